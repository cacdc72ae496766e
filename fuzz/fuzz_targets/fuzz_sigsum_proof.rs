//! Fuzz target for Sigsum ASCII parsing
//!
//! Covers proofs of logging, leaf requests and tree heads as they arrive
//! from records, submissions and log responses.
//!
//! Security concerns:
//! - Unbounded node hash lists
//! - Duplicate or out of order keys
//! - Odd hex and base64 lengths

#![no_main]

use libfuzzer_sys::fuzz_target;

use devattest::sigsum::{CosignedTreeHead, InclusionProof, LeafRequest, SigsumProof};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(proof) = SigsumProof::from_ascii(text) {
        let reparsed = SigsumProof::from_ascii(&proof.to_ascii()).expect("written proof parses");
        assert_eq!(reparsed, proof);
    }

    if let Ok(request) = LeafRequest::from_ascii(text) {
        let _ = request.verify();
    }

    let _ = CosignedTreeHead::from_ascii(text);
    let _ = InclusionProof::from_ascii(text);
});
