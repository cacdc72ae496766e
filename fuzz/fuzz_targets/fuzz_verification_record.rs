//! Fuzz target for verification record and submission JSON
//!
//! Records are fetched from web servers and must never panic the verifier.

#![no_main]

use libfuzzer_sys::fuzz_target;

use devattest::record::{Submission, VerificationRecord};

fuzz_target!(|data: &[u8]| {
    if let Ok(record) = VerificationRecord::from_json(data) {
        let json = record.to_json().expect("serialize parsed record");
        let reparsed = VerificationRecord::from_json(&json).expect("written record parses");
        assert_eq!(reparsed.to_json().expect("serialize again"), json);
    }

    let _ = Submission::from_json(data);
});
