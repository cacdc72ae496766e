//! Fuzz target for Sigsum trust policy and submit key parsing

#![no_main]

use libfuzzer_sys::fuzz_target;

use devattest::appbins::AppRegistry;
use devattest::sigsum::{parse_submit_keys, Policy};
use std::collections::HashSet;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(policy) = Policy::parse(text) {
        // evaluating the quorum must terminate for any group nesting
        let all: HashSet<_> = policy.witnesses().map(|w| w.key_hash).collect();
        let _ = policy.is_quorum(&all);
        let _ = policy.is_quorum(&HashSet::new());
    }

    let _ = parse_submit_keys(text, &AppRegistry::new());
});
