//! Build script for the devattest library
//!
//! Sets DEVATTEST_BUILD_TIMESTAMP for time.rs, a lower bound for the
//! clock used to stamp new records.

use std::time::{SystemTime, UNIX_EPOCH};

fn main() {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System time before Unix epoch")
        .as_secs();

    println!("cargo::rerun-if-changed=build.rs");
    println!("cargo::rustc-env=DEVATTEST_BUILD_TIMESTAMP={}", timestamp);
}
