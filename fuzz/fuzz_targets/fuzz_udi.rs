//! Fuzz target for UDI decoding
//!
//! Raw little-endian device reads must either decode to a UDI that
//! converts back to the same bytes or fail cleanly.

#![no_main]

use libfuzzer_sys::fuzz_target;

use devattest::udi::Udi;

fuzz_target!(|data: &[u8]| {
    if let Ok(udi) = Udi::from_raw_le(data) {
        assert_eq!(&udi.to_raw_le()[..], data);
        let again = Udi::from_hex(&udi.to_hex()).expect("hex of a decoded UDI");
        assert_eq!(again, udi);
        let _ = udi.hardware().udi0_hex();
    }

    if let Ok(s) = std::str::from_utf8(data) {
        let _ = Udi::from_hex(s);
    }
});
