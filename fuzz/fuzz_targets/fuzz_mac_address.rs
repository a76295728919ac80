//! Fuzz target: MAC address parsing.
//!
//! Anything that parses must print back to a string that parses to the same
//! address.
#![no_main]

use libfuzzer_sys::fuzz_target;
use vmctl_core::MacAddress;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else { return };
    if let Ok(mac) = s.parse::<MacAddress>() {
        let again: MacAddress = match mac.to_string().parse() {
            Ok(m) => m,
            Err(e) => panic!("display output must parse: {e}"),
        };
        assert_eq!(mac, again);
    }
});
