//! Fuzz target: snapshot listing parser.
#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let listing = String::from_utf8_lossy(data);
    if let Ok(tags) = vmctl_driver::parse_snapshot_tags(&listing) {
        assert!(tags.iter().all(|t| !t.is_empty()));
    }
});
