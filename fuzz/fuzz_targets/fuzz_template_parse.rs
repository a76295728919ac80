//! Fuzz target: launch argument template parser.
//!
//! Arbitrary argument strings must either parse or be rejected, never panic.
//! A successful parse must reproduce every literal byte outside the actions.
#![no_main]

use libfuzzer_sys::fuzz_target;
use vmctl_driver::template::{parse, Segment};

fuzz_target!(|data: &[u8]| {
    let Ok(arg) = std::str::from_utf8(data) else { return };
    let Ok(segments) = parse(arg) else { return };

    let literal: usize = segments
        .iter()
        .map(|s| match s {
            Segment::Text(t) => t.len(),
            Segment::FdConnect(_) => 0,
        })
        .sum();
    assert!(literal <= arg.len());
    if !arg.contains("{{") {
        assert!(matches!(segments.as_slice(), [] | [Segment::Text(_)]));
    }
});
