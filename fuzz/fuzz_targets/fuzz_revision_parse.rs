// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for revision token parsing.
//!
//! Revisions arrive from remote peers, so parsing must reject garbage
//! without panicking and must round-trip whatever it accepts.

#![no_main]

use gate_ledger::Revision;
use libfuzzer_sys::fuzz_target;
use std::cmp::Ordering;

fuzz_target!(|data: (&str, &str)| {
    let (a, b) = data;

    let (Ok(ra), Ok(rb)) = (a.parse::<Revision>(), b.parse::<Revision>()) else {
        return;
    };

    assert!(ra.generation() >= 1);
    assert_eq!(ra.to_string().parse::<Revision>().ok().as_ref(), Some(&ra));

    // Total order
    match ra.cmp(&rb) {
        Ordering::Less => assert_eq!(rb.cmp(&ra), Ordering::Greater),
        Ordering::Greater => assert_eq!(rb.cmp(&ra), Ordering::Less),
        Ordering::Equal => assert_eq!(ra, rb),
    }
});
