// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for decoding documents pulled from the remote.
//!
//! Arbitrary JSON must either decode into a revision record or fail with an
//! error; a decoded record must survive the trip back to the wire.

#![no_main]

use gate_ledger::remote::WireDocument;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(doc) = serde_json::from_slice::<WireDocument>(data) else {
        return;
    };
    let _ = doc.kind();
    let _ = doc.history();

    if let Ok(record) = doc.into_record() {
        assert!(!record.history.is_empty());
        assert_eq!(record.history[0], record.rev);
        let wire = WireDocument::from_record(&record).expect("decoded record must re-encode");
        assert_eq!(wire.rev, record.rev);
    }
});
