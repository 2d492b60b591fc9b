// SPDX-License-Identifier: PMPL-1.0-or-later
// Fuzz target for subsystem payload decoding and normalization

#![no_main]

use concord_detector::{normalize, SourcePayload};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(payload) = serde_json::from_slice::<SourcePayload>(data) else {
        return;
    };
    // Malformed payloads must be rejected, never panic.
    if let Ok(insight) = normalize(payload.clone(), None) {
        assert!(!insight.organization_id.trim().is_empty());
    }
    let _ = normalize(payload, Some(8));
});
