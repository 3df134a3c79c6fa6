//! Fuzz target for revision id parsing.
//!
//! Parsing never panics, and anything that parses survives a render and
//! re-parse unchanged.

#![no_main]

use libfuzzer_sys::fuzz_target;
use replication_mesh::revision::RevisionId;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(id) = s.parse::<RevisionId>() {
            let rendered = id.to_string();
            assert_eq!(rendered.parse::<RevisionId>().ok(), Some(id.clone()));
            assert!(id.generation() >= 1);
        }
    }
});
