//! Fuzz target for revision bundle decoding.
//!
//! `codec::decode` must reject arbitrary input with an error, never a panic,
//! whether or not it carries the zstd magic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use replication_mesh::codec;

fuzz_target!(|data: &[u8]| {
    if let Ok(bundle) = codec::decode(data) {
        // Anything accepted must be internally consistent.
        assert!(bundle.is_well_formed());
        assert!(bundle.revision.has_valid_digest());
    }
    let _ = codec::maybe_decompress(data);
});
