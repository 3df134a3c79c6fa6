// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Revision bundle encoding for transfer between peers.
//!
//! Bundles are serialized as JSON. Payloads above [`COMPRESSION_THRESHOLD`]
//! are zstd-compressed; the decoder sniffs the zstd magic so both forms are
//! accepted transparently.
//!
//! Decoding also verifies every revision digest, so a payload altered in
//! flight is reported as [`ReplicationError::Codec`] instead of being grafted.

use crate::error::{ReplicationError, Result};
use crate::revision::RevisionBundle;
use std::io::Read;

/// Zstd frame magic bytes.
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// JSON payloads larger than this are compressed.
pub const COMPRESSION_THRESHOLD: usize = 4 * 1024;

const ZSTD_LEVEL: i32 = 3;

/// Encode a bundle for [`Transport::push_revision`](crate::transport::Transport::push_revision)
/// or as the answer to a fetch.
pub fn encode(bundle: &RevisionBundle) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(bundle)
        .map_err(|e| ReplicationError::Codec(format!("serialize {}: {}", bundle.key, e)))?;

    if json.len() <= COMPRESSION_THRESHOLD {
        return Ok(json);
    }

    zstd::encode_all(&json[..], ZSTD_LEVEL)
        .map_err(|e| ReplicationError::Codec(format!("zstd encode: {}", e)))
}

/// Decode a payload produced by [`encode`].
pub fn decode(data: &[u8]) -> Result<RevisionBundle> {
    let raw = maybe_decompress(data)?;
    let bundle: RevisionBundle = serde_json::from_slice(&raw)
        .map_err(|e| ReplicationError::Codec(format!("parse bundle: {}", e)))?;

    if let Some(bad) = bundle
        .history
        .iter()
        .chain(std::iter::once(&bundle.revision))
        .find(|r| !r.has_valid_digest())
    {
        return Err(ReplicationError::Codec(format!(
            "digest mismatch for {}@{}",
            bundle.key, bad.id
        )));
    }
    if !bundle.is_well_formed() {
        return Err(ReplicationError::Codec(format!(
            "incomplete history for {}@{}",
            bundle.key,
            bundle.id()
        )));
    }

    Ok(bundle)
}

/// Decompress zstd data if it carries the zstd magic, otherwise pass through.
pub fn maybe_decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() >= 4 && data[..4] == ZSTD_MAGIC {
        let mut decoder = zstd::Decoder::new(data)
            .map_err(|e| ReplicationError::Codec(format!("zstd init: {}", e)))?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| ReplicationError::Codec(format!("zstd decode: {}", e)))?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::{Body, Revision};
    use serde_json::json;

    fn bundle_with(text: &str) -> RevisionBundle {
        let mut body = Body::new();
        body.insert("name".into(), json!("tiger"));
        let root = Revision::root(Some(body));

        let mut body = Body::new();
        body.insert("name".into(), json!(text));
        let child = Revision::child(&root.id, Some(body));

        RevisionBundle {
            key: "doc1".into(),
            revision: child,
            history: vec![root],
        }
    }

    #[test]
    fn test_small_bundle_is_plain_json() {
        let bundle = bundle_with("cat");
        let bytes = encode(&bundle).unwrap();
        assert_eq!(bytes[0], b'{');
        assert_eq!(decode(&bytes).unwrap(), bundle);
    }

    #[test]
    fn test_large_bundle_is_compressed() {
        let bundle = bundle_with(&"x".repeat(COMPRESSION_THRESHOLD * 2));
        let bytes = encode(&bundle).unwrap();
        assert_eq!(bytes[..4], ZSTD_MAGIC);
        assert_eq!(decode(&bytes).unwrap(), bundle);
    }

    #[test]
    fn test_tampered_body_rejected() {
        let bundle = bundle_with("cat");
        let text = String::from_utf8(encode(&bundle).unwrap()).unwrap();
        let tampered = text.replace("\"cat\"", "\"dog\"");

        let err = decode(tampered.as_bytes()).unwrap_err();
        assert!(matches!(err, ReplicationError::Codec(ref m) if m.contains("digest mismatch")));
    }

    #[test]
    fn test_missing_history_rejected() {
        let mut bundle = bundle_with("cat");
        bundle.history.clear();
        let bytes = serde_json::to_vec(&bundle).unwrap();
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(decode(b"not json").is_err());
        assert!(decode(&[]).is_err());
        assert!(decode(&[0x28, 0xB5, 0x2F, 0xFD, 0xDE, 0xAD]).is_err());
    }

    #[test]
    fn test_maybe_decompress_passthrough() {
        let data = b"plain bytes";
        assert_eq!(maybe_decompress(data).unwrap(), data.to_vec());
    }
}
