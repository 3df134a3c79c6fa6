//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use proptest::prelude::*;
use replication_mesh::codec::{decode, encode, maybe_decompress, COMPRESSION_THRESHOLD, ZSTD_MAGIC};
use replication_mesh::revision::{Body, Revision, RevisionBundle, RevisionId};
use serde_json::json;

fn body_strategy() -> impl Strategy<Value = Option<Body>> {
    prop::option::weighted(
        0.9,
        prop::collection::btree_map("[a-z]{1,8}", "[a-zA-Z0-9 ]{0,32}", 0..6).prop_map(|fields| {
            let mut body = Body::new();
            for (k, v) in fields {
                body.insert(k, json!(v));
            }
            body
        }),
    )
}

fn digest_strategy() -> impl Strategy<Value = String> {
    "[0-9a-f]{1,32}"
}

// =============================================================================
// Revision ID Properties
// =============================================================================

proptest! {
    /// Display then parse yields the same id
    #[test]
    fn revision_id_display_parse_roundtrip(generation in 1u64..u64::MAX, digest in digest_strategy()) {
        let id = RevisionId::new(generation, digest);
        let parsed: RevisionId = id.to_string().parse().unwrap();
        prop_assert_eq!(parsed, id);
    }

    /// Generation zero is never a valid id
    #[test]
    fn revision_id_rejects_generation_zero(digest in digest_strategy()) {
        let rendered = format!("0-{}", digest);
        prop_assert!(rendered.parse::<RevisionId>().is_err());
    }

    /// Generation dominates ordering; digest breaks ties
    #[test]
    fn revision_id_ordering(
        g1 in 1u64..1000,
        g2 in 1u64..1000,
        d1 in digest_strategy(),
        d2 in digest_strategy(),
    ) {
        let a = RevisionId::new(g1, d1.clone());
        let b = RevisionId::new(g2, d2.clone());
        if g1 != g2 {
            prop_assert_eq!(a.cmp(&b), g1.cmp(&g2));
        } else {
            prop_assert_eq!(a.cmp(&b), d1.cmp(&d2));
        }
    }

    /// Arbitrary strings either fail to parse or reparse to the same id
    #[test]
    fn revision_id_parse_is_stable(s in "\\PC{0,40}") {
        if let Ok(id) = s.parse::<RevisionId>() {
            let again: RevisionId = id.to_string().parse().unwrap();
            prop_assert_eq!(again, id);
        }
    }
}

// =============================================================================
// Revision Tree Properties
// =============================================================================

proptest! {
    /// An edit sits exactly one generation below its parent
    #[test]
    fn child_generation_is_parent_plus_one(body in body_strategy(), edits in 1usize..20) {
        let mut rev = Revision::root(body.clone());
        for _ in 0..edits {
            let child = Revision::child(&rev.id, body.clone());
            prop_assert_eq!(child.generation(), rev.generation() + 1);
            prop_assert_eq!(&child.parents, &vec![rev.id.clone()]);
            prop_assert!(child.has_valid_digest());
            rev = child;
        }
        prop_assert_eq!(rev.generation(), edits as u64 + 1);
    }

    /// Both sides of a conflict compute the same merge id
    #[test]
    fn merge_is_order_independent(
        left in body_strategy(),
        right in body_strategy(),
        winner in body_strategy(),
        extra_edits in 0usize..4,
    ) {
        let root = Revision::root(None);
        let mut a = Revision::child(&root.id, left);
        for _ in 0..extra_edits {
            a = Revision::child(&a.id, a.live_body().cloned());
        }
        let b = Revision::child(&root.id, right);

        let ab = Revision::merge(&a.id, &b.id, winner.clone());
        let ba = Revision::merge(&b.id, &a.id, winner);
        prop_assert_eq!(&ab.id, &ba.id);
        prop_assert_eq!(ab.generation(), a.generation().max(b.generation()) + 1);
        prop_assert!(ab.is_merge());
        prop_assert!(ab.has_valid_digest());
    }

    /// Digests depend on content: different bodies give different ids
    #[test]
    fn distinct_bodies_distinct_ids(x in "[a-z]{1,16}", y in "[a-z]{1,16}") {
        prop_assume!(x != y);
        let mut bx = Body::new();
        bx.insert("name".into(), json!(x));
        let mut by = Body::new();
        by.insert("name".into(), json!(y));
        prop_assert_ne!(Revision::root(Some(bx)).id, Revision::root(Some(by)).id);
    }
}

// =============================================================================
// Codec Properties
// =============================================================================

fn bundle(key: &str, bodies: Vec<Option<Body>>) -> RevisionBundle {
    let mut history = Vec::new();
    let mut rev = Revision::root(bodies.first().cloned().flatten());
    for body in bodies.into_iter().skip(1) {
        let child = Revision::child(&rev.id, body);
        history.push(rev);
        rev = child;
    }
    history.reverse();
    RevisionBundle {
        key: key.to_string(),
        revision: rev,
        history,
    }
}

proptest! {
    /// Encoded bundles decode to the original
    #[test]
    fn codec_roundtrip(key in "[a-z0-9:_-]{1,24}", bodies in prop::collection::vec(body_strategy(), 1..8)) {
        let original = bundle(&key, bodies);
        let decoded = decode(&encode(&original).unwrap()).unwrap();
        prop_assert_eq!(decoded, original);
    }

    /// Large bodies take the compressed path and still roundtrip
    #[test]
    fn codec_large_bundle_compressed(filler in "[a-z]{16}", repeat in 300usize..600) {
        let mut body = Body::new();
        body.insert("blob".into(), json!(filler.repeat(repeat)));
        let original = bundle("doc1", vec![None, Some(body)]);

        let bytes = encode(&original).unwrap();
        prop_assert!(filler.len() * repeat <= COMPRESSION_THRESHOLD || bytes[..4] == ZSTD_MAGIC);
        prop_assert_eq!(decode(&bytes).unwrap(), original);
    }

    /// Any edit to an encoded body is caught by the digest check or the parser
    #[test]
    fn codec_rejects_tampered_body(name in "[a-z]{4,12}", replacement in "[A-Z]{4,12}") {
        let mut body = Body::new();
        body.insert("name".into(), json!(name));
        let original = bundle("doc1", vec![Some(body)]);

        let json = String::from_utf8(encode(&original).unwrap()).unwrap();
        let tampered = json.replace(&format!("\"{}\"", name), &format!("\"{}\"", replacement));
        prop_assert!(decode(tampered.as_bytes()).is_err());
    }

    /// Arbitrary bytes never panic the decoder
    #[test]
    fn decode_arbitrary_bytes_no_panic(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = decode(&data);
    }

    /// Non-zstd data passes through decompression unchanged
    #[test]
    fn decompress_passthrough_non_zstd(data in prop::collection::vec(any::<u8>(), 0..1000)) {
        let mut safe_data = data;
        if safe_data.len() >= 4 && safe_data[..4] == ZSTD_MAGIC {
            safe_data[0] = 0x00;
        }

        let result = maybe_decompress(&safe_data);
        prop_assert!(result.is_ok());
        prop_assert_eq!(result.unwrap(), safe_data);
    }
}
