//! Property round-trips over the scalar access methods: wire encode then
//! decode must reproduce the canonical payload, and text render then parse
//! must compare equal, for arbitrary values.

use std::sync::Arc;

use proptest::prelude::*;

use relata::types::builtin;
use relata::types::stack::TypeStack;
use relata::types::tam::{BinOut, BinaryOpts, split_stack};
use relata::types::TypeRef;

fn wire_roundtrip(ty: &TypeRef, payload: &[u8]) -> Vec<u8> {
    let stack = TypeStack::scalar(Arc::clone(ty));
    let (outer, rest) = split_stack(&stack);
    let opts = BinaryOpts {
        src_big_endian: true,
        dst_big_endian: true,
        malloc: true,
    };

    let mut len = 0usize;
    let wire = match outer
        .tam
        .bin_get(rest, &opts, payload, None, Some(&mut len), None)
        .unwrap()
    {
        BinOut::Owned(bytes) => bytes,
        other => panic!("expected owned wire bytes, got {other:?}"),
    };

    let mut back = Vec::new();
    outer.tam.bin_set(rest, &opts, &wire, &mut back, 0).unwrap();
    back
}

fn text_roundtrip(ty: &TypeRef, payload: &[u8]) -> std::cmp::Ordering {
    let stack = TypeStack::scalar(Arc::clone(ty));
    let (outer, rest) = split_stack(&stack);
    let text = outer.tam.text_get(rest, payload, None).unwrap();
    let back = outer.tam.text_set(rest, &text, None).unwrap();
    outer.tom.compare(rest, payload, &back).unwrap()
}

proptest! {
    #[test]
    fn prop_int16_wire_roundtrip(v: i16) {
        let payload = v.to_le_bytes().to_vec();
        prop_assert_eq!(wire_roundtrip(&builtin::int16(), &payload), payload);
    }

    #[test]
    fn prop_int64_wire_roundtrip(v: i64) {
        let payload = v.to_le_bytes().to_vec();
        prop_assert_eq!(wire_roundtrip(&builtin::int64(), &payload), payload);
    }

    #[test]
    fn prop_float64_wire_roundtrip(v: f64) {
        let payload = v.to_le_bytes().to_vec();
        prop_assert_eq!(wire_roundtrip(&builtin::float64(), &payload), payload);
    }

    #[test]
    fn prop_string_wire_roundtrip(s in "\\PC{0,48}") {
        let payload = s.clone().into_bytes();
        prop_assert_eq!(wire_roundtrip(&builtin::string(), &payload), payload);
    }

    #[test]
    fn prop_int64_text_roundtrip(v: i64) {
        let payload = v.to_le_bytes();
        prop_assert_eq!(
            text_roundtrip(&builtin::int64(), &payload),
            std::cmp::Ordering::Equal
        );
    }

    #[test]
    fn prop_date_text_roundtrip(days in -100_000i32..3_000_000i32) {
        let date = chrono::NaiveDate::from_num_days_from_ce_opt(days).unwrap();
        let payload = builtin::date_to_payload(date);
        prop_assert_eq!(
            text_roundtrip(&builtin::date(), &payload),
            std::cmp::Ordering::Equal
        );
    }
}
