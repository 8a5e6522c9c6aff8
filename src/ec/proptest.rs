//! Property-Based Tests for EC Aggregation
//!
//! Uses proptest to check the layout math and the codecs across a wide range
//! of geometries.
//!
//! # Test Properties
//!
//! 1. **Offset Mapping**: `to_logical(to_local(idx), tgt_of(idx)) == idx`
//! 2. **Parity Space**: the indicator bit never collides with replica offsets
//! 3. **Incremental Updates**: folding cell diffs into parity equals a full
//!    re-encode, for any subset of updated cells
//! 4. **Accumulation**: stripe fill equals the covered length of its extents

#![cfg(test)]

use proptest::prelude::*;

use super::codec::{codec_for, CodecKind};
use super::geometry::{is_parity, mask_parity, set_parity, EcAttr};
use super::stripe::{covered_len, AggExtent, Stripe};
use crate::domain::ports::Recx;

// =============================================================================
// Property Strategies
// =============================================================================

/// Valid `(k, p, cell_len)` geometries, kept small for speed.
fn geometry_strategy() -> impl Strategy<Value = EcAttr> {
    (1u32..=8, 1u32..=3, 1u64..=64)
        .prop_filter_map("invalid geometry", |(k, p, cell_len)| {
            EcAttr::new(k, p, cell_len).ok()
        })
}

fn codec_strategy() -> impl Strategy<Value = CodecKind> {
    prop_oneof![Just(CodecKind::ReedSolomon), Just(CodecKind::Xor)]
}

/// Sorted, non-overlapping extents inside stripe `stripe` of `attr`.
fn stripe_extents(attr: EcAttr, stripe: u64) -> impl Strategy<Value = Vec<Recx>> {
    let len = attr.stripe_rec_nr();
    prop::collection::vec((0..len, 1..=len), 0..6).prop_map(move |raw| {
        let base = attr.stripe_start(stripe);
        let mut cuts: Vec<(u64, u64)> = raw
            .into_iter()
            .map(|(start, nr)| (start, (start + nr).min(len)))
            .collect();
        cuts.sort();
        let mut out = Vec::new();
        let mut next = 0;
        for (start, end) in cuts {
            let start = start.max(next);
            if start < end {
                out.push(Recx::new(base + start, end - start));
                next = end;
            }
        }
        out
    })
}

// =============================================================================
// Geometry Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_local_logical_roundtrip(attr in geometry_strategy(), idx in 0u64..1_000_000) {
        let tgt = attr.tgt_of(idx);
        prop_assert!(tgt < attr.k);
        let local = attr.to_local(idx);
        prop_assert_eq!(attr.to_logical(local, tgt), idx);
    }

    #[test]
    fn prop_parity_indicator_roundtrip(idx in 0u64..(1u64 << 62)) {
        let addr = set_parity(idx);
        prop_assert!(is_parity(addr));
        prop_assert!(!is_parity(idx));
        prop_assert_eq!(mask_parity(addr), idx);
    }

    #[test]
    fn prop_parity_recx_per_stripe_is_disjoint(attr in geometry_strategy(), stripe in 0u64..10_000) {
        let a = attr.parity_recx(stripe);
        let b = attr.parity_recx(stripe + 1);
        prop_assert_eq!(a.nr, attr.cell_len);
        prop_assert!(!a.overlaps(&b));
        prop_assert_eq!(mask_parity(a.idx), stripe * attr.cell_len);
    }

    #[test]
    fn prop_stripe_split_preserves_length(attr in geometry_strategy(), idx in 0u64..100_000, nr in 1u64..5_000) {
        let recx = Recx::new(idx, nr);
        let pieces = attr.break_at_stripe_boundaries(&[recx]);
        prop_assert_eq!(pieces.iter().map(|r| r.nr).sum::<u64>(), nr);
        for piece in &pieces {
            prop_assert_eq!(attr.stripe_of(piece.idx), attr.stripe_of(piece.end() - 1));
        }
    }
}

// =============================================================================
// Codec Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_incremental_update_equals_reencode(
        (k, p) in (2usize..=6, 1usize..=3),
        kind in codec_strategy(),
        cell_bytes in 1usize..=32,
        seed in any::<u64>(),
        changed in prop::collection::vec(any::<bool>(), 6),
    ) {
        let p = if kind == CodecKind::Xor { 1 } else { p };
        let attr = EcAttr::new(k as u32, p as u32, cell_bytes as u64).unwrap();
        let codec = codec_for(&attr, kind)?;

        let old: Vec<u8> = (0..k * cell_bytes)
            .map(|i| (seed.wrapping_mul(i as u64 + 1) >> 8) as u8)
            .collect();
        let mut parity = vec![0u8; p * cell_bytes];
        codec.encode(&old, &mut parity)?;

        let mut new = old.clone();
        for cell in (0..k).filter(|c| changed[*c]) {
            let at = cell * cell_bytes;
            for b in &mut new[at..at + cell_bytes] {
                *b = b.wrapping_add(0x5A);
            }
            let diff: Vec<u8> = old[at..at + cell_bytes]
                .iter()
                .zip(&new[at..at + cell_bytes])
                .map(|(o, n)| o ^ n)
                .collect();
            codec.update(cell, &diff, &mut parity)?;
        }

        let mut expected = vec![0u8; p * cell_bytes];
        codec.encode(&new, &mut expected)?;
        prop_assert_eq!(parity, expected);
    }
}

// =============================================================================
// Accumulator Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_fill_matches_covered_len(
        (attr, extents) in geometry_strategy()
            .prop_flat_map(|attr| (Just(attr), stripe_extents(attr, 3))),
    ) {
        let mut stripe = Stripe::new();
        for (i, recx) in extents.iter().enumerate() {
            stripe.add(&attr, AggExtent {
                recx: *recx,
                epoch: i as u64 + 1,
                is_hole: false,
            });
        }
        prop_assert_eq!(stripe.fill(), covered_len(&extents));
        prop_assert_eq!(stripe.is_filled(&attr), covered_len(&extents) == attr.stripe_rec_nr());
        if !extents.is_empty() {
            prop_assert_eq!(stripe.number(), 3);
            prop_assert_eq!(stripe.hi_epoch(), extents.len() as u64);
        }
    }
}
