//! Stripe Geometry & Index Translation
//!
//! Pure functions mapping an EC object class `(k, p, cell_len)` onto stripe and
//! cell sizes, the target owning a logical record, and the translation between
//! logical record indices and per-target ("local") record indices.
//!
//! # Address Space
//!
//! ```text
//!  logical index (client view)         per-target index
//!  ┌────────┬────────┬────────┐        ┌────────┬────────┐
//!  │ cell 0 │ cell 1 │ cell 2 │  ───▶  │ s0     │ s1     │ ...  data targets
//!  └────────┴────────┴────────┘        └────────┴────────┘
//!   └──── stripe_rec_nr ─────┘          bit 63 set ──▶ parity sub-range
//! ```
//!
//! Replica and parity extents share one per-target linear address space. The
//! most significant bit of a record index (the parity indicator) selects the
//! parity sub-range; the remaining 63 bits are a plain record index. The
//! formulas here are part of the on-media format and must not change.
//!
//! Geometry violations are programming errors and trip assertions.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::domain::ports::Recx;
use crate::error::{Error, Result};

/// Most significant bit of a record index: selects the parity sub-range.
pub const PARITY_INDICATOR: u64 = 1 << 63;

/// Upper bound on data cells per stripe (width of [`super::bitset::CellSet`]).
pub const MAX_K: usize = 64;

/// Sets the parity indicator on a record index.
#[inline]
pub fn set_parity(idx: u64) -> u64 {
    idx | PARITY_INDICATOR
}

/// Clears the parity indicator from a record index.
#[inline]
pub fn mask_parity(idx: u64) -> u64 {
    idx & !PARITY_INDICATOR
}

/// True if the record index addresses the parity sub-range.
#[inline]
pub fn is_parity(idx: u64) -> bool {
    idx & PARITY_INDICATOR != 0
}

// =============================================================================
// EC Class Attributes
// =============================================================================

/// Immutable erasure-coding attributes of an object class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EcAttr {
    /// Number of data cells per stripe
    pub k: u32,
    /// Number of parity cells per stripe
    pub p: u32,
    /// Records per cell
    pub cell_len: u64,
}

impl EcAttr {
    /// Create validated class attributes.
    pub fn new(k: u32, p: u32, cell_len: u64) -> Result<Self> {
        let attr = Self { k, p, cell_len };
        attr.validate()?;
        Ok(attr)
    }

    /// Reject geometries the aggregation engine cannot process.
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(Error::InvalidEcConfig(
                "k must be greater than 0".to_string(),
            ));
        }
        if self.p == 0 {
            return Err(Error::InvalidEcConfig(
                "p must be greater than 0".to_string(),
            ));
        }
        if self.k as usize > MAX_K {
            return Err(Error::InvalidEcConfig(format!(
                "k={} exceeds the maximum of {} data cells",
                self.k, MAX_K
            )));
        }
        if self.cell_len == 0 {
            return Err(Error::InvalidEcConfig(
                "cell_len must be greater than 0".to_string(),
            ));
        }
        if self
            .cell_len
            .checked_mul(self.k as u64)
            .map_or(true, |n| n >= PARITY_INDICATOR)
        {
            return Err(Error::InvalidEcConfig(format!(
                "stripe of {} x {} records overflows the record space",
                self.k, self.cell_len
            )));
        }
        Ok(())
    }

    /// Records in one stripe (`k * cell_len`).
    #[inline]
    pub fn stripe_rec_nr(&self) -> u64 {
        self.k as u64 * self.cell_len
    }

    /// Records in one cell.
    #[inline]
    pub fn cell_rec_nr(&self) -> u64 {
        self.cell_len
    }

    /// Total targets an object of this class spans (`k + p`).
    #[inline]
    pub fn tgt_count(&self) -> u32 {
        self.k + self.p
    }

    /// True if `shard` holds a parity cell rather than a data cell.
    #[inline]
    pub fn is_parity_shard(&self, shard: u32) -> bool {
        shard >= self.k && shard < self.tgt_count()
    }

    /// Data target (cell index) owning the logical record `idx`.
    #[inline]
    pub fn tgt_of(&self, idx: u64) -> u32 {
        assert!(!is_parity(idx), "tgt_of called on parity index {idx:#x}");
        ((idx % self.stripe_rec_nr()) / self.cell_len) as u32
    }

    /// Logical record index to the per-target index on its data target.
    ///
    /// Also yields the unmapped parity offset of a stripe start
    /// (`to_local(stripe_start(s)) == s * cell_len`).
    #[inline]
    pub fn to_local(&self, idx: u64) -> u64 {
        assert!(!is_parity(idx), "to_local called on parity index {idx:#x}");
        (idx / self.stripe_rec_nr()) * self.cell_len + (idx % self.cell_len)
    }

    /// Per-target index on data target `tgt` back to the logical record index.
    #[inline]
    pub fn to_logical(&self, local: u64, tgt: u32) -> u64 {
        assert!(!is_parity(local), "to_logical called on parity index {local:#x}");
        assert!(tgt < self.k, "target {tgt} is not a data target (k={})", self.k);
        (local / self.cell_len) * self.stripe_rec_nr()
            + tgt as u64 * self.cell_len
            + (local % self.cell_len)
    }

    /// Stripe number containing the logical record `idx`.
    #[inline]
    pub fn stripe_of(&self, idx: u64) -> u64 {
        assert!(!is_parity(idx), "stripe_of called on parity index {idx:#x}");
        idx / self.stripe_rec_nr()
    }

    /// First logical record of stripe `stripe`.
    #[inline]
    pub fn stripe_start(&self, stripe: u64) -> u64 {
        stripe * self.stripe_rec_nr()
    }

    /// Logical replica range covered by stripe `stripe`.
    pub fn stripe_recx(&self, stripe: u64) -> Recx {
        Recx::new(self.stripe_start(stripe), self.stripe_rec_nr())
    }

    /// Logical range of data cell `cell` within stripe `stripe`.
    pub fn cell_recx(&self, stripe: u64, cell: u32) -> Recx {
        assert!(cell < self.k, "cell {cell} out of range (k={})", self.k);
        Recx::new(
            self.stripe_start(stripe) + cell as u64 * self.cell_len,
            self.cell_len,
        )
    }

    /// Per-target range of data cell `cell` of stripe `stripe` on its data target.
    pub fn cell_local_recx(&self, stripe: u64, cell: u32) -> Recx {
        Recx::new(self.to_local(self.cell_recx(stripe, cell).idx), self.cell_len)
    }

    /// Parity address of stripe `stripe`: `(stripe * cell_len) | PARITY_INDICATOR`.
    #[inline]
    pub fn parity_addr(&self, stripe: u64) -> u64 {
        set_parity(stripe * self.cell_len)
    }

    /// One-cell parity extent for stripe `stripe`, indicator applied.
    pub fn parity_recx(&self, stripe: u64) -> Recx {
        Recx::new(self.parity_addr(stripe), self.cell_len)
    }

    /// Global cell ordinals touched by `recx`, via floor/ceil on cell edges.
    pub fn cells_covered(&self, recx: &Recx) -> Range<u64> {
        assert!(!is_parity(recx.idx), "cells_covered called on parity recx");
        if recx.nr == 0 {
            let c = recx.idx / self.cell_len;
            return c..c;
        }
        let first = recx.idx / self.cell_len;
        let last = recx.end().div_ceil(self.cell_len);
        first..last
    }

    /// Split every extent crossing a cell edge into per-cell pieces.
    pub fn break_at_cell_boundaries(&self, extents: &[Recx]) -> Vec<Recx> {
        self.break_at(extents, self.cell_len)
    }

    /// Split every extent crossing a stripe edge into per-stripe pieces.
    pub fn break_at_stripe_boundaries(&self, extents: &[Recx]) -> Vec<Recx> {
        self.break_at(extents, self.stripe_rec_nr())
    }

    fn break_at(&self, extents: &[Recx], unit: u64) -> Vec<Recx> {
        let mut pieces = Vec::with_capacity(extents.len());
        for recx in extents {
            assert!(!is_parity(recx.idx), "cannot split parity recx {recx:?}");
            let mut idx = recx.idx;
            let end = recx.end();
            while idx < end {
                let edge = (idx / unit + 1) * unit;
                let piece_end = edge.min(end);
                pieces.push(Recx::new(idx, piece_end - idx));
                idx = piece_end;
            }
        }
        pieces
    }
}
