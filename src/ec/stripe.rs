//! Stripe Extent Accumulator
//!
//! Collects the replica extents of one stripe of the current akey as the
//! iterator yields them, in offset order. Tracks how many records of the
//! stripe hold data (`fill`), whether any punched range was seen, and the
//! highest epoch among the extents.
//!
//! An extent that runs past the end of the stripe is kept on `clear()` as the
//! seed of the next stripe, cut down to the tail.

use super::bitset::CellSet;
use super::geometry::EcAttr;
use crate::domain::ports::{Epoch, Recx};

/// Replica extent held by a stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggExtent {
    /// Visible range, starting inside the stripe
    pub recx: Recx,
    pub epoch: Epoch,
    pub is_hole: bool,
}

/// Replica extents of the stripe undergoing aggregation.
#[derive(Debug, Default, Clone)]
pub struct Stripe {
    number: u64,
    extents: Vec<AggExtent>,
    hi_epoch: Epoch,
    fill: u64,
    has_holes: bool,
}

impl Stripe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stripe ordinal (`offset / stripe_rec_nr`).
    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn extents(&self) -> &[AggExtent] {
        &self.extents
    }

    pub fn hi_epoch(&self) -> Epoch {
        self.hi_epoch
    }

    /// Records of the stripe covered by non-hole extents.
    pub fn fill(&self) -> u64 {
        self.fill
    }

    pub fn has_holes(&self) -> bool {
        self.has_holes
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// True if the non-hole extents cover every record of the stripe.
    pub fn is_filled(&self, geo: &EcAttr) -> bool {
        self.fill == geo.stripe_rec_nr()
    }

    /// Append an extent starting in this stripe (or in any stripe, if empty).
    ///
    /// Callers drain the stripe before feeding an extent of another stripe.
    pub fn add(&mut self, geo: &EcAttr, extent: AggExtent) {
        let stripe = geo.stripe_of(extent.recx.idx);
        if self.extents.is_empty() {
            self.number = stripe;
        } else {
            assert_eq!(
                stripe, self.number,
                "extent {} belongs to stripe {stripe}, current stripe is {}",
                extent.recx, self.number
            );
        }

        self.hi_epoch = self.hi_epoch.max(extent.epoch);
        if extent.is_hole {
            self.has_holes = true;
        } else {
            self.fill += self.in_stripe(geo, &extent.recx);
            assert!(
                self.fill <= geo.stripe_rec_nr(),
                "stripe {} over-filled: {} > {}",
                self.number,
                self.fill,
                geo.stripe_rec_nr()
            );
        }
        self.extents.push(extent);
    }

    /// Length of the part of `extent` running past the end of this stripe.
    pub fn carry_over(&self, geo: &EcAttr, extent: &AggExtent) -> u64 {
        let stripe_size = geo.stripe_rec_nr();
        let start = extent.recx.idx / stripe_size;
        let end = (extent.recx.end() - 1) / stripe_size;
        if end > start {
            assert_eq!(end - start, 1, "extent {} spans more than two stripes", extent.recx);
            extent.recx.end() - end * stripe_size
        } else {
            0
        }
    }

    /// Reset after the stripe was processed. A carried-over extent survives as
    /// the seed of the next stripe.
    pub fn clear(&mut self, geo: &EcAttr) {
        let mut seed: Option<AggExtent> = None;
        for extent in &self.extents {
            let tail = self.carry_over(geo, extent);
            if tail > 0 {
                assert!(seed.is_none(), "more than one extent carries over");
                let mut kept = *extent;
                kept.recx = Recx::new(extent.recx.end() - tail, tail);
                seed = Some(kept);
            }
        }

        self.extents.clear();
        match seed {
            Some(extent) => {
                self.number += 1;
                self.hi_epoch = extent.epoch;
                self.has_holes = extent.is_hole;
                self.fill = if extent.is_hole { 0 } else { extent.recx.nr };
                self.extents.push(extent);
            }
            None => {
                self.hi_epoch = 0;
                self.has_holes = false;
                self.fill = 0;
            }
        }
    }

    /// Forget everything, carried-over extents included (key change).
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Part of `recx` lying inside the current stripe.
    fn in_stripe(&self, geo: &EcAttr, recx: &Recx) -> u64 {
        recx.intersect(&geo.stripe_recx(self.number))
            .map_or(0, |r| r.nr)
    }

    /// In-stripe parts of the data (non-hole) extents.
    pub fn data_ranges<'a>(&'a self, geo: &'a EcAttr) -> impl Iterator<Item = (Recx, Epoch)> + 'a {
        let bounds = geo.stripe_recx(self.number);
        self.extents
            .iter()
            .filter(|e| !e.is_hole)
            .filter_map(move |e| e.recx.intersect(&bounds).map(|r| (r, e.epoch)))
    }

    /// True if any punched extent is at or above `epoch`.
    pub fn has_holes_since(&self, epoch: Epoch) -> bool {
        self.extents.iter().any(|e| e.is_hole && e.epoch >= epoch)
    }

    /// In-stripe parts of the punched extents, in offset order.
    pub fn hole_ranges(&self, geo: &EcAttr) -> Vec<Recx> {
        let bounds = geo.stripe_recx(self.number);
        self.extents
            .iter()
            .filter(|e| e.is_hole)
            .filter_map(|e| e.recx.intersect(&bounds))
            .collect()
    }

    /// True if every extent is newer than `epoch`.
    pub fn all_newer_than(&self, epoch: Epoch) -> bool {
        self.extents.iter().all(|e| e.epoch > epoch)
    }

    /// Cells covered edge-to-edge and cells overlapped at all by data extents.
    pub fn cell_coverage(&self, geo: &EcAttr) -> (CellSet, CellSet) {
        self.coverage(geo, |_| true)
    }

    /// Cells covered edge-to-edge by data extents newer than `epoch`.
    pub fn fresh_cells(&self, geo: &EcAttr, epoch: Epoch) -> CellSet {
        self.coverage(geo, |e| e > epoch).0
    }

    /// In-stripe data ranges newer than `epoch`, in offset order.
    pub fn fresh_ranges(&self, geo: &EcAttr, epoch: Epoch) -> Vec<Recx> {
        self.data_ranges(geo)
            .filter(|(_, e)| *e > epoch)
            .map(|(r, _)| r)
            .collect()
    }

    /// Cells covered edge-to-edge by data extents at or above `epoch`.
    pub fn valid_cells(&self, geo: &EcAttr, epoch: Epoch) -> CellSet {
        self.coverage(geo, |e| e >= epoch).0
    }

    /// In-stripe data ranges at or above `epoch`, in offset order.
    pub fn valid_ranges(&self, geo: &EcAttr, epoch: Epoch) -> Vec<Recx> {
        self.data_ranges(geo)
            .filter(|(_, e)| *e >= epoch)
            .map(|(r, _)| r)
            .collect()
    }

    fn coverage(&self, geo: &EcAttr, keep: impl Fn(Epoch) -> bool) -> (CellSet, CellSet) {
        let mut full = CellSet::new(geo.k);
        let mut touched = CellSet::new(geo.k);
        for cell in 0..geo.k {
            let bounds = geo.cell_recx(self.number, cell);
            let pieces: Vec<Recx> = self
                .data_ranges(geo)
                .filter(|(_, e)| keep(*e))
                .filter_map(|(r, _)| r.intersect(&bounds))
                .collect();
            if pieces.is_empty() {
                continue;
            }
            touched.set(cell);
            if covered_len(&pieces) == bounds.nr {
                full.set(cell);
            }
        }
        (full, touched)
    }

    /// True if a data extent of the stripe is not newer than `epoch`.
    pub fn has_stale_data(&self, geo: &EcAttr, epoch: Epoch) -> bool {
        self.data_ranges(geo).any(|(_, e)| e <= epoch)
    }
}

/// Records covered by the union of `ranges`.
pub fn covered_len(ranges: &[Recx]) -> u64 {
    let mut sorted: Vec<Recx> = ranges.iter().copied().filter(|r| !r.is_empty()).collect();
    sorted.sort_by_key(|r| r.idx);
    let mut total = 0;
    let mut reach = 0u64;
    let mut started = false;
    for r in sorted {
        if !started || r.idx >= reach {
            total += r.nr;
            reach = r.end();
            started = true;
        } else if r.end() > reach {
            total += r.end() - reach;
            reach = r.end();
        }
    }
    total
}
