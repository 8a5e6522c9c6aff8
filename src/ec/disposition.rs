//! Stripe Disposition Engine
//!
//! Decides what happens to a completed stripe and carries it out. The
//! decision depends only on the stripe's extents and the epoch of its parity:
//!
//! ```text
//!                     parity >= hi_epoch ──────────▶ RemoveStale
//!                              │ no
//!   filled, replicas all newer than parity ────────▶ FullEncode
//!                              │ no
//!                        no parity ────────────────▶ NoOp
//!                              │
//!         hole not older than parity ──────────────▶ RecoverHoles
//!                              │ no
//!   full >= k/2 | all touched | stale data touched ─▶ PartialUpdate { recalc }
//! ```
//!
//! Every path except `NoOp` ends with one write-back transaction per parity
//! target that also removes the consumed replicas.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::bitset::CellSet;
use super::driver::AggregationConfig;
use super::entry::AggEntry;
use super::geometry::EcAttr;
use super::offload;
use super::prober::{self, ParityExtent};
use super::remote;
use super::stripe::Stripe;
use super::writeback::WriteBack;
use crate::domain::ports::{
    Epoch, EpochRange, ExtentStore, MetricsSink, PeerClient, Recx, ValuePath,
};
use crate::error::{Error, Result};
use crate::metrics::{self, size_bucket};

/// Action selected for a stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Parity is at least as new as every replica: drop the replicas
    RemoveStale,
    /// Replicas cover the whole stripe: encode from them
    FullEncode,
    /// Partial replicas and no parity: leave the stripe replicated
    NoOp,
    /// A punch newer than the parity: convert back to replicas
    RecoverHoles,
    /// Partial replicas over existing parity
    PartialUpdate {
        recalc: bool,
        full: CellSet,
        touched: CellSet,
    },
}

/// What a processed stripe ended up as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StripeOutcome {
    RemovedStale,
    Encoded,
    Skipped,
    HolesRecovered,
    Updated { recalc: bool },
}

impl StripeOutcome {
    /// Counter bumped for this outcome.
    pub fn counter(&self) -> &'static str {
        match self {
            StripeOutcome::RemovedStale => metrics::STRIPES_REMOVED_STALE,
            StripeOutcome::Encoded => metrics::STRIPES_ENCODED,
            StripeOutcome::Skipped => metrics::STRIPES_SKIPPED,
            StripeOutcome::HolesRecovered => metrics::STRIPES_HOLES_RECOVERED,
            StripeOutcome::Updated { recalc: false } => metrics::STRIPES_UPDATED_INCREMENTAL,
            StripeOutcome::Updated { recalc: true } => metrics::STRIPES_UPDATED_RECALC,
        }
    }
}

/// Pick the disposition of `stripe` given its parity, if any.
pub fn select(attr: &EcAttr, stripe: &Stripe, parity: Option<&ParityExtent>) -> Disposition {
    if let Some(par) = parity {
        if par.epoch >= stripe.hi_epoch() {
            return Disposition::RemoveStale;
        }
    }

    if stripe.is_filled(attr) && parity.map_or(true, |par| stripe.all_newer_than(par.epoch)) {
        return Disposition::FullEncode;
    }

    let Some(par) = parity else {
        return Disposition::NoOp;
    };

    if stripe.has_holes_since(par.epoch) {
        return Disposition::RecoverHoles;
    }

    let (full, touched) = stripe.cell_coverage(attr);
    let recalc = full.count() >= attr.k / 2
        || touched.is_full()
        || stripe.has_stale_data(attr, par.epoch);
    Disposition::PartialUpdate {
        recalc,
        full,
        touched,
    }
}

/// Collaborators and bounds a stripe is processed with.
pub struct StripeIo<'a> {
    pub store: &'a dyn ExtentStore,
    pub peers: &'a dyn PeerClient,
    pub metrics: &'a dyn MetricsSink,
    pub config: &'a AggregationConfig,
    /// Aggregation interval of the pass
    pub epr: EpochRange,
}

impl StripeIo<'_> {
    /// Probe, decide and carry out the disposition of `entry.stripe`.
    ///
    /// The stripe itself is left for the caller to clear.
    #[instrument(
        level = "debug",
        skip(self, entry),
        fields(oid = %entry.oid, stripe = entry.stripe.number())
    )]
    pub async fn process(&self, entry: &mut AggEntry) -> Result<StripeOutcome> {
        let started = Instant::now();
        let path = entry.path()?;
        entry.parity = prober::probe(
            self.store,
            &path,
            &entry.attr,
            entry.stripe.number(),
            self.epr.hi,
        )
        .await?;

        let disposition = select(&entry.attr, &entry.stripe, entry.parity.as_ref());
        debug!(
            ?disposition,
            fill = entry.stripe.fill(),
            hi_epoch = entry.stripe.hi_epoch(),
            parity_epoch = entry.parity.map(|p| p.epoch),
            extents = entry.stripe.extents().len(),
            "stripe disposition"
        );

        let outcome = match disposition {
            Disposition::RemoveStale => {
                self.write_back(WriteBack::remove_replicas(entry, self.epr.lo)?)
                    .await?;
                StripeOutcome::RemovedStale
            }
            Disposition::FullEncode => {
                self.full_encode(entry, &path).await?;
                StripeOutcome::Encoded
            }
            Disposition::NoOp => StripeOutcome::Skipped,
            Disposition::RecoverHoles => {
                self.recover_holes(entry, &path).await?;
                StripeOutcome::HolesRecovered
            }
            Disposition::PartialUpdate { recalc: true, .. } => {
                self.recalculate(entry, &path).await?;
                StripeOutcome::Updated { recalc: true }
            }
            Disposition::PartialUpdate {
                recalc: false,
                touched,
                ..
            } => {
                self.incremental(entry, &path, touched).await?;
                StripeOutcome::Updated { recalc: false }
            }
        };

        self.metrics.record_latency(
            metrics::OP_STRIPE,
            size_bucket(entry.cell_bytes()),
            started.elapsed(),
        );
        Ok(outcome)
    }

    /// Encode the stripe from the local replicas.
    async fn full_encode(&self, entry: &mut AggEntry, path: &ValuePath) -> Result<()> {
        entry.prepare_buffers();
        let stripe = entry.attr.stripe_recx(entry.stripe.number());
        let hi = entry.stripe.hi_epoch();
        let data = self.store.fetch(path, entry.rsize, &[stripe], hi).await?;
        entry.bufs.data.copy_from_slice(&data);

        self.encode(entry).await?;
        self.write_back(WriteBack::parity(entry, self.epr.lo, &entry.bufs.parity)?)
            .await
    }

    /// Re-encode the stripe from all `k` cells at `stripe.hi_epoch`. Cells
    /// fully covered by post-parity replicas come from the local replicas,
    /// the others from their data targets.
    async fn recalculate(&self, entry: &mut AggEntry, path: &ValuePath) -> Result<()> {
        let parity_epoch = self.parity_epoch(entry)?;
        let hi = entry.stripe.hi_epoch();
        entry.prepare_buffers();

        let local = entry.stripe.fresh_cells(&entry.attr, parity_epoch);
        self.fetch_cells(entry, path, local.complement(), hi, Slot::Data)
            .await?;
        let ranges: Vec<Recx> = local
            .iter()
            .map(|cell| entry.attr.cell_recx(entry.stripe.number(), cell))
            .collect();
        self.read_replicas(entry, path, &ranges, hi).await?;

        self.encode(entry).await?;
        self.write_back(WriteBack::parity(entry, self.epr.lo, &entry.bufs.parity)?)
            .await
    }

    /// Fold the post-parity replicas of the `touched` cells into the existing
    /// parity.
    async fn incremental(
        &self,
        entry: &mut AggEntry,
        path: &ValuePath,
        touched: CellSet,
    ) -> Result<()> {
        let parity_epoch = self.parity_epoch(entry)?;
        let hi = entry.stripe.hi_epoch();
        entry.prepare_buffers();

        // Pre-image of the touched cells, as encoded in the current parity
        self.fetch_cells(entry, path, touched, parity_epoch, Slot::Old)
            .await?;
        let cell_bytes = entry.cell_bytes();
        for cell in touched.iter() {
            let at = cell as usize * cell_bytes;
            let (data, old) = (&mut entry.bufs.data, &entry.bufs.old);
            data[at..at + cell_bytes].copy_from_slice(&old[at..at + cell_bytes]);
        }
        // New image: pre-image overlaid with the replicas; the diff is zero
        // wherever no replica landed
        let fresh = entry.stripe.fresh_ranges(&entry.attr, parity_epoch);
        self.read_replicas(entry, path, &fresh, hi).await?;

        self.fetch_parity(entry, path, parity_epoch).await?;

        let started = Instant::now();
        let bufs = std::mem::take(&mut entry.bufs);
        entry.bufs = offload::update(entry.codec.clone(), touched.iter().collect(), bufs).await?;
        self.metrics.record_latency(
            metrics::OP_UPDATE,
            size_bucket(cell_bytes),
            started.elapsed(),
        );

        self.write_back(WriteBack::parity(entry, self.epr.lo, &entry.bufs.parity)?)
            .await
    }

    /// Rebuild the stripe as replicas: data ranges at or above the parity
    /// epoch from the local store, the rest from the data targets. Punched
    /// ranges are written back as punches.
    async fn recover_holes(&self, entry: &mut AggEntry, path: &ValuePath) -> Result<()> {
        let parity_epoch = self.parity_epoch(entry)?;
        let hi = entry.stripe.hi_epoch();
        entry.prepare_buffers();

        let local = entry.stripe.valid_cells(&entry.attr, parity_epoch);
        self.fetch_cells(entry, path, local.complement(), hi, Slot::Data)
            .await?;
        let valid = entry.stripe.valid_ranges(&entry.attr, parity_epoch);
        self.read_replicas(entry, path, &valid, hi).await?;

        let holes = entry.stripe.hole_ranges(&entry.attr);
        info!(
            oid = %entry.oid,
            stripe = entry.stripe.number(),
            hi_epoch = hi,
            parity_epoch,
            holes = holes.len(),
            "punch newer than parity, converting stripe back to replicas"
        );
        self.write_back(WriteBack::recover_holes(
            entry,
            self.epr.lo,
            &entry.bufs.data,
            &holes,
        )?)
        .await
    }

    fn parity_epoch(&self, entry: &AggEntry) -> Result<Epoch> {
        entry.parity.map(|p| p.epoch).ok_or_else(|| {
            Error::Internal(format!("stripe {} has no parity", entry.stripe.number()))
        })
    }

    /// Fetch whole data cells from their data targets into a stripe buffer.
    async fn fetch_cells(
        &self,
        entry: &mut AggEntry,
        path: &ValuePath,
        cells: CellSet,
        epoch: Epoch,
        slot: Slot,
    ) -> Result<()> {
        let cell_bytes = entry.cell_bytes();
        let stripe = entry.stripe.number();
        for cell in cells.iter() {
            let bytes = remote::fetch(
                self.peers,
                self.metrics,
                entry.data_target(cell)?,
                &path.with_shard(cell),
                entry.rsize,
                &[entry.attr.cell_local_recx(stripe, cell)],
                epoch,
                self.config.max_fetch_retries,
            )
            .await?;
            let at = cell as usize * cell_bytes;
            let buf = match slot {
                Slot::Data => &mut entry.bufs.data,
                Slot::Old => &mut entry.bufs.old,
            };
            buf[at..at + cell_bytes].copy_from_slice(&bytes);
        }
        Ok(())
    }

    /// Read logical `ranges` of the current stripe from the local replicas
    /// into `bufs.data`.
    async fn read_replicas(
        &self,
        entry: &mut AggEntry,
        path: &ValuePath,
        ranges: &[Recx],
        epoch: Epoch,
    ) -> Result<()> {
        if ranges.is_empty() {
            return Ok(());
        }
        let bytes = self.store.fetch(path, entry.rsize, ranges, epoch).await?;
        let base = entry.attr.stripe_start(entry.stripe.number());
        scatter(&mut entry.bufs.data, base, entry.rsize, ranges, &bytes);
        Ok(())
    }

    /// Current parity cells: the local one from the store, the others from
    /// the peer parity targets.
    async fn fetch_parity(&self, entry: &mut AggEntry, path: &ValuePath, epoch: Epoch) -> Result<()> {
        let cell_bytes = entry.cell_bytes();
        let addr = entry.attr.parity_recx(entry.stripe.number());

        let local = self.store.fetch(path, entry.rsize, &[addr], epoch).await?;
        let at = entry.parity_index() * cell_bytes;
        entry.bufs.parity[at..at + cell_bytes].copy_from_slice(&local);

        for (shard, target) in entry.peer_parity_shards()? {
            let bytes = remote::fetch(
                self.peers,
                self.metrics,
                target,
                &path.with_shard(shard),
                entry.rsize,
                &[addr],
                epoch,
                self.config.max_fetch_retries,
            )
            .await?;
            let at = (shard - entry.attr.k) as usize * cell_bytes;
            entry.bufs.parity[at..at + cell_bytes].copy_from_slice(&bytes);
        }
        Ok(())
    }

    async fn encode(&self, entry: &mut AggEntry) -> Result<()> {
        let started = Instant::now();
        let bufs = std::mem::take(&mut entry.bufs);
        entry.bufs = offload::encode(entry.codec.clone(), bufs).await?;
        self.metrics.record_latency(
            metrics::OP_ENCODE,
            size_bucket(entry.cell_bytes()),
            started.elapsed(),
        );
        Ok(())
    }

    async fn write_back(&self, wb: WriteBack) -> Result<()> {
        if self.config.dry_run {
            info!(
                path = %wb.local.path,
                ops = wb.local.ops.len(),
                peers = wb.peers.len(),
                "[DRY-RUN] Would commit stripe write-back"
            );
            return Ok(());
        }
        wb.commit(
            self.store,
            self.peers,
            self.metrics,
            self.config.max_tx_retries,
        )
        .await
    }
}

/// Destination buffer of a data-cell fetch.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Data,
    Old,
}

/// Copy concatenated `bytes` of logical `ranges` into a stripe buffer whose
/// first byte is logical record `base`.
fn scatter(buf: &mut [u8], base: u64, rsize: u64, ranges: &[Recx], bytes: &[u8]) {
    let mut from = 0usize;
    for r in ranges {
        let at = ((r.idx - base) * rsize) as usize;
        let len = (r.nr * rsize) as usize;
        buf[at..at + len].copy_from_slice(&bytes[from..from + len]);
        from += len;
    }
    assert_eq!(from, bytes.len(), "fetched bytes do not match requested ranges");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ec::stripe::AggExtent;

    fn attr4() -> EcAttr {
        EcAttr::new(4, 1, 8).unwrap() // stripe = 32 records
    }

    fn stripe(extents: &[(u64, u64, Epoch, bool)]) -> Stripe {
        let attr = attr4();
        let mut s = Stripe::new();
        for &(idx, nr, epoch, is_hole) in extents {
            s.add(
                &attr,
                AggExtent {
                    recx: Recx::new(idx, nr),
                    epoch,
                    is_hole,
                },
            );
        }
        s
    }

    fn parity(epoch: Epoch) -> ParityExtent {
        ParityExtent {
            recx: Recx::new(0, 8),
            epoch,
        }
    }

    #[test]
    fn test_stale_replicas_are_removed() {
        let s = stripe(&[(0, 32, 3, false)]);
        assert_eq!(select(&attr4(), &s, Some(&parity(3))), Disposition::RemoveStale);
        assert_eq!(select(&attr4(), &s, Some(&parity(9))), Disposition::RemoveStale);
    }

    #[test]
    fn test_full_stripe_encodes() {
        let s = stripe(&[(0, 16, 4, false), (16, 16, 5, false)]);
        assert_eq!(select(&attr4(), &s, None), Disposition::FullEncode);
        assert_eq!(select(&attr4(), &s, Some(&parity(3))), Disposition::FullEncode);
    }

    #[test]
    fn test_filled_with_stale_extent_is_recalculated() {
        let s = stripe(&[(0, 16, 2, false), (16, 16, 5, false)]);
        match select(&attr4(), &s, Some(&parity(3))) {
            Disposition::PartialUpdate { recalc, .. } => assert!(recalc),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_partial_without_parity_is_noop() {
        let s = stripe(&[(0, 8, 4, false)]);
        assert_eq!(select(&attr4(), &s, None), Disposition::NoOp);
    }

    #[test]
    fn test_hole_newer_than_parity_takes_precedence() {
        let s = stripe(&[(0, 8, 4, false), (8, 8, 6, true)]);
        assert_eq!(select(&attr4(), &s, Some(&parity(5))), Disposition::RecoverHoles);
    }

    #[test]
    fn test_hole_older_than_parity_is_ignored() {
        let s = stripe(&[(0, 8, 2, true), (8, 4, 6, false)]);
        match select(&attr4(), &s, Some(&parity(3))) {
            Disposition::PartialUpdate { recalc, touched, .. } => {
                assert!(!recalc);
                assert_eq!(touched.iter().collect::<Vec<_>>(), vec![1]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_one_full_cell_of_four_is_incremental() {
        let s = stripe(&[(8, 8, 5, false)]);
        match select(&attr4(), &s, Some(&parity(2))) {
            Disposition::PartialUpdate {
                recalc,
                full,
                touched,
            } => {
                assert!(!recalc);
                assert_eq!(full.count(), 1);
                assert_eq!(touched.count(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_three_full_cells_of_four_recalculate() {
        let s = stripe(&[(0, 24, 5, false)]);
        match select(&attr4(), &s, Some(&parity(2))) {
            Disposition::PartialUpdate { recalc, full, .. } => {
                assert!(recalc);
                assert_eq!(full.count(), 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_all_cells_touched_recalculate() {
        let s = stripe(&[(1, 2, 5, false), (9, 2, 5, false), (17, 2, 5, false), (25, 2, 5, false)]);
        match select(&attr4(), &s, Some(&parity(2))) {
            Disposition::PartialUpdate { recalc, full, touched } => {
                assert!(recalc);
                assert!(full.is_empty());
                assert!(touched.is_full());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_touched_replica_older_than_parity_recalculates() {
        let s = stripe(&[(0, 4, 1, false), (8, 4, 5, false)]);
        match select(&attr4(), &s, Some(&parity(2))) {
            Disposition::PartialUpdate { recalc, full, .. } => {
                assert!(recalc);
                assert!(full.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_outcome_counters_are_distinct() {
        let outcomes = [
            StripeOutcome::RemovedStale,
            StripeOutcome::Encoded,
            StripeOutcome::Skipped,
            StripeOutcome::HolesRecovered,
            StripeOutcome::Updated { recalc: false },
            StripeOutcome::Updated { recalc: true },
        ];
        let mut names: Vec<_> = outcomes.iter().map(|o| o.counter()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), outcomes.len());
    }

    #[test]
    fn test_scatter_places_ranges() {
        let mut buf = vec![0u8; 8];
        scatter(&mut buf, 16, 2, &[Recx::new(16, 1), Recx::new(19, 1)], &[1, 2, 3, 4]);
        assert_eq!(buf, vec![1, 2, 0, 0, 0, 0, 3, 4]);
    }
}
