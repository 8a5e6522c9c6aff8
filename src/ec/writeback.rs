//! Write-back & Cleanup Coordinator
//!
//! Turns the result of a stripe disposition into one transaction per parity
//! target: the local commit plus an idempotent remote apply on every peer
//! parity target. Parity upserts and replica removal travel in the same
//! transaction, so a stripe is either fully converted or left as it was.
//!
//! ```text
//!  peer apply (p - 1 targets) ──▶ local commit
//!        ▲                              │
//!        └──── TxConflict, retry ◀──────┘
//! ```

use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, warn};

use super::entry::AggEntry;
use crate::domain::ports::{
    Epoch, EpochRange, ExtentStore, MetricsSink, PeerClient, Recx, StoreTx, TargetId, TxOp,
};
use crate::error::{Error, Result};
use crate::metrics::{self, size_bucket};

/// Transactions finishing one stripe.
#[derive(Debug, Clone)]
pub struct WriteBack {
    /// Commit on the local (leader) parity target
    pub local: StoreTx,
    /// Remote applies, one per peer parity target
    pub peers: Vec<(TargetId, StoreTx)>,
}

impl WriteBack {
    /// One transaction per parity shard of `entry`, built by `ops`.
    fn build(entry: &AggEntry, mut ops: impl FnMut(&mut StoreTx, usize)) -> Result<Self> {
        let path = entry.path()?;
        let mut local = None;
        let mut peers = Vec::with_capacity(entry.attr.p as usize - 1);
        for shard in entry.attr.k..entry.attr.tgt_count() {
            let mut tx = StoreTx::new(path.with_shard(shard), entry.rsize);
            ops(&mut tx, (shard - entry.attr.k) as usize);
            if shard == entry.oid.shard {
                local = Some(tx);
            } else {
                peers.push((entry.layout.target_of(shard)?, tx));
            }
        }
        let local = local.ok_or_else(|| {
            Error::Internal(format!("{} is not a parity shard", entry.oid))
        })?;
        Ok(Self { local, peers })
    }

    /// Replica removal over the current stripe in `[lo, stripe.hi_epoch]`.
    pub fn remove_replicas(entry: &AggEntry, lo: Epoch) -> Result<Self> {
        let range = entry.attr.stripe_recx(entry.stripe.number());
        let epr = EpochRange::new(lo, entry.stripe.hi_epoch());
        Self::build(entry, |tx, _| {
            tx.remove(range, epr);
        })
    }

    /// New parity for the current stripe at `stripe.hi_epoch`, merged with
    /// the replica removal. `parity` holds all `p` cells.
    pub fn parity(entry: &AggEntry, lo: Epoch, parity: &[u8]) -> Result<Self> {
        let cell_bytes = entry.cell_bytes();
        assert_eq!(
            parity.len(),
            cell_bytes * entry.attr.p as usize,
            "parity buffer does not hold {} cells",
            entry.attr.p
        );
        let stripe = entry.stripe.number();
        let range = entry.attr.stripe_recx(stripe);
        let hi = entry.stripe.hi_epoch();
        let addr = entry.attr.parity_recx(stripe);
        Self::build(entry, |tx, j| {
            let cell = Bytes::copy_from_slice(&parity[j * cell_bytes..(j + 1) * cell_bytes]);
            tx.remove(range, EpochRange::new(lo, hi))
                .update(addr, hi, Some(cell));
        })
    }

    /// Convert the stripe back to replicas: drop its parity and replicas,
    /// write `data` (the whole stripe) as replicas at `stripe.hi_epoch`
    /// everywhere outside `holes`, and punch `holes` at the same epoch.
    pub fn recover_holes(entry: &AggEntry, lo: Epoch, data: &[u8], holes: &[Recx]) -> Result<Self> {
        let stripe = entry.stripe.number();
        let range = entry.attr.stripe_recx(stripe);
        assert_eq!(
            data.len() as u64,
            range.nr * entry.rsize,
            "stripe buffer does not hold a full stripe"
        );
        let hi = entry.stripe.hi_epoch();
        let addr = entry.attr.parity_recx(stripe);
        let segments: Vec<(Recx, Bytes)> = data_segments(range, holes)
            .into_iter()
            .map(|seg| {
                let at = ((seg.idx - range.idx) * entry.rsize) as usize;
                let len = (seg.nr * entry.rsize) as usize;
                (seg, Bytes::copy_from_slice(&data[at..at + len]))
            })
            .collect();
        Self::build(entry, |tx, _| {
            tx.remove(range, EpochRange::new(lo, hi))
                .remove(addr, EpochRange::new(0, hi));
            for (seg, bytes) in &segments {
                tx.update(*seg, hi, Some(bytes.clone()));
            }
            for hole in holes {
                tx.update(*hole, hi, None);
            }
        })
    }

    /// Apply to the peers, then commit locally. A conflict anywhere restarts
    /// the whole sequence, up to `max_retries` times; peer applies are
    /// idempotent so re-issuing them is safe.
    pub async fn commit(
        &self,
        store: &dyn ExtentStore,
        peers: &dyn PeerClient,
        metrics_sink: &dyn MetricsSink,
        max_retries: u32,
    ) -> Result<()> {
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            match self.try_commit(store, peers).await {
                Ok(()) => break,
                Err(Error::TxConflict(reason)) if attempt < max_retries => {
                    attempt += 1;
                    metrics_sink.increment(metrics::TX_RETRIES);
                    warn!(path = %self.local.path, attempt, %reason, "restarting write-back");
                }
                Err(e) => return Err(e),
            }
        }

        let bytes: usize = self.local.ops.iter().map(op_bytes).sum();
        metrics_sink.record_latency(metrics::OP_COMMIT, size_bucket(bytes), started.elapsed());
        debug!(
            path = %self.local.path,
            ops = self.local.ops.len(),
            peers = self.peers.len(),
            attempts = attempt + 1,
            "write-back committed"
        );
        Ok(())
    }

    async fn try_commit(&self, store: &dyn ExtentStore, peers: &dyn PeerClient) -> Result<()> {
        for (target, tx) in &self.peers {
            peers.apply(*target, tx).await?;
        }
        store.commit(&self.local).await
    }
}

/// Parts of `range` not covered by any of `holes`, in offset order.
fn data_segments(range: Recx, holes: &[Recx]) -> Vec<Recx> {
    let mut holes: Vec<Recx> = holes.iter().filter_map(|h| h.intersect(&range)).collect();
    holes.sort_by_key(|h| h.idx);
    let mut out = Vec::new();
    let mut at = range.idx;
    for h in holes {
        if h.idx > at {
            out.push(Recx::new(at, h.idx - at));
        }
        at = at.max(h.end());
    }
    if at < range.end() {
        out.push(Recx::new(at, range.end() - at));
    }
    out
}

fn op_bytes(op: &TxOp) -> usize {
    match op {
        TxOp::Update { data: Some(d), .. } => d.len(),
        _ => 0,
    }
}
