//! In-Memory Cluster Adapter
//!
//! A set of [`MemExtentStore`] targets wired together: `MemCluster`
//! implements the `PeerClient` port over them, `StaticPlacement` the
//! `Placement` port, and `EcClient` plays the client I/O path that writes EC
//! objects the way the aggregator expects to find them.
//!
//! ```text
//!   EcClient ── full stripe ──▶ data cells (local offsets) + parity cells
//!            └─ partial ──────▶ data cells (local offsets) + replicas on
//!                               every parity shard (logical offsets)
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, trace};

use super::memory::MemExtentStore;
use crate::domain::ports::{
    Epoch, ExtentStore, FetchReply, Key, Layout, LeaderStatus, ObjectClass, ObjectId, PeerClient,
    Placement, Recx, StoreTx, TargetId, UnitOid, ValuePath,
};
use crate::ec::codec::{codec_for, CodecKind};
use crate::ec::geometry::EcAttr;
use crate::error::{Error, Result};

// =============================================================================
// Cluster
// =============================================================================

/// Targets of a simulated pool, reachable as peers of each other.
#[derive(Debug)]
pub struct MemCluster {
    stores: Vec<Arc<MemExtentStore>>,
    /// Peer fetches left to fail with a transport error
    failing_fetches: AtomicU32,
    /// Peer fetches left to answer with a bad checksum
    corrupt_fetches: AtomicU32,
    fetches: AtomicU64,
    applies: AtomicU64,
}

impl MemCluster {
    pub fn new(targets: u32) -> Self {
        Self {
            stores: (0..targets)
                .map(|t| Arc::new(MemExtentStore::new(TargetId(t))))
                .collect(),
            failing_fetches: AtomicU32::new(0),
            corrupt_fetches: AtomicU32::new(0),
            fetches: AtomicU64::new(0),
            applies: AtomicU64::new(0),
        }
    }

    pub fn target_count(&self) -> u32 {
        self.stores.len() as u32
    }

    pub fn store(&self, target: TargetId) -> Result<Arc<MemExtentStore>> {
        self.stores
            .get(target.0 as usize)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("target {}", target)))
    }

    pub fn stores(&self) -> &[Arc<MemExtentStore>] {
        &self.stores
    }

    /// Fail the next `n` peer fetches in transit.
    pub fn fail_fetches(&self, n: u32) {
        self.failing_fetches.store(n, Ordering::SeqCst);
    }

    /// Corrupt the checksum of the next `n` peer fetch replies.
    pub fn corrupt_fetches(&self, n: u32) {
        self.corrupt_fetches.store(n, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn apply_count(&self) -> u64 {
        self.applies.load(Ordering::SeqCst)
    }
}

/// Decrement `counter` if positive; true if it was.
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl PeerClient for MemCluster {
    async fn fetch(
        &self,
        target: TargetId,
        path: &ValuePath,
        rsize: u64,
        recxs: &[Recx],
        epoch: Epoch,
    ) -> Result<FetchReply> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.failing_fetches) {
            return Err(Error::Transport {
                target: target.0,
                reason: "injected fetch failure".to_string(),
            });
        }

        let data = self.store(target)?.fetch(path, rsize, recxs, epoch).await?;
        let mut checksum = crc32fast::hash(&data);
        if take_one(&self.corrupt_fetches) {
            checksum = !checksum;
        }
        trace!(%target, %path, bytes = data.len(), "peer fetch");
        Ok(FetchReply {
            data: Bytes::from(data),
            checksum: Some(checksum),
        })
    }

    async fn apply(&self, target: TargetId, tx: &StoreTx) -> Result<()> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        self.store(target)?.commit(tx).await
    }
}

// =============================================================================
// Placement
// =============================================================================

/// Rotating placement over a fixed set of targets.
///
/// Shard `s` of an object lives on target `(hash(oid) + s) % targets`. The
/// last parity shard leads every dkey unless an override says otherwise.
#[derive(Debug)]
pub struct StaticPlacement {
    targets: u32,
    overrides: RwLock<HashMap<(ObjectId, Key), LeaderStatus>>,
}

impl StaticPlacement {
    pub fn new(targets: u32) -> Self {
        Self {
            targets,
            overrides: RwLock::new(HashMap::new()),
        }
    }

    /// Force the leadership answer for `dkey` of `oid` on every shard.
    pub fn set_status(&self, oid: ObjectId, dkey: Key, status: LeaderStatus) {
        self.overrides.write().insert((oid, dkey), status);
    }

    pub fn clear_status(&self, oid: ObjectId, dkey: &Key) {
        self.overrides.write().remove(&(oid, dkey.clone()));
    }

    /// Layout without going through the async port.
    pub fn layout_of(&self, oid: &ObjectId, attr: &EcAttr) -> Result<Layout> {
        let width = attr.tgt_count();
        if width > self.targets {
            return Err(Error::InvalidEcConfig(format!(
                "{}+{} needs {} targets, pool has {}",
                attr.k, attr.p, width, self.targets
            )));
        }
        let start = (oid.hi ^ oid.lo) % self.targets as u64;
        Ok(Layout::new(
            (0..width)
                .map(|s| TargetId(((start + s as u64) % self.targets as u64) as u32))
                .collect(),
        ))
    }
}

#[async_trait]
impl Placement for StaticPlacement {
    async fn check_leader(&self, oid: &UnitOid, attr: &EcAttr, dkey: &Key) -> Result<LeaderStatus> {
        if let Some(status) = self.overrides.read().get(&(oid.oid, dkey.clone())) {
            return Ok(*status);
        }
        if oid.shard == attr.tgt_count() - 1 {
            Ok(LeaderStatus::Leader)
        } else {
            Ok(LeaderStatus::NotLeader)
        }
    }

    async fn layout(&self, oid: &ObjectId, attr: &EcAttr) -> Result<Layout> {
        self.layout_of(oid, attr)
    }
}

// =============================================================================
// Client
// =============================================================================

/// One array value of an EC object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayValue {
    pub oid: ObjectId,
    pub attr: EcAttr,
    pub dkey: Key,
    pub akey: Key,
    pub rsize: u64,
}

impl ArrayValue {
    pub fn new(oid: ObjectId, attr: EcAttr, dkey: Key, akey: Key, rsize: u64) -> Self {
        Self {
            oid,
            attr,
            dkey,
            akey,
            rsize,
        }
    }

    /// Path of this value on `shard`.
    pub fn path(&self, shard: u32) -> ValuePath {
        ValuePath::new(
            UnitOid::new(self.oid, shard),
            self.dkey.clone(),
            self.akey.clone(),
        )
    }
}

/// Parity consistency of one stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParityCheck {
    /// No parity cell stored on `shard`
    Missing { shard: u32 },
    /// Every parity cell matches the data cells
    Match,
    /// Parity on `shard` disagrees with the data cells
    Mismatch { shard: u32 },
}

/// Client I/O path of an EC pool.
#[derive(Debug, Clone)]
pub struct EcClient {
    cluster: Arc<MemCluster>,
    placement: Arc<StaticPlacement>,
    codec: CodecKind,
}

impl EcClient {
    pub fn new(cluster: Arc<MemCluster>, placement: Arc<StaticPlacement>, codec: CodecKind) -> Self {
        Self {
            cluster,
            placement,
            codec,
        }
    }

    /// Register every shard of `oid` on its target.
    pub fn create_object(&self, oid: ObjectId, attr: EcAttr) -> Result<Layout> {
        let layout = self.placement.layout_of(&oid, &attr)?;
        for shard in 0..attr.tgt_count() {
            self.cluster
                .store(layout.target_of(shard)?)?
                .create_object(UnitOid::new(oid, shard), ObjectClass::ErasureCoded(attr));
        }
        debug!(%oid, k = attr.k, p = attr.p, ?layout, "created EC object");
        Ok(layout)
    }

    /// Write `data` at record `idx`. Whole stripes are encoded on the spot;
    /// the rest lands as replicas on the parity shards.
    pub async fn write(&self, value: &ArrayValue, idx: u64, data: &[u8], epoch: Epoch) -> Result<()> {
        let rsize = value.rsize as usize;
        if rsize == 0 || data.is_empty() || data.len() % rsize != 0 {
            return Err(Error::Internal(format!(
                "{} bytes is not a whole number of {}-byte records",
                data.len(),
                rsize
            )));
        }
        let attr = value.attr;
        let recx = Recx::new(idx, (data.len() / rsize) as u64);
        let mut txs = ShardTxs::new(value);

        for piece in attr.break_at_stripe_boundaries(&[recx]) {
            let bytes = slice_of(data, recx.idx, piece, value.rsize);
            if piece.nr == attr.stripe_rec_nr() {
                let stripe = attr.stripe_of(piece.idx);
                let mut parity = vec![0u8; attr.p as usize * attr.cell_len as usize * rsize];
                codec_for(&attr, self.codec)?.encode(bytes, &mut parity)?;
                let cell_bytes = attr.cell_len as usize * rsize;
                for j in 0..attr.p {
                    let at = j as usize * cell_bytes;
                    txs.get(attr.k + j).update(
                        attr.parity_recx(stripe),
                        epoch,
                        Some(Bytes::copy_from_slice(&parity[at..at + cell_bytes])),
                    );
                }
            } else {
                let replica = Bytes::copy_from_slice(bytes);
                for shard in attr.k..attr.tgt_count() {
                    txs.get(shard).update(piece, epoch, Some(replica.clone()));
                }
            }
            for cell in attr.break_at_cell_boundaries(&[piece]) {
                let local = Recx::new(attr.to_local(cell.idx), cell.nr);
                let cell_data = slice_of(data, recx.idx, cell, value.rsize);
                txs.get(attr.tgt_of(cell.idx))
                    .update(local, epoch, Some(Bytes::copy_from_slice(cell_data)));
            }
        }
        self.commit(value, txs).await
    }

    /// Punch `recx`: a hole on every data cell it covers and a hole replica on
    /// every parity shard.
    pub async fn punch(&self, value: &ArrayValue, recx: Recx, epoch: Epoch) -> Result<()> {
        let attr = value.attr;
        let mut txs = ShardTxs::new(value);
        for shard in attr.k..attr.tgt_count() {
            txs.get(shard).update(recx, epoch, None);
        }
        for cell in attr.break_at_cell_boundaries(&[recx]) {
            let local = Recx::new(attr.to_local(cell.idx), cell.nr);
            txs.get(attr.tgt_of(cell.idx)).update(local, epoch, None);
        }
        self.commit(value, txs).await
    }

    /// Read `recx` as of `epoch` from the data shards.
    pub async fn read(&self, value: &ArrayValue, recx: Recx, epoch: Epoch) -> Result<Vec<u8>> {
        let attr = value.attr;
        let layout = self.placement.layout_of(&value.oid, &attr)?;
        let mut out = Vec::with_capacity((recx.nr * value.rsize) as usize);
        for cell in attr.break_at_cell_boundaries(&[recx]) {
            let shard = attr.tgt_of(cell.idx);
            let local = Recx::new(attr.to_local(cell.idx), cell.nr);
            let bytes = self
                .cluster
                .store(layout.target_of(shard)?)?
                .fetch(&value.path(shard), value.rsize, &[local], epoch)
                .await?;
            out.extend_from_slice(&bytes);
        }
        Ok(out)
    }

    /// Re-encode stripe `stripe` from its data cells as of `epoch` and compare
    /// with the parity cells stored on the parity shards.
    pub async fn verify_stripe(&self, value: &ArrayValue, stripe: u64, epoch: Epoch) -> Result<ParityCheck> {
        let attr = value.attr;
        let layout = self.placement.layout_of(&value.oid, &attr)?;
        let data = self.read(value, attr.stripe_recx(stripe), epoch).await?;
        let cell_bytes = (attr.cell_len * value.rsize) as usize;
        let mut expected = vec![0u8; attr.p as usize * cell_bytes];
        codec_for(&attr, self.codec)?.encode(&data, &mut expected)?;

        let addr = attr.parity_recx(stripe);
        for j in 0..attr.p {
            let shard = attr.k + j;
            let store = self.cluster.store(layout.target_of(shard)?)?;
            let path = value.path(shard);
            if store.lookup(&path, addr, epoch).await?.is_none() {
                return Ok(ParityCheck::Missing { shard });
            }
            let stored = store.fetch(&path, value.rsize, &[addr], epoch).await?;
            let at = j as usize * cell_bytes;
            if stored[..] != expected[at..at + cell_bytes] {
                return Ok(ParityCheck::Mismatch { shard });
            }
        }
        Ok(ParityCheck::Match)
    }

    async fn commit(&self, value: &ArrayValue, txs: ShardTxs<'_>) -> Result<()> {
        let layout = self.placement.layout_of(&value.oid, &value.attr)?;
        for (shard, tx) in txs.txs {
            self.cluster.store(layout.target_of(shard)?)?.commit(&tx).await?;
        }
        Ok(())
    }
}

/// Per-shard transactions of one client operation.
struct ShardTxs<'a> {
    value: &'a ArrayValue,
    txs: BTreeMap<u32, StoreTx>,
}

impl<'a> ShardTxs<'a> {
    fn new(value: &'a ArrayValue) -> Self {
        Self {
            value,
            txs: BTreeMap::new(),
        }
    }

    fn get(&mut self, shard: u32) -> &mut StoreTx {
        let value = self.value;
        self.txs
            .entry(shard)
            .or_insert_with(|| StoreTx::new(value.path(shard), value.rsize))
    }
}

/// Bytes of `piece` inside a buffer starting at record `base`.
fn slice_of(data: &[u8], base: u64, piece: Recx, rsize: u64) -> &[u8] {
    let at = ((piece.idx - base) * rsize) as usize;
    &data[at..at + (piece.nr * rsize) as usize]
}
