//! Domain Ports (DDD Port/Adapter Pattern)
//!
//! The aggregation engine never talks to a storage engine, a transport or a
//! placement service directly. It depends on the traits defined here; the
//! `adapters` module provides concrete implementations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  ExtentStore │ PeerClient │ Placement │ YieldHook    │    │
//! │  │  MetricsSink                                         │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  MemExtentStore │ MemCluster │ StaticPlacement       │    │
//! │  │  PrometheusMetricsSink │ TokioYieldHook              │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::ops::ControlFlow;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use super::events::IterEvent;
use crate::ec::geometry::EcAttr;
use crate::error::{Error, Result};

// =============================================================================
// Value Objects
// =============================================================================

/// Logical timestamp totally ordering writes.
pub type Epoch = u64;

/// Inclusive epoch interval `[lo, hi]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EpochRange {
    pub lo: Epoch,
    pub hi: Epoch,
}

impl EpochRange {
    pub fn new(lo: Epoch, hi: Epoch) -> Self {
        Self { lo, hi }
    }

    pub fn contains(&self, epoch: Epoch) -> bool {
        epoch >= self.lo && epoch <= self.hi
    }
}

impl fmt::Display for EpochRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.lo, self.hi)
    }
}

/// Record extent: `nr` records starting at record index `idx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Recx {
    pub idx: u64,
    pub nr: u64,
}

impl Recx {
    pub fn new(idx: u64, nr: u64) -> Self {
        Self { idx, nr }
    }

    /// One past the last record.
    pub fn end(&self) -> u64 {
        self.idx + self.nr
    }

    pub fn is_empty(&self) -> bool {
        self.nr == 0
    }

    pub fn overlaps(&self, other: &Recx) -> bool {
        self.idx < other.end() && other.idx < self.end()
    }

    pub fn contains(&self, other: &Recx) -> bool {
        other.idx >= self.idx && other.end() <= self.end()
    }

    /// Overlapping part of two extents, if any.
    pub fn intersect(&self, other: &Recx) -> Option<Recx> {
        let lo = self.idx.max(other.idx);
        let hi = self.end().min(other.end());
        (lo < hi).then(|| Recx::new(lo, hi - lo))
    }
}

impl fmt::Display for Recx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}+{}", self.idx, self.nr)
    }
}

/// Object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    pub hi: u64,
    pub lo: u64,
}

impl ObjectId {
    pub fn new(hi: u64, lo: u64) -> Self {
        Self { hi, lo }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}.{:x}", self.hi, self.lo)
    }
}

/// One shard of an object: the cell index it holds among the `k + p` targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitOid {
    pub oid: ObjectId,
    pub shard: u32,
}

impl UnitOid {
    pub fn new(oid: ObjectId, shard: u32) -> Self {
        Self { oid, shard }
    }
}

impl fmt::Display for UnitOid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.oid, self.shard)
    }
}

/// Opaque distribution or attribute key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Key(pub Vec<u8>);

impl Key {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Storage target identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId(pub u32);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tgt-{}", self.0)
    }
}

/// Targets holding each shard of an object, in shard order (data then parity).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub targets: Vec<TargetId>,
}

impl Layout {
    pub fn new(targets: Vec<TargetId>) -> Self {
        Self { targets }
    }

    /// Target holding `shard`.
    pub fn target_of(&self, shard: u32) -> Result<TargetId> {
        self.targets.get(shard as usize).copied().ok_or_else(|| {
            Error::InvalidLayout(format!(
                "no target for shard {shard} in a layout of {}",
                self.targets.len()
            ))
        })
    }

    /// Fail unless the layout places exactly `width` shards.
    pub fn ensure_width(&self, width: u32) -> Result<()> {
        if self.targets.len() != width as usize {
            return Err(Error::InvalidLayout(format!(
                "{} targets for {width} shards",
                self.targets.len()
            )));
        }
        Ok(())
    }
}

/// Address of one array value: object shard, dkey and akey.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValuePath {
    pub oid: UnitOid,
    pub dkey: Key,
    pub akey: Key,
}

impl ValuePath {
    pub fn new(oid: UnitOid, dkey: Key, akey: Key) -> Self {
        Self { oid, dkey, akey }
    }

    /// Same value as seen by another shard of the object.
    pub fn with_shard(&self, shard: u32) -> Self {
        Self {
            oid: UnitOid::new(self.oid.oid, shard),
            dkey: self.dkey.clone(),
            akey: self.akey.clone(),
        }
    }
}

impl fmt::Display for ValuePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.oid, self.dkey, self.akey)
    }
}

/// Redundancy class of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectClass {
    Replicated { replicas: u32 },
    ErasureCoded(EcAttr),
}

impl ObjectClass {
    pub fn ec_attr(&self) -> Option<&EcAttr> {
        match self {
            ObjectClass::ErasureCoded(attr) => Some(attr),
            ObjectClass::Replicated { .. } => None,
        }
    }
}

/// Leadership of the local target for a dkey.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaderStatus {
    /// This target drives aggregation for the dkey
    Leader,
    /// Another target leads the dkey
    NotLeader,
    /// Leadership is changing (e.g. during rebuild); retry later
    InFlux,
}

/// An extent found by exact-match lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedRecx {
    pub recx: Recx,
    pub epoch: Epoch,
}

// =============================================================================
// Transactions
// =============================================================================

/// One mutation inside a [`StoreTx`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TxOp {
    /// Write `recx` at `epoch`; `None` data writes a punched hole
    Update {
        recx: Recx,
        epoch: Epoch,
        data: Option<Bytes>,
    },
    /// Remove every extent version inside `recx` whose epoch lies in `epr`
    Remove { recx: Recx, epr: EpochRange },
}

/// All-or-nothing batch against one array value on one target.
///
/// This is also the record shipped to peer targets, so applying the same
/// transaction twice must leave the target in the same state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreTx {
    pub path: ValuePath,
    pub rsize: u64,
    pub ops: Vec<TxOp>,
}

impl StoreTx {
    pub fn new(path: ValuePath, rsize: u64) -> Self {
        Self {
            path,
            rsize,
            ops: Vec::new(),
        }
    }

    pub fn update(&mut self, recx: Recx, epoch: Epoch, data: Option<Bytes>) -> &mut Self {
        self.ops.push(TxOp::Update { recx, epoch, data });
        self
    }

    pub fn remove(&mut self, recx: Recx, epr: EpochRange) -> &mut Self {
        self.ops.push(TxOp::Remove { recx, epr });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Data returned by a remote fetch.
#[derive(Debug, Clone)]
pub struct FetchReply {
    pub data: Bytes,
    /// CRC32 of `data` computed by the sender, if it sends one
    pub checksum: Option<u32>,
}

// =============================================================================
// Extent Store Port
// =============================================================================

/// Port onto one container of the local versioned extent store.
#[async_trait]
pub trait ExtentStore: Send + Sync {
    /// Target this store lives on.
    fn target(&self) -> TargetId;

    /// Ordered walk over objects, dkeys, akeys and visible replica extents
    /// written within `epr`. Parity-range extents are never yielded.
    fn iterate(&self, epr: EpochRange) -> BoxStream<'_, Result<IterEvent>>;

    /// Exact-match lookup of the newest extent at `recx` visible as of `epoch`.
    async fn lookup(&self, path: &ValuePath, recx: Recx, epoch: Epoch)
        -> Result<Option<VersionedRecx>>;

    /// Read `recxs` as visible at `epoch`, concatenated; unwritten and punched
    /// records read as zeroes.
    async fn fetch(&self, path: &ValuePath, rsize: u64, recxs: &[Recx], epoch: Epoch)
        -> Result<Vec<u8>>;

    /// Apply a transaction atomically. Fails with `Error::TxConflict` when
    /// it must be restarted.
    async fn commit(&self, tx: &StoreTx) -> Result<()>;

    /// Persisted aggregated-through epoch of this container.
    async fn low_water(&self) -> Result<Epoch>;

    /// Persist a new aggregated-through epoch.
    async fn set_low_water(&self, epoch: Epoch) -> Result<()>;
}

// =============================================================================
// Peer Port
// =============================================================================

/// Port onto the transport reaching the other shards of an object.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Read `recxs` from `path` on `target` as visible at `epoch`.
    async fn fetch(
        &self,
        target: TargetId,
        path: &ValuePath,
        rsize: u64,
        recxs: &[Recx],
        epoch: Epoch,
    ) -> Result<FetchReply>;

    /// Apply `tx` on `target`. Must be idempotent.
    async fn apply(&self, target: TargetId, tx: &StoreTx) -> Result<()>;
}

// =============================================================================
// Placement Port
// =============================================================================

/// Port onto placement and leadership resolution.
#[async_trait]
pub trait Placement: Send + Sync {
    /// Whether the local target leads aggregation of `dkey` in `oid`.
    async fn check_leader(&self, oid: &UnitOid, attr: &EcAttr, dkey: &Key)
        -> Result<LeaderStatus>;

    /// Targets holding the shards of `oid`.
    async fn layout(&self, oid: &ObjectId, attr: &EcAttr) -> Result<Layout>;
}

// =============================================================================
// Scheduling & Metrics Ports
// =============================================================================

/// Cooperative yield injected by the scheduler.
#[async_trait]
pub trait YieldHook: Send + Sync {
    /// Give up the worker; `Break` tears the pass down.
    async fn yield_now(&self) -> ControlFlow<()>;
}

/// Metrics capability handed to the aggregator at construction.
pub trait MetricsSink: Send + Sync {
    fn record_latency(&self, op: &'static str, bucket: &'static str, value: Duration);

    fn increment(&self, counter: &'static str);

    fn set_gauge(&self, gauge: &'static str, value: f64);
}
