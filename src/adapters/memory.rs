//! In-Memory Extent Store Adapter
//!
//! Implements the `ExtentStore` port over a versioned, in-process extent map
//! for one storage target. Every write is kept as a version tagged with its
//! epoch; reads resolve the newest version covering each record. This is the
//! store the simulation binary and the integration tests aggregate against.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::domain::events::{ExtentEntry, IterEvent};
use crate::domain::ports::{
    Epoch, EpochRange, ExtentStore, Key, ObjectClass, Recx, StoreTx, TargetId, TxOp, UnitOid,
    ValuePath, VersionedRecx,
};
use crate::ec::geometry::is_parity;
use crate::error::{Error, Result};

/// One stored extent version, as seen by tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredExtent {
    pub recx: Recx,
    pub epoch: Epoch,
    pub is_hole: bool,
}

#[derive(Debug, Clone)]
struct Version {
    recx: Recx,
    epoch: Epoch,
    /// Insertion order, breaks ties between equal epochs
    seq: u64,
    /// `None` for punched ranges
    data: Option<Bytes>,
}

impl Version {
    /// Part of this version inside `range`, with its data sliced to match.
    fn slice(&self, range: Recx, rsize: u64) -> Version {
        let data = self.data.as_ref().map(|d| {
            let from = ((range.idx - self.recx.idx) * rsize) as usize;
            d.slice(from..from + (range.nr * rsize) as usize)
        });
        Version {
            recx: range,
            epoch: self.epoch,
            seq: self.seq,
            data,
        }
    }
}

#[derive(Debug)]
struct ValueState {
    rsize: u64,
    versions: Vec<Version>,
}

impl ValueState {
    /// Drop the parts of every version inside `recx` whose epoch lies in `epr`.
    fn punch(&mut self, recx: Recx, epr: EpochRange) {
        let rsize = self.rsize;
        let mut kept = Vec::with_capacity(self.versions.len());
        for v in self.versions.drain(..) {
            if !epr.contains(v.epoch) || !v.recx.overlaps(&recx) {
                kept.push(v);
                continue;
            }
            if v.recx.idx < recx.idx {
                kept.push(v.slice(Recx::new(v.recx.idx, recx.idx - v.recx.idx), rsize));
            }
            if v.recx.end() > recx.end() {
                kept.push(v.slice(Recx::new(recx.end(), v.recx.end() - recx.end()), rsize));
            }
        }
        self.versions = kept;
    }

    /// Versions readable as of `epoch`, oldest first.
    fn readable(&self, epoch: Epoch) -> Vec<&Version> {
        let mut live: Vec<&Version> = self.versions.iter().filter(|v| v.epoch <= epoch).collect();
        live.sort_by_key(|v| (v.epoch, v.seq));
        live
    }

    /// Visible replica extents as of `epr.hi`, restricted to those written
    /// within `epr`, in offset order.
    fn visible(&self, epr: EpochRange) -> Vec<ExtentEntry> {
        let live: Vec<&Version> = self
            .readable(epr.hi)
            .into_iter()
            .filter(|v| !is_parity(v.recx.idx))
            .collect();

        let mut edges: Vec<u64> = live.iter().flat_map(|v| [v.recx.idx, v.recx.end()]).collect();
        edges.sort_unstable();
        edges.dedup();

        let mut out: Vec<ExtentEntry> = Vec::new();
        for w in edges.windows(2) {
            let seg = Recx::new(w[0], w[1] - w[0]);
            // `live` is oldest first, so the last covering version wins
            let Some(top) = live.iter().rev().find(|v| v.recx.contains(&seg)) else {
                continue;
            };
            if top.epoch < epr.lo {
                continue;
            }
            let is_hole = top.data.is_none();
            if let Some(last) = out.last_mut() {
                if last.recx.end() == seg.idx
                    && last.epoch == top.epoch
                    && last.orig_recx == top.recx
                    && last.is_hole == is_hole
                {
                    last.recx.nr += seg.nr;
                    continue;
                }
            }
            out.push(ExtentEntry {
                recx: seg,
                orig_recx: top.recx,
                epoch: top.epoch,
                is_hole,
            });
        }
        out
    }
}

#[derive(Debug)]
struct ObjectState {
    class: ObjectClass,
    last_write: Epoch,
    dkeys: BTreeMap<Key, BTreeMap<Key, ValueState>>,
}

#[derive(Debug, Default)]
struct StoreState {
    objects: BTreeMap<UnitOid, ObjectState>,
    low_water: Epoch,
    seq: u64,
}

/// Versioned extent store of one target, held in memory.
#[derive(Debug)]
pub struct MemExtentStore {
    target: TargetId,
    state: RwLock<StoreState>,
    /// Commits left to fail with a conflict
    injected_conflicts: AtomicU32,
    commits: AtomicU64,
}

impl MemExtentStore {
    pub fn new(target: TargetId) -> Self {
        Self {
            target,
            state: RwLock::new(StoreState::default()),
            injected_conflicts: AtomicU32::new(0),
            commits: AtomicU64::new(0),
        }
    }

    /// Register an object shard; writes to unknown shards are rejected.
    pub fn create_object(&self, oid: UnitOid, class: ObjectClass) {
        let mut state = self.state.write();
        state.objects.entry(oid).or_insert_with(|| ObjectState {
            class,
            last_write: 0,
            dkeys: BTreeMap::new(),
        });
    }

    /// Fail the next `n` commits with `Error::TxConflict`.
    pub fn inject_conflicts(&self, n: u32) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    /// Commits applied successfully so far.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Every stored version of a value, hidden ones included, in offset order.
    pub fn extents(&self, path: &ValuePath) -> Vec<StoredExtent> {
        let state = self.state.read();
        let mut out: Vec<StoredExtent> = state
            .objects
            .get(&path.oid)
            .and_then(|o| o.dkeys.get(&path.dkey))
            .and_then(|d| d.get(&path.akey))
            .map(|v| {
                v.versions
                    .iter()
                    .map(|v| StoredExtent {
                        recx: v.recx,
                        epoch: v.epoch,
                        is_hole: v.data.is_none(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by_key(|e| (e.recx.idx, e.epoch));
        out
    }

    /// Stored replica (non-parity) versions of a value.
    pub fn replica_extents(&self, path: &ValuePath) -> Vec<StoredExtent> {
        self.extents(path)
            .into_iter()
            .filter(|e| !is_parity(e.recx.idx))
            .collect()
    }

    /// Stored parity versions of a value.
    pub fn parity_extents(&self, path: &ValuePath) -> Vec<StoredExtent> {
        self.extents(path)
            .into_iter()
            .filter(|e| is_parity(e.recx.idx))
            .collect()
    }

    /// Object shards held by this target.
    pub fn objects(&self) -> Vec<(UnitOid, ObjectClass)> {
        self.state
            .read()
            .objects
            .iter()
            .map(|(oid, o)| (*oid, o.class))
            .collect()
    }

    /// Dkey/akey pairs written under an object shard.
    pub fn keys(&self, oid: &UnitOid) -> Vec<(Key, Key, u64)> {
        let state = self.state.read();
        let Some(obj) = state.objects.get(oid) else {
            return Vec::new();
        };
        obj.dkeys
            .iter()
            .flat_map(|(dkey, akeys)| {
                akeys
                    .iter()
                    .map(move |(akey, v)| (dkey.clone(), akey.clone(), v.rsize))
            })
            .collect()
    }

    fn check_tx(state: &StoreState, tx: &StoreTx) -> Result<()> {
        let obj = state
            .objects
            .get(&tx.path.oid)
            .ok_or_else(|| Error::NotFound(format!("object shard {}", tx.path.oid)))?;
        if tx.rsize == 0 {
            return Err(Error::Internal(format!("zero record size for {}", tx.path)));
        }
        if let Some(value) = obj.dkeys.get(&tx.path.dkey).and_then(|d| d.get(&tx.path.akey)) {
            if value.rsize != tx.rsize {
                return Err(Error::Internal(format!(
                    "record size {} does not match stored size {} for {}",
                    tx.rsize, value.rsize, tx.path
                )));
            }
        }
        for op in &tx.ops {
            if let TxOp::Update {
                recx,
                data: Some(data),
                ..
            } = op
            {
                if data.len() as u64 != recx.nr * tx.rsize {
                    return Err(Error::Internal(format!(
                        "{} bytes supplied for {} records of size {}",
                        data.len(),
                        recx.nr,
                        tx.rsize
                    )));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ExtentStore for MemExtentStore {
    fn target(&self) -> TargetId {
        self.target
    }

    fn iterate(&self, epr: EpochRange) -> BoxStream<'_, Result<IterEvent>> {
        let state = self.state.read();
        let mut events = Vec::new();
        for (oid, obj) in &state.objects {
            events.push(IterEvent::Object {
                oid: *oid,
                class: obj.class,
                last_write: obj.last_write,
            });
            for (dkey, akeys) in &obj.dkeys {
                let mut dkey_pushed = false;
                for (akey, value) in akeys {
                    let extents = value.visible(epr);
                    if extents.is_empty() {
                        continue;
                    }
                    if !dkey_pushed {
                        events.push(IterEvent::Dkey { dkey: dkey.clone() });
                        dkey_pushed = true;
                    }
                    events.push(IterEvent::Akey {
                        akey: akey.clone(),
                        rsize: value.rsize,
                    });
                    events.extend(extents.into_iter().map(IterEvent::Recx));
                }
            }
        }
        trace!(target_id = %self.target, %epr, events = events.len(), "iteration snapshot");
        stream::iter(events.into_iter().map(Ok)).boxed()
    }

    async fn lookup(
        &self,
        path: &ValuePath,
        recx: Recx,
        epoch: Epoch,
    ) -> Result<Option<VersionedRecx>> {
        let state = self.state.read();
        let Some(value) = state
            .objects
            .get(&path.oid)
            .and_then(|o| o.dkeys.get(&path.dkey))
            .and_then(|d| d.get(&path.akey))
        else {
            return Ok(None);
        };

        let newest = value
            .readable(epoch)
            .into_iter()
            .rev()
            .find(|v| v.recx.overlaps(&recx));
        Ok(newest
            .filter(|v| v.recx == recx && v.data.is_some())
            .map(|v| VersionedRecx {
                recx: v.recx,
                epoch: v.epoch,
            }))
    }

    async fn fetch(
        &self,
        path: &ValuePath,
        rsize: u64,
        recxs: &[Recx],
        epoch: Epoch,
    ) -> Result<Vec<u8>> {
        let total: u64 = recxs.iter().map(|r| r.nr * rsize).sum();
        let mut out = Vec::with_capacity(total as usize);

        let state = self.state.read();
        let value = state
            .objects
            .get(&path.oid)
            .and_then(|o| o.dkeys.get(&path.dkey))
            .and_then(|d| d.get(&path.akey));
        if let Some(value) = value {
            if value.rsize != rsize {
                return Err(Error::Internal(format!(
                    "fetch with record size {} from {} stored with size {}",
                    rsize, path, value.rsize
                )));
            }
        }

        for recx in recxs {
            let mut buf = vec![0u8; (recx.nr * rsize) as usize];
            if let Some(value) = value {
                for v in value.readable(epoch) {
                    let Some(hit) = v.recx.intersect(recx) else {
                        continue;
                    };
                    let dst = ((hit.idx - recx.idx) * rsize) as usize;
                    let len = (hit.nr * rsize) as usize;
                    match &v.data {
                        Some(data) => {
                            let src = ((hit.idx - v.recx.idx) * rsize) as usize;
                            buf[dst..dst + len].copy_from_slice(&data[src..src + len]);
                        }
                        None => buf[dst..dst + len].fill(0),
                    }
                }
            }
            out.extend_from_slice(&buf);
        }
        Ok(out)
    }

    async fn commit(&self, tx: &StoreTx) -> Result<()> {
        if self
            .injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            debug!(target_id = %self.target, path = %tx.path, "injected transaction conflict");
            return Err(Error::TxConflict(format!(
                "conflict on {} at {}",
                tx.path, self.target
            )));
        }

        let mut state = self.state.write();
        Self::check_tx(&state, tx)?;

        let mut seq = state.seq;
        let obj = state
            .objects
            .get_mut(&tx.path.oid)
            .ok_or_else(|| Error::NotFound(format!("object shard {}", tx.path.oid)))?;
        for op in &tx.ops {
            match op {
                TxOp::Update { recx, epoch, data } => {
                    let value = obj
                        .dkeys
                        .entry(tx.path.dkey.clone())
                        .or_default()
                        .entry(tx.path.akey.clone())
                        .or_insert_with(|| ValueState {
                            rsize: tx.rsize,
                            versions: Vec::new(),
                        });
                    // Rewriting an epoch replaces what it held
                    value.punch(*recx, EpochRange::new(*epoch, *epoch));
                    seq += 1;
                    value.versions.push(Version {
                        recx: *recx,
                        epoch: *epoch,
                        seq,
                        data: data.clone(),
                    });
                    obj.last_write = obj.last_write.max(*epoch);
                }
                TxOp::Remove { recx, epr } => {
                    if let Some(value) = obj
                        .dkeys
                        .get_mut(&tx.path.dkey)
                        .and_then(|d| d.get_mut(&tx.path.akey))
                    {
                        value.punch(*recx, *epr);
                    }
                }
            }
        }
        state.seq = seq;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn low_water(&self) -> Result<Epoch> {
        Ok(self.state.read().low_water)
    }

    async fn set_low_water(&self, epoch: Epoch) -> Result<()> {
        let mut state = self.state.write();
        state.low_water = state.low_water.max(epoch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::ObjectId;
    use crate::ec::geometry::{set_parity, EcAttr};

    fn path() -> ValuePath {
        ValuePath::new(UnitOid::new(ObjectId::new(0, 1), 2), "d".into(), "a".into())
    }

    fn store() -> MemExtentStore {
        let store = MemExtentStore::new(TargetId(0));
        let attr = EcAttr::new(2, 1, 4).unwrap();
        store.create_object(path().oid, ObjectClass::ErasureCoded(attr));
        store
    }

    async fn write(store: &MemExtentStore, recx: Recx, epoch: Epoch, byte: u8) {
        let mut tx = StoreTx::new(path(), 1);
        tx.update(recx, epoch, Some(Bytes::from(vec![byte; recx.nr as usize])));
        store.commit(&tx).await.unwrap();
    }

    async fn punch(store: &MemExtentStore, recx: Recx, epoch: Epoch) {
        let mut tx = StoreTx::new(path(), 1);
        tx.update(recx, epoch, None);
        store.commit(&tx).await.unwrap();
    }

    async fn recxs(store: &MemExtentStore, epr: EpochRange) -> Vec<ExtentEntry> {
        store
            .iterate(epr)
            .filter_map(|e| async move {
                match e.unwrap() {
                    IterEvent::Recx(ext) => Some(ext),
                    _ => None,
                }
            })
            .collect::<Vec<_>>()
            .await
    }

    #[tokio::test]
    async fn test_fetch_resolves_newest_version() {
        let s = store();
        write(&s, Recx::new(0, 8), 1, 0xAA).await;
        write(&s, Recx::new(2, 2), 3, 0xBB).await;

        let now = s.fetch(&path(), 1, &[Recx::new(0, 8)], 5).await.unwrap();
        assert_eq!(now, vec![0xAA, 0xAA, 0xBB, 0xBB, 0xAA, 0xAA, 0xAA, 0xAA]);

        let before = s.fetch(&path(), 1, &[Recx::new(2, 2)], 2).await.unwrap();
        assert_eq!(before, vec![0xAA, 0xAA]);

        // Unwritten records read as zeroes
        let beyond = s.fetch(&path(), 1, &[Recx::new(6, 4)], 5).await.unwrap();
        assert_eq!(beyond, vec![0xAA, 0xAA, 0, 0]);
    }

    #[tokio::test]
    async fn test_punch_reads_as_zero() {
        let s = store();
        write(&s, Recx::new(0, 4), 1, 7).await;
        punch(&s, Recx::new(1, 2), 2).await;
        let data = s.fetch(&path(), 1, &[Recx::new(0, 4)], 2).await.unwrap();
        assert_eq!(data, vec![7, 0, 0, 7]);
    }

    #[tokio::test]
    async fn test_iterate_yields_visible_extents() {
        let s = store();
        write(&s, Recx::new(0, 8), 1, 1).await;
        write(&s, Recx::new(2, 2), 2, 2).await;
        punch(&s, Recx::new(6, 4), 3).await;

        let all = recxs(&s, EpochRange::new(0, 5)).await;
        let shape: Vec<(Recx, Epoch, bool)> =
            all.iter().map(|e| (e.recx, e.epoch, e.is_hole)).collect();
        assert_eq!(
            shape,
            vec![
                (Recx::new(0, 2), 1, false),
                (Recx::new(2, 2), 2, false),
                (Recx::new(4, 2), 1, false),
                (Recx::new(6, 4), 3, true),
            ]
        );
        assert_eq!(all[0].orig_recx, Recx::new(0, 8));

        // Lower bound filters visible extents, it does not uncover old ones
        let recent = recxs(&s, EpochRange::new(2, 5)).await;
        assert_eq!(recent.len(), 2);
        assert!(recent.iter().all(|e| e.epoch >= 2));
    }

    #[tokio::test]
    async fn test_iterate_skips_parity_range() {
        let s = store();
        write(&s, Recx::new(set_parity(0), 4), 1, 9).await;
        assert!(recxs(&s, EpochRange::new(0, 5)).await.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_exact_match() {
        let s = store();
        let par = Recx::new(set_parity(4), 4);
        write(&s, par, 2, 9).await;
        write(&s, par, 4, 8).await;

        let found = s.lookup(&path(), par, 3).await.unwrap().unwrap();
        assert_eq!(found.epoch, 2);
        let newest = s.lookup(&path(), par, 10).await.unwrap().unwrap();
        assert_eq!(newest.epoch, 4);
        assert!(s.lookup(&path(), par, 1).await.unwrap().is_none());
        assert!(s
            .lookup(&path(), Recx::new(set_parity(0), 4), 10)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_remove_trims_by_epoch_range() {
        let s = store();
        write(&s, Recx::new(0, 12), 1, 1).await;
        write(&s, Recx::new(4, 4), 5, 2).await;

        let mut tx = StoreTx::new(path(), 1);
        tx.remove(Recx::new(0, 8), EpochRange::new(0, 3));
        s.commit(&tx).await.unwrap();

        let left = s.extents(&path());
        assert_eq!(
            left,
            vec![
                StoredExtent {
                    recx: Recx::new(4, 4),
                    epoch: 5,
                    is_hole: false
                },
                StoredExtent {
                    recx: Recx::new(8, 4),
                    epoch: 1,
                    is_hole: false
                },
            ]
        );
        let tail = s.fetch(&path(), 1, &[Recx::new(8, 4)], 9).await.unwrap();
        assert_eq!(tail, vec![1; 4]);
    }

    #[tokio::test]
    async fn test_commit_replay_is_idempotent() {
        let s = store();
        write(&s, Recx::new(0, 8), 1, 1).await;
        let mut tx = StoreTx::new(path(), 1);
        tx.remove(Recx::new(0, 8), EpochRange::new(0, 2))
            .update(Recx::new(set_parity(0), 4), 2, Some(Bytes::from(vec![5u8; 4])));
        s.commit(&tx).await.unwrap();
        let once = s.extents(&path());
        s.commit(&tx).await.unwrap();
        assert_eq!(s.extents(&path()), once);
        assert_eq!(once.len(), 1);
    }

    #[tokio::test]
    async fn test_injected_conflict_leaves_state_untouched() {
        let s = store();
        s.inject_conflicts(1);
        let mut tx = StoreTx::new(path(), 1);
        tx.update(Recx::new(0, 2), 1, Some(Bytes::from_static(&[1, 2])));
        let err = s.commit(&tx).await.unwrap_err();
        assert!(matches!(err, Error::TxConflict(_)));
        assert!(s.extents(&path()).is_empty());

        s.commit(&tx).await.unwrap();
        assert_eq!(s.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_commit_rejects_bad_payload() {
        let s = store();
        let mut tx = StoreTx::new(path(), 1);
        tx.update(Recx::new(0, 4), 1, Some(Bytes::from_static(&[1])));
        assert!(s.commit(&tx).await.is_err());

        let unknown = ValuePath::new(UnitOid::new(ObjectId::new(9, 9), 0), "d".into(), "a".into());
        let tx = StoreTx::new(unknown, 1);
        assert!(matches!(s.commit(&tx).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_low_water_only_moves_forward() {
        let s = store();
        s.set_low_water(5).await.unwrap();
        s.set_low_water(3).await.unwrap();
        assert_eq!(s.low_water().await.unwrap(), 5);
    }
}
