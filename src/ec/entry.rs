//! Aggregation Entry
//!
//! Per-object state carried across the stripes of one object: identity,
//! class attributes, codec handle, placement layout, the current key pair and
//! stripe, and the scratch buffers the codec works in. The entry is reused
//! from object to object so the buffers keep their allocation.

use std::sync::Arc;

use super::codec::ParityCodec;
use super::geometry::EcAttr;
use super::prober::ParityExtent;
use super::stripe::Stripe;
use crate::domain::ports::{Key, Layout, TargetId, UnitOid, ValuePath};
use crate::error::{Error, Result};

/// Codec working memory: local data, fetched old data, parity, one-cell diff.
#[derive(Debug, Default)]
pub struct ScratchBuffers {
    /// `k` data cells
    pub data: Vec<u8>,
    /// `k` cells of pre-image data for incremental updates
    pub old: Vec<u8>,
    /// `p` parity cells
    pub parity: Vec<u8>,
    pub diff: Vec<u8>,
}

impl ScratchBuffers {
    /// Size the buffers for `k` data and `p` parity cells of `cell_bytes`
    /// each and zero them. Capacity is kept, so a smaller geometry does not
    /// reallocate.
    pub fn prepare(&mut self, k: usize, p: usize, cell_bytes: usize) {
        fit(&mut self.data, k * cell_bytes);
        fit(&mut self.old, k * cell_bytes);
        fit(&mut self.parity, p * cell_bytes);
        fit(&mut self.diff, cell_bytes);
    }
}

fn fit(buf: &mut Vec<u8>, len: usize) {
    buf.clear();
    buf.resize(len, 0);
}

/// State of the object under aggregation.
pub struct AggEntry {
    pub oid: UnitOid,
    pub attr: EcAttr,
    pub codec: Arc<dyn ParityCodec>,
    pub layout: Layout,
    pub stripe: Stripe,
    /// Parity of the current stripe, filled in by the prober
    pub parity: Option<ParityExtent>,
    pub dkey: Option<Key>,
    pub akey: Option<Key>,
    pub rsize: u64,
    pub bufs: ScratchBuffers,
}

impl AggEntry {
    pub fn new(oid: UnitOid, attr: EcAttr, codec: Arc<dyn ParityCodec>, layout: Layout) -> Self {
        assert!(
            attr.is_parity_shard(oid.shard),
            "aggregation entry for data shard {oid}"
        );
        Self {
            oid,
            attr,
            codec,
            layout,
            stripe: Stripe::new(),
            parity: None,
            dkey: None,
            akey: None,
            rsize: 0,
            bufs: ScratchBuffers::default(),
        }
    }

    /// Move on to another object, keeping the scratch buffers.
    pub fn reset(&mut self, oid: UnitOid, attr: EcAttr, codec: Arc<dyn ParityCodec>, layout: Layout) {
        let bufs = std::mem::take(&mut self.bufs);
        *self = Self::new(oid, attr, codec, layout);
        self.bufs = bufs;
    }

    pub fn set_dkey(&mut self, dkey: Key) {
        self.stripe.reset();
        self.parity = None;
        self.akey = None;
        self.dkey = Some(dkey);
    }

    pub fn set_akey(&mut self, akey: Key, rsize: u64) {
        self.stripe.reset();
        self.parity = None;
        self.akey = Some(akey);
        self.rsize = rsize;
    }

    /// Path of the current value on the local shard.
    pub fn path(&self) -> Result<ValuePath> {
        match (&self.dkey, &self.akey) {
            (Some(dkey), Some(akey)) => Ok(ValuePath::new(self.oid, dkey.clone(), akey.clone())),
            _ => Err(Error::Internal(format!(
                "no current key pair for object {}",
                self.oid
            ))),
        }
    }

    /// Bytes in one cell of the current value.
    pub fn cell_bytes(&self) -> usize {
        (self.attr.cell_len * self.rsize) as usize
    }

    /// Index of the local parity cell among the `p` parity cells.
    pub fn parity_index(&self) -> usize {
        (self.oid.shard - self.attr.k) as usize
    }

    /// Parity shards other than the local one, with their targets.
    pub fn peer_parity_shards(&self) -> Result<Vec<(u32, TargetId)>> {
        (self.attr.k..self.attr.tgt_count())
            .filter(|s| *s != self.oid.shard)
            .map(|s| Ok((s, self.layout.target_of(s)?)))
            .collect()
    }

    /// Target holding data cell `cell`.
    pub fn data_target(&self, cell: u32) -> Result<TargetId> {
        assert!(cell < self.attr.k, "cell {cell} is not a data cell");
        self.layout.target_of(cell)
    }

    /// Size the scratch buffers for the current value.
    pub fn prepare_buffers(&mut self) {
        let cell_bytes = self.cell_bytes();
        self.bufs
            .prepare(self.attr.k as usize, self.attr.p as usize, cell_bytes);
    }
}

impl std::fmt::Debug for AggEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggEntry")
            .field("oid", &self.oid)
            .field("attr", &self.attr)
            .field("stripe", &self.stripe.number())
            .field("dkey", &self.dkey)
            .field("akey", &self.akey)
            .field("rsize", &self.rsize)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::ObjectId;
    use crate::ec::codec::{codec_for, CodecKind};

    fn entry(k: u32, p: u32) -> AggEntry {
        let attr = EcAttr::new(k, p, 4).unwrap();
        let codec = codec_for(&attr, CodecKind::ReedSolomon).unwrap();
        let layout = Layout::new((0..k + p).map(|t| TargetId(t + 10)).collect());
        AggEntry::new(UnitOid::new(ObjectId::new(0, 1), k + p - 1), attr, codec, layout)
    }

    #[test]
    fn test_buffers_keep_capacity() {
        let mut bufs = ScratchBuffers::default();
        bufs.prepare(4, 2, 64);
        assert_eq!(bufs.data.len(), 256);
        assert_eq!(bufs.parity.len(), 128);
        assert_eq!(bufs.diff.len(), 64);
        bufs.data[0] = 9;

        let cap = bufs.data.capacity();
        bufs.prepare(2, 1, 64);
        assert_eq!(bufs.data.len(), 128);
        assert_eq!(bufs.data.capacity(), cap);
        assert_eq!(bufs.data[0], 0);
    }

    #[test]
    fn test_path_requires_keys() {
        let mut e = entry(2, 1);
        assert!(e.path().is_err());
        e.set_dkey("d".into());
        e.set_akey("a".into(), 8);
        let path = e.path().unwrap();
        assert_eq!(path.oid.shard, 2);
        assert_eq!(e.cell_bytes(), 32);
    }

    #[test]
    fn test_peer_parity_shards() {
        let e = entry(4, 2);
        assert_eq!(e.parity_index(), 1);
        assert_eq!(e.peer_parity_shards().unwrap(), vec![(4, TargetId(14))]);
        assert_eq!(e.data_target(3).unwrap(), TargetId(13));
        assert!(entry(2, 1).peer_parity_shards().unwrap().is_empty());
    }

    #[test]
    #[should_panic]
    fn test_data_shard_rejected() {
        let attr = EcAttr::new(2, 1, 4).unwrap();
        let codec = codec_for(&attr, CodecKind::Xor).unwrap();
        AggEntry::new(
            UnitOid::new(ObjectId::new(0, 1), 0),
            attr,
            codec,
            Layout::new(vec![TargetId(0), TargetId(1), TargetId(2)]),
        );
    }
}
