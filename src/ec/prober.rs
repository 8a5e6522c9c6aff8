//! Parity Prober
//!
//! Point lookup of the local parity cell of a stripe. The lookup runs at the
//! upper bound of the aggregation interval only, so parity written by an
//! earlier pass (below the interval) is still found.

use tracing::trace;

use super::geometry::{is_parity, mask_parity, EcAttr};
use crate::domain::ports::{Epoch, ExtentStore, Recx, ValuePath, VersionedRecx};
use crate::error::Result;

/// Local parity cell of the current stripe.
///
/// `recx` is the unmapped parity range, indicator bit cleared.
pub type ParityExtent = VersionedRecx;

/// Look up the parity of `stripe` on the local store as of `epoch`.
pub async fn probe(
    store: &dyn ExtentStore,
    path: &ValuePath,
    attr: &EcAttr,
    stripe: u64,
    epoch: Epoch,
) -> Result<Option<ParityExtent>> {
    let addr = attr.parity_recx(stripe);
    let found = store.lookup(path, addr, epoch).await?;

    trace!(
        stripe,
        addr = %format_args!("{:#x}", addr.idx),
        found = found.is_some(),
        "parity probe"
    );

    Ok(found.map(|ext| {
        assert!(is_parity(ext.recx.idx), "parity lookup returned replica range");
        ParityExtent {
            recx: Recx::new(mask_parity(ext.recx.idx), ext.recx.nr),
            epoch: ext.epoch,
        }
    }))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::adapters::memory::MemExtentStore;
    use crate::domain::ports::{ObjectClass, ObjectId, StoreTx, TargetId, UnitOid};

    async fn store_with_parity(attr: &EcAttr, stripe: u64, epoch: Epoch) -> (MemExtentStore, ValuePath) {
        let store = MemExtentStore::new(TargetId(2));
        let oid = UnitOid::new(ObjectId::new(0, 5), attr.k);
        store.create_object(oid, ObjectClass::ErasureCoded(*attr));
        let path = ValuePath::new(oid, "d".into(), "a".into());
        let addr = attr.parity_recx(stripe);
        let mut tx = StoreTx::new(path.clone(), 1);
        tx.update(addr, epoch, Some(Bytes::from(vec![1u8; addr.nr as usize])));
        store.commit(&tx).await.unwrap();
        (store, path)
    }

    #[tokio::test]
    async fn test_probe_finds_parity_below_interval() {
        let attr = EcAttr::new(2, 1, 4).unwrap();
        let (store, path) = store_with_parity(&attr, 3, 5).await;

        let found = probe(&store, &path, &attr, 3, 9).await.unwrap().unwrap();
        assert_eq!(found.recx, Recx::new(12, 4));
        assert_eq!(found.epoch, 5);
    }

    #[tokio::test]
    async fn test_probe_misses() {
        let attr = EcAttr::new(2, 1, 4).unwrap();
        let (store, path) = store_with_parity(&attr, 3, 5).await;

        // Other stripe, and a snapshot older than the parity
        assert!(probe(&store, &path, &attr, 2, 9).await.unwrap().is_none());
        assert!(probe(&store, &path, &attr, 3, 4).await.unwrap().is_none());
    }
}
