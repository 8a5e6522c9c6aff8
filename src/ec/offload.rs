//! Codec Offload
//!
//! GF arithmetic is CPU-bound; it runs on the blocking pool so the
//! aggregation task keeps its worker free. The scratch buffers are moved into
//! the task and handed back with the result, and the single `JoinHandle` is
//! awaited before the stripe moves on.

use std::sync::Arc;

use tokio::task;

use super::codec::ParityCodec;
use super::entry::ScratchBuffers;
use crate::error::Result;

/// Await an offloaded task, re-raising its panic on the caller.
async fn join<T: Send + 'static>(handle: task::JoinHandle<Result<T>>) -> Result<T> {
    match handle.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(e.into()),
    }
}

/// Full k-cell encode of `bufs.data` into `bufs.parity`.
pub async fn encode(codec: Arc<dyn ParityCodec>, mut bufs: ScratchBuffers) -> Result<ScratchBuffers> {
    join(task::spawn_blocking(move || -> Result<ScratchBuffers> {
        codec.encode(&bufs.data, &mut bufs.parity)?;
        Ok(bufs)
    }))
    .await
}

/// Fold the change from `bufs.old` to `bufs.data` of every cell in `cells`
/// into `bufs.parity`, one cell at a time through `bufs.diff`.
pub async fn update(
    codec: Arc<dyn ParityCodec>,
    cells: Vec<u32>,
    mut bufs: ScratchBuffers,
) -> Result<ScratchBuffers> {
    join(task::spawn_blocking(move || -> Result<ScratchBuffers> {
        let cell_bytes = bufs.diff.len();
        for cell in cells {
            let at = cell as usize * cell_bytes;
            let old = &bufs.old[at..at + cell_bytes];
            let new = &bufs.data[at..at + cell_bytes];
            for ((d, o), n) in bufs.diff.iter_mut().zip(old).zip(new) {
                *d = o ^ n;
            }
            codec.update(cell as usize, &bufs.diff, &mut bufs.parity)?;
        }
        Ok(bufs)
    }))
    .await
}
