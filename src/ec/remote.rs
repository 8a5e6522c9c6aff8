//! Peer fetch with transport retry and checksum verification.

use std::time::Instant;

use tracing::{debug, warn};

use crate::domain::ports::{Epoch, MetricsSink, PeerClient, Recx, TargetId, ValuePath};
use crate::error::{Error, Result};
use crate::metrics::{self, size_bucket};

/// Read `recxs` of `path` from `target`, retrying transport failures up to
/// `max_retries` times. A checksum mismatch is not retried.
#[allow(clippy::too_many_arguments)]
pub async fn fetch(
    peers: &dyn PeerClient,
    metrics_sink: &dyn MetricsSink,
    target: TargetId,
    path: &ValuePath,
    rsize: u64,
    recxs: &[Recx],
    epoch: Epoch,
    max_retries: u32,
) -> Result<Vec<u8>> {
    let mut attempt = 0;
    loop {
        let started = Instant::now();
        match peers.fetch(target, path, rsize, recxs, epoch).await {
            Ok(reply) => {
                if let Some(expected) = reply.checksum {
                    let actual = crc32fast::hash(&reply.data);
                    if actual != expected {
                        metrics_sink.increment(metrics::CHECKSUM_ERRORS);
                        return Err(Error::ChecksumMismatch {
                            target: target.0,
                            expected,
                            actual,
                        });
                    }
                }
                metrics_sink.record_latency(
                    metrics::OP_FETCH,
                    size_bucket(reply.data.len()),
                    started.elapsed(),
                );
                debug!(%target, %path, bytes = reply.data.len(), epoch, "fetched from peer");
                return Ok(reply.data.to_vec());
            }
            Err(e) if matches!(e, Error::Transport { .. }) && attempt < max_retries => {
                attempt += 1;
                metrics_sink.increment(metrics::FETCH_RETRIES);
                warn!(%target, %path, attempt, error = %e, "retrying peer fetch");
            }
            Err(e) => return Err(e),
        }
    }
}
