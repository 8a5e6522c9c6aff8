//! EC Aggregation Integration Tests
//!
//! End-to-end passes over an in-memory pool: a client writes EC objects the
//! way the I/O path would, the leader parity target aggregates, and the
//! resulting parity is checked against a fresh encode of the data cells.

use std::ops::ControlFlow;
use std::sync::Arc;

use assert_matches::assert_matches;
use async_trait::async_trait;
use tokio_test::assert_ok;

use ecagg::adapters::{
    ArrayValue, EcClient, MemCluster, MemExtentStore, ParityCheck, PrometheusMetricsSink,
    StaticPlacement, StoredExtent,
};
use ecagg::domain::ports::{
    Epoch, EpochRange, ExtentStore, Key, Layout, LeaderStatus, ObjectId, Placement, Recx,
    TargetId, UnitOid, YieldHook,
};
use ecagg::ec::{AggregationConfig, Aggregator, CodecKind, EcAttr, PassReport, PassStatus};
use ecagg::metrics;
use ecagg::Result;

// =============================================================================
// Harness
// =============================================================================

/// One EC object on a pool of exactly `k + p` targets; shard `s` lives on
/// target `s`.
struct Pool {
    cluster: Arc<MemCluster>,
    placement: Arc<StaticPlacement>,
    client: EcClient,
    value: ArrayValue,
}

impl Pool {
    fn new(k: u32, p: u32, cell_len: u64) -> Self {
        let attr = EcAttr::new(k, p, cell_len).expect("valid geometry");
        let cluster = Arc::new(MemCluster::new(attr.tgt_count()));
        let placement = Arc::new(StaticPlacement::new(attr.tgt_count()));
        let client = EcClient::new(cluster.clone(), placement.clone(), CodecKind::ReedSolomon);
        let oid = ObjectId::new(0, 0);
        client.create_object(oid, attr).expect("create object");
        let value = ArrayValue::new(oid, attr, Key::from("dkey"), Key::from("akey"), 1);
        Self {
            cluster,
            placement,
            client,
            value,
        }
    }

    fn attr(&self) -> EcAttr {
        self.value.attr
    }

    fn leader_shard(&self) -> u32 {
        self.attr().tgt_count() - 1
    }

    fn store(&self, shard: u32) -> Arc<MemExtentStore> {
        self.cluster.store(TargetId(shard)).expect("store")
    }

    fn aggregator(&self, shard: u32, config: AggregationConfig) -> Aggregator {
        Aggregator::new(
            config,
            self.store(shard),
            self.cluster.clone(),
            self.placement.clone(),
        )
        .expect("aggregator")
    }

    fn leader(&self) -> Aggregator {
        self.aggregator(self.leader_shard(), AggregationConfig::default())
    }

    fn replicas(&self, shard: u32) -> Vec<StoredExtent> {
        self.store(shard).replica_extents(&self.value.path(shard))
    }

    fn parity(&self, shard: u32) -> Vec<StoredExtent> {
        self.store(shard).parity_extents(&self.value.path(shard))
    }

    async fn write(&self, idx: u64, data: &[u8], epoch: Epoch) {
        self.client
            .write(&self.value, idx, data, epoch)
            .await
            .expect("client write");
    }

    /// Full-stripe writes over stripes `0..stripes`, leaving parity and no
    /// replicas.
    async fn seed(&self, stripes: u64, epoch: Epoch) {
        let len = (self.attr().stripe_rec_nr() * stripes) as usize;
        self.write(0, &pattern(len, 1), epoch).await;
    }

    async fn verify(&self, stripe: u64, epoch: Epoch) -> ParityCheck {
        self.client
            .verify_stripe(&self.value, stripe, epoch)
            .await
            .expect("verify stripe")
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

async fn run(aggregator: &Aggregator, hi: Epoch) -> PassReport {
    aggregator
        .run_pass(EpochRange::new(0, hi))
        .await
        .expect("pass runs")
}

/// Yield hook that always tears the pass down.
struct StopHook;

#[async_trait]
impl YieldHook for StopHook {
    async fn yield_now(&self) -> ControlFlow<()> {
        ControlFlow::Break(())
    }
}

/// Placement that reports fewer targets than the object has shards.
struct ShortPlacement {
    inner: Arc<StaticPlacement>,
    keep: usize,
}

#[async_trait]
impl Placement for ShortPlacement {
    async fn check_leader(&self, oid: &UnitOid, attr: &EcAttr, dkey: &Key) -> Result<LeaderStatus> {
        self.inner.check_leader(oid, attr, dkey).await
    }

    async fn layout(&self, oid: &ObjectId, attr: &EcAttr) -> Result<Layout> {
        let mut layout = self.inner.layout(oid, attr).await?;
        layout.targets.truncate(self.keep);
        Ok(layout)
    }
}

// =============================================================================
// Dispositions
// =============================================================================

#[tokio::test]
async fn test_partial_update_recalculates_and_advances_low_water() {
    let pool = Pool::new(2, 1, 4096);
    pool.seed(1, 0).await;
    // Cell 0 fully rewritten, half of cell 1
    pool.write(0, &[0xAA; 4096], 1).await;
    pool.write(4096, &[0xBB; 2048], 2).await;
    assert_eq!(pool.replicas(2).len(), 2);

    let sink = Arc::new(PrometheusMetricsSink::new().unwrap());
    let leader = pool.leader().with_metrics(sink.clone());
    let report = run(&leader, 3).await;

    assert_eq!(report.status, PassStatus::Completed);
    assert_eq!(report.stripes.updated_recalc, 1);
    assert_eq!(report.stripes.total(), 1);
    assert!(report.low_water_advanced);
    assert_eq!(report.low_water, 3);
    assert_eq!(pool.store(2).low_water().await.unwrap(), 3);

    assert!(pool.replicas(2).is_empty());
    assert!(pool.parity(2).iter().any(|e| e.epoch == 2 && !e.is_hole));
    assert_eq!(pool.verify(0, 3).await, ParityCheck::Match);

    assert_eq!(sink.counter_value(metrics::STRIPES_UPDATED_RECALC), 1);
    assert_eq!(sink.counter_value(metrics::PASSES_COMPLETED), 1);
    assert_eq!(sink.gauge_value(metrics::LOW_WATER_EPOCH), Some(3.0));
    assert_eq!(sink.latency_count(metrics::OP_PASS), 1);
    assert_eq!(sink.latency_count(metrics::OP_STRIPE), 1);
}

#[tokio::test]
async fn test_single_cell_update_is_incremental() {
    let pool = Pool::new(4, 2, 8);
    pool.seed(1, 1).await;
    pool.write(9, &[7, 7, 7], 2).await;

    let report = run(&pool.leader(), 2).await;

    assert_eq!(report.stripes.updated_incremental, 1);
    assert_eq!(report.stripes.updated_recalc, 0);
    assert!(pool.replicas(4).is_empty());
    assert!(pool.replicas(5).is_empty());
    assert_eq!(pool.verify(0, 2).await, ParityCheck::Match);
}

#[tokio::test]
async fn test_stale_replicas_removed_without_encoding() {
    let pool = Pool::new(2, 1, 4);
    pool.write(1, &[5, 5], 3).await;
    pool.seed(1, 5).await;

    let report = run(&pool.leader(), 6).await;

    assert_eq!(report.stripes.removed_stale, 1);
    assert!(pool.replicas(2).is_empty());
    // Parity untouched: still the single full-stripe version
    let parity = pool.parity(2);
    assert_eq!(parity.len(), 1);
    assert_eq!(parity[0].epoch, 5);
    assert_eq!(pool.verify(0, 6).await, ParityCheck::Match);
}

#[tokio::test]
async fn test_filled_stripe_without_parity_is_encoded() {
    let pool = Pool::new(2, 1, 4);
    pool.write(0, &pattern(5, 3), 1).await;
    pool.write(5, &pattern(3, 9), 2).await;
    assert_eq!(pool.verify(0, 2).await, ParityCheck::Missing { shard: 2 });

    let report = run(&pool.leader(), 2).await;

    assert_eq!(report.stripes.encoded, 1);
    assert!(pool.replicas(2).is_empty());
    let parity = pool.parity(2);
    assert_eq!(parity.len(), 1);
    assert_eq!(parity[0].epoch, 2);
    assert_eq!(pool.verify(0, 2).await, ParityCheck::Match);
}

#[tokio::test]
async fn test_partial_stripe_without_parity_stays_replicated() {
    let pool = Pool::new(2, 1, 4);
    pool.write(2, &[1, 2, 3], 1).await;

    let report = run(&pool.leader(), 1).await;

    assert_eq!(report.stripes.skipped, 1);
    assert_eq!(pool.replicas(2).len(), 1);
    assert!(pool.parity(2).is_empty());
    assert!(report.low_water_advanced);
}

#[tokio::test]
async fn test_punch_newer_than_parity_recovers_replicas() {
    let pool = Pool::new(2, 1, 4);
    pool.seed(1, 1).await;
    assert_ok!(
        pool.client
            .punch(&pool.value, Recx::new(2, 3), 2)
            .await
    );

    let report = run(&pool.leader(), 2).await;

    assert_eq!(report.stripes.holes_recovered, 1);
    assert!(pool.parity(2).is_empty());

    // Data around the punch comes back as replicas; the punch stays a punch
    let replicas = pool.replicas(2);
    assert_eq!(
        replicas,
        vec![
            StoredExtent {
                recx: Recx::new(0, 2),
                epoch: 2,
                is_hole: false
            },
            StoredExtent {
                recx: Recx::new(2, 3),
                epoch: 2,
                is_hole: true
            },
            StoredExtent {
                recx: Recx::new(5, 3),
                epoch: 2,
                is_hole: false
            },
        ]
    );

    let range = pool.attr().stripe_recx(0);
    let data = pool.client.read(&pool.value, range, 2).await.unwrap();
    let replica = pool
        .store(2)
        .fetch(&pool.value.path(2), 1, &[range], 2)
        .await
        .unwrap();
    assert_eq!(data, replica);
    assert_eq!(&replica[2..5], &[0, 0, 0]);
}

#[tokio::test]
async fn test_extent_across_stripes_updates_both() {
    let pool = Pool::new(2, 1, 4);
    pool.seed(2, 1).await;
    pool.write(6, &[9, 9, 9, 9], 2).await;

    let report = run(&pool.leader(), 2).await;

    assert_eq!(report.stripes.updated_incremental, 2);
    assert!(pool.replicas(2).is_empty());
    assert_eq!(pool.verify(0, 2).await, ParityCheck::Match);
    assert_eq!(pool.verify(1, 2).await, ParityCheck::Match);
}

// =============================================================================
// Write-back
// =============================================================================

#[tokio::test]
async fn test_conflicts_replay_peer_apply_idempotently() {
    let pool = Pool::new(2, 2, 4);
    pool.seed(1, 1).await;
    pool.write(0, &[4, 4, 4], 2).await;
    pool.store(3).inject_conflicts(2);

    let sink = Arc::new(PrometheusMetricsSink::new().unwrap());
    let report = run(&pool.leader().with_metrics(sink.clone()), 2).await;

    assert_eq!(report.stripes.updated_incremental, 1);
    assert_eq!(report.objects_failed, 0);
    assert_eq!(sink.counter_value(metrics::TX_RETRIES), 2);
    assert_eq!(pool.cluster.apply_count(), 3);

    // Three applies, one parity version at the stripe's epoch
    assert_eq!(pool.parity(2).iter().filter(|e| e.epoch == 2).count(), 1);
    assert!(pool.replicas(2).is_empty());
    assert!(pool.replicas(3).is_empty());
    assert_eq!(pool.verify(0, 2).await, ParityCheck::Match);
}

#[tokio::test]
async fn test_exhausted_retries_fail_object_and_hold_low_water() {
    let pool = Pool::new(2, 2, 4);
    pool.seed(1, 1).await;
    pool.write(0, &[4, 4, 4], 2).await;
    pool.store(3).inject_conflicts(3);

    let config = AggregationConfig {
        max_tx_retries: 2,
        ..Default::default()
    };
    let leader = pool.aggregator(3, config);
    let report = run(&leader, 2).await;

    assert_eq!(report.status, PassStatus::Completed);
    assert_eq!(report.objects_failed, 1);
    assert!(!report.low_water_advanced);
    assert_eq!(report.low_water, 0);
    assert_eq!(pool.replicas(3).len(), 1);

    // The peer already took the write-back; the retry lands the same state
    let report = run(&leader, 2).await;
    assert_eq!(report.objects_failed, 0);
    assert!(report.low_water_advanced);
    assert!(pool.replicas(3).is_empty());
    assert_eq!(pool.verify(0, 2).await, ParityCheck::Match);
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let pool = Pool::new(2, 1, 4);
    pool.seed(1, 1).await;
    pool.write(0, &[4, 4], 2).await;
    let commits = pool.store(2).commit_count();

    let config = AggregationConfig {
        dry_run: true,
        ..Default::default()
    };
    let report = run(&pool.aggregator(2, config), 2).await;

    assert_eq!(report.stripes.total(), 1);
    assert!(!report.low_water_advanced);
    assert_eq!(pool.store(2).commit_count(), commits);
    assert_eq!(pool.replicas(2).len(), 1);
}

// =============================================================================
// Peer Fetch
// =============================================================================

#[tokio::test]
async fn test_transport_errors_are_retried() {
    let pool = Pool::new(4, 2, 8);
    pool.seed(1, 1).await;
    pool.write(9, &[7, 7, 7], 2).await;
    pool.cluster.fail_fetches(2);

    let sink = Arc::new(PrometheusMetricsSink::new().unwrap());
    let report = run(&pool.leader().with_metrics(sink.clone()), 2).await;

    assert_eq!(report.objects_failed, 0);
    assert_eq!(report.stripes.updated_incremental, 1);
    assert_eq!(sink.counter_value(metrics::FETCH_RETRIES), 2);
    assert_eq!(pool.verify(0, 2).await, ParityCheck::Match);
}

#[tokio::test]
async fn test_checksum_mismatch_fails_object() {
    let pool = Pool::new(4, 2, 8);
    pool.seed(1, 1).await;
    pool.write(9, &[7, 7, 7], 2).await;
    pool.cluster.corrupt_fetches(1);

    let sink = Arc::new(PrometheusMetricsSink::new().unwrap());
    let report = run(&pool.leader().with_metrics(sink.clone()), 2).await;

    assert_eq!(report.objects_failed, 1);
    assert_eq!(report.stripes.total(), 0);
    assert!(!report.low_water_advanced);
    assert_eq!(sink.counter_value(metrics::CHECKSUM_ERRORS), 1);
    assert_eq!(sink.counter_value(metrics::OBJECTS_FAILED), 1);
    assert_eq!(pool.replicas(5).len(), 1);
}

// =============================================================================
// Driver
// =============================================================================

#[tokio::test]
async fn test_short_layout_fails_object() {
    let pool = Pool::new(2, 2, 4);
    pool.seed(1, 1).await;
    pool.write(4, &[9, 9], 2).await;

    let placement = Arc::new(ShortPlacement {
        inner: pool.placement.clone(),
        keep: 1,
    });
    let leader = Aggregator::new(
        AggregationConfig::default(),
        pool.store(pool.leader_shard()),
        pool.cluster.clone(),
        placement,
    )
    .expect("aggregator");
    let report = run(&leader, 3).await;

    assert_eq!(report.status, PassStatus::Completed);
    assert_eq!(report.objects_failed, 1);
    assert_eq!(report.stripes.total(), 0);
    assert!(!report.low_water_advanced);
    assert_eq!(pool.replicas(3).len(), 1);
}

#[tokio::test]
async fn test_leadership_in_flux_skips_object() {
    let pool = Pool::new(2, 1, 4);
    pool.seed(1, 1).await;
    pool.write(0, &[4, 4], 2).await;
    pool.placement
        .set_status(pool.value.oid, pool.value.dkey.clone(), LeaderStatus::InFlux);

    let sink = Arc::new(PrometheusMetricsSink::new().unwrap());
    let leader = pool.leader().with_metrics(sink.clone());
    let report = run(&leader, 2).await;

    assert_eq!(report.objects_skipped, 1);
    assert_eq!(report.stripes.total(), 0);
    assert!(!report.low_water_advanced);
    assert_eq!(sink.counter_value(metrics::OBJECTS_SKIPPED), 1);
    assert_eq!(pool.replicas(2).len(), 1);

    pool.placement.clear_status(pool.value.oid, &pool.value.dkey);
    let report = run(&leader, 2).await;
    assert_eq!(report.objects_skipped, 0);
    assert_eq!(report.stripes.updated_incremental, 1);
    assert!(report.low_water_advanced);
}

#[tokio::test]
async fn test_non_leader_parity_shard_leaves_stripes_alone() {
    let pool = Pool::new(2, 2, 4);
    pool.seed(1, 1).await;
    pool.write(0, &[4, 4], 2).await;

    let report = run(&pool.aggregator(2, AggregationConfig::default()), 2).await;

    assert_eq!(report.objects_aggregated, 1);
    assert_eq!(report.stripes.total(), 0);
    assert!(report.low_water_advanced);
    assert_eq!(pool.replicas(2).len(), 1);
}

#[tokio::test]
async fn test_data_shards_are_not_aggregated() {
    let pool = Pool::new(2, 1, 4);
    pool.seed(1, 1).await;
    pool.write(0, &[4, 4], 2).await;

    let report = run(&pool.aggregator(0, AggregationConfig::default()), 2).await;

    assert_eq!(report.objects_scanned, 1);
    assert_eq!(report.objects_aggregated, 0);
    assert_eq!(report.stripes.total(), 0);
}

#[tokio::test]
async fn test_objects_below_low_water_are_pruned() {
    let pool = Pool::new(2, 1, 4);
    pool.seed(1, 1).await;
    pool.write(0, &[4, 4], 2).await;
    let leader = pool.leader();

    assert!(run(&leader, 3).await.low_water_advanced);
    let report = run(&leader, 4).await;

    assert_eq!(report.objects_pruned, 1);
    assert_eq!(report.objects_aggregated, 0);
    assert_eq!(report.low_water, 4);
}

#[tokio::test]
async fn test_yield_teardown_aborts_pass() {
    let pool = Pool::new(2, 1, 4);
    pool.seed(1, 1).await;
    pool.write(0, &[4, 4], 2).await;

    let config = AggregationConfig {
        credits_max: 1,
        ..Default::default()
    };
    let sink = Arc::new(PrometheusMetricsSink::new().unwrap());
    let leader = pool
        .aggregator(2, config)
        .with_yield_hook(Arc::new(StopHook))
        .with_metrics(sink.clone());
    let report = run(&leader, 2).await;

    assert_eq!(report.status, PassStatus::Aborted);
    assert_eq!(report.yields, 1);
    assert_eq!(report.stripes.total(), 0);
    assert!(!report.low_water_advanced);
    assert_eq!(pool.store(2).low_water().await.unwrap(), 0);
    assert_eq!(sink.counter_value(metrics::PASSES_ABORTED), 1);
    assert_eq!(pool.replicas(2).len(), 1);
}

#[tokio::test]
async fn test_cancelled_pass_aborts() {
    let pool = Pool::new(2, 1, 4);
    pool.seed(1, 1).await;
    pool.write(0, &[4, 4], 2).await;

    let leader = pool.leader();
    leader.cancellation_token().cancel();
    let report = run(&leader, 2).await;

    assert_eq!(report.status, PassStatus::Aborted);
    assert_eq!(report.stripes.total(), 0);
    assert_eq!(pool.replicas(2).len(), 1);
}

#[tokio::test]
async fn test_invalid_epoch_range_is_rejected() {
    let pool = Pool::new(2, 1, 4);
    let result = pool.leader().run_pass(EpochRange::new(5, 4)).await;
    assert_matches!(result, Err(ecagg::Error::Internal(_)));
}

#[tokio::test]
async fn test_concurrent_passes_on_every_target() {
    let pool = Pool::new(4, 2, 8);
    pool.seed(3, 1).await;
    pool.write(3, &pattern(20, 5), 2).await;
    pool.write(30, &pattern(40, 6), 3).await;
    assert_ok!(pool.client.punch(&pool.value, Recx::new(80, 4), 4).await);

    let aggregators: Vec<Aggregator> = (0..pool.attr().tgt_count())
        .map(|shard| pool.aggregator(shard, AggregationConfig::default()))
        .collect();
    let reports = futures::future::join_all(aggregators.iter().map(|a| run(a, 4))).await;

    assert!(reports.iter().all(|r| r.status == PassStatus::Completed));
    // Stripe 1 was rewritten whole by the client and holds no replicas
    let leader = &reports[pool.leader_shard() as usize];
    assert_eq!(leader.stripes.total(), 2);
    assert_eq!(leader.stripes.updated_recalc, 1);
    assert_eq!(leader.stripes.holes_recovered, 1);

    assert_eq!(pool.verify(0, 4).await, ParityCheck::Match);
    assert_eq!(pool.verify(1, 4).await, ParityCheck::Match);
    assert_matches!(pool.verify(2, 4).await, ParityCheck::Missing { .. });
}
