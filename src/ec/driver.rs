//! Aggregation Driver
//!
//! Walks the local extent store for one epoch interval and feeds every
//! replica extent of every admitted object through the stripe pipeline.
//!
//! # Flow
//!
//! ```text
//! iterate(epr) ─▶ Object ─▶ admit? ─▶ Dkey ─▶ leader? ─▶ Akey ─▶ Recx ...
//!                   │ EC parity shard,     │ Leader          │
//!                   │ newer than low-water │                 ▼
//!                   ▼                      ▼        split at stripe edges
//!                 skip                   skip       accumulate ─▶ stripe done?
//!                                                               │
//!                                           probe ─▶ dispose ─▶ write back
//! ```
//!
//! The low-water epoch only moves when a pass completes with no object
//! skipped or failed.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use super::codec::{codec_for, CodecKind, ParityCodec};
use super::disposition::{StripeIo, StripeOutcome};
use super::entry::AggEntry;
use super::geometry::{is_parity, EcAttr};
use super::stripe::AggExtent;
use crate::adapters::TokioYieldHook;
use crate::domain::events::{ExtentEntry, IterEvent};
use crate::domain::ports::{
    Epoch, EpochRange, ExtentStore, Key, LeaderStatus, MetricsSink, ObjectClass, PeerClient,
    Placement, TargetId, UnitOid, YieldHook,
};
use crate::error::{Error, Result};
use crate::metrics::{self, NoopMetrics};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the aggregation driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Iteration events processed between cooperative yields
    pub credits_max: u32,

    /// Write-back restarts after a transaction conflict
    pub max_tx_retries: u32,

    /// Retries of a peer fetch after a transport error
    pub max_fetch_retries: u32,

    /// Parity codec family
    pub codec: CodecKind,

    /// Whether running in dry-run mode (decide, but write nothing)
    pub dry_run: bool,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            credits_max: 256,
            max_tx_retries: 5,
            max_fetch_retries: 3,
            codec: CodecKind::ReedSolomon,
            dry_run: false,
        }
    }
}

impl AggregationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.credits_max == 0 {
            return Err(Error::Internal(
                "credits_max must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Pass Report
// =============================================================================

/// How a pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassStatus {
    Completed,
    Aborted,
}

/// Stripes processed, per outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub removed_stale: u64,
    pub encoded: u64,
    pub skipped: u64,
    pub holes_recovered: u64,
    pub updated_incremental: u64,
    pub updated_recalc: u64,
}

impl OutcomeCounts {
    pub fn record(&mut self, outcome: StripeOutcome) {
        match outcome {
            StripeOutcome::RemovedStale => self.removed_stale += 1,
            StripeOutcome::Encoded => self.encoded += 1,
            StripeOutcome::Skipped => self.skipped += 1,
            StripeOutcome::HolesRecovered => self.holes_recovered += 1,
            StripeOutcome::Updated { recalc: false } => self.updated_incremental += 1,
            StripeOutcome::Updated { recalc: true } => self.updated_recalc += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.removed_stale
            + self.encoded
            + self.skipped
            + self.holes_recovered
            + self.updated_incremental
            + self.updated_recalc
    }

    /// Add another pass's counts.
    pub fn merge(&mut self, other: &OutcomeCounts) {
        self.removed_stale += other.removed_stale;
        self.encoded += other.encoded;
        self.skipped += other.skipped;
        self.holes_recovered += other.holes_recovered;
        self.updated_incremental += other.updated_incremental;
        self.updated_recalc += other.updated_recalc;
    }
}

/// Result of one aggregation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassReport {
    pub target: TargetId,
    pub epr: EpochRange,
    pub status: PassStatus,
    /// Low-water epoch after the pass
    pub low_water: Epoch,
    pub low_water_advanced: bool,
    pub objects_scanned: u64,
    pub objects_aggregated: u64,
    pub objects_pruned: u64,
    /// Objects skipped while leadership was in flux; retry later
    pub objects_skipped: u64,
    pub objects_failed: u64,
    pub stripes: OutcomeCounts,
    pub yields: u64,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl PassReport {
    fn new(target: TargetId, epr: EpochRange, low_water: Epoch) -> Self {
        Self {
            target,
            epr,
            status: PassStatus::Completed,
            low_water,
            low_water_advanced: false,
            objects_scanned: 0,
            objects_aggregated: 0,
            objects_pruned: 0,
            objects_skipped: 0,
            objects_failed: 0,
            stripes: OutcomeCounts::default(),
            yields: 0,
            started_at: Utc::now(),
            duration_ms: 0,
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// Per-pass iteration state.
struct Session {
    epr: EpochRange,
    low_water: Epoch,
    credits: u32,
    /// Reused across objects for its scratch buffers
    entry: Option<AggEntry>,
    /// Current object admitted and not failed
    active: bool,
    /// Current dkey led by this target
    dkey_led: bool,
    report: PassReport,
}

impl Session {
    fn in_value(&self) -> bool {
        self.active && self.dkey_led && self.entry.as_ref().is_some_and(|e| e.akey.is_some())
    }
}

// =============================================================================
// Aggregator
// =============================================================================

/// Drives EC aggregation passes over one target's extent store.
pub struct Aggregator {
    store: Arc<dyn ExtentStore>,
    peers: Arc<dyn PeerClient>,
    placement: Arc<dyn Placement>,
    yield_hook: Arc<dyn YieldHook>,
    metrics: Arc<dyn MetricsSink>,
    config: AggregationConfig,
    cancel: CancellationToken,
    codecs: Mutex<HashMap<EcAttr, Arc<dyn ParityCodec>>>,
}

impl Aggregator {
    /// Create an aggregator yielding through tokio and recording no metrics.
    pub fn new(
        config: AggregationConfig,
        store: Arc<dyn ExtentStore>,
        peers: Arc<dyn PeerClient>,
        placement: Arc<dyn Placement>,
    ) -> Result<Self> {
        config.validate()?;
        let cancel = CancellationToken::new();
        Ok(Self {
            store,
            peers,
            placement,
            yield_hook: Arc::new(TokioYieldHook::new(cancel.clone())),
            metrics: Arc::new(NoopMetrics),
            config,
            cancel,
            codecs: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_yield_hook(mut self, hook: Arc<dyn YieldHook>) -> Self {
        self.yield_hook = hook;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Token that tears down a running pass when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    /// Aggregate every replica extent visible in `epr`.
    ///
    /// An aborted pass is reported, not returned as an error; the low-water
    /// epoch stays where it was.
    #[instrument(skip(self), fields(target = %self.store.target()))]
    pub async fn run_pass(&self, epr: EpochRange) -> Result<PassReport> {
        if epr.lo > epr.hi {
            return Err(Error::Internal(format!("invalid epoch range {epr}")));
        }

        let started = Instant::now();
        let low_water = self.store.low_water().await?;
        let mut session = Session {
            epr,
            low_water,
            credits: 0,
            entry: None,
            active: false,
            dkey_led: false,
            report: PassReport::new(self.store.target(), epr, low_water),
        };

        info!(%epr, low_water, "Starting EC aggregation pass");

        match self.drive(&mut session).await {
            Ok(()) => {}
            Err(Error::Aborted) => {
                session.report.status = PassStatus::Aborted;
            }
            Err(e) => {
                error!("EC aggregation pass failed: {}", e);
                return Err(e);
            }
        }

        let mut report = session.report;
        match report.status {
            PassStatus::Completed => {
                self.metrics.increment(metrics::PASSES_COMPLETED);
                if report.objects_skipped == 0 && report.objects_failed == 0 && !self.config.dry_run
                {
                    self.store.set_low_water(epr.hi).await?;
                    report.low_water = report.low_water.max(epr.hi);
                    report.low_water_advanced = true;
                } else {
                    warn!(
                        skipped = report.objects_skipped,
                        failed = report.objects_failed,
                        dry_run = self.config.dry_run,
                        low_water = report.low_water,
                        "Low-water epoch held back"
                    );
                }
            }
            PassStatus::Aborted => {
                self.metrics.increment(metrics::PASSES_ABORTED);
                info!("EC aggregation aborted");
            }
        }

        self.metrics
            .set_gauge(metrics::LOW_WATER_EPOCH, report.low_water as f64);
        self.metrics
            .record_latency(metrics::OP_PASS, "all", started.elapsed());
        report.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            status = ?report.status,
            low_water = report.low_water,
            stripes = report.stripes.total(),
            objects = report.objects_aggregated,
            skipped = report.objects_skipped,
            failed = report.objects_failed,
            "EC aggregation pass finished in {}ms",
            report.duration_ms
        );
        Ok(report)
    }

    async fn drive(&self, s: &mut Session) -> Result<()> {
        let mut events = self.store.iterate(s.epr);
        while let Some(event) = events.next().await {
            let event = event?;
            trace!(kind = event.kind(), "iteration event");
            match event {
                IterEvent::Object {
                    oid,
                    class,
                    last_write,
                } => {
                    self.finish_value(s).await?;
                    if self.cancel.is_cancelled() {
                        return Err(Error::Aborted);
                    }
                    self.enter_object(s, oid, class, last_write).await;
                }
                IterEvent::Dkey { dkey } => {
                    self.finish_value(s).await?;
                    self.enter_dkey(s, dkey).await;
                }
                IterEvent::Akey { akey, rsize } => {
                    self.finish_value(s).await?;
                    if self.active_dkey(s) {
                        if let Some(entry) = s.entry.as_mut() {
                            entry.set_akey(akey, rsize);
                        }
                    }
                }
                IterEvent::Recx(extent) => self.on_extent(s, extent).await?,
            }
            self.consume_credit(s).await?;
        }
        self.finish_value(s).await
    }

    fn active_dkey(&self, s: &Session) -> bool {
        s.active && s.dkey_led
    }

    async fn enter_object(&self, s: &mut Session, oid: UnitOid, class: ObjectClass, last_write: Epoch) {
        s.report.objects_scanned += 1;
        s.active = false;
        s.dkey_led = false;

        let Some(attr) = class.ec_attr().copied() else {
            trace!(%oid, "not erasure coded");
            return;
        };
        if !attr.is_parity_shard(oid.shard) {
            trace!(%oid, "data shard");
            return;
        }
        if last_write <= s.low_water {
            s.report.objects_pruned += 1;
            debug!(%oid, last_write, low_water = s.low_water, "nothing written since last pass");
            return;
        }

        let admitted = match self.codec(&attr) {
            Ok(codec) => self
                .placement
                .layout(&oid.oid, &attr)
                .await
                .and_then(|layout| {
                    layout.ensure_width(attr.tgt_count())?;
                    Ok((codec, layout))
                }),
            Err(e) => Err(e),
        };
        match admitted {
            Ok((codec, layout)) => {
                match s.entry.as_mut() {
                    Some(entry) => entry.reset(oid, attr, codec, layout),
                    None => s.entry = Some(AggEntry::new(oid, attr, codec, layout)),
                }
                s.active = true;
                s.report.objects_aggregated += 1;
                debug!(%oid, k = attr.k, p = attr.p, cell_len = attr.cell_len, "aggregating object");
            }
            Err(e) => self.fail_object(s, oid, e),
        }
    }

    async fn enter_dkey(&self, s: &mut Session, dkey: Key) {
        s.dkey_led = false;
        if !s.active {
            return;
        }
        let Some(entry) = s.entry.as_mut() else {
            return;
        };
        let oid = entry.oid;
        match self.placement.check_leader(&oid, &entry.attr, &dkey).await {
            Ok(LeaderStatus::Leader) => {
                entry.set_dkey(dkey);
                s.dkey_led = true;
            }
            Ok(LeaderStatus::NotLeader) => {
                trace!(%oid, %dkey, "not the leader");
            }
            Ok(LeaderStatus::InFlux) => {
                warn!(%oid, %dkey, "Leadership in flux, skipping object this pass");
                s.report.objects_skipped += 1;
                self.metrics.increment(metrics::OBJECTS_SKIPPED);
                s.active = false;
            }
            Err(e) => self.fail_object(s, oid, e),
        }
    }

    async fn on_extent(&self, s: &mut Session, extent: ExtentEntry) -> Result<()> {
        if !s.in_value() {
            return Ok(());
        }
        assert!(
            !is_parity(extent.recx.idx),
            "iterator yielded parity range {}",
            extent.recx
        );

        let pieces = match s.entry.as_ref() {
            Some(entry) => entry.attr.break_at_stripe_boundaries(&[extent.recx]),
            None => return Ok(()),
        };
        for piece in pieces {
            let crosses = s.entry.as_ref().is_some_and(|e| {
                !e.stripe.is_empty() && e.attr.stripe_of(piece.idx) != e.stripe.number()
            });
            if crosses {
                self.process_stripe(s).await?;
                if !s.active {
                    return Ok(());
                }
            }
            if let Some(entry) = s.entry.as_mut() {
                let attr = entry.attr;
                entry.stripe.add(
                    &attr,
                    AggExtent {
                        recx: piece,
                        epoch: extent.epoch,
                        is_hole: extent.is_hole,
                    },
                );
            }
        }
        Ok(())
    }

    /// Drain the open stripe of the current value, if any.
    async fn finish_value(&self, s: &mut Session) -> Result<()> {
        if s.in_value() {
            self.process_stripe(s).await?;
        }
        if let Some(entry) = s.entry.as_mut() {
            entry.stripe.reset();
        }
        Ok(())
    }

    async fn process_stripe(&self, s: &mut Session) -> Result<()> {
        let Some(entry) = s.entry.as_mut() else {
            return Ok(());
        };
        if entry.stripe.is_empty() {
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            return Err(Error::Aborted);
        }

        let io = StripeIo {
            store: self.store.as_ref(),
            peers: self.peers.as_ref(),
            metrics: self.metrics.as_ref(),
            config: &self.config,
            epr: s.epr,
        };
        let result = io.process(entry).await;
        let oid = entry.oid;
        entry.stripe.clear(&entry.attr);

        match result {
            Ok(outcome) => {
                s.report.stripes.record(outcome);
                self.metrics.increment(outcome.counter());
                Ok(())
            }
            Err(Error::Aborted) => Err(Error::Aborted),
            Err(e) => {
                self.fail_object(s, oid, e);
                Ok(())
            }
        }
    }

    fn fail_object(&self, s: &mut Session, oid: UnitOid, e: Error) {
        error!(%oid, "EC aggregation failed for object: {}", e);
        s.report.objects_failed += 1;
        self.metrics.increment(metrics::OBJECTS_FAILED);
        s.active = false;
        s.dkey_led = false;
        if let Some(entry) = s.entry.as_mut() {
            entry.stripe.reset();
        }
    }

    async fn consume_credit(&self, s: &mut Session) -> Result<()> {
        s.credits += 1;
        if s.credits <= self.config.credits_max {
            return Ok(());
        }
        s.credits = 0;
        s.report.yields += 1;
        match self.yield_hook.yield_now().await {
            ControlFlow::Continue(()) => Ok(()),
            ControlFlow::Break(()) => {
                debug!("yield hook requested teardown");
                Err(Error::Aborted)
            }
        }
    }

    fn codec(&self, attr: &EcAttr) -> Result<Arc<dyn ParityCodec>> {
        let mut codecs = self.codecs.lock();
        if let Some(codec) = codecs.get(attr) {
            return Ok(codec.clone());
        }
        let codec = codec_for(attr, self.config.codec)?;
        codecs.insert(*attr, codec.clone());
        Ok(codec)
    }
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("target", &self.store.target())
            .field("config", &self.config)
            .finish()
    }
}
