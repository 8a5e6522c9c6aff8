//! EC Aggregation Simulator
//!
//! Seeds an in-memory pool with a random EC write workload, runs aggregation
//! passes on every target, verifies each stripe and prints a JSON report.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     EC Aggregation Simulator                     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   Workload   │───▶│  Aggregator  │───▶│   Verifier   │       │
//! │  │  (EcClient)  │    │ (per target) │    │  (re-encode) │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use clap::Parser;
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ecagg::adapters::{
    ArrayValue, EcClient, MemCluster, ParityCheck, PrometheusMetricsSink, StaticPlacement,
};
use ecagg::domain::ports::{
    Epoch, EpochRange, ExtentStore, Key, MetricsSink, ObjectId, PeerClient, Placement, Recx,
    TargetId,
};
use ecagg::ec::{AggregationConfig, Aggregator, CodecKind, EcAttr, OutcomeCounts, PassReport, PassStatus};
use ecagg::error::{Error, Result};

// =============================================================================
// CLI Arguments
// =============================================================================

/// EC aggregation simulator - folds random replica workloads into parity
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Data cells per stripe
    #[arg(short = 'k', long, env = "ECAGG_K", default_value = "4")]
    k: u32,

    /// Parity cells per stripe
    #[arg(short = 'p', long, env = "ECAGG_P", default_value = "2")]
    p: u32,

    /// Records per cell
    #[arg(long, env = "ECAGG_CELL_LEN", default_value = "64")]
    cell_len: u64,

    /// Record size in bytes
    #[arg(long, env = "ECAGG_RSIZE", default_value = "8")]
    rsize: u64,

    /// Targets in the pool (at least k + p)
    #[arg(long, env = "ECAGG_TARGETS")]
    targets: Option<u32>,

    /// EC objects to write
    #[arg(long, env = "ECAGG_OBJECTS", default_value = "8")]
    objects: u64,

    /// Stripes per object value
    #[arg(long, env = "ECAGG_STRIPES", default_value = "4")]
    stripes: u64,

    /// Write rounds, each followed by an aggregation pass on every target
    #[arg(long, env = "ECAGG_ROUNDS", default_value = "3")]
    rounds: u32,

    /// Partial writes per object per round
    #[arg(long, env = "ECAGG_WRITES", default_value = "6")]
    writes_per_round: u32,

    /// Probability that a workload operation is a punch
    #[arg(long, env = "ECAGG_PUNCH_RATIO", default_value = "0.1")]
    punch_ratio: f64,

    /// Transaction conflicts injected on every target per round
    #[arg(long, env = "ECAGG_INJECT_CONFLICTS", default_value = "0")]
    inject_conflicts: u32,

    /// Workload seed
    #[arg(long, env = "ECAGG_SEED", default_value = "42")]
    seed: u64,

    /// Parity codec
    #[arg(long, env = "ECAGG_CODEC", value_enum, default_value = "reed-solomon")]
    codec: CodecKind,

    /// Iteration events between cooperative yields
    #[arg(long, env = "ECAGG_CREDITS", default_value = "256")]
    credits_max: u32,

    /// Write-back restarts after a conflict
    #[arg(long, env = "ECAGG_MAX_TX_RETRIES", default_value = "5")]
    max_tx_retries: u32,

    /// Peer fetch retries after a transport error
    #[arg(long, env = "ECAGG_MAX_FETCH_RETRIES", default_value = "3")]
    max_fetch_retries: u32,

    /// Enable dry-run mode (decide, write nothing)
    #[arg(long, env = "DRY_RUN")]
    dry_run: bool,

    /// Print the Prometheus text exposition after the report
    #[arg(long, env = "ECAGG_DUMP_METRICS")]
    dump_metrics: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Report
// =============================================================================

#[derive(Debug, Serialize)]
struct RoundReport {
    round: u32,
    epr: EpochRange,
    passes: Vec<PassReport>,
}

#[derive(Debug, Default, Serialize)]
struct Verification {
    stripes_checked: u64,
    parity_match: u64,
    replicated: u64,
    mismatches: Vec<String>,
}

#[derive(Debug, Serialize)]
struct SimReport {
    attr: EcAttr,
    codec: CodecKind,
    targets: u32,
    objects: u64,
    rounds: Vec<RoundReport>,
    totals: OutcomeCounts,
    verification: Verification,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let attr = EcAttr::new(args.k, args.p, args.cell_len)?;
    let targets = args.targets.unwrap_or(attr.tgt_count());
    if targets < attr.tgt_count() {
        return Err(Error::InvalidEcConfig(format!(
            "{} targets cannot hold {}+{} objects",
            targets, attr.k, attr.p
        )));
    }

    info!("Starting EC aggregation simulator");
    info!("  Geometry: {}+{}, cell_len {}", attr.k, attr.p, attr.cell_len);
    info!("  Targets: {}", targets);
    info!("  Objects: {} x {} stripes", args.objects, args.stripes);
    info!("  Codec: {:?}", args.codec);
    info!("  Dry-run mode: {}", args.dry_run);

    let config = AggregationConfig {
        credits_max: args.credits_max,
        max_tx_retries: args.max_tx_retries,
        max_fetch_retries: args.max_fetch_retries,
        codec: args.codec,
        dry_run: args.dry_run,
    };

    let cluster = Arc::new(MemCluster::new(targets));
    let placement = Arc::new(StaticPlacement::new(targets));
    let client = EcClient::new(cluster.clone(), placement.clone(), args.codec);
    let metrics = Arc::new(PrometheusMetricsSink::new()?);
    let cancel = CancellationToken::new();

    let aggregators = (0..targets)
        .map(|t| -> Result<Aggregator> {
            let store: Arc<dyn ExtentStore> = cluster.store(TargetId(t))?;
            let peers: Arc<dyn PeerClient> = cluster.clone();
            let placement: Arc<dyn Placement> = placement.clone();
            let metrics: Arc<dyn MetricsSink> = metrics.clone();
            Ok(Aggregator::new(config.clone(), store, peers, placement)?.with_metrics(metrics))
        })
        .collect::<Result<Vec<_>>>()?;

    // Stop all passes on Ctrl-C
    {
        let tokens: Vec<CancellationToken> =
            aggregators.iter().map(|a| a.cancellation_token()).collect();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, tearing down aggregation passes");
                cancel.cancel();
                for token in tokens {
                    token.cancel();
                }
            }
        });
    }

    let values = create_values(&client, &args, attr)?;
    let mut workload = Workload::new(&args, attr);

    let mut rounds = Vec::new();
    let mut totals = OutcomeCounts::default();
    for round in 0..args.rounds {
        if cancel.is_cancelled() {
            break;
        }
        workload.run(&client, &values, round == 0).await?;
        if args.inject_conflicts > 0 {
            for store in cluster.stores() {
                store.inject_conflicts(args.inject_conflicts);
            }
        }

        let epr = EpochRange::new(0, workload.epoch);
        info!(round, %epr, "Running aggregation passes");
        let passes = join_all(aggregators.iter().map(|a| a.run_pass(epr)))
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;

        for pass in &passes {
            totals.merge(&pass.stripes);
            if pass.status == PassStatus::Aborted {
                warn!(target = %pass.target, "pass aborted");
            }
        }
        rounds.push(RoundReport { round, epr, passes });
    }

    let aborted = rounds
        .iter()
        .flat_map(|r| &r.passes)
        .any(|p| p.status == PassStatus::Aborted);
    let verification = if args.dry_run || aborted || cancel.is_cancelled() {
        // Parity is expected to lag the data; nothing to check
        warn!("Skipping stripe verification");
        Verification::default()
    } else {
        verify(&client, &cluster, &placement, &values, args.stripes, workload.epoch).await?
    };
    if !verification.mismatches.is_empty() {
        error!(
            mismatches = verification.mismatches.len(),
            "Stripe verification failed"
        );
    } else {
        info!(
            checked = verification.stripes_checked,
            parity = verification.parity_match,
            replicated = verification.replicated,
            "All stripes verified"
        );
    }

    let failed = !verification.mismatches.is_empty();
    let report = SimReport {
        attr,
        codec: args.codec,
        targets,
        objects: args.objects,
        rounds,
        totals,
        verification,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if args.dump_metrics {
        println!("{}", metrics.gather_text()?);
    }

    if failed {
        return Err(Error::Internal("parity verification failed".to_string()));
    }
    Ok(())
}

// =============================================================================
// Workload
// =============================================================================

fn create_values(client: &EcClient, args: &Args, attr: EcAttr) -> Result<Vec<ArrayValue>> {
    (0..args.objects)
        .map(|i| {
            let oid = ObjectId::new(args.seed, i);
            client.create_object(oid, attr)?;
            Ok(ArrayValue::new(
                oid,
                attr,
                Key::from("dkey"),
                Key::from("akey"),
                args.rsize,
            ))
        })
        .collect()
}

/// Random writes against every value, one epoch per operation.
struct Workload {
    rng: StdRng,
    attr: EcAttr,
    stripes: u64,
    writes: u32,
    punch_ratio: f64,
    rsize: u64,
    epoch: Epoch,
}

impl Workload {
    fn new(args: &Args, attr: EcAttr) -> Self {
        Self {
            rng: StdRng::seed_from_u64(args.seed),
            attr,
            stripes: args.stripes.max(1),
            writes: args.writes_per_round,
            punch_ratio: args.punch_ratio.clamp(0.0, 1.0),
            rsize: args.rsize,
            epoch: 0,
        }
    }

    fn next_epoch(&mut self) -> Epoch {
        self.epoch += 1;
        self.epoch
    }

    async fn run(&mut self, client: &EcClient, values: &[ArrayValue], seed_stripes: bool) -> Result<()> {
        let stripe_len = self.attr.stripe_rec_nr();
        for value in values {
            if seed_stripes {
                // Full stripes give later partial writes existing parity
                let data = self.random_bytes(self.stripes * stripe_len);
                let epoch = self.next_epoch();
                client.write(value, 0, &data, epoch).await?;
            }
            for _ in 0..self.writes {
                let idx = self.rng.gen_range(0..self.stripes * stripe_len);
                let max_nr = (self.stripes * stripe_len - idx).min(stripe_len);
                let nr = self.rng.gen_range(1..=max_nr);
                let epoch = self.next_epoch();
                if self.rng.gen_bool(self.punch_ratio) {
                    client.punch(value, Recx::new(idx, nr), epoch).await?;
                } else {
                    let data = self.random_bytes(nr);
                    client.write(value, idx, &data, epoch).await?;
                }
            }
        }
        Ok(())
    }

    fn random_bytes(&mut self, records: u64) -> Vec<u8> {
        let mut data = vec![0u8; (records * self.rsize) as usize];
        self.rng.fill(&mut data[..]);
        data
    }
}

// =============================================================================
// Verification
// =============================================================================

/// Every stripe either carries parity matching its data cells, or is still
/// replicated with replicas matching its data cells.
async fn verify(
    client: &EcClient,
    cluster: &MemCluster,
    placement: &StaticPlacement,
    values: &[ArrayValue],
    stripes: u64,
    epoch: Epoch,
) -> Result<Verification> {
    let mut out = Verification::default();
    for value in values {
        let attr = value.attr;
        let layout = placement.layout_of(&value.oid, &attr)?;
        let leader_shard = attr.tgt_count() - 1;
        let leader = cluster.store(layout.target_of(leader_shard)?)?;
        let leader_path = value.path(leader_shard);

        for stripe in 0..stripes {
            out.stripes_checked += 1;
            match client.verify_stripe(value, stripe, epoch).await? {
                ParityCheck::Match => out.parity_match += 1,
                ParityCheck::Mismatch { shard } => out.mismatches.push(format!(
                    "{} stripe {}: parity on shard {} does not match data",
                    value.oid, stripe, shard
                )),
                ParityCheck::Missing { .. } => {
                    let range = attr.stripe_recx(stripe);
                    let data = client.read(value, range, epoch).await?;
                    let replicas = leader.fetch(&leader_path, value.rsize, &[range], epoch).await?;
                    if data == replicas {
                        out.replicated += 1;
                    } else {
                        out.mismatches.push(format!(
                            "{} stripe {}: no parity and replicas differ from data",
                            value.oid, stripe
                        ));
                    }
                }
            }
        }
    }
    Ok(out)
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
