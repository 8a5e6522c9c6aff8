//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  ExtentStore │ PeerClient │ Placement │ YieldHook          │ │
//! │  │  MetricsSink                                               │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ MemExtentStore │ MemCluster │ StaticPlacement │ EcClient   │ │
//! │  │ PrometheusMetricsSink │ TokioYieldHook                     │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use ecagg::adapters::{EcClient, MemCluster, StaticPlacement};
//! use ecagg::ec::{AggregationConfig, Aggregator};
//!
//! let cluster = Arc::new(MemCluster::new(4));
//! let placement = Arc::new(StaticPlacement::new(4));
//! let store = cluster.store(TargetId(2))?;
//!
//! let aggregator = Aggregator::new(AggregationConfig::default(), store, cluster, placement)?;
//! let report = aggregator.run_pass(EpochRange::new(0, 10)).await?;
//! ```

pub mod cluster;
pub mod memory;
mod prometheus;
mod tokio_yield;

pub use cluster::{ArrayValue, EcClient, MemCluster, ParityCheck, StaticPlacement};
pub use memory::{MemExtentStore, StoredExtent};
pub use prometheus::{PrometheusMetricsSink, LATENCY_HISTOGRAM};
pub use tokio_yield::TokioYieldHook;
