//! EC Aggregation Engine
//!
//! Background aggregation for erasure-coded array values. Client writes to an
//! EC object land as full replicas on every parity target; an aggregation
//! pass folds those replicas into Reed-Solomon parity cells, stripe by
//! stripe, and removes them.
//!
//! # Architecture
//!
//! The engine sits behind a set of ports and never touches storage or the
//! network directly:
//!
//! ```text
//! ExtentStore (iterate) → Aggregator (decide per stripe) → ExtentStore + PeerClient (write back)
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - In-memory and Prometheus adapters implementing domain ports
//! - [`domain`] - Domain layer with ports and events (DDD)
//! - [`ec`] - Stripe geometry, codecs and the aggregation pipeline
//! - [`error`] - Error types
//! - [`metrics`] - Metric names and size buckets

pub mod adapters;
pub mod domain;
pub mod ec;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use domain::ports::{Epoch, EpochRange};
pub use ec::{AggregationConfig, Aggregator, CodecKind, EcAttr, PassReport, PassStatus};
pub use error::{Error, Result};
