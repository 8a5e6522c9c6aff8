//! Erasure Coding Aggregation Module
//!
//! Background conversion of replicated extents into erasure-coded parity.
//! Writes to an EC object land as full replicas on the parity targets; each
//! aggregation pass folds the replicas of a stripe into its parity cells and
//! removes them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      EC Aggregation Module                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                          │
//! │  ┌──────────────┐    ┌──────────────┐    ┌───────────────────────────┐  │
//! │  │    Driver    │───▶│    Stripe    │───▶│   Parity Prober           │  │
//! │  │  (iteration) │    │  Accumulator │    │   (local lookup)          │  │
//! │  └──────────────┘    └──────────────┘    └───────────────────────────┘  │
//! │                                                       │                  │
//! │                   ┌───────────────────┐               ▼                  │
//! │                   │    Write-back     │◀──── Disposition Engine          │
//! │                   │  (local + peers)  │      (encode, update, recover)   │
//! │                   └───────────────────┘                                  │
//! │                                                                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - **Geometry** (`geometry.rs`): `k + p` layout math, logical/local offset
//!   mapping and the parity address space.
//! - **Codec** (`codec.rs`, `offload.rs`): full and incremental parity
//!   computation, run on the blocking pool.
//! - **Stripe Accumulator** (`stripe.rs`): replica extents of the stripe
//!   under aggregation.
//! - **Disposition Engine** (`disposition.rs`): decides and carries out what
//!   happens to a stripe.
//! - **Write-back** (`writeback.rs`): local commit plus peer applies.
//! - **Driver** (`driver.rs`): one aggregation pass over a target.
//!
//! # Usage
//!
//! ```rust,ignore
//! use ecagg::ec::{AggregationConfig, Aggregator};
//! use ecagg::domain::ports::EpochRange;
//!
//! let aggregator = Aggregator::new(AggregationConfig::default(), store, peers, placement)?;
//! let report = aggregator.run_pass(EpochRange::new(0, 42)).await?;
//! println!("{} stripes", report.stripes.total());
//! ```

pub mod bitset;
pub mod codec;
pub mod disposition;
pub mod driver;
pub mod entry;
pub mod geometry;
pub mod offload;
pub mod prober;
pub mod remote;
pub mod stripe;
pub mod writeback;

#[cfg(test)]
mod proptest;

pub use codec::{codec_for, CodecKind, ParityCodec};
pub use disposition::{Disposition, StripeOutcome};
pub use driver::{AggregationConfig, Aggregator, OutcomeCounts, PassReport, PassStatus};
pub use geometry::{EcAttr, PARITY_INDICATOR};
