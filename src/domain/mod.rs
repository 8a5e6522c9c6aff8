//! Domain Layer
//!
//! Value objects shared by the aggregation engine and the ports through which
//! it reaches its external collaborators.
//!
//! - **Ports** (`ports.rs`) - identity and extent value objects, transaction
//!   records, and the collaborator traits
//! - **Events** (`events.rs`) - the tagged iteration events produced by an
//!   [`ports::ExtentStore`] walk

pub mod events;
pub mod ports;

pub use events::{ExtentEntry, IterEvent};
pub use ports::{
    Epoch, EpochRange, ExtentStore, FetchReply, Key, Layout, LeaderStatus, MetricsSink, ObjectClass,
    ObjectId, PeerClient, Placement, Recx, StoreTx, TargetId, TxOp, UnitOid, ValuePath,
    VersionedRecx, YieldHook,
};
