//! Iteration Events
//!
//! The extent store walks a container as a nested tree (object, dkey, akey,
//! extent). The walk is flattened into a stream of tagged events; the
//! aggregation driver reconstructs the nesting from the event order.
//!
//! ```text
//! Object ─┬─ Dkey ─┬─ Akey ── Recx, Recx, ...
//!         │        └─ Akey ── Recx, ...
//!         └─ Dkey ── ...
//! ```

use serde::{Deserialize, Serialize};

use super::ports::{Epoch, Key, ObjectClass, Recx, UnitOid};

/// One visible replica extent yielded by the iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentEntry {
    /// Visible part of the extent
    pub recx: Recx,
    /// Extent as originally written
    pub orig_recx: Recx,
    /// Epoch the extent was written at
    pub epoch: Epoch,
    /// True for punched ranges
    pub is_hole: bool,
}

/// Tagged iteration event, outermost level first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IterEvent {
    /// Start of an object shard stored on this target.
    Object {
        oid: UnitOid,
        class: ObjectClass,
        /// Newest epoch written anywhere in the object
        last_write: Epoch,
    },
    /// Start of a dkey within the current object.
    Dkey { dkey: Key },
    /// Start of an array akey within the current dkey.
    Akey { akey: Key, rsize: u64 },
    /// Visible extent within the current akey, in offset order.
    Recx(ExtentEntry),
}

impl IterEvent {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            IterEvent::Object { .. } => "object",
            IterEvent::Dkey { .. } => "dkey",
            IterEvent::Akey { .. } => "akey",
            IterEvent::Recx(_) => "recx",
        }
    }
}
