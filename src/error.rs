//! Error types for the EC aggregation engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while aggregating erasure-coded extents
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Offloaded codec task panicked or was cancelled
    #[error("Offloaded task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Erasure Coding Errors
    // =========================================================================
    /// Invalid EC configuration
    #[error("Invalid EC configuration: {0}")]
    InvalidEcConfig(String),

    /// EC encoding failed
    #[error("EC encoding failed: {0}")]
    EcEncodingFailed(String),

    // =========================================================================
    // Storage / Transport Errors
    // =========================================================================
    /// Transaction conflicted with concurrent traffic and must be restarted
    #[error("Transaction conflict: {0}")]
    TxConflict(String),

    /// Remote fetch or apply failed in transit
    #[error("Transport error to target {target}: {reason}")]
    Transport { target: u32, reason: String },

    /// Data fetched from a peer did not match its checksum
    #[error("Checksum mismatch on data from target {target}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        target: u32,
        expected: u32,
        actual: u32,
    },

    /// Placement returned a layout that does not fit the object
    #[error("Invalid layout: {0}")]
    InvalidLayout(String),

    /// Object, key or extent not found
    #[error("Not found: {0}")]
    NotFound(String),

    // =========================================================================
    // Aggregation Control
    // =========================================================================
    /// Pass aborted by the yield hook or cancellation
    #[error("EC aggregation aborted")]
    Aborted,
}

impl Error {
    /// True for conditions a caller may retry without changing its inputs.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TxConflict(_) | Error::Transport { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::TxConflict("busy".to_string()).is_retryable());
        assert!(Error::Transport {
            target: 3,
            reason: "timeout".to_string()
        }
        .is_retryable());
        assert!(!Error::Aborted.is_retryable());
        assert!(!Error::EcEncodingFailed("bad".to_string()).is_retryable());
    }

    #[test]
    fn test_display_includes_context() {
        let err = Error::ChecksumMismatch {
            target: 2,
            expected: 0xdead_beef,
            actual: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains("target 2"));
        assert!(msg.contains("0xdeadbeef"));
    }
}
