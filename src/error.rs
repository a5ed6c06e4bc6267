//! Error types for the broker.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for broker operations.
///
/// Delivery itself never fails from the subscriber's point of view; every
/// variant here belongs to the audit sink lifecycle or to thread startup.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to open audit sink at {}: {source}", .path.display())]
    SinkOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Audit sink write failed: {0}")]
    SinkWrite(#[source] std::io::Error),

    #[error("Audit sink close failed: {0}")]
    SinkClose(#[source] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Failed to spawn dispatch thread: {0}")]
    DispatchSpawn(#[source] std::io::Error),
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Serialization(e.to_string())
    }
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;
