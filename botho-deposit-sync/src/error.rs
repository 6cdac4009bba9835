//! Error taxonomy for the deposit sync pipeline.
//!
//! Every fallible operation in the library returns [`SyncError`]. Whether a
//! failure should be retried by the sweeper is answered by
//! [`SyncError::is_retryable`]; nothing in this crate treats a single failed
//! sync attempt as fatal to the process.

use thiserror::Error;

use crate::charge::ChargeKey;

/// Errors produced while classifying, persisting or reconciling deposits.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An output script could not be decoded. The output is skipped.
    #[error("Classification error: {0}")]
    Classification(String),

    /// The durable charge store failed to write, delete or load.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The ledger service or the address store failed or timed out.
    #[error("Retryable sync error: {0}")]
    RetryableSync(String),

    /// The node's chain index could not be queried.
    #[error("Chain index error: {0}")]
    Chain(String),

    /// More than one unpaired credit token exists for a charge key.
    #[error("Consistency error for {key}: {unpaired} unpaired credit tokens")]
    Consistency { key: ChargeKey, unpaired: usize },

    /// Invalid configuration or address data.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether the sweeper should simply try again on its next tick.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::RetryableSync(_) | SyncError::Chain(_) | SyncError::Persistence(_)
        )
    }

    /// Whether this error indicates a corrupted or double-applied history.
    pub fn is_consistency(&self) -> bool {
        matches!(self, SyncError::Consistency { .. })
    }
}

impl From<lmdb::Error> for SyncError {
    fn from(e: lmdb::Error) -> Self {
        SyncError::Persistence(e.to_string())
    }
}

impl From<bincode::Error> for SyncError {
    fn from(e: bincode::Error) -> Self {
        SyncError::Persistence(format!("record encoding: {}", e))
    }
}
