/// Error types for timeline sync and chunk storage
use thiserror::Error;

/// Failure reported by a sync or pagination transport.
///
/// The split matters to the sync loop: connectivity failures wait for the
/// network to come back, everything else waits out the fixed backoff.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("Transport error: {0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether the same batch can be retried later with a chance of success.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SyncError::DataIntegrity(_) | SyncError::Config(_))
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(self, SyncError::Transport(TransportError::Connectivity(_)))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
