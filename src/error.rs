//! Error types exposed by this crate.

use thiserror::Error;

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Error variants related to the internals of the membership core.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RaftError {
    /// An error which has come from the `RaftStorage` layer.
    #[error("{0}")]
    Storage(anyhow::Error),
    /// An error which has come from the `RaftNetwork` layer.
    #[error("{0}")]
    Network(anyhow::Error),
}

/// Error variants related to configuration.
#[derive(Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The given value for heartbeat_interval is too small, must be > 0.
    #[error("the given value for heartbeat_interval is too small, must be > 0")]
    HeartbeatIntervalTooSmall,
    /// The given value for join_response_limit is too small, must be > 0.
    #[error("the given value for join_response_limit is too small, must be > 0")]
    JoinResponseLimitTooSmall,
    /// The given value for log_sync_batch_size is too small, must be > 0.
    #[error("the given value for log_sync_batch_size is too small, must be > 0")]
    LogSyncBatchSizeTooSmall,
}
