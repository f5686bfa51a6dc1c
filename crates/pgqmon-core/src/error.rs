//! Error taxonomy shared by the monitoring core.

use thiserror::Error;

use crate::store::StoreError;
use crate::tunnel::TunnelError;

/// Errors surfaced by monitoring operations.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Tunnel, authentication or database unreachable. Retried by loops on the next tick.
    #[error("connectivity: {0}")]
    Connectivity(String),
    /// pg_stat_statements is not installed in the monitored database.
    #[error("pg_stat_statements extension is not installed in database {database}")]
    ExtensionMissing { database: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Kill(#[from] KillError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("{0} not found")]
    NotFound(String),
    /// A background task panicked or was cancelled.
    #[error("internal: {0}")]
    Internal(String),
}

impl From<TunnelError> for MonitorError {
    fn from(e: TunnelError) -> Self {
        MonitorError::Connectivity(e.to_string())
    }
}

impl MonitorError {
    /// True for failures that a polling loop should simply retry on its next tick.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MonitorError::Connectivity(_))
    }
}

/// Failure of a single terminate attempt. Never halts a kill loop.
#[derive(Debug, Error)]
pub enum KillError {
    #[error("process {0} is no longer running")]
    ProcessGone(i32),
    #[error("not allowed to terminate process {pid}: {message}")]
    Denied { pid: i32, message: String },
    #[error("connectivity: {0}")]
    Connectivity(String),
}
