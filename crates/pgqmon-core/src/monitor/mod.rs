//! Background loops: per-database polling sessions and continuous kill.
//!
//! Loops are tokio tasks. Everything that touches the network or the store
//! runs on the blocking pool through [`bounded`], so a stuck database can
//! hold a blocking thread but never a runtime worker.

mod kill;
mod session;

use std::sync::Arc;
use std::time::Duration;

use crate::connection::ConnectionFactory;
use crate::error::MonitorError;
use crate::pg::{MonitoredDb, PgDatabase};
use crate::registry::Registry;

pub use kill::{ContinuousKill, KillRound, kill_matching};
pub use session::{SessionManager, StartOptions};

/// Opens a monitored database by id.
pub trait Connector: Send + Sync {
    /// Called from blocking context. The returned handle must also be
    /// dropped there.
    fn open(&self, database_id: i64) -> Result<Box<dyn MonitoredDb>, MonitorError>;
}

/// Resolves ids through the registry and connects through the factory.
pub struct RegistryConnector {
    registry: Arc<dyn Registry>,
    factory: Arc<ConnectionFactory>,
}

impl RegistryConnector {
    pub fn new(registry: Arc<dyn Registry>, factory: Arc<ConnectionFactory>) -> Self {
        Self { registry, factory }
    }
}

impl Connector for RegistryConnector {
    fn open(&self, database_id: i64) -> Result<Box<dyn MonitoredDb>, MonitorError> {
        let config = self.registry.resolve(database_id)?;
        let handle = self.factory.create_connection(&config, false)?;
        Ok(Box::new(PgDatabase::new(handle, config.database)))
    }
}

/// Runs `f` on the blocking pool.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, MonitorError>
where
    F: FnOnce() -> Result<T, MonitorError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| MonitorError::Internal(format!("blocking task failed: {e}")))?
}

/// Runs `f` on the blocking pool and gives up waiting after `limit`.
///
/// A timed-out task keeps running to completion in the background; only its
/// result is discarded.
pub(crate) async fn bounded<T, F>(limit: Duration, f: F) -> Result<T, MonitorError>
where
    F: FnOnce() -> Result<T, MonitorError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(limit, blocking(f)).await {
        Ok(result) => result,
        Err(_) => Err(MonitorError::Connectivity(format!(
            "operation timed out after {}s",
            limit.as_secs_f64()
        ))),
    }
}
