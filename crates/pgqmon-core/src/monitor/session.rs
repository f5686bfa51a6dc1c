//! Monitoring sessions: one polling loop per database.
//!
//! ```text
//!   start ──▶ running ──stop──▶ stopped
//!                │
//!                └──scheduled end──▶ completed
//! ```
//!
//! Neither terminal state is ever left; a later start creates a new session.
//! Start and stop for one database are serialized by a per-database gate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::{OwnedMutexGuard, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Connector, blocking, bounded};
use crate::collector;
use crate::error::MonitorError;
use crate::model::{MonitoringSession, SessionStatus};
use crate::settings::MonitorSettings;
use crate::store::QueryStore;

/// How long shutdown waits for a loop to finish its in-flight cycle.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Upper bound for a requested session duration (one year).
const MAX_DURATION_MINUTES: u64 = 366 * 24 * 60;

/// Optional parameters of a start request.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StartOptions {
    pub polling_interval_seconds: Option<u64>,
    /// Run for this long, then complete. Unbounded when absent.
    pub duration_minutes: Option<u64>,
}

struct LoopHandle {
    session_id: i64,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

type Loops = Arc<Mutex<HashMap<i64, LoopHandle>>>;
type Gates = Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns the polling loops. Must be used from within a tokio runtime.
pub struct SessionManager {
    store: Arc<dyn QueryStore>,
    connector: Arc<dyn Connector>,
    settings: MonitorSettings,
    gates: Gates,
    /// Keyed by database id.
    loops: Loops,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn QueryStore>,
        connector: Arc<dyn Connector>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            store,
            connector,
            settings,
            gates: Mutex::new(HashMap::new()),
            loops: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Waits for exclusive access to the database's start/stop path.
    async fn enter(&self, database_id: i64) -> GateGuard<'_> {
        let gate = lock(&self.gates).entry(database_id).or_default().clone();
        GateGuard {
            gates: &self.gates,
            database_id,
            held: gate.lock_owned().await,
        }
    }

    #[cfg(test)]
    fn gate_count(&self) -> usize {
        lock(&self.gates).len()
    }

    /// Starts polling a database, or returns its already-active session.
    ///
    /// The database is probed synchronously: connectivity failures and a
    /// missing pg_stat_statements extension are returned to the caller and no
    /// session is created.
    pub async fn start(
        &self,
        database_id: i64,
        options: StartOptions,
    ) -> Result<MonitoringSession, MonitorError> {
        let interval = options
            .polling_interval_seconds
            .unwrap_or(self.settings.default_poll_interval_secs);
        if interval == 0 {
            return Err(MonitorError::InvalidRequest(
                "polling interval must be positive".to_string(),
            ));
        }
        if options.duration_minutes == Some(0) {
            return Err(MonitorError::InvalidRequest(
                "duration must be positive".to_string(),
            ));
        }

        let _gate = self.enter(database_id).await;

        let store = self.store.clone();
        let existing =
            blocking(move || Ok(store.active_session(database_id, Utc::now())?)).await?;
        if let Some(session) = existing {
            debug!(database_id, session_id = session.id, "session already running");
            self.ensure_loop(&session);
            return Ok(session);
        }

        let connector = self.connector.clone();
        let version = bounded(self.settings.cycle_timeout(), move || {
            let mut db = connector.open(database_id)?;
            db.statements_extension()?
                .ok_or_else(|| MonitorError::ExtensionMissing {
                    database: database_id.to_string(),
                })
        })
        .await?;

        let now = Utc::now();
        let end = options
            .duration_minutes
            .map(|m| now + chrono::Duration::minutes(m.min(MAX_DURATION_MINUTES) as i64));
        let store = self.store.clone();
        let session =
            blocking(move || Ok(store.create_session(database_id, interval, end, now)?)).await?;

        info!(
            database_id,
            session_id = session.id,
            interval_secs = interval,
            scheduled_end = ?session.scheduled_end_time,
            pg_stat_statements = %version,
            "monitoring session started"
        );
        self.ensure_loop(&session);
        Ok(session)
    }

    /// Stops a running session. Stopping a finished session is a no-op.
    pub async fn stop(&self, session_id: i64) -> Result<MonitoringSession, MonitorError> {
        let session = self.load(session_id).await?;
        let _gate = self.enter(session.database_id).await;

        let store = self.store.clone();
        let changed = blocking(move || {
            Ok(store.finish_session(session_id, SessionStatus::Stopped, Utc::now())?)
        })
        .await?;

        if let Some(handle) = self.detach(session.database_id, session_id) {
            let _ = handle.stop.send(true);
        }
        if changed {
            info!(
                database_id = session.database_id,
                session_id, "monitoring session stopped"
            );
        }
        self.load(session_id).await
    }

    pub async fn status(&self, session_id: i64) -> Result<MonitoringSession, MonitorError> {
        self.load(session_id).await
    }

    /// Re-attaches loops to sessions persisted as running. Expired ones are
    /// completed instead. Returns the number of loops attached.
    pub async fn recover(&self) -> Result<usize, MonitorError> {
        let store = self.store.clone();
        let running = blocking(move || Ok(store.running_sessions()?)).await?;
        let now = Utc::now();
        let mut attached = 0;
        for session in running {
            if session.is_expired(now) {
                let store = self.store.clone();
                let id = session.id;
                blocking(move || Ok(store.finish_session(id, SessionStatus::Completed, now)?))
                    .await?;
                info!(session_id = id, "expired session completed during recovery");
                continue;
            }
            let _gate = self.enter(session.database_id).await;
            if self.ensure_loop(&session) {
                attached += 1;
            }
        }
        if attached > 0 {
            info!(sessions = attached, "monitoring sessions recovered");
        }
        Ok(attached)
    }

    /// Number of loops currently attached.
    pub fn active_loops(&self) -> usize {
        lock(&self.loops).len()
    }

    /// Signals every loop and waits for in-flight cycles. Sessions stay
    /// `running` in the store so that [`recover`](Self::recover) picks them up.
    pub async fn shutdown(&self) {
        let handles: Vec<LoopHandle> = lock(&self.loops).drain().map(|(_, h)| h).collect();
        for handle in &handles {
            let _ = handle.stop.send(true);
        }
        for handle in handles {
            if tokio::time::timeout(SHUTDOWN_GRACE, handle.task).await.is_err() {
                warn!(session_id = handle.session_id, "session loop did not stop in time");
            }
        }
    }

    async fn load(&self, session_id: i64) -> Result<MonitoringSession, MonitorError> {
        let store = self.store.clone();
        blocking(move || Ok(store.session(session_id)?))
            .await?
            .ok_or_else(|| MonitorError::NotFound(format!("session {session_id}")))
    }

    fn detach(&self, database_id: i64, session_id: i64) -> Option<LoopHandle> {
        let mut loops = lock(&self.loops);
        match loops.get(&database_id) {
            Some(h) if h.session_id == session_id => loops.remove(&database_id),
            _ => None,
        }
    }

    /// Spawns the loop for `session` unless one is attached. Caller holds the gate.
    fn ensure_loop(&self, session: &MonitoringSession) -> bool {
        let mut loops = lock(&self.loops);
        if let Some(existing) = loops.get(&session.database_id) {
            if existing.session_id == session.id && !existing.task.is_finished() {
                return false;
            }
            let _ = existing.stop.send(true);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let ctx = LoopContext {
            store: self.store.clone(),
            connector: self.connector.clone(),
            cycle_timeout: self.settings.cycle_timeout(),
            loops: self.loops.clone(),
        };
        let task = tokio::spawn(run_loop(ctx, session.clone(), stop_rx));
        loops.insert(
            session.database_id,
            LoopHandle {
                session_id: session.id,
                stop: stop_tx,
                task,
            },
        );
        true
    }
}

/// Exclusive access to one database's gate. The gate is forgotten on drop
/// when no other caller is waiting for it.
struct GateGuard<'a> {
    gates: &'a Gates,
    database_id: i64,
    held: OwnedMutexGuard<()>,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        let mut gates = lock(self.gates);
        // One reference in the map, one in this guard.
        if Arc::strong_count(OwnedMutexGuard::mutex(&self.held)) <= 2 {
            gates.remove(&self.database_id);
        }
    }
}

struct LoopContext {
    store: Arc<dyn QueryStore>,
    connector: Arc<dyn Connector>,
    cycle_timeout: Duration,
    loops: Loops,
}

async fn run_loop(ctx: LoopContext, session: MonitoringSession, mut stop: watch::Receiver<bool>) {
    let database_id = session.database_id;
    let session_id = session.id;
    let interval = Duration::from_secs(session.polling_interval_seconds.max(1));
    let mut cycles: u64 = 0;

    loop {
        if *stop.borrow() {
            break;
        }

        let now = Utc::now();
        if session.is_expired(now) {
            complete(&ctx, session_id, now).await;
            break;
        }
        let store = ctx.store.clone();
        match blocking(move || Ok(store.session(session_id)?)).await {
            Ok(Some(current)) if current.status != SessionStatus::Running => break,
            Ok(None) => break,
            Ok(Some(_)) => {}
            Err(e) => warn!(session_id, error = %e, "failed to re-check session state"),
        }

        let store = ctx.store.clone();
        let connector = ctx.connector.clone();
        let result = bounded(ctx.cycle_timeout, move || {
            let mut db = connector.open(database_id)?;
            collector::run_cycle(db.as_mut(), store.as_ref(), database_id, Utc::now())
        })
        .await;
        cycles += 1;
        match result {
            Ok(report) => debug!(
                database_id,
                session_id,
                cycles,
                processed = report.processed,
                skipped = report.skipped,
                "poll cycle completed"
            ),
            Err(e) => warn!(database_id, session_id, error = %e, "poll cycle failed, retrying next tick"),
        }

        let sleep_for = until_next_tick(interval, session.scheduled_end_time, Utc::now());
        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    let mut loops = lock(&ctx.loops);
    if loops.get(&database_id).is_some_and(|h| h.session_id == session_id) {
        loops.remove(&database_id);
    }
    drop(loops);
    debug!(database_id, session_id, cycles, "session loop exited");
}

async fn complete(ctx: &LoopContext, session_id: i64, now: DateTime<Utc>) {
    let store = ctx.store.clone();
    match blocking(move || Ok(store.finish_session(session_id, SessionStatus::Completed, now)?))
        .await
    {
        Ok(true) => info!(session_id, "monitoring session completed"),
        Ok(false) => {}
        Err(e) => warn!(session_id, error = %e, "failed to complete session"),
    }
}

/// The polling interval, shortened so that expiry is noticed on time.
fn until_next_tick(
    interval: Duration,
    scheduled_end: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Duration {
    match scheduled_end.and_then(|end| (end - now).to_std().ok()) {
        Some(left) => interval.min(left),
        None if scheduled_end.is_some() => Duration::ZERO,
        None => interval,
    }
}
