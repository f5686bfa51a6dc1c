//! Continuous kill: terminate every running query whose signature matches a
//! target, on a fixed interval, until the target is cleared.
//!
//! Matching is by pid within one snapshot. A backend that finishes and whose
//! pid is reused before the terminate call lands will be killed instead.
//! Nothing here guards against that.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{Connector, bounded};
use crate::error::MonitorError;
use crate::model::{ContinuousKillStatus, KillTarget};
use crate::normalize::signature;
use crate::pg::MonitoredDb;
use crate::settings::MonitorSettings;

/// Result of one kill tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KillRound {
    pub matched: usize,
    pub killed: usize,
    pub failed: usize,
}

/// Terminates every running query whose signature equals `target`. A failed
/// terminate is counted and the remaining matches are still attempted.
pub fn kill_matching(
    db: &mut dyn MonitoredDb,
    target: &str,
    signature_len: usize,
) -> Result<KillRound, MonitorError> {
    let running = db.running_queries()?;
    let mut round = KillRound::default();
    for sample in running
        .iter()
        .filter(|s| signature(&s.query_text, signature_len) == target)
    {
        round.matched += 1;
        match db.terminate_backend(sample.pid) {
            Ok(()) => {
                round.killed += 1;
                info!(
                    pid = sample.pid,
                    username = %sample.username,
                    duration_ms = sample.duration_ms,
                    "terminated matching backend"
                );
            }
            Err(e) => {
                round.failed += 1;
                warn!(pid = sample.pid, error = %e, "terminate failed");
            }
        }
    }
    Ok(round)
}

struct KillJob {
    generation: u64,
    target: String,
    kill_count: u64,
    failed_count: u64,
    started_at: DateTime<Utc>,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Jobs {
    next_generation: u64,
    by_database: HashMap<i64, KillJob>,
}

type SharedJobs = Arc<Mutex<Jobs>>;

fn lock(jobs: &Mutex<Jobs>) -> MutexGuard<'_, Jobs> {
    jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Per-database continuous kill loops.
///
/// Target, counters and loop lifetime live under one lock, so clearing a
/// target resets its counters and retires its loop in one step.
pub struct ContinuousKill {
    connector: Arc<dyn Connector>,
    settings: MonitorSettings,
    jobs: SharedJobs,
}

impl ContinuousKill {
    pub fn new(connector: Arc<dyn Connector>, settings: MonitorSettings) -> Self {
        Self {
            connector,
            settings,
            jobs: Arc::new(Mutex::new(Jobs::default())),
        }
    }

    /// Sets (or replaces) the target of a database and starts its loop.
    ///
    /// A [`KillTarget::Signature`] is matched exactly as given; a
    /// [`KillTarget::Query`] is reduced to a signature the same way running
    /// queries are.
    pub fn set_target(
        &self,
        database_id: i64,
        target: &KillTarget,
    ) -> Result<ContinuousKillStatus, MonitorError> {
        let target = target.resolve(self.settings.signature_len);
        if target.trim().is_empty() {
            return Err(MonitorError::InvalidRequest(
                "continuous kill target must not be empty".to_string(),
            ));
        }

        let mut jobs = lock(&self.jobs);
        if let Some(previous) = jobs.by_database.remove(&database_id) {
            let _ = previous.stop.send(true);
        }
        jobs.next_generation += 1;
        let generation = jobs.next_generation;

        let (stop_tx, stop_rx) = watch::channel(false);
        let ctx = KillContext {
            database_id,
            generation,
            target: target.clone(),
            connector: self.connector.clone(),
            jobs: self.jobs.clone(),
            interval: self.settings.kill_interval,
            timeout: self.settings.cycle_timeout(),
            signature_len: self.settings.signature_len,
        };
        let job = KillJob {
            generation,
            target: target.clone(),
            kill_count: 0,
            failed_count: 0,
            started_at: Utc::now(),
            stop: stop_tx,
            task: None,
        };
        let status = job_status(database_id, &job);
        jobs.by_database.insert(database_id, job);
        let task = tokio::spawn(run_kill_loop(ctx, stop_rx));
        if let Some(job) = jobs.by_database.get_mut(&database_id) {
            job.task = Some(task);
        }
        drop(jobs);

        info!(database_id, target = %target, "continuous kill started");
        Ok(status)
    }

    /// Clears the target, resets the counters and stops the loop. Returns
    /// false when no target was set.
    pub fn clear(&self, database_id: i64) -> bool {
        let removed = lock(&self.jobs).by_database.remove(&database_id);
        match removed {
            Some(job) => {
                let _ = job.stop.send(true);
                info!(
                    database_id,
                    kill_count = job.kill_count,
                    failed_count = job.failed_count,
                    "continuous kill cleared"
                );
                true
            }
            None => false,
        }
    }

    pub fn status(&self, database_id: i64) -> ContinuousKillStatus {
        match lock(&self.jobs).by_database.get(&database_id) {
            Some(job) => job_status(database_id, job),
            None => ContinuousKillStatus {
                database_id,
                target: None,
                kill_count: 0,
                failed_count: 0,
                started_at: None,
            },
        }
    }

    pub fn active_targets(&self) -> usize {
        lock(&self.jobs).by_database.len()
    }

    /// Stops every loop and waits briefly for in-flight ticks.
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut jobs = lock(&self.jobs);
            jobs.by_database
                .drain()
                .filter_map(|(_, mut job)| {
                    let _ = job.stop.send(true);
                    job.task.take()
                })
                .collect()
        };
        for task in tasks {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
    }
}

fn job_status(database_id: i64, job: &KillJob) -> ContinuousKillStatus {
    ContinuousKillStatus {
        database_id,
        target: Some(job.target.clone()),
        kill_count: job.kill_count,
        failed_count: job.failed_count,
        started_at: Some(job.started_at),
    }
}

struct KillContext {
    database_id: i64,
    generation: u64,
    target: String,
    connector: Arc<dyn Connector>,
    jobs: SharedJobs,
    interval: Duration,
    timeout: Duration,
    signature_len: usize,
}

impl KillContext {
    fn is_current(&self) -> bool {
        lock(&self.jobs)
            .by_database
            .get(&self.database_id)
            .is_some_and(|job| job.generation == self.generation)
    }

    fn record(&self, round: KillRound) {
        let mut jobs = lock(&self.jobs);
        if let Some(job) = jobs.by_database.get_mut(&self.database_id)
            && job.generation == self.generation
        {
            job.kill_count += round.killed as u64;
            job.failed_count += round.failed as u64;
        }
    }
}

async fn run_kill_loop(ctx: KillContext, mut stop: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(ctx.interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut ticks: u64 = 0;

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
        if *stop.borrow() || !ctx.is_current() {
            break;
        }

        let connector = ctx.connector.clone();
        let target = ctx.target.clone();
        let database_id = ctx.database_id;
        let signature_len = ctx.signature_len;
        let result = bounded(ctx.timeout, move || {
            let mut db = connector.open(database_id)?;
            kill_matching(db.as_mut(), &target, signature_len)
        })
        .await;
        ticks += 1;

        match result {
            Ok(round) => {
                if round.matched > 0 {
                    debug!(
                        database_id,
                        matched = round.matched,
                        killed = round.killed,
                        failed = round.failed,
                        "kill tick"
                    );
                }
                ctx.record(round);
            }
            Err(e) => warn!(database_id, error = %e, "kill tick failed, retrying next tick"),
        }
    }
    debug!(database_id = ctx.database_id, ticks, "continuous kill loop exited");
}
