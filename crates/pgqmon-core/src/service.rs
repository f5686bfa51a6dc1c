//! The API surface consumed by the dashboard.
//!
//! Mutating calls take the caller's user id and emit an audit event under the
//! `audit` tracing target. Read calls never fail on backend trouble: they log
//! and return whatever is available, possibly nothing.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::connection::ConnectionFactory;
use crate::error::MonitorError;
use crate::model::{
    CollectedQueryInstance, ContinuousKillStatus, DiscoveredQuery, KillTarget, MonitoringSession,
    QueryFilter, QuerySample,
};
use crate::monitor::{
    Connector, ContinuousKill, RegistryConnector, SessionManager, StartOptions, blocking, bounded,
};
use crate::registry::Registry;
use crate::settings::MonitorSettings;
use crate::store::QueryStore;
use crate::tunnel::{SshOpener, TunnelManager, TunnelTimeouts};

pub struct QueryMonitor {
    store: Arc<dyn QueryStore>,
    connector: Arc<dyn Connector>,
    sessions: SessionManager,
    kills: ContinuousKill,
    settings: MonitorSettings,
    /// Present when connections go through [`RegistryConnector`].
    factory: Option<Arc<ConnectionFactory>>,
}

impl QueryMonitor {
    pub fn new(
        store: Arc<dyn QueryStore>,
        connector: Arc<dyn Connector>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            sessions: SessionManager::new(store.clone(), connector.clone(), settings.clone()),
            kills: ContinuousKill::new(connector.clone(), settings.clone()),
            store,
            connector,
            settings,
            factory: None,
        }
    }

    /// Wires the registry, SSH tunnels and connection factory together.
    pub fn with_registry(
        store: Arc<dyn QueryStore>,
        registry: Arc<dyn Registry>,
        settings: MonitorSettings,
    ) -> Self {
        let tunnels = TunnelManager::new(
            Arc::new(SshOpener),
            TunnelTimeouts {
                handshake: settings.ssh_timeout,
                keepalive: settings.ssh_keepalive,
            },
        );
        let factory = Arc::new(ConnectionFactory::new(tunnels, settings.clone()));
        let connector = Arc::new(RegistryConnector::new(registry, factory.clone()));
        let mut monitor = Self::new(store, connector, settings);
        monitor.factory = Some(factory);
        monitor
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// Re-attaches persisted running sessions. Call once at startup.
    pub async fn recover(&self) -> Result<usize, MonitorError> {
        self.sessions.recover().await
    }

    // ---- sessions ----

    pub async fn start_monitoring(
        &self,
        database_id: i64,
        options: StartOptions,
        caller: &str,
    ) -> Result<MonitoringSession, MonitorError> {
        let session = self.sessions.start(database_id, options).await?;
        info!(
            target: "audit",
            user = caller,
            action = "start_monitoring",
            database_id,
            session_id = session.id
        );
        Ok(session)
    }

    pub async fn stop_monitoring(
        &self,
        session_id: i64,
        caller: &str,
    ) -> Result<MonitoringSession, MonitorError> {
        let session = self.sessions.stop(session_id).await?;
        info!(
            target: "audit",
            user = caller,
            action = "stop_monitoring",
            database_id = session.database_id,
            session_id
        );
        Ok(session)
    }

    pub async fn session_status(&self, session_id: i64) -> Result<MonitoringSession, MonitorError> {
        self.sessions.status(session_id).await
    }

    // ---- discovered queries ----

    /// At most `discovered_limit` signatures, most recently updated first.
    pub async fn discovered_queries(
        &self,
        database_id: i64,
        filter: QueryFilter,
    ) -> Vec<DiscoveredQuery> {
        let store = self.store.clone();
        let limit = self.settings.discovered_limit;
        match blocking(move || Ok(store.discovered_queries(database_id, &filter, limit)?)).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(database_id, error = %e, "discovered queries unavailable");
                Vec::new()
            }
        }
    }

    pub async fn query_instances(&self, query_id: i64) -> Vec<CollectedQueryInstance> {
        let store = self.store.clone();
        match blocking(move || Ok(store.query_instances(query_id)?)).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(query_id, error = %e, "query instances unavailable");
                Vec::new()
            }
        }
    }

    pub async fn mark_query_known(
        &self,
        query_id: i64,
        is_known: bool,
        caller: &str,
    ) -> Result<(), MonitorError> {
        let store = self.store.clone();
        let found = blocking(move || Ok(store.set_query_known(query_id, is_known)?)).await?;
        if !found {
            return Err(MonitorError::NotFound(format!("query {query_id}")));
        }
        info!(target: "audit", user = caller, action = "mark_query_known", query_id, is_known);
        Ok(())
    }

    pub async fn assign_query_group(
        &self,
        query_id: i64,
        group_id: Option<i64>,
        caller: &str,
    ) -> Result<(), MonitorError> {
        let store = self.store.clone();
        let found = blocking(move || Ok(store.set_query_group(query_id, group_id)?)).await?;
        if !found {
            return Err(MonitorError::NotFound(format!("query {query_id}")));
        }
        info!(target: "audit", user = caller, action = "assign_query_group", query_id, ?group_id);
        Ok(())
    }

    // ---- running queries and kills ----

    /// Live snapshot of running queries. The snapshot is persisted; when the
    /// database cannot be reached the last persisted snapshot is returned.
    pub async fn running_queries(&self, database_id: i64) -> Vec<QuerySample> {
        let connector = self.connector.clone();
        let live = bounded(self.settings.cycle_timeout(), move || {
            let mut db = connector.open(database_id)?;
            db.running_queries()
        })
        .await;

        let store = self.store.clone();
        match live {
            Ok(samples) => {
                let snapshot = samples.clone();
                let saved = blocking(move || {
                    Ok(store.replace_query_samples(database_id, &snapshot, Utc::now())?)
                })
                .await;
                if let Err(e) = saved {
                    warn!(database_id, error = %e, "failed to persist running queries");
                }
                samples
            }
            Err(e) => {
                warn!(database_id, error = %e, "running queries unavailable, serving last snapshot");
                blocking(move || Ok(store.query_samples(database_id)?))
                    .await
                    .unwrap_or_default()
            }
        }
    }

    /// Terminates one backend. Failures are returned to the caller.
    pub async fn kill_query(
        &self,
        database_id: i64,
        pid: i32,
        caller: &str,
    ) -> Result<(), MonitorError> {
        let connector = self.connector.clone();
        let result = bounded(self.settings.cycle_timeout(), move || {
            let mut db = connector.open(database_id)?;
            Ok(db.terminate_backend(pid)?)
        })
        .await;
        info!(
            target: "audit",
            user = caller,
            action = "kill_query",
            database_id,
            pid,
            ok = result.is_ok()
        );
        result
    }

    pub fn set_continuous_kill_target(
        &self,
        database_id: i64,
        target: &KillTarget,
        caller: &str,
    ) -> Result<ContinuousKillStatus, MonitorError> {
        let status = self.kills.set_target(database_id, target)?;
        info!(
            target: "audit",
            user = caller,
            action = "set_continuous_kill",
            database_id,
            signature = status.target.as_deref().unwrap_or_default()
        );
        Ok(status)
    }

    pub fn clear_continuous_kill_target(
        &self,
        database_id: i64,
        caller: &str,
    ) -> ContinuousKillStatus {
        let cleared = self.kills.clear(database_id);
        info!(target: "audit", user = caller, action = "clear_continuous_kill", database_id, cleared);
        self.kills.status(database_id)
    }

    pub fn continuous_kill_status(&self, database_id: i64) -> ContinuousKillStatus {
        self.kills.status(database_id)
    }

    /// Stops all loops and closes all tunnels. Sessions remain `running` in
    /// the store and are recovered on the next start.
    pub async fn shutdown(&self) {
        self.kills.shutdown().await;
        self.sessions.shutdown().await;
        if let Some(factory) = &self.factory {
            factory.tunnels().close_all();
        }
        info!("query monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::error::KillError;
    use crate::model::StatementStats;
    use crate::monitor::testing::{FakeBackend, FakeConnector, sample};
    use crate::normalize::{normalize_query, query_hash};
    use crate::store::MemoryStore;

    fn monitor() -> (QueryMonitor, Arc<MemoryStore>, Arc<FakeBackend>) {
        let store = Arc::new(MemoryStore::new());
        let (connector, backend) = FakeConnector::new();
        let settings = MonitorSettings {
            default_poll_interval_secs: 1,
            ..MonitorSettings::default()
        };
        (
            QueryMonitor::new(store.clone(), connector, settings),
            store,
            backend,
        )
    }

    fn seed(store: &MemoryStore, database_id: i64, raw: &str, calls: i64) -> i64 {
        let normalized = normalize_query(raw);
        let now = Utc::now();
        let id = store
            .upsert_normalized_query(database_id, &query_hash(&normalized), &normalized, now)
            .unwrap();
        let stats = StatementStats {
            query_text: raw.to_string(),
            calls,
            total_time: calls as f64,
            min_time: 1.0,
            max_time: 1.0,
            mean_time: 1.0,
        };
        store
            .upsert_query_instance(database_id, id, &query_hash(raw), &stats, now)
            .unwrap();
        id
    }

    #[tokio::test]
    async fn discovered_queries_respect_known_flag() {
        let (monitor, store, _backend) = monitor();
        let id = seed(&store, 1, "SELECT * FROM users WHERE id = 1", 3);
        seed(&store, 1, "SELECT * FROM users WHERE id = 2", 4);

        let rows = monitor.discovered_queries(1, QueryFilter::default()).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].call_count, 7);
        assert_eq!(monitor.query_instances(id).await.len(), 2);

        monitor.mark_query_known(id, true, "alice").await.unwrap();
        assert!(monitor.discovered_queries(1, QueryFilter::default()).await.is_empty());

        monitor.assign_query_group(id, Some(9), "alice").await.unwrap();
        let filter = QueryFilter {
            show_known: true,
            group_id: Some(9),
            ..QueryFilter::default()
        };
        assert_eq!(monitor.discovered_queries(1, filter).await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_query_updates_are_not_found() {
        let (monitor, _store, _backend) = monitor();
        assert!(matches!(
            monitor.mark_query_known(5, true, "alice").await,
            Err(MonitorError::NotFound(_))
        ));
        assert!(matches!(
            monitor.assign_query_group(5, None, "alice").await,
            Err(MonitorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn running_queries_fall_back_to_last_snapshot() {
        let (monitor, _store, backend) = monitor();
        backend
            .running
            .lock()
            .unwrap()
            .push(sample(42, "SELECT pg_sleep(60)"));

        let live = monitor.running_queries(1).await;
        assert_eq!(live.len(), 1);

        backend.unreachable.store(true, Ordering::SeqCst);
        let cached = monitor.running_queries(1).await;
        assert_eq!(cached, live);
        assert!(monitor.running_queries(2).await.is_empty());
    }

    #[tokio::test]
    async fn manual_kill_surfaces_errors() {
        let (monitor, _store, backend) = monitor();
        monitor.kill_query(1, 77, "bob").await.unwrap();

        backend
            .kill_failures
            .lock()
            .unwrap()
            .insert(78, KillError::ProcessGone);
        let err = monitor.kill_query(1, 78, "bob").await.unwrap_err();
        assert!(matches!(err, MonitorError::Kill(KillError::ProcessGone(78))));
        assert_eq!(backend.kill_attempts(), vec![77, 78]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn session_round_trip() {
        let (monitor, _store, _backend) = monitor();
        let session = monitor
            .start_monitoring(3, StartOptions::default(), "carol")
            .await
            .unwrap();
        let status = monitor.session_status(session.id).await.unwrap();
        assert_eq!(status.id, session.id);

        let stopped = monitor.stop_monitoring(session.id, "carol").await.unwrap();
        assert_eq!(stopped.status, crate::model::SessionStatus::Stopped);
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn continuous_kill_set_and_clear() {
        let (monitor, _store, _backend) = monitor();
        let status = monitor
            .set_continuous_kill_target(
                2,
                &KillTarget::Query("DELETE FROM jobs WHERE id = $1".into()),
                "dave",
            )
            .unwrap();
        assert_eq!(
            status.target.as_deref(),
            Some("delete from jobs where id = $?")
        );
        assert_eq!(
            monitor.continuous_kill_status(2).target,
            status.target
        );

        let cleared = monitor.clear_continuous_kill_target(2, "dave");
        assert_eq!(cleared.target, None);
        assert_eq!(cleared.kill_count, 0);
        monitor.shutdown().await;
    }
}
