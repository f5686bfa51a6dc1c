//! Builds database connections to monitored databases, direct or through an
//! SSH tunnel, and owns their release.

mod executor;

use postgres::types::ToSql;
use postgres::{NoTls, Row};
use r2d2::Pool;
use r2d2_postgres::PostgresConnectionManager;
use tracing::debug;

use crate::error::MonitorError;
use crate::pg::format_postgres_error;
use crate::settings::MonitorSettings;
use crate::tunnel::{SshSettings, TunnelLease, TunnelManager, TunnelTarget};

pub use executor::{ExecError, PgExecutor, PgPool};

const APPLICATION_NAME: &str = "pgqmon";
const LOOPBACK: &str = "127.0.0.1";

/// Everything needed to reach one logical database.
#[derive(Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Identity used to share tunnels between databases of one instance.
    pub instance_id: i64,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
    pub ssh: Option<SshSettings>,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("instance_id", &self.instance_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .field("ssh", &self.ssh)
            .finish()
    }
}

pub enum DbConnection {
    Single(postgres::Client),
    Pooled(PgPool),
}

impl PgExecutor for DbConnection {
    fn query(&mut self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>, ExecError> {
        match self {
            DbConnection::Single(client) => PgExecutor::query(client, sql, params),
            DbConnection::Pooled(pool) => pool.query(sql, params),
        }
    }

    fn execute(&mut self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64, ExecError> {
        match self {
            DbConnection::Single(client) => PgExecutor::execute(client, sql, params),
            DbConnection::Pooled(pool) => pool.execute(sql, params),
        }
    }
}

/// A live connection plus the tunnel reference it depends on.
///
/// Dropping the handle (or calling [`cleanup`](Self::cleanup)) closes the
/// connection and then releases the tunnel lease. Fields drop in
/// declaration order, so `db` must stay above `lease`.
pub struct ConnectionHandle<D = DbConnection> {
    db: D,
    lease: Option<TunnelLease>,
    database: String,
}

impl<D> ConnectionHandle<D> {
    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn is_tunneled(&self) -> bool {
        self.lease.is_some()
    }

    pub fn cleanup(self) {
        debug!(
            database = %self.database,
            tunneled = self.is_tunneled(),
            "releasing database connection"
        );
    }
}

impl<D: PgExecutor> PgExecutor for ConnectionHandle<D> {
    fn query(&mut self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>, ExecError> {
        self.db.query(sql, params)
    }

    fn execute(&mut self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64, ExecError> {
        self.db.execute(sql, params)
    }
}

/// Creates [`ConnectionHandle`]s, acquiring tunnels from the shared manager.
pub struct ConnectionFactory {
    tunnels: TunnelManager,
    settings: MonitorSettings,
}

impl ConnectionFactory {
    pub fn new(tunnels: TunnelManager, settings: MonitorSettings) -> Self {
        Self { tunnels, settings }
    }

    pub fn tunnels(&self) -> &TunnelManager {
        &self.tunnels
    }

    /// Connects to `config.database`, through the instance's tunnel when it
    /// has SSH settings. On failure the tunnel lease taken for this call is
    /// released before the error is returned.
    pub fn create_connection(
        &self,
        config: &ConnectionConfig,
        use_pool: bool,
    ) -> Result<ConnectionHandle, MonitorError> {
        let (lease, host, port) = match &config.ssh {
            Some(ssh) => {
                let target = TunnelTarget {
                    host: config.host.clone(),
                    port: config.port,
                };
                let lease = self.tunnels.acquire(config.instance_id, ssh, &target)?;
                let port = lease.local_port();
                (Some(lease), LOOPBACK.to_string(), port)
            }
            None => (None, config.host.clone(), config.port),
        };

        let pg_config = self.pg_config(config, &host, port);
        let db = if use_pool {
            let manager = PostgresConnectionManager::new(pg_config, NoTls);
            Pool::builder()
                .max_size(self.settings.pool_max_size.max(1))
                .min_idle(Some(1))
                .connection_timeout(self.settings.connect_timeout)
                .build(manager)
                .map(DbConnection::Pooled)
                .map_err(|e| {
                    MonitorError::Connectivity(format!(
                        "{}: pool setup failed: {e}",
                        config.database
                    ))
                })?
        } else {
            pg_config
                .connect(NoTls)
                .map(DbConnection::Single)
                .map_err(|e| {
                    MonitorError::Connectivity(format!(
                        "{}: {}",
                        config.database,
                        format_postgres_error(&e)
                    ))
                })?
        };

        debug!(
            database = %config.database,
            host = %host,
            port,
            pooled = use_pool,
            tunneled = lease.is_some(),
            "database connection established"
        );
        Ok(ConnectionHandle {
            db,
            lease,
            database: config.database.clone(),
        })
    }

    fn pg_config(&self, config: &ConnectionConfig, host: &str, port: u16) -> postgres::Config {
        let mut pg = postgres::Config::new();
        pg.host(host)
            .port(port)
            .user(&config.user)
            .dbname(&config.database)
            .application_name(APPLICATION_NAME)
            .connect_timeout(self.settings.connect_timeout)
            .options(&format!(
                "-c statement_timeout={}",
                self.settings.statement_timeout.as_millis()
            ));
        if let Some(password) = &config.password {
            pg.password(password);
        }
        pg
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::tunnel::Tunnel;
    use crate::tunnel::testing::{FakeOpener, FakeTunnel, ssh_settings, target, timeouts};

    /// Executor over a pool nobody listens for, recording whether the tunnel
    /// was still open when it was dropped.
    struct Unreachable {
        pool: PgPool,
        tunnel: Arc<FakeTunnel>,
        tunnel_open_at_drop: Arc<AtomicBool>,
    }

    impl PgExecutor for Unreachable {
        fn query(&mut self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>, ExecError> {
            self.pool.query(sql, params)
        }

        fn execute(&mut self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64, ExecError> {
            self.pool.execute(sql, params)
        }
    }

    impl Drop for Unreachable {
        fn drop(&mut self) {
            self.tunnel_open_at_drop
                .store(!self.tunnel.is_closed(), Ordering::SeqCst);
        }
    }

    fn settings() -> MonitorSettings {
        MonitorSettings {
            connect_timeout: Duration::from_secs(1),
            ..MonitorSettings::default()
        }
    }

    fn unused_port() -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        listener.local_addr().unwrap().port()
    }

    fn config(ssh: Option<SshSettings>) -> ConnectionConfig {
        ConnectionConfig {
            instance_id: 1,
            host: "127.0.0.1".into(),
            port: unused_port(),
            user: "monitor".into(),
            password: Some("hunter2".into()),
            database: "app".into(),
            ssh,
        }
    }

    #[test]
    fn failed_connect_releases_tunnel() {
        let opener = Arc::new(FakeOpener::default());
        let factory = ConnectionFactory::new(TunnelManager::new(opener.clone(), timeouts()), settings());

        let err = factory
            .create_connection(&config(Some(ssh_settings())), false)
            .err()
            .unwrap();

        assert!(matches!(err, MonitorError::Connectivity(ref m) if m.starts_with("app")));
        assert_eq!(opener.open_count(), 1);
        assert_eq!(factory.tunnels().ref_count(1), 0);
        assert!(opener.last().is_closed());
    }

    #[test]
    fn failed_pool_setup_releases_tunnel() {
        let opener = Arc::new(FakeOpener::default());
        let factory = ConnectionFactory::new(TunnelManager::new(opener.clone(), timeouts()), settings());

        let err = factory
            .create_connection(&config(Some(ssh_settings())), true)
            .err()
            .unwrap();

        assert!(matches!(err, MonitorError::Connectivity(_)));
        assert_eq!(factory.tunnels().open_tunnels(), 0);
        assert!(opener.last().is_closed());
    }

    #[test]
    fn tunnel_failure_is_connectivity() {
        let opener = Arc::new(FakeOpener::default());
        opener
            .fail_auth
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let factory = ConnectionFactory::new(TunnelManager::new(opener.clone(), timeouts()), settings());

        let err = factory
            .create_connection(&config(Some(ssh_settings())), false)
            .err()
            .unwrap();
        assert!(matches!(err, MonitorError::Connectivity(ref m) if m.contains("authentication")));
        assert_eq!(opener.open_count(), 0);
    }

    #[test]
    fn direct_connect_opens_no_tunnel() {
        let opener = Arc::new(FakeOpener::default());
        let factory = ConnectionFactory::new(TunnelManager::new(opener.clone(), timeouts()), settings());

        assert!(factory.create_connection(&config(None), false).is_err());
        assert_eq!(opener.open_count(), 0);
    }

    #[test]
    fn failed_query_then_cleanup_releases_tunnel_after_connection() {
        let opener = Arc::new(FakeOpener::default());
        let tunnels = TunnelManager::new(opener.clone(), timeouts());
        let lease = tunnels.acquire(1, &ssh_settings(), &target()).unwrap();

        let mut pg = postgres::Config::new();
        pg.host(LOOPBACK).port(lease.local_port()).user("monitor");
        let pool = Pool::builder()
            .max_size(1)
            .min_idle(Some(0))
            .connection_timeout(Duration::from_millis(200))
            .build_unchecked(PostgresConnectionManager::new(pg, NoTls));
        let tunnel_open_at_drop = Arc::new(AtomicBool::new(false));
        let mut handle = ConnectionHandle {
            db: Unreachable {
                pool,
                tunnel: opener.last(),
                tunnel_open_at_drop: tunnel_open_at_drop.clone(),
            },
            lease: Some(lease),
            database: "app".into(),
        };

        assert!(matches!(
            handle.query("SELECT 1", &[]),
            Err(ExecError::Pool(_))
        ));
        assert_eq!(tunnels.ref_count(1), 1);

        handle.cleanup();
        assert!(tunnel_open_at_drop.load(Ordering::SeqCst));
        assert_eq!(tunnels.ref_count(1), 0);
        assert!(opener.last().is_closed());
    }

    #[test]
    fn config_debug_hides_password() {
        let dbg = format!("{:?}", config(Some(ssh_settings())));
        assert!(!dbg.contains("hunter2"));
        assert!(!dbg.contains("secret"));
        assert!(dbg.contains("monitor"));
    }
}
