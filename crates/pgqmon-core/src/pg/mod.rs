//! Reads from and actions on a monitored PostgreSQL database.
//!
//! - `pg_stat_statements`: cumulative per-statement statistics (requires extension)
//! - `pg_stat_activity`: currently running queries
//! - `pg_terminate_backend()`: kill by pid

mod queries;

use postgres::Row;
use postgres::error::SqlState;
use tracing::{debug, warn};

use crate::connection::{ConnectionHandle, ExecError, PgExecutor};
use crate::error::{KillError, MonitorError};
use crate::model::{QuerySample, StatementStats};

pub use queries::STATEMENTS_LIMIT;

/// Capabilities the session and kill loops need from a monitored database.
pub trait MonitoredDb: Send {
    /// Installed pg_stat_statements version, `None` when absent.
    fn statements_extension(&mut self) -> Result<Option<String>, MonitorError>;

    fn fetch_statement_stats(&mut self) -> Result<Vec<StatementStats>, MonitorError>;

    fn running_queries(&mut self) -> Result<Vec<QuerySample>, MonitorError>;

    fn terminate_backend(&mut self, pid: i32) -> Result<(), KillError>;
}

/// [`MonitoredDb`] over any [`PgExecutor`], normally a [`ConnectionHandle`].
pub struct PgDatabase<E: PgExecutor = ConnectionHandle> {
    conn: E,
    database: String,
    server_version_num: Option<i32>,
}

impl<E: PgExecutor> PgDatabase<E> {
    /// Wraps a connection, reading the server version once.
    pub fn new(mut conn: E, database: impl Into<String>) -> Self {
        let database = database.into();
        let server_version_num = conn
            .query(queries::SERVER_VERSION_QUERY, &[])
            .ok()
            .and_then(|rows| rows.into_iter().next())
            .and_then(|row| row.try_get::<_, String>(0).ok())
            .and_then(|v| v.parse::<i32>().ok());
        debug!(database = %database, ?server_version_num, "monitored database opened");
        Self {
            conn,
            database,
            server_version_num,
        }
    }

    pub fn server_version_num(&self) -> Option<i32> {
        self.server_version_num
    }

    fn connectivity(&self, e: ExecError) -> MonitorError {
        MonitorError::Connectivity(format!("{}: {e}", self.database))
    }
}

impl<E: PgExecutor + Send> MonitoredDb for PgDatabase<E> {
    fn statements_extension(&mut self) -> Result<Option<String>, MonitorError> {
        let rows = self
            .conn
            .query(queries::STATEMENTS_EXTENSION_QUERY, &[])
            .map_err(|e| self.connectivity(e))?;
        Ok(rows.first().and_then(|row| row.try_get::<_, String>(0).ok()))
    }

    fn fetch_statement_stats(&mut self) -> Result<Vec<StatementStats>, MonitorError> {
        let query = queries::build_stat_statements_query(self.server_version_num);
        let rows = match self.conn.query(&query, &[]) {
            Ok(rows) => rows,
            Err(e) if e.sql_state() == Some(&SqlState::UNDEFINED_TABLE) => {
                return Err(MonitorError::ExtensionMissing {
                    database: self.database.clone(),
                });
            }
            Err(e) => return Err(self.connectivity(e)),
        };

        let mut stats = Vec::with_capacity(rows.len());
        for row in &rows {
            match decode_statement_row(row) {
                Ok(s) => stats.push(s),
                Err(e) => warn!(database = %self.database, error = %e, "skipping undecodable pg_stat_statements row"),
            }
        }
        Ok(stats)
    }

    fn running_queries(&mut self) -> Result<Vec<QuerySample>, MonitorError> {
        let rows = self
            .conn
            .query(queries::build_running_queries_query(), &[])
            .map_err(|e| self.connectivity(e))?;

        let mut samples = Vec::with_capacity(rows.len());
        for row in &rows {
            match decode_activity_row(row) {
                Ok(s) => samples.push(s),
                Err(e) => warn!(database = %self.database, error = %e, "skipping undecodable pg_stat_activity row"),
            }
        }
        Ok(samples)
    }

    fn terminate_backend(&mut self, pid: i32) -> Result<(), KillError> {
        let rows = self
            .conn
            .query(queries::TERMINATE_BACKEND_QUERY, &[&pid])
            .map_err(|e| kill_error(pid, e))?;
        let terminated = rows
            .first()
            .and_then(|row| row.try_get::<_, bool>(0).ok())
            .unwrap_or(false);
        if terminated {
            Ok(())
        } else {
            Err(KillError::ProcessGone(pid))
        }
    }
}

fn decode_statement_row(row: &Row) -> Result<StatementStats, postgres::Error> {
    Ok(StatementStats {
        query_text: row.try_get(0)?,
        calls: row.try_get(1)?,
        total_time: row.try_get(2)?,
        min_time: row.try_get(3)?,
        max_time: row.try_get(4)?,
        mean_time: row.try_get(5)?,
    })
}

fn decode_activity_row(row: &Row) -> Result<QuerySample, postgres::Error> {
    Ok(QuerySample {
        pid: row.try_get(0)?,
        username: row.try_get(1)?,
        application_name: row.try_get(2)?,
        client_addr: row.try_get(3)?,
        query_text: row.try_get(4)?,
        query_start: row.try_get(5)?,
        duration_ms: row.try_get(6)?,
    })
}

fn kill_error(pid: i32, e: ExecError) -> KillError {
    if e.sql_state() == Some(&SqlState::INSUFFICIENT_PRIVILEGE) {
        KillError::Denied {
            pid,
            message: e.to_string(),
        }
    } else {
        KillError::Connectivity(e.to_string())
    }
}

/// Formats a PostgreSQL error into a concise, human-readable message.
pub(crate) fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        format!("{}: {}", db_error.severity(), db_error.message())
    } else {
        let msg = e.to_string();
        if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else if msg.contains("password authentication failed") {
            "password authentication failed".to_string()
        } else if msg.contains("timed out") {
            "connection timed out".to_string()
        } else {
            msg
        }
    }
}
