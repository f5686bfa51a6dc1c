//! Minimal statement-execution capability shared by single clients and pools.

use postgres::error::SqlState;
use postgres::types::ToSql;
use postgres::{Client, NoTls, Row};
use r2d2::Pool;
use r2d2_postgres::PostgresConnectionManager;
use thiserror::Error;

use crate::pg::format_postgres_error;

pub type PgPool = Pool<PostgresConnectionManager<NoTls>>;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{}", format_postgres_error(.0))]
    Postgres(#[from] postgres::Error),
    #[error("connection pool: {0}")]
    Pool(#[from] r2d2::Error),
}

impl ExecError {
    /// SQLSTATE reported by the server, if the failure came from it.
    pub fn sql_state(&self) -> Option<&SqlState> {
        match self {
            ExecError::Postgres(e) => e.code(),
            ExecError::Pool(_) => None,
        }
    }
}

/// The two operations the monitoring core needs from a database handle.
pub trait PgExecutor {
    fn query(&mut self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>, ExecError>;

    fn execute(&mut self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64, ExecError>;
}

impl PgExecutor for Client {
    fn query(&mut self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>, ExecError> {
        Ok(Client::query(self, sql, params)?)
    }

    fn execute(&mut self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64, ExecError> {
        Ok(Client::execute(self, sql, params)?)
    }
}

impl PgExecutor for PgPool {
    fn query(&mut self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>, ExecError> {
        let mut conn = self.get()?;
        Ok(conn.query(sql, params)?)
    }

    fn execute(&mut self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64, ExecError> {
        let mut conn = self.get()?;
        Ok(conn.execute(sql, params)?)
    }
}
