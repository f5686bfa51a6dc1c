use chrono::{DateTime, Utc};
use postgres::{NoTls, Row};
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use tracing::info;

use super::{QueryStore, StoreError};
use crate::connection::PgPool;
use crate::model::{
    CollectedQueryInstance, DiscoveredQuery, MonitoringSession, NormalizedQuery, QueryFilter,
    QuerySample, SessionStatus, StatementStats, mean_time,
};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS pgqmon_normalized_queries (
        id BIGSERIAL PRIMARY KEY,
        database_id BIGINT NOT NULL,
        normalized_hash TEXT NOT NULL,
        normalized_text TEXT NOT NULL,
        is_known BOOLEAN NOT NULL DEFAULT false,
        group_id BIGINT,
        first_seen_at TIMESTAMPTZ NOT NULL,
        last_seen_at TIMESTAMPTZ NOT NULL,
        UNIQUE (database_id, normalized_hash)
    );
    CREATE TABLE IF NOT EXISTS pgqmon_query_instances (
        id BIGSERIAL PRIMARY KEY,
        database_id BIGINT NOT NULL,
        normalized_query_id BIGINT NOT NULL REFERENCES pgqmon_normalized_queries (id),
        query_text TEXT NOT NULL,
        query_hash TEXT NOT NULL,
        calls BIGINT NOT NULL,
        total_time DOUBLE PRECISION NOT NULL,
        min_time DOUBLE PRECISION NOT NULL,
        max_time DOUBLE PRECISION NOT NULL,
        mean_time DOUBLE PRECISION NOT NULL,
        last_updated_at TIMESTAMPTZ NOT NULL,
        UNIQUE (database_id, query_hash)
    );
    CREATE INDEX IF NOT EXISTS pgqmon_query_instances_nq_idx
        ON pgqmon_query_instances (normalized_query_id);
    CREATE TABLE IF NOT EXISTS pgqmon_sessions (
        id BIGSERIAL PRIMARY KEY,
        database_id BIGINT NOT NULL,
        status TEXT NOT NULL,
        polling_interval_seconds BIGINT NOT NULL,
        scheduled_end_time TIMESTAMPTZ,
        started_at TIMESTAMPTZ NOT NULL,
        stopped_at TIMESTAMPTZ
    );
    CREATE INDEX IF NOT EXISTS pgqmon_sessions_status_idx ON pgqmon_sessions (status);
    CREATE TABLE IF NOT EXISTS pgqmon_query_samples (
        database_id BIGINT NOT NULL,
        pid INTEGER NOT NULL,
        username TEXT NOT NULL,
        application_name TEXT NOT NULL,
        client_addr TEXT NOT NULL,
        query_text TEXT NOT NULL,
        query_start TIMESTAMPTZ,
        duration_ms DOUBLE PRECISION NOT NULL,
        captured_at TIMESTAMPTZ NOT NULL
    );
    CREATE INDEX IF NOT EXISTS pgqmon_query_samples_db_idx ON pgqmon_query_samples (database_id);
"#;

const SESSION_COLUMNS: &str = "id, database_id, status, polling_interval_seconds, \
     scheduled_end_time, started_at, stopped_at";

const QUERY_COLUMNS: &str = "id, database_id, normalized_hash, normalized_text, is_known, \
     group_id, first_seen_at, last_seen_at";

/// Connections kept open to the store database.
pub const STORE_POOL_SIZE: u32 = 8;

/// [`QueryStore`] backed by tables in a PostgreSQL database.
///
/// Calls draw a connection from an r2d2 pool, so pollers of different
/// databases write concurrently. Uses the synchronous client; call it from
/// blocking context only, and drop it there too.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connects and creates the schema if missing.
    pub fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with(url, STORE_POOL_SIZE)
    }

    pub fn connect_with(url: &str, pool_size: u32) -> Result<Self, StoreError> {
        let config: postgres::Config = url.parse()?;
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .build(PostgresConnectionManager::new(config, NoTls))?;
        pool.get()?.batch_execute(SCHEMA)?;
        info!(pool_size = pool.max_size(), "store schema ready");
        Ok(Self { pool })
    }

    fn client(&self) -> Result<PooledConnection<PostgresConnectionManager<NoTls>>, StoreError> {
        Ok(self.pool.get()?)
    }
}

impl QueryStore for PgStore {
    fn upsert_normalized_query(
        &self,
        database_id: i64,
        normalized_hash: &str,
        normalized_text: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let row = self.client()?.query_one(
            "INSERT INTO pgqmon_normalized_queries
                 (database_id, normalized_hash, normalized_text, first_seen_at, last_seen_at)
             VALUES ($1, $2, $3, $4, $4)
             ON CONFLICT (database_id, normalized_hash)
             DO UPDATE SET last_seen_at = EXCLUDED.last_seen_at
             RETURNING id",
            &[&database_id, &normalized_hash, &normalized_text, &now],
        )?;
        Ok(row.try_get(0)?)
    }

    fn upsert_query_instance(
        &self,
        database_id: i64,
        normalized_query_id: i64,
        query_hash: &str,
        stats: &StatementStats,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let row = self.client()?.query_one(
            "INSERT INTO pgqmon_query_instances
                 (database_id, normalized_query_id, query_text, query_hash, calls,
                  total_time, min_time, max_time, mean_time, last_updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (database_id, query_hash) DO UPDATE SET
                 calls = EXCLUDED.calls,
                 total_time = EXCLUDED.total_time,
                 min_time = EXCLUDED.min_time,
                 max_time = EXCLUDED.max_time,
                 mean_time = EXCLUDED.mean_time,
                 last_updated_at = EXCLUDED.last_updated_at
             RETURNING id",
            &[
                &database_id,
                &normalized_query_id,
                &stats.query_text,
                &query_hash,
                &stats.calls,
                &stats.total_time,
                &stats.min_time,
                &stats.max_time,
                &stats.mean_time,
                &now,
            ],
        )?;
        Ok(row.try_get(0)?)
    }

    fn discovered_queries(
        &self,
        database_id: i64,
        filter: &QueryFilter,
        limit: usize,
    ) -> Result<Vec<DiscoveredQuery>, StoreError> {
        let search = filter.search_term();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self.client()?.query(
            "SELECT q.id, q.normalized_text, q.is_known, q.group_id,
                    q.first_seen_at, q.last_seen_at,
                    COUNT(i.id)::bigint,
                    COALESCE(SUM(i.calls), 0)::bigint,
                    COALESCE(SUM(i.total_time), 0)::double precision,
                    COALESCE(MIN(i.min_time), 0)::double precision,
                    COALESCE(MAX(i.max_time), 0)::double precision,
                    MAX(i.last_updated_at),
                    (SELECT s.query_text FROM pgqmon_query_instances s
                      WHERE s.normalized_query_id = q.id
                      ORDER BY s.last_updated_at DESC, s.id DESC LIMIT 1)
             FROM pgqmon_normalized_queries q
             LEFT JOIN pgqmon_query_instances i ON i.normalized_query_id = q.id
             WHERE q.database_id = $1
               AND ($2 OR NOT q.is_known)
               AND ($3::bigint IS NULL OR q.group_id = $3)
               AND ($4::timestamptz IS NULL OR q.last_seen_at >= $4)
               AND ($5::timestamptz IS NULL OR q.last_seen_at <= $5)
               AND ($6::text IS NULL OR strpos(lower(q.normalized_text), $6) > 0)
             GROUP BY q.id
             ORDER BY COALESCE(MAX(i.last_updated_at), q.last_seen_at) DESC, q.id DESC
             LIMIT $7",
            &[
                &database_id,
                &filter.show_known,
                &filter.group_id,
                &filter.date_range_start,
                &filter.date_range_end,
                &search,
                &limit,
            ],
        )?;
        rows.iter().map(decode_discovered).collect()
    }

    fn normalized_query(&self, id: i64) -> Result<Option<NormalizedQuery>, StoreError> {
        let sql = format!("SELECT {QUERY_COLUMNS} FROM pgqmon_normalized_queries WHERE id = $1");
        let row = self.client()?.query_opt(&sql, &[&id])?;
        row.as_ref().map(decode_normalized).transpose()
    }

    fn query_instances(
        &self,
        normalized_query_id: i64,
    ) -> Result<Vec<CollectedQueryInstance>, StoreError> {
        let rows = self.client()?.query(
            "SELECT id, database_id, normalized_query_id, query_text, query_hash, calls,
                    total_time, min_time, max_time, mean_time, last_updated_at
             FROM pgqmon_query_instances
             WHERE normalized_query_id = $1
             ORDER BY last_updated_at DESC, id DESC",
            &[&normalized_query_id],
        )?;
        rows.iter().map(decode_instance).collect()
    }

    fn set_query_known(&self, id: i64, is_known: bool) -> Result<bool, StoreError> {
        let n = self.client()?.execute(
            "UPDATE pgqmon_normalized_queries SET is_known = $2 WHERE id = $1",
            &[&id, &is_known],
        )?;
        Ok(n > 0)
    }

    fn set_query_group(&self, id: i64, group_id: Option<i64>) -> Result<bool, StoreError> {
        let n = self.client()?.execute(
            "UPDATE pgqmon_normalized_queries SET group_id = $2 WHERE id = $1",
            &[&id, &group_id],
        )?;
        Ok(n > 0)
    }

    fn create_session(
        &self,
        database_id: i64,
        polling_interval_seconds: u64,
        scheduled_end_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<MonitoringSession, StoreError> {
        let interval = i64::try_from(polling_interval_seconds)
            .map_err(|_| StoreError::Backend("polling interval out of range".to_string()))?;
        let sql = format!(
            "INSERT INTO pgqmon_sessions
                 (database_id, status, polling_interval_seconds, scheduled_end_time, started_at)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {SESSION_COLUMNS}"
        );
        let row = self.client()?.query_one(
            &sql,
            &[
                &database_id,
                &SessionStatus::Running.as_str(),
                &interval,
                &scheduled_end_time,
                &now,
            ],
        )?;
        decode_session(&row)
    }

    fn session(&self, id: i64) -> Result<Option<MonitoringSession>, StoreError> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM pgqmon_sessions WHERE id = $1");
        let row = self.client()?.query_opt(&sql, &[&id])?;
        row.as_ref().map(decode_session).transpose()
    }

    fn running_sessions(&self) -> Result<Vec<MonitoringSession>, StoreError> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM pgqmon_sessions WHERE status = $1 ORDER BY id"
        );
        let rows = self
            .client()?
            .query(&sql, &[&SessionStatus::Running.as_str()])?;
        rows.iter().map(decode_session).collect()
    }

    fn finish_session(
        &self,
        id: i64,
        status: SessionStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let n = self.client()?.execute(
            "UPDATE pgqmon_sessions SET status = $2, stopped_at = $3
             WHERE id = $1 AND status = $4",
            &[&id, &status.as_str(), &at, &SessionStatus::Running.as_str()],
        )?;
        Ok(n > 0)
    }

    fn replace_query_samples(
        &self,
        database_id: i64,
        samples: &[QuerySample],
        captured_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut client = self.client()?;
        let mut tx = client.transaction()?;
        tx.execute(
            "DELETE FROM pgqmon_query_samples WHERE database_id = $1",
            &[&database_id],
        )?;
        let insert = tx.prepare(
            "INSERT INTO pgqmon_query_samples
                 (database_id, pid, username, application_name, client_addr,
                  query_text, query_start, duration_ms, captured_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )?;
        for s in samples {
            tx.execute(
                &insert,
                &[
                    &database_id,
                    &s.pid,
                    &s.username,
                    &s.application_name,
                    &s.client_addr,
                    &s.query_text,
                    &s.query_start,
                    &s.duration_ms,
                    &captured_at,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn query_samples(&self, database_id: i64) -> Result<Vec<QuerySample>, StoreError> {
        let rows = self.client()?.query(
            "SELECT pid, username, application_name, client_addr, query_text,
                    query_start, duration_ms
             FROM pgqmon_query_samples
             WHERE database_id = $1
             ORDER BY duration_ms DESC",
            &[&database_id],
        )?;
        rows.iter().map(decode_sample).collect()
    }
}

fn decode_normalized(row: &Row) -> Result<NormalizedQuery, StoreError> {
    Ok(NormalizedQuery {
        id: row.try_get(0)?,
        database_id: row.try_get(1)?,
        normalized_hash: row.try_get(2)?,
        normalized_text: row.try_get(3)?,
        is_known: row.try_get(4)?,
        group_id: row.try_get(5)?,
        first_seen_at: row.try_get(6)?,
        last_seen_at: row.try_get(7)?,
    })
}

fn decode_instance(row: &Row) -> Result<CollectedQueryInstance, StoreError> {
    Ok(CollectedQueryInstance {
        id: row.try_get(0)?,
        database_id: row.try_get(1)?,
        normalized_query_id: row.try_get(2)?,
        query_text: row.try_get(3)?,
        query_hash: row.try_get(4)?,
        calls: row.try_get(5)?,
        total_time: row.try_get(6)?,
        min_time: row.try_get(7)?,
        max_time: row.try_get(8)?,
        mean_time: row.try_get(9)?,
        last_updated_at: row.try_get(10)?,
    })
}

fn decode_discovered(row: &Row) -> Result<DiscoveredQuery, StoreError> {
    let call_count: i64 = row.try_get(7)?;
    let total_time: f64 = row.try_get(8)?;
    Ok(DiscoveredQuery {
        id: row.try_get(0)?,
        normalized_text: row.try_get(1)?,
        is_known: row.try_get(2)?,
        group_id: row.try_get(3)?,
        first_seen_at: row.try_get(4)?,
        last_seen_at: row.try_get(5)?,
        instance_count: row.try_get(6)?,
        call_count,
        total_time,
        min_time: row.try_get(9)?,
        max_time: row.try_get(10)?,
        mean_time: mean_time(total_time, call_count),
        last_updated_at: row.try_get(11)?,
        sample_query_text: row.try_get(12)?,
    })
}

fn decode_sample(row: &Row) -> Result<QuerySample, StoreError> {
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

fn decode_session(row: &Row) -> Result<MonitoringSession, StoreError> {
    let status: String = row.try_get(2)?;
    let status = SessionStatus::parse(&status)
        .ok_or_else(|| StoreError::Backend(format!("unknown session status {status:?}")))?;
    let interval: i64 = row.try_get(3)?;
    Ok(MonitoringSession {
        id: row.try_get(0)?,
        database_id: row.try_get(1)?,
        status,
        polling_interval_seconds: u64::try_from(interval).unwrap_or(0),
        scheduled_end_time: row.try_get(4)?,
        started_at: row.try_get(5)?,
        stopped_at: row.try_get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn schema_declares_upsert_keys() {
        for table in [
            "pgqmon_normalized_queries",
            "pgqmon_query_instances",
            "pgqmon_sessions",
            "pgqmon_query_samples",
        ] {
            assert!(SCHEMA.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")));
        }
        assert!(SCHEMA.contains("UNIQUE (database_id, normalized_hash)"));
        assert!(SCHEMA.contains("UNIQUE (database_id, query_hash)"));
    }

    #[test]
    fn bad_url_is_backend_error() {
        assert!(matches!(
            PgStore::connect("host=localhost port=notaport").err(),
            Some(StoreError::Backend(_))
        ));
    }

    /// Runs against a real database when `PGQMON_TEST_STORE_URL` is set.
    #[test]
    fn concurrent_writers_share_the_pool() {
        let Ok(url) = std::env::var("PGQMON_TEST_STORE_URL") else {
            return;
        };
        let store = PgStore::connect_with(&url, 4).unwrap();
        let now = Utc::now();
        let base = now.timestamp_micros();

        std::thread::scope(|scope| {
            for n in 0..4 {
                let store = &store;
                scope.spawn(move || {
                    let database_id = base + n;
                    let id = store
                        .upsert_normalized_query(database_id, "h", "select ?", now)
                        .unwrap();
                    let again = store
                        .upsert_normalized_query(
                            database_id,
                            "h",
                            "select ?",
                            now + Duration::seconds(1),
                        )
                        .unwrap();
                    assert_eq!(id, again);
                });
            }
        });
    }
}
