//! Persistence of signatures, instances, sessions and running-query samples.
//!
//! Two backends implement [`QueryStore`]:
//! - [`MemoryStore`]: process-local tables, used when no store URL is configured and in tests
//! - [`PgStore`]: PostgreSQL tables created on startup, upserts via `ON CONFLICT`
//!
//! All writes are upserts keyed by content hash, so concurrent pollers on the
//! same `(database_id, hash)` converge to last-write-wins.

mod memory;
mod postgres;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{
    CollectedQueryInstance, DiscoveredQuery, InstanceAggregate, MonitoringSession,
    NormalizedQuery, QueryFilter, QuerySample, SessionStatus, StatementStats,
};

pub use self::memory::MemoryStore;
pub use self::postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend: {0}")]
    Backend(String),
    #[error("{entity} {id} not found")]
    Missing { entity: &'static str, id: i64 },
}

impl From<::postgres::Error> for StoreError {
    fn from(e: ::postgres::Error) -> Self {
        StoreError::Backend(crate::pg::format_postgres_error(&e))
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(e: r2d2::Error) -> Self {
        StoreError::Backend(format!("connection pool: {e}"))
    }
}

pub trait QueryStore: Send + Sync {
    /// Find-or-create by `(database_id, normalized_hash)`; refreshes
    /// `last_seen_at` on an existing row. Returns the row id.
    fn upsert_normalized_query(
        &self,
        database_id: i64,
        normalized_hash: &str,
        normalized_text: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    /// Find-or-create by `(database_id, query_hash)`. An existing row gets
    /// its statistics overwritten with `stats`, not summed.
    fn upsert_query_instance(
        &self,
        database_id: i64,
        normalized_query_id: i64,
        query_hash: &str,
        stats: &StatementStats,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    /// Signatures of a database with aggregated instance statistics, most
    /// recently updated first, at most `limit` rows.
    fn discovered_queries(
        &self,
        database_id: i64,
        filter: &QueryFilter,
        limit: usize,
    ) -> Result<Vec<DiscoveredQuery>, StoreError>;

    fn normalized_query(&self, id: i64) -> Result<Option<NormalizedQuery>, StoreError>;

    /// Instances of one signature, most recently updated first.
    fn query_instances(
        &self,
        normalized_query_id: i64,
    ) -> Result<Vec<CollectedQueryInstance>, StoreError>;

    /// Returns false when no such query exists.
    fn set_query_known(&self, id: i64, is_known: bool) -> Result<bool, StoreError>;

    fn set_query_group(&self, id: i64, group_id: Option<i64>) -> Result<bool, StoreError>;

    fn create_session(
        &self,
        database_id: i64,
        polling_interval_seconds: u64,
        scheduled_end_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<MonitoringSession, StoreError>;

    fn session(&self, id: i64) -> Result<Option<MonitoringSession>, StoreError>;

    /// Sessions persisted with status `running`, expired or not.
    fn running_sessions(&self) -> Result<Vec<MonitoringSession>, StoreError>;

    fn active_session(
        &self,
        database_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<MonitoringSession>, StoreError> {
        Ok(self
            .running_sessions()?
            .into_iter()
            .filter(|s| s.database_id == database_id && s.is_active(now))
            .max_by_key(|s| s.started_at))
    }

    /// Moves a `running` session to `status`. Returns false when the session
    /// does not exist or has already left `running`.
    fn finish_session(
        &self,
        id: i64,
        status: SessionStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Replaces the stored running-query snapshot of a database.
    fn replace_query_samples(
        &self,
        database_id: i64,
        samples: &[QuerySample],
        captured_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn query_samples(&self, database_id: i64) -> Result<Vec<QuerySample>, StoreError>;
}

/// Builds the read model of one signature from its instance rows.
pub(crate) fn discovered_from<'a>(
    query: &NormalizedQuery,
    instances: impl IntoIterator<Item = &'a CollectedQueryInstance> + Clone,
) -> DiscoveredQuery {
    let agg = InstanceAggregate::from_instances(instances.clone());
    let newest = instances.into_iter().max_by_key(|i| (i.last_updated_at, i.id));
    DiscoveredQuery {
        id: query.id,
        normalized_text: query.normalized_text.clone(),
        is_known: query.is_known,
        group_id: query.group_id,
        first_seen_at: query.first_seen_at,
        last_seen_at: query.last_seen_at,
        instance_count: agg.instance_count,
        call_count: agg.call_count,
        total_time: agg.total_time,
        min_time: agg.min_time,
        max_time: agg.max_time,
        mean_time: agg.mean_time,
        sample_query_text: newest.map(|i| i.query_text.clone()),
        last_updated_at: newest.map(|i| i.last_updated_at),
    }
}

/// Newest `last_updated_at` first; signatures without instances sort by
/// `last_seen_at`.
pub(crate) fn sort_newest_first(rows: &mut [DiscoveredQuery]) {
    rows.sort_by(|a, b| {
        let ka = (a.last_updated_at.unwrap_or(a.last_seen_at), a.id);
        let kb = (b.last_updated_at.unwrap_or(b.last_seen_at), b.id);
        kb.cmp(&ka)
    });
}
