use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::{QueryStore, StoreError, discovered_from, sort_newest_first};
use crate::model::{
    CollectedQueryInstance, DiscoveredQuery, MonitoringSession, NormalizedQuery, QueryFilter,
    QuerySample, SessionStatus, StatementStats,
};

#[derive(Default)]
struct Tables {
    next_id: i64,
    queries: BTreeMap<i64, NormalizedQuery>,
    /// `(database_id, normalized_hash)` → query id
    query_keys: HashMap<(i64, String), i64>,
    instances: BTreeMap<i64, CollectedQueryInstance>,
    /// `(database_id, query_hash)` → instance id
    instance_keys: HashMap<(i64, String), i64>,
    sessions: BTreeMap<i64, MonitoringSession>,
    samples: HashMap<i64, Vec<QuerySample>>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-process [`QueryStore`]. Contents are lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl QueryStore for MemoryStore {
    fn upsert_normalized_query(
        &self,
        database_id: i64,
        normalized_hash: &str,
        normalized_text: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let mut t = self.tables();
        let key = (database_id, normalized_hash.to_string());
        if let Some(&id) = t.query_keys.get(&key) {
            if let Some(q) = t.queries.get_mut(&id) {
                q.last_seen_at = now;
            }
            return Ok(id);
        }

        let id = t.next_id();
        t.queries.insert(
            id,
            NormalizedQuery {
                id,
                database_id,
                normalized_hash: normalized_hash.to_string(),
                normalized_text: normalized_text.to_string(),
                is_known: false,
                group_id: None,
                first_seen_at: now,
                last_seen_at: now,
            },
        );
        t.query_keys.insert(key, id);
        Ok(id)
    }

    fn upsert_query_instance(
        &self,
        database_id: i64,
        normalized_query_id: i64,
        query_hash: &str,
        stats: &StatementStats,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let mut t = self.tables();
        if !t.queries.contains_key(&normalized_query_id) {
            return Err(StoreError::Missing {
                entity: "normalized query",
                id: normalized_query_id,
            });
        }

        let key = (database_id, query_hash.to_string());
        if let Some(&id) = t.instance_keys.get(&key)
            && let Some(inst) = t.instances.get_mut(&id)
        {
            inst.calls = stats.calls;
            inst.total_time = stats.total_time;
            inst.min_time = stats.min_time;
            inst.max_time = stats.max_time;
            inst.mean_time = stats.mean_time;
            inst.last_updated_at = now;
            return Ok(id);
        }

        let id = t.next_id();
        t.instances.insert(
            id,
            CollectedQueryInstance {
                id,
                database_id,
                normalized_query_id,
                query_text: stats.query_text.clone(),
                query_hash: query_hash.to_string(),
                calls: stats.calls,
                total_time: stats.total_time,
                min_time: stats.min_time,
                max_time: stats.max_time,
                mean_time: stats.mean_time,
                last_updated_at: now,
            },
        );
        t.instance_keys.insert(key, id);
        Ok(id)
    }

    fn discovered_queries(
        &self,
        database_id: i64,
        filter: &QueryFilter,
        limit: usize,
    ) -> Result<Vec<DiscoveredQuery>, StoreError> {
        let t = self.tables();
        let mut by_query: HashMap<i64, Vec<&CollectedQueryInstance>> = HashMap::new();
        for inst in t.instances.values().filter(|i| i.database_id == database_id) {
            by_query.entry(inst.normalized_query_id).or_default().push(inst);
        }

        let mut rows: Vec<DiscoveredQuery> = t
            .queries
            .values()
            .filter(|q| q.database_id == database_id && filter.matches(q))
            .map(|q| {
                let instances = by_query.get(&q.id).map(Vec::as_slice).unwrap_or(&[]);
                discovered_from(q, instances.iter().copied())
            })
            .collect();
        sort_newest_first(&mut rows);
        rows.truncate(limit);
        Ok(rows)
    }

    fn normalized_query(&self, id: i64) -> Result<Option<NormalizedQuery>, StoreError> {
        Ok(self.tables().queries.get(&id).cloned())
    }

    fn query_instances(
        &self,
        normalized_query_id: i64,
    ) -> Result<Vec<CollectedQueryInstance>, StoreError> {
        let mut rows: Vec<CollectedQueryInstance> = self
            .tables()
            .instances
            .values()
            .filter(|i| i.normalized_query_id == normalized_query_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (b.last_updated_at, b.id).cmp(&(a.last_updated_at, a.id)));
        Ok(rows)
    }

    fn set_query_known(&self, id: i64, is_known: bool) -> Result<bool, StoreError> {
        Ok(match self.tables().queries.get_mut(&id) {
            Some(q) => {
                q.is_known = is_known;
                true
            }
            None => false,
        })
    }

    fn set_query_group(&self, id: i64, group_id: Option<i64>) -> Result<bool, StoreError> {
        Ok(match self.tables().queries.get_mut(&id) {
            Some(q) => {
                q.group_id = group_id;
                true
            }
            None => false,
        })
    }

    fn create_session(
        &self,
        database_id: i64,
        polling_interval_seconds: u64,
        scheduled_end_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<MonitoringSession, StoreError> {
        let mut t = self.tables();
        let id = t.next_id();
        let session = MonitoringSession {
            id,
            database_id,
            status: SessionStatus::Running,
            polling_interval_seconds,
            scheduled_end_time,
            started_at: now,
            stopped_at: None,
        };
        t.sessions.insert(id, session.clone());
        Ok(session)
    }

    fn session(&self, id: i64) -> Result<Option<MonitoringSession>, StoreError> {
        Ok(self.tables().sessions.get(&id).cloned())
    }

    fn running_sessions(&self) -> Result<Vec<MonitoringSession>, StoreError> {
        Ok(self
            .tables()
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Running)
            .cloned()
            .collect())
    }

    fn finish_session(
        &self,
        id: i64,
        status: SessionStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut t = self.tables();
        match t.sessions.get_mut(&id) {
            Some(s) if s.status == SessionStatus::Running => {
                s.status = status;
                s.stopped_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn replace_query_samples(
        &self,
        database_id: i64,
        samples: &[QuerySample],
        _captured_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.tables().samples.insert(database_id, samples.to_vec());
        Ok(())
    }

    fn query_samples(&self, database_id: i64) -> Result<Vec<QuerySample>, StoreError> {
        Ok(self
            .tables()
            .samples
            .get(&database_id)
            .cloned()
            .unwrap_or_default())
    }
}
