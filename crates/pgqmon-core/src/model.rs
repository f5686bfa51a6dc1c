//! Entities persisted and exposed by the monitoring core.
//!
//! All timestamps are UTC and serialize as ISO-8601 strings; field names
//! serialize in camelCase for the dashboard.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::normalize::{signature, truncate_chars};

/// Canonical signature grouping all literal variants of one statement.
///
/// Unique per `(database_id, normalized_hash)`.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedQuery {
    pub id: i64,
    pub database_id: i64,
    /// Hash of `normalized_text`, see [`crate::normalize::query_hash`].
    pub normalized_hash: String,
    pub normalized_text: String,
    /// Set by an operator once the query has been reviewed.
    pub is_known: bool,
    pub group_id: Option<i64>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// One literal SQL text observed for a [`NormalizedQuery`], with the latest
/// cumulative statistics read for it.
///
/// Unique per `(database_id, query_hash)`.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CollectedQueryInstance {
    pub id: i64,
    pub database_id: i64,
    pub normalized_query_id: i64,
    pub query_text: String,
    /// Hash of the raw `query_text`, distinct from the normalized hash.
    pub query_hash: String,
    pub calls: i64,
    pub total_time: f64,
    pub min_time: f64,
    pub max_time: f64,
    pub mean_time: f64,
    pub last_updated_at: DateTime<Utc>,
}

/// One row read from pg_stat_statements during a poll.
///
/// Times are in milliseconds. Counters are cumulative since the last
/// statistics reset, not deltas.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StatementStats {
    pub query_text: String,
    pub calls: i64,
    pub total_time: f64,
    pub min_time: f64,
    pub max_time: f64,
    pub mean_time: f64,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Stopped,
    Completed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(SessionStatus::Running),
            "stopped" => Some(SessionStatus::Stopped),
            "completed" => Some(SessionStatus::Completed),
            _ => None,
        }
    }
}

/// A background polling task for one monitored database.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringSession {
    pub id: i64,
    pub database_id: i64,
    pub status: SessionStatus,
    pub polling_interval_seconds: u64,
    pub scheduled_end_time: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl MonitoringSession {
    /// Running and not past its scheduled end.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Running && !self.is_expired(now)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_end_time.is_some_and(|end| now >= end)
    }
}

/// Point-in-time observation of a running backend, from pg_stat_activity.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct QuerySample {
    pub pid: i32,
    pub username: String,
    pub application_name: String,
    pub client_addr: String,
    pub query_text: String,
    pub query_start: Option<DateTime<Utc>>,
    /// Milliseconds since `query_start`, computed by the server.
    pub duration_ms: f64,
}

/// A [`NormalizedQuery`] with statistics aggregated over its instances at read time.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredQuery {
    pub id: i64,
    pub normalized_text: String,
    pub is_known: bool,
    pub group_id: Option<i64>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub instance_count: i64,
    pub call_count: i64,
    pub total_time: f64,
    pub min_time: f64,
    pub max_time: f64,
    pub mean_time: f64,
    /// Text of the most recently updated instance.
    pub sample_query_text: Option<String>,
    #[serde(skip)]
    pub last_updated_at: Option<DateTime<Utc>>,
}

/// Aggregates over the instances of one signature.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct InstanceAggregate {
    pub instance_count: i64,
    pub call_count: i64,
    pub total_time: f64,
    pub min_time: f64,
    pub max_time: f64,
    pub mean_time: f64,
}

impl InstanceAggregate {
    /// Folds instance rows into count/sum/min/max; mean is `total / calls`.
    pub fn from_instances<'a>(
        instances: impl IntoIterator<Item = &'a CollectedQueryInstance>,
    ) -> Self {
        let mut agg = InstanceAggregate::default();
        let mut min: Option<f64> = None;
        let mut max: Option<f64> = None;
        for inst in instances {
            agg.instance_count += 1;
            agg.call_count += inst.calls;
            agg.total_time += inst.total_time;
            min = Some(min.map_or(inst.min_time, |m| m.min(inst.min_time)));
            max = Some(max.map_or(inst.max_time, |m| m.max(inst.max_time)));
        }
        agg.min_time = min.unwrap_or(0.0);
        agg.max_time = max.unwrap_or(0.0);
        agg.mean_time = mean_time(agg.total_time, agg.call_count);
        agg
    }
}

/// `total / calls`, or 0 when there were no calls.
pub fn mean_time(total_time: f64, calls: i64) -> f64 {
    if calls > 0 {
        total_time / calls as f64
    } else {
        0.0
    }
}

/// Filters for the discovered-queries read.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueryFilter {
    /// Include queries already marked known. Unknown queries are always included.
    #[serde(default)]
    pub show_known: bool,
    pub group_id: Option<i64>,
    /// Inclusive bounds on `last_seen_at`.
    pub date_range_start: Option<DateTime<Utc>>,
    pub date_range_end: Option<DateTime<Utc>>,
    /// Case-insensitive substring of the normalized text.
    pub search: Option<String>,
}

impl QueryFilter {
    pub fn matches(&self, query: &NormalizedQuery) -> bool {
        if query.is_known && !self.show_known {
            return false;
        }
        if let Some(group) = self.group_id
            && query.group_id != Some(group)
        {
            return false;
        }
        if let Some(start) = self.date_range_start
            && query.last_seen_at < start
        {
            return false;
        }
        if let Some(end) = self.date_range_end
            && query.last_seen_at > end
        {
            return false;
        }
        match self.search_term() {
            Some(term) => query.normalized_text.to_lowercase().contains(&term),
            None => true,
        }
    }

    /// Lower-cased search term, `None` when empty.
    pub fn search_term(&self) -> Option<String> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase)
    }
}

/// What a continuous kill loop matches running queries against.
///
/// Serialized externally tagged: `{"signature": ".."}` or `{"query": ".."}`.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum KillTarget {
    /// Output of [`crate::normalize::signature`], used verbatim. Trailing
    /// whitespace is significant: a prefix cut can end in a space.
    Signature(String),
    /// Raw SQL, reduced to its signature before matching.
    Query(String),
}

impl KillTarget {
    /// The signature to compare running queries with.
    pub fn resolve(&self, signature_len: usize) -> String {
        match self {
            KillTarget::Signature(sig) => truncate_chars(sig, signature_len),
            KillTarget::Query(sql) => signature(sql, signature_len),
        }
    }
}

/// State of a continuous kill loop for one database.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContinuousKillStatus {
    pub database_id: i64,
    pub target: Option<String>,
    pub kill_count: u64,
    pub failed_count: u64,
    pub started_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn instance(calls: i64, total: f64, min: f64, max: f64) -> CollectedQueryInstance {
        CollectedQueryInstance {
            id: 0,
            database_id: 1,
            normalized_query_id: 1,
            query_text: String::new(),
            query_hash: String::new(),
            calls,
            total_time: total,
            min_time: min,
            max_time: max,
            mean_time: mean_time(total, calls),
            last_updated_at: Utc::now(),
        }
    }

    #[test]
    fn aggregate_sums_counts_and_bounds() {
        let rows = [instance(10, 100.0, 2.0, 30.0), instance(30, 50.0, 0.5, 9.0)];
        let agg = InstanceAggregate::from_instances(&rows);
        assert_eq!(agg.instance_count, 2);
        assert_eq!(agg.call_count, 40);
        assert_eq!(agg.total_time, 150.0);
        assert_eq!(agg.min_time, 0.5);
        assert_eq!(agg.max_time, 30.0);
        assert_eq!(agg.mean_time, 150.0 / 40.0);
    }

    #[test]
    fn aggregate_of_nothing_is_zero() {
        let none: Vec<CollectedQueryInstance> = Vec::new();
        let agg = InstanceAggregate::from_instances(&none);
        assert_eq!(agg, InstanceAggregate::default());
        assert_eq!(mean_time(12.0, 0), 0.0);
    }

    #[test]
    fn session_activity_respects_end_time() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let mut session = MonitoringSession {
            id: 1,
            database_id: 7,
            status: SessionStatus::Running,
            polling_interval_seconds: 30,
            scheduled_end_time: Some(start + Duration::minutes(10)),
            started_at: start,
            stopped_at: None,
        };
        assert!(session.is_active(start + Duration::minutes(9)));
        assert!(!session.is_active(start + Duration::minutes(10)));

        session.scheduled_end_time = None;
        assert!(session.is_active(start + Duration::days(30)));

        session.status = SessionStatus::Stopped;
        assert!(!session.is_active(start));
    }

    #[test]
    fn filter_hides_known_unless_requested() {
        let now = Utc::now();
        let mut q = NormalizedQuery {
            id: 1,
            database_id: 1,
            normalized_hash: "h".into(),
            normalized_text: "select * from users where id = $?".into(),
            is_known: true,
            group_id: Some(3),
            first_seen_at: now,
            last_seen_at: now,
        };
        let mut filter = QueryFilter::default();
        assert!(!filter.matches(&q));
        filter.show_known = true;
        assert!(filter.matches(&q));

        filter.group_id = Some(4);
        assert!(!filter.matches(&q));
        filter.group_id = Some(3);
        filter.search = Some("  FROM Users ".into());
        assert!(filter.matches(&q));

        q.is_known = false;
        filter.show_known = false;
        filter.date_range_start = Some(now + Duration::seconds(1));
        assert!(!filter.matches(&q));
    }

    #[test]
    fn session_serializes_iso_timestamps_and_lowercase_status() {
        let start = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
        let session = MonitoringSession {
            id: 2,
            database_id: 9,
            status: SessionStatus::Completed,
            polling_interval_seconds: 60,
            scheduled_end_time: None,
            started_at: start,
            stopped_at: Some(start),
        };
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["startedAt"], "2026-03-04T05:06:07Z");
        assert_eq!(json["pollingIntervalSeconds"], 60);
        assert_eq!(SessionStatus::parse("stopped"), Some(SessionStatus::Stopped));
    }
}
