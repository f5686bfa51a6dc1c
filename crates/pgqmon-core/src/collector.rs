//! One polling cycle: read statement statistics, normalize, upsert.
//!
//! Each row becomes (or refreshes) a signature keyed by the normalized hash
//! and an instance keyed by the raw-text hash. Rows are independent, so a bad
//! row or a failed write only loses that row.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::MonitorError;
use crate::model::StatementStats;
use crate::normalize::{normalize_query, query_hash};
use crate::pg::MonitoredDb;
use crate::store::{QueryStore, StoreError};

/// Outcome of one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub processed: usize,
    pub skipped: usize,
}

/// Fetches statistics and ingests them. A fetch failure fails the whole
/// cycle; row failures do not.
pub fn run_cycle(
    db: &mut dyn MonitoredDb,
    store: &dyn QueryStore,
    database_id: i64,
    now: DateTime<Utc>,
) -> Result<CycleReport, MonitorError> {
    let rows = db.fetch_statement_stats()?;
    let report = ingest(store, database_id, &rows, now);
    debug!(
        database_id,
        rows = rows.len(),
        processed = report.processed,
        skipped = report.skipped,
        "collection cycle finished"
    );
    Ok(report)
}

/// Upserts a batch of statistics rows observed at `now`.
pub fn ingest(
    store: &dyn QueryStore,
    database_id: i64,
    rows: &[StatementStats],
    now: DateTime<Utc>,
) -> CycleReport {
    let mut report = CycleReport::default();
    for row in rows {
        if let Err(reason) = validate(row) {
            warn!(database_id, reason, "skipping malformed statistics row");
            report.skipped += 1;
            continue;
        }
        match ingest_row(store, database_id, row, now) {
            Ok(()) => report.processed += 1,
            Err(e) => {
                warn!(database_id, error = %e, "failed to store statistics row");
                report.skipped += 1;
            }
        }
    }
    report
}

fn ingest_row(
    store: &dyn QueryStore,
    database_id: i64,
    row: &StatementStats,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let normalized = normalize_query(&row.query_text);
    let normalized_hash = query_hash(&normalized);
    let query_id = store.upsert_normalized_query(database_id, &normalized_hash, &normalized, now)?;
    store.upsert_query_instance(
        database_id,
        query_id,
        &query_hash(&row.query_text),
        row,
        now,
    )?;
    Ok(())
}

fn validate(row: &StatementStats) -> Result<(), &'static str> {
    if row.query_text.trim().is_empty() {
        return Err("empty query text");
    }
    if row.calls < 0 {
        return Err("negative call count");
    }
    let times = [row.total_time, row.min_time, row.max_time, row.mean_time];
    if times.iter().any(|t| !t.is_finite()) {
        return Err("non-finite timing");
    }
    Ok(())
}
