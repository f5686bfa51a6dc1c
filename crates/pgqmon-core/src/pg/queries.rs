//! SQL for the statistics and activity views of a monitored database.

/// Row cap for one pg_stat_statements read.
pub const STATEMENTS_LIMIT: usize = 500;

pub(super) const SERVER_VERSION_QUERY: &str = "SHOW server_version_num";

pub(super) const STATEMENTS_EXTENSION_QUERY: &str =
    "SELECT extversion FROM pg_extension WHERE extname = 'pg_stat_statements'";

pub(super) const TERMINATE_BACKEND_QUERY: &str = "SELECT pg_terminate_backend($1)";

/// Builds version-aware query for pg_stat_statements of the current database.
///
/// PostgreSQL 13 renamed the `*_time` columns to `*_exec_time`.
pub(super) fn build_stat_statements_query(server_version_num: Option<i32>) -> String {
    let (total, min, max, mean) = if server_version_num.unwrap_or(0) >= 130000 {
        (
            "s.total_exec_time",
            "s.min_exec_time",
            "s.max_exec_time",
            "s.mean_exec_time",
        )
    } else {
        ("s.total_time", "s.min_time", "s.max_time", "s.mean_time")
    };

    format!(
        r#"
            SELECT
                COALESCE(s.query, '') as query,
                s.calls::bigint as calls,
                {total}::double precision as total_time,
                {min}::double precision as min_time,
                {max}::double precision as max_time,
                {mean}::double precision as mean_time
            FROM pg_stat_statements s
            JOIN pg_database d ON d.oid = s.dbid
            WHERE d.datname = current_database()
            ORDER BY {total} DESC
            LIMIT {STATEMENTS_LIMIT}
        "#
    )
}

/// Active backends of the current database, excluding our own.
pub(super) fn build_running_queries_query() -> &'static str {
    r#"
        SELECT
            pid,
            COALESCE(usename, '') as usename,
            COALESCE(application_name, '') as application_name,
            COALESCE(client_addr::text, '') as client_addr,
            COALESCE(query, '') as query,
            query_start,
            COALESCE(EXTRACT(EPOCH FROM (clock_timestamp() - query_start)) * 1000, 0)::double precision
                as duration_ms
        FROM pg_stat_activity
        WHERE state = 'active'
          AND pid <> pg_backend_pid()
          AND datname = current_database()
          AND COALESCE(query, '') <> ''
        ORDER BY duration_ms DESC
    "#
}
