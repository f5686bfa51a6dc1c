//! HTTP request handlers and the API router.

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use serde::Deserialize;
use tracing::error;

use pgqmon_core::model::{
    CollectedQueryInstance, ContinuousKillStatus, DiscoveredQuery, KillTarget, MonitoringSession,
    QueryFilter, QuerySample,
};
use pgqmon_core::monitor::StartOptions;
use pgqmon_core::{KillError, MonitorError};

use crate::auth::Caller;
use crate::state::AppState;

pub(crate) fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(handle_health))
        .route(
            "/api/v1/databases/{id}/monitoring",
            post(handle_start_monitoring),
        )
        .route("/api/v1/databases/{id}/queries", get(handle_discovered_queries))
        .route("/api/v1/databases/{id}/running", get(handle_running_queries))
        .route("/api/v1/databases/{id}/kill", post(handle_kill_query))
        .route(
            "/api/v1/databases/{id}/continuous-kill",
            get(handle_continuous_kill_status)
                .put(handle_set_continuous_kill)
                .delete(handle_clear_continuous_kill),
        )
        .route("/api/v1/sessions/{id}", get(handle_session_status))
        .route("/api/v1/sessions/{id}/stop", post(handle_stop_monitoring))
        .route("/api/v1/queries/{id}/instances", get(handle_query_instances))
        .route("/api/v1/queries/{id}/known", put(handle_mark_known))
        .route("/api/v1/queries/{id}/group", put(handle_assign_group))
        .with_state(state)
}

// ============================================================
// Errors
// ============================================================

pub(crate) struct ApiError(MonitorError);

impl From<MonitorError> for ApiError {
    fn from(e: MonitorError) -> Self {
        ApiError(e)
    }
}

pub(crate) fn status_for(e: &MonitorError) -> StatusCode {
    match e {
        MonitorError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        MonitorError::NotFound(_) => StatusCode::NOT_FOUND,
        MonitorError::ExtensionMissing { .. } => StatusCode::CONFLICT,
        MonitorError::Kill(KillError::ProcessGone(_)) => StatusCode::NOT_FOUND,
        MonitorError::Kill(KillError::Denied { .. }) => StatusCode::BAD_GATEWAY,
        MonitorError::Kill(KillError::Connectivity(_)) | MonitorError::Connectivity(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        MonitorError::Store(_) | MonitorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self.0, "request failed");
        }
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Parses an optional JSON body; an empty body yields the default.
fn optional_json<T: for<'de> Deserialize<'de> + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError(MonitorError::InvalidRequest(format!("invalid body: {e}"))))
}

// ============================================================
// Health
// ============================================================

pub(crate) async fn handle_health() -> &'static str {
    "ok"
}

// ============================================================
// Sessions
// ============================================================

pub(crate) async fn handle_start_monitoring(
    State(state): State<AppState>,
    Path(database_id): Path<i64>,
    Caller(caller): Caller,
    body: Bytes,
) -> ApiResult<MonitoringSession> {
    let options: StartOptions = optional_json(&body)?;
    let session = state
        .monitor
        .start_monitoring(database_id, options, &caller)
        .await?;
    Ok(Json(session))
}

pub(crate) async fn handle_stop_monitoring(
    State(state): State<AppState>,
    Path(session_id): Path<i64>,
    Caller(caller): Caller,
) -> ApiResult<MonitoringSession> {
    Ok(Json(state.monitor.stop_monitoring(session_id, &caller).await?))
}

pub(crate) async fn handle_session_status(
    State(state): State<AppState>,
    Path(session_id): Path<i64>,
) -> ApiResult<MonitoringSession> {
    Ok(Json(state.monitor.session_status(session_id).await?))
}

// ============================================================
// Discovered queries
// ============================================================

pub(crate) async fn handle_discovered_queries(
    State(state): State<AppState>,
    Path(database_id): Path<i64>,
    Query(filter): Query<QueryFilter>,
) -> Json<Vec<DiscoveredQuery>> {
    Json(state.monitor.discovered_queries(database_id, filter).await)
}

pub(crate) async fn handle_query_instances(
    State(state): State<AppState>,
    Path(query_id): Path<i64>,
) -> Json<Vec<CollectedQueryInstance>> {
    Json(state.monitor.query_instances(query_id).await)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct KnownBody {
    is_known: bool,
}

pub(crate) async fn handle_mark_known(
    State(state): State<AppState>,
    Path(query_id): Path<i64>,
    Caller(caller): Caller,
    Json(body): Json<KnownBody>,
) -> Result<StatusCode, ApiError> {
    state
        .monitor
        .mark_query_known(query_id, body.is_known, &caller)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GroupBody {
    #[serde(default)]
    group_id: Option<i64>,
}

pub(crate) async fn handle_assign_group(
    State(state): State<AppState>,
    Path(query_id): Path<i64>,
    Caller(caller): Caller,
    Json(body): Json<GroupBody>,
) -> Result<StatusCode, ApiError> {
    state
        .monitor
        .assign_query_group(query_id, body.group_id, &caller)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================
// Running queries and kills
// ============================================================

pub(crate) async fn handle_running_queries(
    State(state): State<AppState>,
    Path(database_id): Path<i64>,
) -> Json<Vec<QuerySample>> {
    Json(state.monitor.running_queries(database_id).await)
}

#[derive(Deserialize)]
pub(crate) struct KillBody {
    pid: i32,
}

pub(crate) async fn handle_kill_query(
    State(state): State<AppState>,
    Path(database_id): Path<i64>,
    Caller(caller): Caller,
    Json(body): Json<KillBody>,
) -> Result<StatusCode, ApiError> {
    state
        .monitor
        .kill_query(database_id, body.pid, &caller)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn handle_continuous_kill_status(
    State(state): State<AppState>,
    Path(database_id): Path<i64>,
) -> Json<ContinuousKillStatus> {
    Json(state.monitor.continuous_kill_status(database_id))
}

pub(crate) async fn handle_set_continuous_kill(
    State(state): State<AppState>,
    Path(database_id): Path<i64>,
    Caller(caller): Caller,
    Json(target): Json<KillTarget>,
) -> ApiResult<ContinuousKillStatus> {
    Ok(Json(state.monitor.set_continuous_kill_target(
        database_id,
        &target,
        &caller,
    )?))
}

pub(crate) async fn handle_clear_continuous_kill(
    State(state): State<AppState>,
    Path(database_id): Path<i64>,
    Caller(caller): Caller,
) -> Json<ContinuousKillStatus> {
    Json(
        state
            .monitor
            .clear_continuous_kill_target(database_id, &caller),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, header};
    use serde_json::Value;
    use tower::ServiceExt;

    use pgqmon_core::monitor::Connector;
    use pgqmon_core::pg::MonitoredDb;
    use pgqmon_core::store::MemoryStore;
    use pgqmon_core::{MonitorSettings, QueryMonitor};

    use super::*;

    /// Every monitored database is unreachable.
    struct Offline;

    impl Connector for Offline {
        fn open(&self, database_id: i64) -> Result<Box<dyn MonitoredDb>, MonitorError> {
            Err(MonitorError::Connectivity(format!(
                "database {database_id}: connection refused"
            )))
        }
    }

    fn app() -> (Router, Arc<QueryMonitor>) {
        let monitor = Arc::new(QueryMonitor::new(
            Arc::new(MemoryStore::new()),
            Arc::new(Offline),
            MonitorSettings::default(),
        ));
        (routes(AppState::new(monitor.clone())), monitor)
    }

    async fn send(app: Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                req = req.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_owned())
            }
            None => Body::empty(),
        };
        let resp = app.oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[test]
    fn errors_map_to_status_codes() {
        let cases = [
            (MonitorError::InvalidRequest("x".into()), StatusCode::BAD_REQUEST),
            (MonitorError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                MonitorError::ExtensionMissing {
                    database: "1".into(),
                },
                StatusCode::CONFLICT,
            ),
            (
                MonitorError::Kill(KillError::Denied {
                    pid: 1,
                    message: "no".into(),
                }),
                StatusCode::BAD_GATEWAY,
            ),
            (
                MonitorError::Connectivity("down".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                MonitorError::Internal("panic".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(status_for(&err), expected, "{err}");
        }
    }

    #[tokio::test]
    async fn unreachable_database_rejects_start() {
        let (app, _) = app();
        let (status, body) = send(
            app,
            "POST",
            "/api/v1/databases/7/monitoring",
            Some(r#"{"pollingIntervalSeconds": 60}"#),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn malformed_start_body_is_bad_request() {
        let (app, _) = app();
        let (status, _) = send(app, "POST", "/api/v1/databases/7/monitoring", Some("{")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_entities_are_not_found() {
        let (app, _) = app();
        let (status, _) = send(app.clone(), "GET", "/api/v1/sessions/42", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            app,
            "PUT",
            "/api/v1/queries/42/known",
            Some(r#"{"isKnown": true}"#),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn reads_degrade_to_empty_lists() {
        let (app, _) = app();
        let (status, body) = send(
            app.clone(),
            "GET",
            "/api/v1/databases/7/queries?showKnown=true&search=users",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::Array(vec![]));

        let (status, body) = send(app, "GET", "/api/v1/databases/7/running", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::Array(vec![]));
    }

    #[tokio::test]
    async fn continuous_kill_lifecycle() {
        let (app, monitor) = app();
        let (status, _) = send(
            app.clone(),
            "PUT",
            "/api/v1/databases/3/continuous-kill",
            Some(r#"{"signature": "   "}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            app.clone(),
            "PUT",
            "/api/v1/databases/3/continuous-kill",
            Some(r#"{"query": "SELECT pg_sleep(100)"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["target"], "select pg_sleep(?)");
        assert_eq!(body["databaseId"], 3);

        // A signature is stored as sent, trailing space included.
        let (status, body) = send(
            app.clone(),
            "PUT",
            "/api/v1/databases/3/continuous-kill",
            Some(r#"{"signature": "select a, b, "}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["target"], "select a, b, ");

        let (status, body) = send(
            app.clone(),
            "PUT",
            "/api/v1/databases/3/continuous-kill",
            Some(r#"{"query": "SELECT pg_sleep(100)"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["target"], "select pg_sleep(?)");

        let (_, body) = send(app.clone(), "GET", "/api/v1/databases/3/continuous-kill", None).await;
        assert_eq!(body["target"], "select pg_sleep(?)");

        let (status, body) =
            send(app, "DELETE", "/api/v1/databases/3/continuous-kill", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["target"], Value::Null);
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn manual_kill_on_unreachable_database_fails() {
        let (app, _) = app();
        let (status, _) = send(
            app,
            "POST",
            "/api/v1/databases/3/kill",
            Some(r#"{"pid": 1234}"#),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
