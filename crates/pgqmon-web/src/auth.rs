//! Basic Auth, access log and caller identity.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use tracing::{debug, info, warn};

/// Header the dashboard uses to pass the signed-in operator.
pub(crate) const USER_ID_HEADER: &str = "x-user-id";

/// Caller id used in audit events when nothing identifies the caller.
pub(crate) const ANONYMOUS: &str = "anonymous";

/// Authenticated username, inserted into request extensions by auth middleware.
#[derive(Clone)]
pub(crate) struct AuthUser(pub(crate) String);

/// The user a request acts on behalf of: `X-User-Id`, else the basic-auth
/// user, else [`ANONYMOUS`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Caller(pub(crate) String);

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let from_header = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_owned);
        let id = from_header
            .or_else(|| parts.extensions.get::<AuthUser>().map(|u| u.0.clone()))
            .unwrap_or_else(|| ANONYMOUS.to_owned());
        Ok(Caller(id))
    }
}

// ============================================================
// Access log layer (tower Layer + Service)
// ============================================================

#[derive(Clone)]
pub(crate) struct AccessLogLayer;

impl<S> tower::Layer<S> for AccessLogLayer {
    type Service = AccessLogService<S>;
    fn layer(&self, inner: S) -> Self::Service {
        AccessLogService { inner }
    }
}

#[derive(Clone)]
pub(crate) struct AccessLogService<S> {
    inner: S,
}

impl<S> tower::Service<Request> for AccessLogService<S>
where
    S: tower::Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let method = req.method().clone();
        let path = req.uri().path().to_owned();
        let client = req
            .extensions()
            .get::<axum::extract::ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip().to_string())
            .unwrap_or_else(|| "-".to_owned());
        let user = req
            .headers()
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .or_else(|| req.extensions().get::<AuthUser>().map(|u| u.0.clone()))
            .unwrap_or_else(|| "-".to_owned());
        let t0 = Instant::now();

        let mut inner = self.inner.clone();
        Box::pin(async move {
            let response = inner.call(req).await?;
            let latency_ms = t0.elapsed().as_millis() as u64;
            let status = response.status().as_u16();
            if path != "/api/v1/health" {
                info!(client, user, status, latency_ms, "{method} {path}");
            }
            Ok(response)
        })
    }
}

// ============================================================
// Basic Auth middleware
// ============================================================

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"pgqmon\""),
        )],
        "Unauthorized",
    )
        .into_response()
}

/// Decodes `Basic <base64(user:pass)>`.
fn parse_basic(value: &str) -> Result<(String, String), &'static str> {
    let encoded = value.strip_prefix("Basic ").ok_or("not basic auth")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| "invalid base64")?;
    let decoded = String::from_utf8(decoded).map_err(|_| "invalid utf8")?;
    let (user, pass) = decoded.split_once(':').ok_or("malformed credentials")?;
    Ok((user.to_owned(), pass.to_owned()))
}

pub(crate) async fn basic_auth_middleware(
    State(creds): State<Arc<(String, String)>>,
    mut req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_owned();
    if path == "/api/v1/health" {
        return next.run(req).await;
    }

    let Some(auth_header) = req.headers().get(header::AUTHORIZATION) else {
        warn!(path = %path, "auth failed: no authorization header");
        return unauthorized();
    };
    let Ok(auth_str) = auth_header.to_str() else {
        warn!(path = %path, "auth failed: invalid header encoding");
        return unauthorized();
    };
    let (user, pass) = match parse_basic(auth_str) {
        Ok(pair) => pair,
        Err(reason) => {
            warn!(path = %path, reason, "auth failed");
            return unauthorized();
        }
    };

    if user != creds.0 || pass != creds.1 {
        warn!(user = %user, path = %path, "auth failed: invalid credentials");
        return unauthorized();
    }

    debug!(user = %user, path = %path, "authenticated");
    req.extensions_mut().insert(AuthUser(user));
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::body::Body;
    use axum::routing::get;
    use tower::ServiceExt;

    use super::*;

    async fn whoami(caller: Caller) -> String {
        caller.0
    }

    fn app() -> Router {
        Router::new()
            .route("/api/v1/health", get(|| async { "ok" }))
            .route("/api/v1/whoami", get(whoami))
            .layer(axum::middleware::from_fn_with_state(
                Arc::new(("admin".to_owned(), "secret".to_owned())),
                basic_auth_middleware,
            ))
    }

    fn basic(user: &str, pass: &str) -> String {
        let token = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
        format!("Basic {token}")
    }

    async fn body_text(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn parse_basic_rejects_malformed_values() {
        assert_eq!(
            parse_basic(&basic("a", "b:c")).unwrap(),
            ("a".to_owned(), "b:c".to_owned())
        );
        assert_eq!(parse_basic("Bearer x"), Err("not basic auth"));
        assert_eq!(parse_basic("Basic !!!"), Err("invalid base64"));
    }

    #[tokio::test]
    async fn missing_or_wrong_credentials_are_rejected() {
        let resp = app()
            .oneshot(Request::get("/api/v1/whoami").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(resp.headers().contains_key(header::WWW_AUTHENTICATE));

        let resp = app()
            .oneshot(
                Request::get("/api/v1/whoami")
                    .header(header::AUTHORIZATION, basic("admin", "nope"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn health_is_public() {
        let resp = app()
            .oneshot(Request::get("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn caller_prefers_user_id_header() {
        let resp = app()
            .oneshot(
                Request::get("/api/v1/whoami")
                    .header(header::AUTHORIZATION, basic("admin", "secret"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_text(resp).await, "admin");

        let resp = app()
            .oneshot(
                Request::get("/api/v1/whoami")
                    .header(header::AUTHORIZATION, basic("admin", "secret"))
                    .header(USER_ID_HEADER, "jane")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_text(resp).await, "jane");
    }

    #[tokio::test]
    async fn caller_defaults_to_anonymous() {
        let app = Router::new().route("/", get(whoami));
        let resp = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_text(resp).await, ANONYMOUS);
    }
}
