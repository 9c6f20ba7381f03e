//! Data plane router
//!
//! Routes:
//! - `POST /invoke/:capability` - forward the body to the ACTIVE plugin serving
//!   the capability
//! - `GET  /health` - liveness, always public
//!
//! Nothing here mutates plugin lifecycle.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use super::auth::require_bearer;
use super::error::RoutingError;
use crate::registry::Registry;

/// Per-request timeout override, in milliseconds
pub const TIMEOUT_HEADER: &str = "x-harbor-timeout-ms";

/// State of the data plane router
#[derive(Clone)]
pub struct DataPlane {
    registry: Arc<Registry>,
    default_timeout: Duration,
    max_timeout: Duration,
    auth_token: Option<Arc<str>>,
    allow_anonymous: bool,
    max_body_bytes: usize,
}

impl DataPlane {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            default_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(300),
            auth_token: None,
            allow_anonymous: false,
            max_body_bytes: 16 * 1024 * 1024,
        }
    }

    pub fn with_timeouts(mut self, default: Duration, max: Duration) -> Self {
        self.default_timeout = default;
        self.max_timeout = max;
        self
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token.map(Arc::from);
        self
    }

    /// Serve invocations without a token when none is configured
    pub fn with_anonymous_access(mut self, allow: bool) -> Self {
        self.allow_anonymous = allow;
        self
    }

    pub fn with_body_limit(mut self, bytes: usize) -> Self {
        self.max_body_bytes = bytes;
        self
    }

    pub(crate) fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    pub(crate) fn allows_anonymous(&self) -> bool {
        self.allow_anonymous
    }

    fn timeout_for(&self, headers: &HeaderMap) -> Result<Duration, RoutingError> {
        let Some(value) = headers.get(TIMEOUT_HEADER) else {
            return Ok(self.default_timeout);
        };
        let millis = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .ok_or_else(|| {
                RoutingError::InvalidRequest(format!(
                    "{TIMEOUT_HEADER} must be a positive number of milliseconds"
                ))
            })?;
        Ok(Duration::from_millis(millis).min(self.max_timeout))
    }
}

/// Create the data plane router
pub fn data_router(plane: DataPlane) -> Router {
    let body_limit = plane.max_body_bytes;

    let invoke_routes = Router::new()
        .route("/invoke/:capability", post(invoke))
        .route_layer(middleware::from_fn_with_state(plane.clone(), require_bearer));

    Router::new()
        // Health check for monitoring/load balancers
        .route("/health", get(health_check))
        .merge(invoke_routes)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(plane)
}

async fn invoke(
    State(plane): State<DataPlane>,
    Path(capability): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, RoutingError> {
    let timeout = plane.timeout_for(&headers)?;
    let content_type = headers
        .get(CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));

    let lease = plane.registry.resolve(&capability)?;
    let instance = lease.instance().clone();

    tracing::debug!(
        capability = %capability,
        plugin = %instance.id(),
        generation = instance.generation(),
        bytes = body.len(),
        "Routing invocation"
    );

    let result = lease.invoke(body, timeout).await;
    drop(lease);

    match result {
        Ok(reply) => Ok(([(CONTENT_TYPE, content_type)], reply).into_response()),
        Err(e) => {
            tracing::warn!(
                capability = %capability,
                plugin = %instance.id(),
                generation = instance.generation(),
                "Invocation failed: {}",
                e
            );
            let registry = plane.registry.clone();
            let report = e.clone();
            tokio::spawn(async move { registry.report_failure(&instance, &report).await });
            Err(e.into())
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
