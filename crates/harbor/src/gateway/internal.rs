//! Control plane router
//!
//! Routes:
//! - `GET    /health`
//! - `GET    /plugins` - list all plugins with state
//! - `POST   /plugins` - upload an archive (multipart field `file`), `?activate=true`
//! - `POST   /plugins/rescan` - run discovery now
//! - `GET    /plugins/:id` - single plugin snapshot
//! - `DELETE /plugins/:id` - unload, `?purge=true` also deletes the archive;
//!   an `id:version` reference is accepted
//! - `GET    /plugins/:id/health` - last error, uptime, counters
//! - `POST   /plugins/:id/load` - `?replace=true` stages a new generation
//! - `POST   /plugins/:id/activate`
//! - `POST   /plugins/:id/deactivate`
//! - `POST   /plugins/:id/reload` - load with replace, then activate
//!
//! Each handler maps to exactly one registry call.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use super::error::ControlError;
use crate::registry::{CapabilityRoute, PluginHealth, PluginSnapshot, Registry, ScanReport};

type ControlResult<T> = Result<Json<T>, ControlError>;

/// Create the control plane router
pub fn control_router(registry: Arc<Registry>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/plugins", get(list_plugins).post(upload_plugin))
        .route("/plugins/rescan", post(rescan))
        .route("/plugins/:id", get(get_plugin).delete(unload_plugin))
        .route("/plugins/:id/health", get(plugin_health))
        .route("/plugins/:id/load", post(load_plugin))
        .route("/plugins/:id/activate", post(activate_plugin))
        .route("/plugins/:id/deactivate", post(deactivate_plugin))
        .route("/plugins/:id/reload", post(reload_plugin))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    plugins: usize,
    live_sandboxes: usize,
    routes: Vec<CapabilityRoute>,
}

async fn health_check(State(registry): State<Arc<Registry>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        plugins: registry.list().len(),
        live_sandboxes: registry.live_sandboxes(),
        routes: registry.routes(),
    })
}

async fn list_plugins(State(registry): State<Arc<Registry>>) -> Json<Vec<PluginSnapshot>> {
    Json(registry.list())
}

async fn get_plugin(
    State(registry): State<Arc<Registry>>,
    Path(id): Path<String>,
) -> ControlResult<PluginSnapshot> {
    Ok(Json(registry.snapshot(&id)?))
}

async fn plugin_health(
    State(registry): State<Arc<Registry>>,
    Path(id): Path<String>,
) -> ControlResult<PluginHealth> {
    Ok(Json(registry.health(&id)?))
}

async fn rescan(State(registry): State<Arc<Registry>>) -> ControlResult<ScanReport> {
    Ok(Json(registry.rescan().await?))
}

#[derive(Debug, Default, Deserialize)]
struct LoadParams {
    #[serde(default)]
    replace: bool,
}

async fn load_plugin(
    State(registry): State<Arc<Registry>>,
    Path(id): Path<String>,
    Query(params): Query<LoadParams>,
) -> ControlResult<PluginSnapshot> {
    Ok(Json(registry.load(&id, params.replace).await?))
}

async fn activate_plugin(
    State(registry): State<Arc<Registry>>,
    Path(id): Path<String>,
) -> ControlResult<PluginSnapshot> {
    Ok(Json(registry.activate(&id).await?))
}

async fn deactivate_plugin(
    State(registry): State<Arc<Registry>>,
    Path(id): Path<String>,
) -> ControlResult<PluginSnapshot> {
    Ok(Json(registry.deactivate(&id).await?))
}

async fn reload_plugin(
    State(registry): State<Arc<Registry>>,
    Path(id): Path<String>,
) -> ControlResult<PluginSnapshot> {
    Ok(Json(registry.reload(&id).await?))
}

#[derive(Debug, Default, Deserialize)]
struct UnloadParams {
    #[serde(default)]
    purge: bool,
}

async fn unload_plugin(
    State(registry): State<Arc<Registry>>,
    Path(id): Path<String>,
    Query(params): Query<UnloadParams>,
) -> ControlResult<PluginSnapshot> {
    Ok(Json(registry.unload(strip_version(&id), params.purge).await?))
}

/// `plugin-a:1.0.0` -> `plugin-a`; ids never contain `:`
fn strip_version(reference: &str) -> &str {
    reference
        .split_once(':')
        .map(|(id, _)| id)
        .unwrap_or(reference)
}

#[derive(Debug, Default, Deserialize)]
struct UploadParams {
    #[serde(default)]
    activate: bool,
}

async fn upload_plugin(
    State(registry): State<Arc<Registry>>,
    Query(params): Query<UploadParams>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ControlError> {
    let mut upload = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ControlError::BadRequest(format!("invalid multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| ControlError::BadRequest("field 'file' has no file name".into()))?;
        let contents = field
            .bytes()
            .await
            .map_err(|e| ControlError::BadRequest(format!("failed to read upload: {e}")))?;
        upload = Some((file_name, contents));
        break;
    }

    let (file_name, contents) =
        upload.ok_or_else(|| ControlError::BadRequest("missing multipart field 'file'".into()))?;

    let candidate = registry.install(&file_name, contents).await?;
    let mut snapshot = registry.load(&candidate.id, true).await?;
    if params.activate {
        snapshot = registry.activate(&candidate.id).await?;
    }

    Ok((StatusCode::CREATED, Json(snapshot)))
}
