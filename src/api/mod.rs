//! C10 — Control API: the single HTTP + WebSocket surface every client
//! (embedded UI, desktop launcher, fleet dashboard) talks to (spec §6.1).
//! Generalized from the teacher's `web_server`/`web.rs` static-file + single
//! `/api/config` handler into the full versioned REST + push-channel surface
//! the spec requires, kept on the same axum/tower stack.

mod handlers;
mod ws;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::{Config, MediaServerConfig};
use crate::credentials::CredentialCache;
use crate::error::CoreError;
use crate::events::EventBus;
use crate::ingest::IngestHandle;
use crate::mixer::MixerHandle;
use crate::recording::RecordingCoordinator;
use crate::scenes::SceneStore;
use crate::vpu::VpuBudget;

/// Shared, cheaply cloneable handle set every axum handler closes over.
/// Every field is itself an actor front or a process-wide singleton; the API
/// layer holds no mutable state of its own (spec §5: "there is no globally
/// mutable state outside these actors").
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub media_server: MediaServerConfig,
    pub vpu: Arc<VpuBudget>,
    pub workers: Arc<HashMap<String, IngestHandle>>,
    pub events: Arc<EventBus>,
    pub scenes: Arc<SceneStore>,
    pub mixer: MixerHandle,
    pub recording: Arc<RecordingCoordinator>,
    pub credentials: Arc<CredentialCache>,
    pub started_at: Instant,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(handlers::health))
        .route("/capabilities", get(handlers::capabilities))
        .route("/cameras", get(handlers::list_cameras))
        .route("/cameras/:id/enable", post(handlers::enable_camera))
        .route("/cameras/:id/disable", post(handlers::disable_camera))
        .route("/recording/start", post(handlers::recording_start))
        .route("/recording/stop", post(handlers::recording_stop))
        .route("/recording/status", get(handlers::recording_status))
        .route("/scenes", get(handlers::list_scenes).post(handlers::create_scene))
        .route("/scenes/:id", put(handlers::update_scene).delete(handlers::delete_scene))
        .route("/mixer/status", get(handlers::mixer_status))
        .route("/mixer/start", post(handlers::mixer_start))
        .route("/mixer/stop", post(handlers::mixer_stop))
        .route("/mixer/preview", post(handlers::mixer_preview))
        .route("/mixer/take", post(handlers::mixer_take))
        .route("/disk", get(handlers::disk_status))
        .route("/events", get(ws::events_ws))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Lets every handler simply return `Result<impl IntoResponse, CoreError>`
/// and have failures render as the uniform `{error:{kind,message,details?}}`
/// envelope (spec §6.1) with the matching status code.
impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = match &self {
            CoreError::ConfigInvalid(_) => StatusCode::BAD_REQUEST,
            CoreError::DeviceMissing(_) => StatusCode::NOT_FOUND,
            CoreError::NoSignal(_) => StatusCode::CONFLICT,
            CoreError::BusyRecording(_) => StatusCode::CONFLICT,
            CoreError::DiskLow => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::VpuExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::PipelineBuildFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::PipelineFatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::PrerollTimeout => StatusCode::GATEWAY_TIMEOUT,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self.envelope())).into_response()
    }
}

pub(crate) fn ok() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
