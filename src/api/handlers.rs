//! Request handlers for the `/api/v1` surface (spec §6.1). Each handler is a
//! thin translation from HTTP to the owning actor's handle; none of them
//! hold or mutate state directly.

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::mixer::Transition;
use crate::scenes::Scene;

use super::{ok, AppState};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_seconds: u64,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

#[derive(Debug, Serialize)]
pub struct CapabilitiesResponse {
    pub api_version: &'static str,
    pub cameras: Vec<String>,
    pub hardware_encoder_available: bool,
    pub vpu: crate::vpu::VpuSnapshot,
}

pub async fn capabilities(State(state): State<AppState>) -> Json<CapabilitiesResponse> {
    let vpu = state.vpu.snapshot();
    Json(CapabilitiesResponse {
        api_version: "v1",
        cameras: state.config.cameras.iter().map(|c| c.id.clone()).collect(),
        hardware_encoder_available: vpu.max_encode > 0,
        vpu,
    })
}

pub async fn list_cameras(State(state): State<AppState>) -> Json<Vec<crate::ingest::IngestSnapshot>> {
    let mut snapshots = Vec::with_capacity(state.workers.len());
    for handle in state.workers.values() {
        snapshots.push(handle.describe().await);
    }
    Json(snapshots)
}

pub async fn enable_camera(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, CoreError> {
    let handle = state.workers.get(&id).ok_or_else(|| CoreError::DeviceMissing(id.clone()))?;
    handle.enable().await;
    Ok(ok())
}

pub async fn disable_camera(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, CoreError> {
    let handle = state.workers.get(&id).ok_or_else(|| CoreError::DeviceMissing(id.clone()))?;
    handle.disable().await;
    Ok(ok())
}

#[derive(Debug, Deserialize)]
pub struct RecordingStartRequest {
    #[serde(default)]
    pub camera_ids: Option<Vec<String>>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RecordingStartResponse {
    pub session_id: String,
}

pub async fn recording_start(
    State(state): State<AppState>,
    Json(req): Json<RecordingStartRequest>,
) -> Result<Json<RecordingStartResponse>, CoreError> {
    let camera_ids = req
        .camera_ids
        .unwrap_or_else(|| state.config.cameras.iter().map(|c| c.id.clone()).collect());
    let session_id = state.recording.start(camera_ids, req.name, &state.workers).await?;
    Ok(Json(RecordingStartResponse { session_id }))
}

#[derive(Debug, Deserialize)]
pub struct RecordingStopRequest {
    pub session_id: Option<String>,
}

pub async fn recording_stop(
    State(state): State<AppState>,
    body: Option<Json<RecordingStopRequest>>,
) -> Result<Json<crate::recording::SessionSummary>, CoreError> {
    let requested = body.and_then(|Json(req)| req.session_id);
    let session_id = match requested {
        Some(id) => id,
        None => match state.recording.status().await {
            Some(active) => active.id,
            None => return Err(CoreError::Conflict("no active recording session".into())),
        },
    };
    let summary = state.recording.stop_with_workers(&session_id, &state.workers).await?;
    Ok(Json(summary))
}

pub async fn recording_status(
    State(state): State<AppState>,
) -> Json<Option<crate::recording::SessionSummary>> {
    Json(state.recording.status().await)
}

pub async fn list_scenes(State(state): State<AppState>) -> Json<Vec<Scene>> {
    Json(state.scenes.list())
}

pub async fn create_scene(
    State(state): State<AppState>,
    Json(scene): Json<Scene>,
) -> Result<Json<Scene>, CoreError> {
    Ok(Json(state.scenes.upsert(scene)?))
}

pub async fn update_scene(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut scene): Json<Scene>,
) -> Result<Json<Scene>, CoreError> {
    scene.scene_id = id;
    Ok(Json(state.scenes.upsert(scene)?))
}

pub async fn delete_scene(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, CoreError> {
    state.scenes.delete(&id)?;
    Ok(ok())
}

pub async fn mixer_status(State(state): State<AppState>) -> Json<crate::mixer::MixerStatus> {
    Json(state.mixer.status().await)
}

pub async fn mixer_start(State(state): State<AppState>) -> Result<Json<serde_json::Value>, CoreError> {
    state.mixer.start().await?;
    Ok(ok())
}

pub async fn mixer_stop(State(state): State<AppState>) -> Result<Json<serde_json::Value>, CoreError> {
    state.mixer.stop().await?;
    Ok(ok())
}

#[derive(Debug, Deserialize)]
pub struct MixerPreviewRequest {
    pub scene_id: String,
}

pub async fn mixer_preview(
    State(state): State<AppState>,
    Json(req): Json<MixerPreviewRequest>,
) -> Result<Json<serde_json::Value>, CoreError> {
    state.mixer.set_preview_scene(req.scene_id).await?;
    Ok(ok())
}

#[derive(Debug, Deserialize)]
pub struct MixerTakeRequest {
    pub transition: Transition,
}

pub async fn mixer_take(
    State(state): State<AppState>,
    Json(req): Json<MixerTakeRequest>,
) -> Result<Json<serde_json::Value>, CoreError> {
    state.mixer.take(req.transition).await?;
    Ok(ok())
}

pub async fn disk_status(State(state): State<AppState>) -> Json<crate::recording::DiskStatus> {
    Json(state.recording.disk_status().await)
}
