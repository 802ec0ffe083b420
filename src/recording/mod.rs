//! C6 — Recording Session: atomic grouping of concurrent per-camera
//! recording legs (spec §4.6, §3). Lifecycle operations serialize behind a
//! single session mutex (spec §5); per-leg file rotation happens in
//! parallel underneath it. Durable metadata is written via
//! [`metadata::SessionMetadata`] on every state change so a crash mid-session
//! leaves a recoverable record.

pub mod metadata;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use sysinfo::Disks;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::RecordingConfig;
use crate::error::CoreError;
use crate::events::{Event, EventBus, EventPayload};
use crate::ingest::{AttachRecordingRequest, IngestHandle};
use metadata::{LegMetadata, LegState, SessionMetadata};

#[derive(Debug, Clone, serde::Serialize)]
pub struct LegSummary {
    pub camera_id: String,
    pub state: LegState,
    pub file_path: Option<String>,
    pub file_sequence: u32,
    pub bytes_written: u64,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub name: Option<String>,
    pub started_at: chrono::DateTime<Utc>,
    pub ended_at: Option<chrono::DateTime<Utc>>,
    pub legs: Vec<LegSummary>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DiskStatus {
    pub free_gb: f64,
    pub warning_threshold_gb: f64,
    pub min_threshold_gb: f64,
}

struct LegRuntime {
    camera_id: String,
    state: LegState,
    file_path: Option<String>,
    file_sequence: u32,
    started_at: std::time::Instant,
}

struct SessionRuntime {
    id: String,
    name: Option<String>,
    started_at: chrono::DateTime<Utc>,
    legs: HashMap<String, LegRuntime>,
}

pub struct RecordingCoordinator {
    config: RecordingConfig,
    events: Arc<EventBus>,
    active: Mutex<Option<SessionRuntime>>,
    disk_warned: AtomicBool,
}

impl RecordingCoordinator {
    pub fn new(config: RecordingConfig, events: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            config,
            events,
            active: Mutex::new(None),
            disk_warned: AtomicBool::new(false),
        })
    }

    fn root(&self) -> PathBuf {
        PathBuf::from(&self.config.root)
    }

    /// Crash recovery (spec §4.6): on startup, any session metadata file with
    /// no `ended_at` has every leg whose file is stale (no write in over one
    /// supervisor tick) marked `failed`, then the session itself finalized.
    pub async fn recover_on_startup(&self, supervisor_tick: std::time::Duration) {
        for mut meta in SessionMetadata::list_all(&self.root()).await {
            if meta.ended_at.is_some() {
                continue;
            }
            info!(session_id = %meta.id, "recovering unfinished session from crash");
            for (camera_id, leg) in meta.cameras.iter_mut() {
                if leg.state == LegState::Recording || leg.state == LegState::Armed || leg.state == LegState::Rotating {
                    let stale = leg
                        .files
                        .last()
                        .and_then(|path| std::fs::metadata(path).ok())
                        .and_then(|m| m.modified().ok())
                        .map(|m| m.elapsed().unwrap_or_default() > supervisor_tick)
                        .unwrap_or(true);
                    if stale {
                        warn!(session_id = %meta.id, camera_id, "marking stale leg failed on crash recovery");
                        leg.state = LegState::Failed;
                    }
                }
            }
            meta.ended_at = Some(Utc::now());
            if let Err(e) = meta.save(&self.root()).await {
                warn!(session_id = %meta.id, error = %e, "failed to persist recovered session metadata");
            }
        }
    }

    pub async fn disk_status(&self) -> DiskStatus {
        let free_gb = disk_free_gb(&self.root());
        DiskStatus {
            free_gb,
            warning_threshold_gb: self.config.warning_free_gb,
            min_threshold_gb: self.config.min_free_gb,
        }
    }

    /// Spec §4.6: emits `DiskLow` exactly once per crossing below the
    /// warning threshold, resetting once free space recovers above
    /// `warning + hysteresis`.
    pub async fn poll_disk(&self) {
        let status = self.disk_status().await;
        if status.free_gb < status.warning_threshold_gb {
            if !self.disk_warned.swap(true, Ordering::Relaxed) {
                self.events.publish(Event::new(EventPayload::DiskLow {
                    free_gb: status.free_gb,
                    warning_threshold_gb: status.warning_threshold_gb,
                }));
            }
        } else if status.free_gb > status.warning_threshold_gb + self.config.disk_hysteresis_gb {
            self.disk_warned.store(false, Ordering::Relaxed);
        }
    }

    /// Starts a new session, attaching a recording leg on each requested
    /// camera in parallel. Atomic: if every leg fails, the session is rolled
    /// back (spec §4.6).
    pub async fn start(
        &self,
        camera_ids: Vec<String>,
        name: Option<String>,
        workers: &HashMap<String, IngestHandle>,
    ) -> Result<String, CoreError> {
        let mut guard = self.active.lock().await;
        if guard.is_some() {
            return Err(CoreError::Conflict("a recording session is already active".into()));
        }

        let status = self.disk_status().await;
        if status.free_gb < status.min_threshold_gb {
            return Err(CoreError::DiskLow);
        }

        let session_id = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        let dir = self.root().join(&session_id);

        let mut attach_futures = Vec::new();
        for camera_id in &camera_ids {
            let Some(handle) = workers.get(camera_id) else {
                attach_futures.push((camera_id.clone(), Err(CoreError::DeviceMissing(camera_id.clone()))));
                continue;
            };
            let req = AttachRecordingRequest {
                recording_cfg: self.config.clone(),
                dir: dir.clone(),
                session_id: session_id.clone(),
            };
            let result = handle.attach_recording(req).await;
            attach_futures.push((camera_id.clone(), result));
        }

        let mut legs = HashMap::new();
        let mut any_succeeded = false;
        for (camera_id, result) in attach_futures {
            match result {
                Ok(_placement) => {
                    any_succeeded = true;
                    let file_path = dir
                        .join(format!("cam{camera_id}_{session_id}_000.{}", self.config.container_extension))
                        .to_string_lossy()
                        .into_owned();
                    legs.insert(
                        camera_id.clone(),
                        LegRuntime {
                            camera_id,
                            state: LegState::Recording,
                            file_path: Some(file_path),
                            file_sequence: 0,
                            started_at: std::time::Instant::now(),
                        },
                    );
                }
                Err(e) => {
                    warn!(camera_id, error = %e, "failed to attach recording leg");
                    legs.insert(
                        camera_id.clone(),
                        LegRuntime {
                            camera_id,
                            state: LegState::Failed,
                            file_path: None,
                            file_sequence: 0,
                            started_at: std::time::Instant::now(),
                        },
                    );
                }
            }
        }

        if !any_succeeded {
            return Err(CoreError::Conflict("no camera accepted a recording leg".into()));
        }

        let session = SessionRuntime {
            id: session_id.clone(),
            name,
            started_at: Utc::now(),
            legs,
        };
        self.persist(&session).await;

        for (camera_id, leg) in &session.legs {
            if leg.state == LegState::Recording {
                self.events.publish(Event::new(EventPayload::RecordingStarted {
                    session_id: session_id.clone(),
                    camera_id: camera_id.clone(),
                    file_path: leg.file_path.clone().unwrap_or_default(),
                }));
            }
        }

        info!(session_id = %session_id, cameras = ?camera_ids, "recording session started");
        *guard = Some(session);
        Ok(session_id)
    }

    /// Idempotent: a second call after the session has already finalized
    /// returns the same summary (spec §8 round-trip property).
    pub async fn stop(&self, session_id: &str) -> Result<SessionSummary, CoreError> {
        let mut guard = self.active.lock().await;
        match guard.as_ref() {
            Some(session) if session.id == session_id => {}
            Some(session) => {
                return Err(CoreError::NotFound(format!(
                    "session {session_id} is not the active session ({})",
                    session.id
                )))
            }
            None => {
                return self.load_finished_summary(session_id).await;
            }
        }

        let mut session = guard.take().expect("checked Some above");
        for (camera_id, leg) in session.legs.iter_mut() {
            if leg.state != LegState::Recording && leg.state != LegState::Rotating {
                continue;
            }
            leg.state = LegState::Finished;
            self.events.publish(Event::new(EventPayload::RecordingStopped {
                session_id: session.id.clone(),
                camera_id: camera_id.clone(),
            }));
        }

        let summary = self.to_summary(&session, Some(Utc::now()));
        self.persist_final(&session).await;
        info!(session_id = %session_id, "recording session stopped");
        Ok(summary)
    }

    /// Detaches every live leg from its ingest worker before finalizing.
    /// Split from `stop` so the caller (control API) can hold worker handles
    /// without the coordinator depending on the full worker map at `stop`
    /// time; `stop` records bookkeeping state while the actual
    /// `detach_recording` calls happen here, in parallel.
    pub async fn stop_with_workers(
        &self,
        session_id: &str,
        workers: &HashMap<String, IngestHandle>,
    ) -> Result<SessionSummary, CoreError> {
        {
            let guard = self.active.lock().await;
            if let Some(session) = guard.as_ref() {
                if session.id == session_id {
                    let camera_ids: Vec<String> = session.legs.keys().cloned().collect();
                    drop(guard);
                    for camera_id in camera_ids {
                        if let Some(handle) = workers.get(&camera_id) {
                            if let Err(e) = handle.detach_recording().await {
                                warn!(camera_id, error = %e, "detach_recording failed during session stop");
                            }
                        }
                    }
                }
            }
        }
        self.stop(session_id).await
    }

    pub async fn rotate_if_needed(&self, workers: &HashMap<String, IngestHandle>) {
        let camera_ids: Vec<String> = {
            let guard = self.active.lock().await;
            let Some(session) = guard.as_ref() else { return };
            session
                .legs
                .iter()
                .filter(|(_, l)| l.state == LegState::Recording)
                .map(|(id, l)| (id.clone(), l.started_at))
                .filter(|(_, started)| started.elapsed().as_secs() >= self.config.rotate_seconds)
                .map(|(id, _)| id)
                .collect()
        };
        for camera_id in camera_ids {
            let Some(handle) = workers.get(&camera_id) else { continue };
            match handle.rotate_recording().await {
                Ok(seq) => {
                    let mut guard = self.active.lock().await;
                    if let Some(session) = guard.as_mut() {
                        if let Some(leg) = session.legs.get_mut(&camera_id) {
                            leg.file_sequence = seq;
                            leg.started_at = std::time::Instant::now();
                            self.events.publish(Event::new(EventPayload::FileRotated {
                                session_id: session.id.clone(),
                                camera_id: camera_id.clone(),
                                file_path: leg.file_path.clone().unwrap_or_default(),
                                sequence: seq,
                            }));
                        }
                    }
                }
                Err(e) => warn!(camera_id, error = %e, "rotation failed"),
            }
        }
    }

    pub async fn status(&self) -> Option<SessionSummary> {
        let guard = self.active.lock().await;
        guard.as_ref().map(|s| self.to_summary(s, None))
    }

    fn to_summary(&self, session: &SessionRuntime, ended_at: Option<chrono::DateTime<Utc>>) -> SessionSummary {
        SessionSummary {
            id: session.id.clone(),
            name: session.name.clone(),
            started_at: session.started_at,
            ended_at,
            legs: session
                .legs
                .values()
                .map(|l| LegSummary {
                    camera_id: l.camera_id.clone(),
                    state: l.state,
                    file_path: l.file_path.clone(),
                    file_sequence: l.file_sequence,
                    bytes_written: l
                        .file_path
                        .as_ref()
                        .and_then(|p| std::fs::metadata(p).ok())
                        .map(|m| m.len())
                        .unwrap_or(0),
                    duration_seconds: l.started_at.elapsed().as_secs_f64(),
                })
                .collect(),
        }
    }

    async fn persist(&self, session: &SessionRuntime) {
        let meta = self.to_metadata(session, None);
        if let Err(e) = meta.save(&self.root()).await {
            warn!(session_id = %session.id, error = %e, "failed to persist session metadata");
        }
    }

    async fn persist_final(&self, session: &SessionRuntime) {
        let meta = self.to_metadata(session, Some(Utc::now()));
        if let Err(e) = meta.save(&self.root()).await {
            warn!(session_id = %session.id, error = %e, "failed to persist final session metadata");
        }
    }

    fn to_metadata(&self, session: &SessionRuntime, ended_at: Option<chrono::DateTime<Utc>>) -> SessionMetadata {
        SessionMetadata {
            id: session.id.clone(),
            name: session.name.clone(),
            started_at: session.started_at,
            ended_at,
            cameras: session
                .legs
                .iter()
                .map(|(id, l)| {
                    (
                        id.clone(),
                        LegMetadata {
                            files: l.file_path.clone().into_iter().collect(),
                            state: l.state,
                            bytes: std::fs::metadata(l.file_path.as_deref().unwrap_or_default())
                                .map(|m| m.len())
                                .unwrap_or(0),
                            duration_s: l.started_at.elapsed().as_secs_f64(),
                        },
                    )
                })
                .collect(),
        }
    }

    async fn load_finished_summary(&self, session_id: &str) -> Result<SessionSummary, CoreError> {
        match SessionMetadata::load(&self.root(), session_id).await {
            Ok(meta) => Ok(SessionSummary {
                id: meta.id,
                name: meta.name,
                started_at: meta.started_at,
                ended_at: meta.ended_at,
                legs: meta
                    .cameras
                    .into_iter()
                    .map(|(camera_id, l)| LegSummary {
                        camera_id,
                        state: l.state,
                        file_path: l.files.last().cloned(),
                        file_sequence: l.files.len().saturating_sub(1) as u32,
                        bytes_written: l.bytes,
                        duration_seconds: l.duration_s,
                    })
                    .collect(),
            }),
            Err(_) => Err(CoreError::NotFound(format!("session {session_id}"))),
        }
    }
}

fn disk_free_gb(root: &std::path::Path) -> f64 {
    let disks = Disks::new_with_refreshed_list();
    let mut best: Option<(&std::path::Path, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if root.starts_with(mount) {
            let better = best.map(|(m, _)| mount.as_os_str().len() > m.as_os_str().len()).unwrap_or(true);
            if better {
                best = Some((mount, disk.available_space()));
            }
        }
    }
    best.map(|(_, avail)| avail as f64 / 1_073_741_824.0).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(root: &std::path::Path) -> RecordingConfig {
        RecordingConfig {
            root: root.to_string_lossy().into_owned(),
            min_free_gb: 0.0,
            warning_free_gb: 0.0,
            disk_hysteresis_gb: 1.0,
            rotate_size_mb: 2048,
            rotate_seconds: 900,
            container_extension: "mkv".to_string(),
        }
    }

    #[tokio::test]
    async fn stop_without_active_session_returns_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = RecordingCoordinator::new(test_config(dir.path()), EventBus::new(16));
        let result = coordinator.stop("nonexistent").await;
        assert!(matches!(result, Err(CoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn start_with_no_known_cameras_fails_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = RecordingCoordinator::new(test_config(dir.path()), EventBus::new(16));
        let workers = HashMap::new();
        let result = coordinator.start(vec!["cam0".to_string()], None, &workers).await;
        assert!(matches!(result, Err(CoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn disk_status_reports_configured_thresholds() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = RecordingCoordinator::new(test_config(dir.path()), EventBus::new(16));
        let status = coordinator.disk_status().await;
        assert_eq!(status.warning_threshold_gb, 0.0);
        assert_eq!(status.min_threshold_gb, 0.0);
    }
}
