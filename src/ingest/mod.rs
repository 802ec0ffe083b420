//! C4 — Ingest Worker: one actor per camera, owning its pipeline and state
//! machine (spec §4.4). The supervisor and the control API both talk to a
//! worker only through its `IngestHandle`, so every state transition and
//! every recording-leg operation on a given camera serializes on that
//! camera's inbox (spec §5 ordering guarantees).

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, instrument, warn};

use crate::config::{CameraConfig, MediaServerConfig, RecordingConfig};
use crate::device_probe::Resolution;
use crate::error::CoreError;
use crate::events::{Event, EventBus, EventPayload};
use crate::pipeline::ingest::IngestPipeline;
use crate::pipeline::{BusEvent, EncoderPlacement};
use crate::vpu::VpuBudget;

const PREROLL_TIMEOUT: Duration = Duration::from_secs(5);
const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(8);
const BACKOFF_RESET_AFTER_STABLE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestState {
    Disabled,
    Idle,
    NoSignal,
    Streaming,
    Error,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct IngestSnapshot {
    pub camera_id: String,
    pub state: IngestState,
    pub has_signal: bool,
    pub resolution: Option<Resolution>,
    pub device: String,
    pub encoder_placement: Option<EncoderPlacement>,
    pub recording: bool,
    pub error_reason: Option<String>,
}

pub struct AttachRecordingRequest {
    pub recording_cfg: RecordingConfig,
    pub dir: std::path::PathBuf,
    pub session_id: String,
}

enum Command {
    Enable,
    Disable,
    SignalUpdate(Option<Resolution>),
    AttachRecording(AttachRecordingRequest, oneshot::Sender<Result<EncoderPlacement, CoreError>>),
    DetachRecording(oneshot::Sender<Result<(), CoreError>>),
    RotateRecording(oneshot::Sender<Result<u32, CoreError>>),
    Describe(oneshot::Sender<IngestSnapshot>),
    Shutdown,
}

/// Cheaply cloneable front for an `IngestWorker`'s inbox. All calls reduce to
/// an enqueue plus (for request/response ops) a oneshot reply.
#[derive(Clone)]
pub struct IngestHandle {
    camera_id: String,
    tx: mpsc::UnboundedSender<Command>,
}

impl IngestHandle {
    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub async fn enable(&self) {
        let _ = self.tx.send(Command::Enable);
    }

    pub async fn disable(&self) {
        let _ = self.tx.send(Command::Disable);
    }

    /// Used only by the supervisor (spec §4.5 step 1-4); not part of the
    /// public control-API surface.
    pub(crate) fn probe_signal(&self, resolution: Option<Resolution>) {
        let _ = self.tx.send(Command::SignalUpdate(resolution));
    }

    pub async fn describe(&self) -> IngestSnapshot {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Describe(tx)).is_err() {
            return IngestSnapshot {
                camera_id: self.camera_id.clone(),
                state: IngestState::Error,
                has_signal: false,
                resolution: None,
                device: String::new(),
                encoder_placement: None,
                recording: false,
                error_reason: Some("worker not running".into()),
            };
        }
        rx.await.unwrap_or(IngestSnapshot {
            camera_id: self.camera_id.clone(),
            state: IngestState::Error,
            has_signal: false,
            resolution: None,
            device: String::new(),
            encoder_placement: None,
            recording: false,
            error_reason: Some("worker dropped reply".into()),
        })
    }

    pub async fn attach_recording(&self, req: AttachRecordingRequest) -> Result<EncoderPlacement, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::AttachRecording(req, tx))
            .map_err(|_| CoreError::Internal("ingest worker gone".into()))?;
        rx.await.map_err(|_| CoreError::Internal("ingest worker dropped reply".into()))?
    }

    pub async fn detach_recording(&self) -> Result<(), CoreError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::DetachRecording(tx))
            .map_err(|_| CoreError::Internal("ingest worker gone".into()))?;
        rx.await.map_err(|_| CoreError::Internal("ingest worker dropped reply".into()))?
    }

    pub async fn rotate_recording(&self) -> Result<u32, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::RotateRecording(tx))
            .map_err(|_| CoreError::Internal("ingest worker gone".into()))?;
        rx.await.map_err(|_| CoreError::Internal("ingest worker dropped reply".into()))?
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

/// Spawns the actor task and returns a handle to it.
pub fn spawn(
    camera: CameraConfig,
    media_server: MediaServerConfig,
    vpu: Arc<VpuBudget>,
    events: Arc<EventBus>,
    test_mode: bool,
) -> IngestHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let camera_id = camera.id.clone();
    let worker = IngestWorker {
        camera,
        media_server,
        vpu,
        events,
        test_mode,
        state: IngestState::Disabled,
        resolution: None,
        pipeline: None,
        error_reason: None,
        signal_loss_since: None,
        last_stable_since: Instant::now(),
        backoff: BACKOFF_INITIAL,
        current_session_id: None,
    };
    tokio::spawn(worker.run(rx));
    IngestHandle { camera_id, tx }
}

struct IngestWorker {
    camera: CameraConfig,
    media_server: MediaServerConfig,
    vpu: Arc<VpuBudget>,
    events: Arc<EventBus>,
    test_mode: bool,
    state: IngestState,
    resolution: Option<Resolution>,
    pipeline: Option<IngestPipeline>,
    error_reason: Option<String>,
    signal_loss_since: Option<Instant>,
    last_stable_since: Instant,
    backoff: Duration,
    current_session_id: Option<String>,
}

impl IngestWorker {
    #[instrument(skip_all, fields(camera = %self.camera.id))]
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let (bus_tx, mut bus_rx) = mpsc::unbounded_channel::<BusEvent>();
        let mut pending_bus_tx = Some(bus_tx);

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        None | Some(Command::Shutdown) => {
                            self.teardown();
                            return;
                        }
                        Some(Command::Enable) => self.handle_enable(&mut pending_bus_tx).await,
                        Some(Command::Disable) => self.handle_disable(),
                        Some(Command::SignalUpdate(res)) => self.handle_signal_update(res, &mut pending_bus_tx).await,
                        Some(Command::Describe(reply)) => {
                            let _ = reply.send(self.snapshot());
                        }
                        Some(Command::AttachRecording(req, reply)) => {
                            let result = self.handle_attach_recording(req).await;
                            let _ = reply.send(result);
                        }
                        Some(Command::DetachRecording(reply)) => {
                            let result = self.handle_detach_recording();
                            let _ = reply.send(result);
                        }
                        Some(Command::RotateRecording(reply)) => {
                            let result = self.handle_rotate_recording();
                            let _ = reply.send(result);
                        }
                    }
                }
                Some(event) = bus_rx.recv() => {
                    self.handle_bus_event(event, &mut pending_bus_tx).await;
                }
            }
        }
    }

    fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            camera_id: self.camera.id.clone(),
            state: self.state,
            has_signal: self.resolution.is_some(),
            resolution: self.resolution,
            device: self.camera.device.clone(),
            encoder_placement: self
                .pipeline
                .as_ref()
                .map(|p| p.recording_placement().unwrap_or(p.stream_placement)),
            recording: self.pipeline.as_ref().map(|p| p.is_recording()).unwrap_or(false),
            error_reason: self.error_reason.clone(),
        }
    }

    async fn handle_enable(&mut self, bus_tx: &mut Option<mpsc::UnboundedSender<BusEvent>>) {
        if self.state != IngestState::Disabled {
            return;
        }
        self.state = IngestState::Idle;
        self.try_start(bus_tx).await;
    }

    fn handle_disable(&mut self) {
        self.teardown();
        self.state = IngestState::Disabled;
    }

    async fn handle_signal_update(&mut self, resolution: Option<Resolution>, bus_tx: &mut Option<mpsc::UnboundedSender<BusEvent>>) {
        if self.state == IngestState::Disabled {
            return;
        }
        match (self.state, resolution) {
            (IngestState::Streaming, None) => {
                self.teardown();
                self.state = IngestState::NoSignal;
                self.signal_loss_since = Some(Instant::now());
                self.events.publish(Event::new(EventPayload::SignalLost {
                    camera_id: self.camera.id.clone(),
                }));
            }
            (IngestState::Streaming, Some(new_res)) if Some(new_res) != self.resolution => {
                info!(camera = %self.camera.id, ?new_res, "resolution changed, rebuilding pipeline");
                let old_res = self.resolution;
                self.teardown();
                self.resolution = Some(new_res);
                self.try_start(bus_tx).await;
                self.events.publish(Event::new(EventPayload::ResolutionChanged {
                    camera_id: self.camera.id.clone(),
                    from: old_res.map(|r| (r.width, r.height)),
                    to: (new_res.width, new_res.height),
                }));
            }
            (IngestState::NoSignal, Some(new_res)) | (IngestState::Idle, Some(new_res)) => {
                let outage = self
                    .signal_loss_since
                    .map(|since| since.elapsed().as_secs_f64())
                    .unwrap_or(0.0);
                self.resolution = Some(new_res);
                self.try_start(bus_tx).await;
                self.events.publish(Event::new(EventPayload::SignalRecovered {
                    camera_id: self.camera.id.clone(),
                    outage_seconds: outage,
                }));
                self.signal_loss_since = None;
            }
            (IngestState::Error, Some(new_res)) => {
                self.resolution = Some(new_res);
                self.try_start(bus_tx).await;
            }
            _ => {}
        }
    }

    /// Builds the pipeline and waits for the streaming branch to emit its
    /// first buffer, bounded by `PREROLL_TIMEOUT` (spec §4.4 start-up
    /// ordering). A pipeline that reaches PLAYING but never prerolls (e.g. a
    /// stalled RTSP TCP connect) is torn down and retried with the same
    /// backoff used for bus-reported transient errors, rather than being
    /// reported `Streaming` forever.
    async fn try_start(&mut self, bus_tx: &mut Option<mpsc::UnboundedSender<BusEvent>>) {
        let Some(resolution) = self.resolution else {
            self.state = IngestState::NoSignal;
            return;
        };

        loop {
            let Some(tx) = bus_tx.take() else {
                warn!(camera = %self.camera.id, "bus channel already consumed, cannot rebuild");
                return;
            };

            let build_result =
                IngestPipeline::build(&self.camera, resolution, &self.media_server, tx.clone(), self.test_mode);
            *bus_tx = Some(tx);

            let (pipeline, preroll_rx) = match build_result {
                Ok(built) => built,
                Err(e) => {
                    error!(camera = %self.camera.id, error = %e, "pipeline build failed");
                    self.state = IngestState::Error;
                    self.error_reason = Some(e.to_string());
                    self.events.publish(Event::new(EventPayload::EncoderDegraded {
                        camera_id: self.camera.id.clone(),
                        reason: e.to_string(),
                    }));
                    return;
                }
            };

            match tokio::time::timeout(PREROLL_TIMEOUT, preroll_rx).await {
                Ok(Ok(())) => {
                    self.pipeline = Some(pipeline);
                    self.state = IngestState::Streaming;
                    self.error_reason = None;
                    self.last_stable_since = Instant::now();
                    self.backoff = BACKOFF_INITIAL;
                    self.events.publish(Event::new(EventPayload::IngestStateChanged {
                        camera_id: self.camera.id.clone(),
                        state: "streaming".into(),
                    }));
                    return;
                }
                _ => {
                    let reason = CoreError::PrerollTimeout.to_string();
                    warn!(camera = %self.camera.id, backoff_ms = self.backoff.as_millis(), "preroll timed out, restarting with backoff");
                    pipeline.stop();
                    self.state = IngestState::Error;
                    self.error_reason = Some(reason.clone());
                    self.events.publish(Event::new(EventPayload::EncoderDegraded {
                        camera_id: self.camera.id.clone(),
                        reason,
                    }));
                    let backoff = self.backoff;
                    tokio::time::sleep(backoff).await;
                    self.backoff = (self.backoff * 2).min(BACKOFF_CAP);
                }
            }
        }
    }

    async fn handle_bus_event(&mut self, event: BusEvent, bus_tx: &mut Option<mpsc::UnboundedSender<BusEvent>>) {
        match event {
            BusEvent::Fatal(reason) => {
                error!(camera = %self.camera.id, %reason, "fatal pipeline error");
                self.teardown();
                self.state = IngestState::Error;
                self.error_reason = Some(reason);
            }
            BusEvent::Transient(reason) => {
                warn!(camera = %self.camera.id, %reason, backoff_ms = self.backoff.as_millis(), "transient pipeline error, restarting with backoff");
                self.teardown();
                self.state = IngestState::Error;
                self.error_reason = Some(reason);
                let backoff = self.backoff;
                tokio::time::sleep(backoff).await;
                self.backoff = (self.backoff * 2).min(BACKOFF_CAP);
                self.try_start(bus_tx).await;
            }
            BusEvent::Eos => {
                warn!(camera = %self.camera.id, "unexpected EOS on ingest pipeline");
            }
            BusEvent::StateChanged { .. } => {
                if self.last_stable_since.elapsed() > BACKOFF_RESET_AFTER_STABLE {
                    self.backoff = BACKOFF_INITIAL;
                }
            }
        }
    }

    async fn handle_attach_recording(&mut self, req: AttachRecordingRequest) -> Result<EncoderPlacement, CoreError> {
        if self.state != IngestState::Streaming {
            return Err(CoreError::NoSignal(self.camera.id.clone()));
        }
        let Some(pipeline) = self.pipeline.as_mut() else {
            return Err(CoreError::NoSignal(self.camera.id.clone()));
        };
        let info = pipeline.attach_recording(&self.camera, &req.recording_cfg, &req.dir, &req.session_id, &self.vpu)?;
        self.current_session_id = Some(req.session_id.clone());
        self.events.publish(Event::new(EventPayload::RecordingStarted {
            session_id: req.session_id.clone(),
            camera_id: self.camera.id.clone(),
            file_path: req
                .dir
                .join(format!("cam{}_{}_000.{}", self.camera.id, req.session_id, req.recording_cfg.container_extension))
                .to_string_lossy()
                .into_owned(),
        }));
        Ok(info.placement)
    }

    fn handle_detach_recording(&mut self) -> Result<(), CoreError> {
        let Some(pipeline) = self.pipeline.as_mut() else {
            return Ok(());
        };
        pipeline.detach_recording()?;
        let session_id = self.current_session_id.take().unwrap_or_default();
        self.events.publish(Event::new(EventPayload::RecordingStopped {
            session_id,
            camera_id: self.camera.id.clone(),
        }));
        Ok(())
    }

    fn handle_rotate_recording(&mut self) -> Result<u32, CoreError> {
        let Some(pipeline) = self.pipeline.as_mut() else {
            return Err(CoreError::Conflict("no active pipeline".into()));
        };
        let seq = pipeline.rotate_recording()?;
        self.events.publish(Event::new(EventPayload::FileRotated {
            session_id: self.current_session_id.clone().unwrap_or_default(),
            camera_id: self.camera.id.clone(),
            file_path: String::new(),
            sequence: seq,
        }));
        Ok(seq)
    }

    fn teardown(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.stop();
        }
        self.current_session_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CodecPreference;

    fn test_camera() -> CameraConfig {
        CameraConfig {
            id: "cam0".into(),
            device: "/dev/video0".into(),
            capture_class: None,
            max_width: 1920,
            max_height: 1080,
            max_fps: 30,
            codec_preference: CodecPreference::H264,
            target_bitrate_kbps: 4000,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn describe_before_enable_reports_disabled() {
        crate::pipeline::test_gst_init();
        let handle = spawn(
            test_camera(),
            MediaServerConfig::default(),
            VpuBudget::new(4, 4),
            EventBus::new(16),
            true,
        );
        let snap = handle.describe().await;
        assert_eq!(snap.state, IngestState::Disabled);
        assert!(!snap.has_signal);
    }

    #[tokio::test]
    async fn attach_recording_without_signal_is_rejected() {
        crate::pipeline::test_gst_init();
        let handle = spawn(
            test_camera(),
            MediaServerConfig::default(),
            VpuBudget::new(4, 4),
            EventBus::new(16),
            true,
        );
        handle.enable().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = handle
            .attach_recording(AttachRecordingRequest {
                recording_cfg: RecordingConfig::default(),
                dir: std::path::PathBuf::from("/tmp"),
                session_id: "s1".into(),
            })
            .await;
        assert!(matches!(result, Err(CoreError::NoSignal(_))));
    }
}
