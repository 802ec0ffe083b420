//! C8 — Mixer: the single long-lived compositor actor (spec §4.8). Owns one
//! `MixerPipeline` for its whole running lifetime; scene switches rewrite
//! compositor pad properties and slot bindings in place rather than tearing
//! the pipeline down. Two parallel groups of physical slots ("stacks") let
//! MIX/AUTO crossfade the outgoing and incoming scene while both are
//! composited simultaneously; CUT skips the second stack entirely and
//! rewrites the active one directly, so it is visible for at most one frame.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::config::{MediaServerConfig, MixerConfig, TakeQueuePolicy};
use crate::error::CoreError;
use crate::events::{Event, EventBus, EventPayload};
use crate::pipeline::mixer::MixerPipeline;
use crate::pipeline::BusEvent;
use crate::scenes::{MixerInput, Scene, SceneStore};
use crate::vpu::{VpuBudget, VpuGuard, VpuKind};

const WATCHDOG_TICK: Duration = Duration::from_secs(1);
const WATCHDOG_TIMEOUT_SECS: f64 = 10.0;
const RAMP_TICK: Duration = Duration::from_millis(33);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Cut,
    Mix,
    Auto,
}

impl Transition {
    fn duration(self) -> Duration {
        match self {
            Transition::Cut => Duration::ZERO,
            Transition::Mix => Duration::from_millis(500),
            Transition::Auto => Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MixerState {
    Null,
    Building,
    Playing,
    Error,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MixerStatus {
    pub state: MixerState,
    pub program_scene_id: Option<String>,
    pub preview_scene_id: Option<String>,
    pub transition_in_flight: bool,
    pub tally_program: Vec<String>,
    pub tally_preview: Vec<String>,
}

enum Command {
    Start(oneshot::Sender<Result<(), CoreError>>),
    Stop(oneshot::Sender<Result<(), CoreError>>),
    SetPreviewScene(String, oneshot::Sender<Result<(), CoreError>>),
    Take(Transition, oneshot::Sender<Result<(), CoreError>>),
    Status(oneshot::Sender<MixerStatus>),
    Shutdown,
}

#[derive(Clone)]
pub struct MixerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl MixerHandle {
    pub async fn start(&self) -> Result<(), CoreError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(Command::Start(tx)).map_err(|_| CoreError::Internal("mixer actor gone".into()))?;
        rx.await.map_err(|_| CoreError::Internal("mixer actor dropped reply".into()))?
    }

    pub async fn stop(&self) -> Result<(), CoreError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(Command::Stop(tx)).map_err(|_| CoreError::Internal("mixer actor gone".into()))?;
        rx.await.map_err(|_| CoreError::Internal("mixer actor dropped reply".into()))?
    }

    pub async fn set_preview_scene(&self, scene_id: String) -> Result<(), CoreError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::SetPreviewScene(scene_id, tx))
            .map_err(|_| CoreError::Internal("mixer actor gone".into()))?;
        rx.await.map_err(|_| CoreError::Internal("mixer actor dropped reply".into()))?
    }

    pub async fn take(&self, transition: Transition) -> Result<(), CoreError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Take(transition, tx))
            .map_err(|_| CoreError::Internal("mixer actor gone".into()))?;
        rx.await.map_err(|_| CoreError::Internal("mixer actor dropped reply".into()))?
    }

    pub async fn status(&self) -> MixerStatus {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Status(tx)).is_err() {
            return MixerStatus {
                state: MixerState::Error,
                program_scene_id: None,
                preview_scene_id: None,
                transition_in_flight: false,
                tally_program: Vec::new(),
                tally_preview: Vec::new(),
            };
        }
        rx.await.unwrap_or(MixerStatus {
            state: MixerState::Error,
            program_scene_id: None,
            preview_scene_id: None,
            transition_in_flight: false,
            tally_program: Vec::new(),
            tally_preview: Vec::new(),
        })
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

/// In-flight crossfade state. `None` means the active group is the program
/// and no second stack is allocated.
struct RampState {
    target_scene: Scene,
    target_transition: Transition,
    started_at: Instant,
    duration: Duration,
    incoming_group: u8,
}

pub fn spawn(
    config: MixerConfig,
    media_server: MediaServerConfig,
    scenes: Arc<SceneStore>,
    vpu: Arc<VpuBudget>,
    events: Arc<EventBus>,
) -> MixerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let actor = MixerActor {
        config,
        media_server,
        scenes,
        vpu,
        events,
        state: MixerState::Null,
        pipeline: None,
        program_scene_id: None,
        preview_scene_id: None,
        active_group: 0,
        ramp: None,
        queued_take: None,
        restarted_once: false,
        decode_guards: Vec::new(),
    };
    tokio::spawn(actor.run(rx));
    MixerHandle { tx }
}

struct MixerActor {
    config: MixerConfig,
    media_server: MediaServerConfig,
    scenes: Arc<SceneStore>,
    vpu: Arc<VpuBudget>,
    events: Arc<EventBus>,
    state: MixerState,
    pipeline: Option<MixerPipeline>,
    program_scene_id: Option<String>,
    preview_scene_id: Option<String>,
    active_group: u8,
    ramp: Option<RampState>,
    queued_take: Option<(Transition, oneshot::Sender<Result<(), CoreError>>)>,
    restarted_once: bool,
    decode_guards: Vec<VpuGuard>,
}

impl MixerActor {
    fn max_layout_slots(&self) -> u32 {
        self.scenes
            .list()
            .iter()
            .map(|s| s.slots.len() as u32)
            .max()
            .unwrap_or(1)
            .max(1)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let (bus_tx, mut bus_rx) = mpsc::unbounded_channel::<BusEvent>();
        let mut pending_bus_tx = Some(bus_tx);
        let mut watchdog = tokio::time::interval(WATCHDOG_TICK);
        let mut ramp_ticker = tokio::time::interval(RAMP_TICK);

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        None | Some(Command::Shutdown) => {
                            self.teardown();
                            return;
                        }
                        Some(Command::Start(reply)) => {
                            let result = self.handle_start(&mut pending_bus_tx);
                            let _ = reply.send(result);
                        }
                        Some(Command::Stop(reply)) => {
                            self.teardown();
                            let _ = reply.send(Ok(()));
                        }
                        Some(Command::SetPreviewScene(scene_id, reply)) => {
                            let result = self.handle_set_preview(scene_id);
                            let _ = reply.send(result);
                        }
                        Some(Command::Take(transition, reply)) => {
                            self.handle_take(transition, reply);
                        }
                        Some(Command::Status(reply)) => {
                            let _ = reply.send(self.status());
                        }
                    }
                }
                Some(event) = bus_rx.recv() => {
                    self.handle_bus_event(event);
                }
                _ = ramp_ticker.tick(), if self.ramp.is_some() => {
                    self.step_ramp();
                }
                _ = watchdog.tick(), if self.state == MixerState::Playing => {
                    self.check_watchdog(&mut pending_bus_tx);
                }
            }
        }
    }

    fn status(&self) -> MixerStatus {
        let (program, preview) = self.tally();
        MixerStatus {
            state: self.state,
            program_scene_id: self.program_scene_id.clone(),
            preview_scene_id: self.preview_scene_id.clone(),
            transition_in_flight: self.ramp.is_some(),
            tally_program: program.into_iter().collect(),
            tally_preview: preview.into_iter().collect(),
        }
    }

    /// Cameras referenced by the program scene (red) and cameras referenced
    /// only by the preview scene (green), per spec §4.8 tally semantics.
    fn tally(&self) -> (HashSet<String>, HashSet<String>) {
        let camera_ids_of = |scene_id: &Option<String>| -> HashSet<String> {
            scene_id
                .as_ref()
                .and_then(|id| self.scenes.get(id))
                .map(|scene| {
                    scene
                        .slots
                        .iter()
                        .filter(|s| s.visible)
                        .filter_map(|s| match &s.input_ref {
                            MixerInput::Camera { id } => Some(id.clone()),
                            _ => None,
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        let program = camera_ids_of(&self.program_scene_id);
        let preview = camera_ids_of(&self.preview_scene_id)
            .difference(&program)
            .cloned()
            .collect();
        (program, preview)
    }

    fn handle_start(&mut self, bus_tx: &mut Option<mpsc::UnboundedSender<BusEvent>>) -> Result<(), CoreError> {
        if self.state == MixerState::Playing {
            return Ok(());
        }
        let Some(tx) = bus_tx.take() else {
            return Err(CoreError::Internal("mixer bus channel already consumed".into()));
        };
        self.state = MixerState::Building;

        let default_scene = self
            .scenes
            .get(&self.config.default_scene_id)
            .ok_or_else(|| CoreError::ConfigInvalid(format!("default scene {} not found", self.config.default_scene_id)))?;

        let slot_count = self.max_layout_slots() * 2;
        let pipeline = MixerPipeline::build(
            self.config.canvas_width,
            self.config.canvas_height,
            self.config.frame_rate,
            slot_count,
            &self.media_server,
            self.config.target_bitrate_kbps,
            tx.clone(),
        );
        let pipeline = match pipeline {
            Ok(p) => p,
            Err(e) => {
                *bus_tx = Some(tx);
                self.state = MixerState::Error;
                return Err(e);
            }
        };
        *bus_tx = Some(tx);

        // Spec §4.8 start(): acquire one VPU decode slot per camera input referenced by any scene.
        let camera_ids: HashSet<String> = self
            .scenes
            .list()
            .iter()
            .flat_map(|s| s.slots.iter())
            .filter_map(|s| match &s.input_ref {
                MixerInput::Camera { id } => Some(id.clone()),
                _ => None,
            })
            .collect();
        let mut decode_guards = Vec::new();
        for _ in &camera_ids {
            if let Some(guard) = self.vpu.try_acquire(VpuKind::Decode, 1) {
                decode_guards.push(guard);
            } else {
                warn!("VPU decode budget exhausted building mixer, compositing will still proceed");
            }
        }
        self.decode_guards = decode_guards;

        self.pipeline = Some(pipeline);
        self.apply_scene_in_place(0, &default_scene);
        self.program_scene_id = Some(default_scene.scene_id.clone());
        self.preview_scene_id = Some(default_scene.scene_id.clone());
        self.active_group = 0;
        self.restarted_once = false;
        self.state = MixerState::Playing;
        info!(scene = %default_scene.scene_id, "mixer playing");
        Ok(())
    }

    fn handle_set_preview(&mut self, scene_id: String) -> Result<(), CoreError> {
        if self.state != MixerState::Playing {
            return Err(CoreError::Conflict("mixer is not playing".into()));
        }
        if self.scenes.get(&scene_id).is_none() {
            return Err(CoreError::NotFound(format!("scene {scene_id}")));
        }
        self.preview_scene_id = Some(scene_id);
        Ok(())
    }

    fn handle_take(&mut self, transition: Transition, reply: oneshot::Sender<Result<(), CoreError>>) {
        if self.state != MixerState::Playing {
            let _ = reply.send(Err(CoreError::Conflict("mixer is not playing".into())));
            return;
        }
        if self.ramp.is_some() {
            match self.config.take_queue_policy {
                TakeQueuePolicy::Reject => {
                    let _ = reply.send(Err(CoreError::Conflict("a transition is already in flight".into())));
                }
                TakeQueuePolicy::Queue => {
                    if self.queued_take.is_some() {
                        let _ = reply.send(Err(CoreError::Conflict("a transition is already queued".into())));
                    } else {
                        self.queued_take = Some((transition, reply));
                    }
                }
            }
            return;
        }
        let result = self.begin_transition(transition);
        let _ = reply.send(result);
    }

    fn begin_transition(&mut self, transition: Transition) -> Result<(), CoreError> {
        let Some(preview_id) = self.preview_scene_id.clone() else {
            return Err(CoreError::Conflict("no preview scene selected".into()));
        };
        let scene = self
            .scenes
            .get(&preview_id)
            .ok_or_else(|| CoreError::NotFound(format!("scene {preview_id}")))?;

        if transition == Transition::Cut {
            self.apply_scene_in_place(self.active_group, &scene);
            self.program_scene_id = Some(scene.scene_id.clone());
            self.emit_transition_completed("cut");
            return Ok(());
        }

        let incoming_group = 1 - self.active_group;
        self.apply_scene_to_group(incoming_group, &scene, 0.0);
        self.ramp = Some(RampState {
            target_scene: scene,
            target_transition: transition,
            started_at: Instant::now(),
            duration: transition.duration(),
            incoming_group,
        });
        Ok(())
    }

    fn step_ramp(&mut self) {
        let max_slots = self.max_layout_slots();
        let Some(ramp) = self.ramp.as_ref() else { return };
        let elapsed = ramp.started_at.elapsed();
        let progress = if ramp.duration.is_zero() {
            1.0
        } else {
            (elapsed.as_secs_f64() / ramp.duration.as_secs_f64()).min(1.0)
        };
        let outgoing_offset = group_offset(1 - ramp.incoming_group, max_slots);
        let incoming_offset = group_offset(ramp.incoming_group, max_slots);

        let Some(pipeline) = self.pipeline.as_ref() else { return };

        for i in 0..max_slots {
            let outgoing_alpha = 1.0 - progress;
            pipeline.set_slot_alpha(outgoing_offset + i, outgoing_alpha.clamp(0.0, 1.0));
        }
        for (i, slot) in ramp.target_scene.slots.iter().enumerate().take(max_slots as usize) {
            if !slot.visible {
                continue;
            }
            pipeline.set_slot_alpha(incoming_offset + i as u32, slot.opacity * progress);
        }

        if progress >= 1.0 {
            self.finish_ramp();
        }
    }

    fn finish_ramp(&mut self) {
        let Some(ramp) = self.ramp.take() else { return };
        let outgoing_group = 1 - ramp.incoming_group;
        self.clear_group(outgoing_group);
        self.active_group = ramp.incoming_group;
        self.program_scene_id = Some(ramp.target_scene.scene_id.clone());
        self.emit_transition_completed(match ramp.target_transition {
            Transition::Mix => "mix",
            Transition::Auto => "auto",
            Transition::Cut => "cut",
        });

        if let Some((transition, reply)) = self.queued_take.take() {
            let result = self.begin_transition(transition);
            let _ = reply.send(result);
        }
    }

    fn emit_transition_completed(&self, transition: &str) {
        let (program, preview) = self.tally();
        self.events.publish(Event::new(EventPayload::MixerTransitionCompleted {
            scene_id: self.program_scene_id.clone().unwrap_or_default(),
            transition: transition.to_string(),
        }));
        self.events.publish(Event::new(EventPayload::TallyChanged {
            program: program.into_iter().collect(),
            preview: preview.into_iter().collect(),
        }));
    }

    /// Rewrites every physical slot in `group` to match `scene`'s layout in
    /// one pass, at a fixed `alpha_override` (used for the instantaneous CUT
    /// path and for seeding a fresh incoming stack at alpha 0).
    fn apply_scene_to_group(&mut self, group: u8, scene: &Scene, alpha_override: f64) {
        let max_slots = self.max_layout_slots();
        let offset = group as u32 * max_slots;
        let Some(pipeline) = self.pipeline.as_mut() else { return };

        for i in 0..max_slots {
            let physical = offset + i;
            if let Some(slot) = scene.slots.get(i as usize) {
                let uri = resolve_source_uri(&slot.input_ref, &self.media_server, &self.config);
                if let Some(p_slot) = pipeline.slots.get_mut(physical as usize) {
                    if let Err(e) = p_slot.rebind(&pipeline.pipeline, Some(slot.input_ref.clone()), uri) {
                        warn!(slot = physical, error = %e, "failed to rebind mixer slot, leaving black");
                    }
                }
                let alpha = if slot.visible { alpha_override.max(0.0).min(slot.opacity) } else { 0.0 };
                pipeline.set_slot_geometry(
                    physical,
                    slot.x as i32,
                    slot.y as i32,
                    slot.width as i32,
                    slot.height as i32,
                    slot.z_order,
                    alpha,
                );
            } else {
                if let Some(p_slot) = pipeline.slots.get_mut(physical as usize) {
                    let _ = p_slot.rebind(&pipeline.pipeline, None, None);
                }
                pipeline.set_slot_alpha(physical, 0.0);
            }
        }
    }

    /// CUT path: apply directly to the currently-active group with full
    /// target opacity, no ramp.
    fn apply_scene_in_place(&mut self, group: u8, scene: &Scene) {
        self.apply_scene_to_group(group, scene, 1.0);
    }

    fn clear_group(&mut self, group: u8) {
        let max_slots = self.max_layout_slots();
        let offset = group as u32 * max_slots;
        let Some(pipeline) = self.pipeline.as_mut() else { return };
        for i in 0..max_slots {
            if let Some(p_slot) = pipeline.slots.get_mut((offset + i) as usize) {
                let _ = p_slot.rebind(&pipeline.pipeline, None, None);
            }
            pipeline.set_slot_alpha(offset + i, 0.0);
        }
    }

    fn handle_bus_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::Fatal(reason) => {
                warn!(%reason, "fatal mixer pipeline error");
                self.state = MixerState::Error;
            }
            BusEvent::Transient(reason) => {
                warn!(%reason, "transient mixer pipeline error");
            }
            BusEvent::Eos => warn!("unexpected EOS on mixer pipeline"),
            BusEvent::StateChanged { .. } => {}
        }
    }

    /// Spec §4.8: "a watchdog thread monitors the program output for
    /// keyframe production; if none observed within 10s of PLAYING, performs
    /// one auto-restart; persistent failure surfaces as ERROR."
    fn check_watchdog(&mut self, bus_tx: &mut Option<mpsc::UnboundedSender<BusEvent>>) {
        let Some(pipeline) = self.pipeline.as_ref() else { return };
        if pipeline.seconds_since_last_buffer() < WATCHDOG_TIMEOUT_SECS {
            return;
        }
        if self.restarted_once {
            warn!("mixer watchdog timeout after prior auto-restart, surfacing ERROR");
            self.state = MixerState::Error;
            return;
        }
        warn!("mixer watchdog detected no program output for 10s, restarting once");
        self.restarted_once = true;
        let program_id = self.program_scene_id.clone();
        self.teardown_pipeline_only();
        if let Err(e) = self.handle_start(bus_tx) {
            warn!(error = %e, "mixer auto-restart failed");
            self.state = MixerState::Error;
            return;
        }
        if let Some(scene_id) = program_id {
            if let Some(scene) = self.scenes.get(&scene_id) {
                self.apply_scene_in_place(self.active_group, &scene);
                self.program_scene_id = Some(scene_id.clone());
                self.preview_scene_id = Some(scene_id);
            }
        }
    }

    fn teardown_pipeline_only(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.stop();
        }
        self.decode_guards.clear();
        self.ramp = None;
    }

    fn teardown(&mut self) {
        self.teardown_pipeline_only();
        self.state = MixerState::Null;
    }
}

fn group_offset(group: u8, max_slots: u32) -> u32 {
    group as u32 * max_slots
}

/// Resolves a `MixerInput` to a URI `uridecodebin` can open, or `None` when
/// the input has no dynamic source (a missing/unresolvable input renders as
/// black, per spec §4.8 failure semantics; `TestPattern` is handled entirely
/// by the pipeline's permanent SMPTE branch).
fn resolve_source_uri(input: &MixerInput, media_server: &MediaServerConfig, config: &MixerConfig) -> Option<String> {
    match input {
        MixerInput::Camera { id } => Some(format!(
            "rtsp://{}:{}/{}",
            media_server.rtsp_host, media_server.rtsp_port, id
        )),
        MixerInput::File { path, .. } => Some(format!("file://{path}")),
        MixerInput::Graphic { id } => Some(format!("file://{}/{}.png", config.graphics_root, id)),
        MixerInput::Guest { slot_id } => Some(format!(
            "rtsp://{}:{}/guest_{}",
            media_server.rtsp_host, media_server.rtsp_port, slot_id
        )),
        MixerInput::TestPattern => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenes::SceneStore;

    fn test_store() -> Arc<SceneStore> {
        Arc::new(SceneStore::with_defaults(640, 360, 30, &["cam0".to_string(), "cam1".to_string()]))
    }

    fn test_config() -> MixerConfig {
        MixerConfig {
            canvas_width: 640,
            canvas_height: 360,
            frame_rate: 30,
            default_scene_id: "quad".to_string(),
            ..MixerConfig::default()
        }
    }

    #[tokio::test]
    async fn start_then_status_reports_playing_on_default_scene() {
        crate::pipeline::test_gst_init();
        let handle = spawn(
            test_config(),
            MediaServerConfig::default(),
            test_store(),
            VpuBudget::new(4, 4),
            EventBus::new(16),
        );
        handle.start().await.unwrap();
        let status = handle.status().await;
        assert_eq!(status.state, MixerState::Playing);
        assert_eq!(status.program_scene_id.as_deref(), Some("quad"));
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn cut_transition_updates_program_scene_immediately() {
        crate::pipeline::test_gst_init();
        let handle = spawn(
            test_config(),
            MediaServerConfig::default(),
            test_store(),
            VpuBudget::new(4, 4),
            EventBus::new(16),
        );
        handle.start().await.unwrap();
        handle.set_preview_scene("fullscreen_cam0".to_string()).await.unwrap();
        handle.take(Transition::Cut).await.unwrap();
        let status = handle.status().await;
        assert_eq!(status.program_scene_id.as_deref(), Some("fullscreen_cam0"));
        assert!(!status.transition_in_flight);
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn mix_transition_settles_after_its_duration() {
        crate::pipeline::test_gst_init();
        let handle = spawn(
            test_config(),
            MediaServerConfig::default(),
            test_store(),
            VpuBudget::new(4, 4),
            EventBus::new(16),
        );
        handle.start().await.unwrap();
        handle.set_preview_scene("fullscreen_cam1".to_string()).await.unwrap();
        handle.take(Transition::Mix).await.unwrap();
        assert!(handle.status().await.transition_in_flight);
        tokio::time::sleep(Duration::from_millis(600)).await;
        let status = handle.status().await;
        assert!(!status.transition_in_flight);
        assert_eq!(status.program_scene_id.as_deref(), Some("fullscreen_cam1"));
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn second_take_rejected_by_default_queue_policy_depth() {
        crate::pipeline::test_gst_init();
        let handle = spawn(
            test_config(),
            MediaServerConfig::default(),
            test_store(),
            VpuBudget::new(4, 4),
            EventBus::new(16),
        );
        handle.start().await.unwrap();
        handle.set_preview_scene("fullscreen_cam0".to_string()).await.unwrap();
        handle.take(Transition::Auto).await.unwrap();
        handle.set_preview_scene("fullscreen_cam1".to_string()).await.unwrap();
        // The first ramp (1000ms) is still in flight; this take fills the
        // single queue slot. Spawn it so we can probe the still-full queue
        // before its reply (deferred until the first ramp finishes) arrives.
        let queued_handle = handle.clone();
        let queued = tokio::spawn(async move { queued_handle.take(Transition::Auto).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let rejected = handle.take(Transition::Auto).await;
        assert!(matches!(rejected, Err(CoreError::Conflict(_))));
        assert!(queued.await.unwrap().is_ok());
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn take_without_playing_mixer_is_conflict() {
        let handle = spawn(
            test_config(),
            MediaServerConfig::default(),
            test_store(),
            VpuBudget::new(4, 4),
            EventBus::new(16),
        );
        let result = handle.take(Transition::Cut).await;
        assert!(matches!(result, Err(CoreError::Conflict(_))));
    }
}
