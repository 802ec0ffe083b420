//! Ingest-dual-output pipeline (spec §4.3):
//!
//! ```text
//! source(device) -> rate(fps) -> colorspace -> scale(WxH) -> tee
//!   |- queue(leaky) -> encoder_rec(hw_or_sw, cbr, gop=fps) -> parser -> splitmuxsink (recording, dynamic)
//!   `- queue(leaky) -> encoder_stream(software, zerolatency, baseline) -> parser -> rtspclientsink (always on)
//! ```
//!
//! The streaming branch is linked statically and runs for the pipeline's
//! whole life; the recording branch is linked on `attach_recording` and torn
//! down on `detach_recording`/`rotate_recording`, so recording can start and
//! stop without perturbing the always-on preview/publish path.

use std::sync::Arc;

use gstreamer as gst;
use gstreamer::prelude::*;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::config::{CameraConfig, MediaServerConfig, RecordingConfig};
use crate::device_probe::Resolution;
use crate::error::CoreError;
use crate::pipeline::{configure_leaky_queue, make_encoder, setup_bus_watch, BusEvent, EncoderPlacement};
use crate::raii_guards::{PadGuard, PipelineElement};
use crate::vpu::{VpuBudget, VpuGuard};

const MAX_BRANCH_BUFFER_SECONDS: u64 = 2;

pub struct IngestPipeline {
    pub pipeline: gst::Pipeline,
    pub tee: gst::Element,
    pub source: gst::Element,
    pub stream_placement: EncoderPlacement,
    pub _bus_watch: gst::bus::BusWatchGuard,
    recording: Option<RecordingBranch>,
}

/// The dynamically-attached recording branch: tee -> queue -> encoder -> parser -> splitmuxsink.
struct RecordingBranch {
    tee_pad: PadGuard,
    queue: PipelineElement,
    encoder: PipelineElement,
    parser: PipelineElement,
    splitmuxsink: PipelineElement,
    vpu_guard: Option<VpuGuard>,
    placement: EncoderPlacement,
    file_sequence: u32,
}

pub struct AttachedRecordingInfo {
    pub placement: EncoderPlacement,
    pub file_sequence: u32,
}

impl IngestPipeline {
    /// Builds source -> rate -> colorspace -> scale -> tee -> streaming branch
    /// (always linked) and starts the pipeline. Does not attach a recording
    /// branch; call `attach_recording` afterwards if desired.
    /// Returns the built, PLAYING pipeline together with a one-shot receiver
    /// that fires the moment the streaming branch emits its first buffer
    /// (spec §4.4 preroll signal). The caller bounds the wait with
    /// `PREROLL_TIMEOUT` and tears down/retries on expiry.
    pub fn build(
        camera: &CameraConfig,
        resolution: Resolution,
        media_server: &MediaServerConfig,
        bus_tx: mpsc::UnboundedSender<BusEvent>,
        test_mode: bool,
    ) -> Result<(Self, oneshot::Receiver<()>), CoreError> {
        let pipeline = gst::Pipeline::new();

        let source = if test_mode {
            gst::ElementFactory::make("videotestsrc")
                .property("is-live", true)
                .property_from_str("pattern", "smpte")
                .build()
        } else {
            gst::ElementFactory::make("v4l2src")
                .property("device", &camera.device)
                .build()
        }
        .map_err(|e| CoreError::PipelineBuildFailed(format!("source: {e}")))?;

        let rate = gst::ElementFactory::make("videorate")
            .build()
            .map_err(|e| CoreError::PipelineBuildFailed(format!("videorate: {e}")))?;
        let colorspace = gst::ElementFactory::make("videoconvert")
            .build()
            .map_err(|e| CoreError::PipelineBuildFailed(format!("videoconvert: {e}")))?;
        let scale = gst::ElementFactory::make("videoscale")
            .build()
            .map_err(|e| CoreError::PipelineBuildFailed(format!("videoscale: {e}")))?;
        let caps = gst::ElementFactory::make("capsfilter")
            .property(
                "caps",
                gst::Caps::builder("video/x-raw")
                    .field("width", resolution.width as i32)
                    .field("height", resolution.height as i32)
                    .field("framerate", gst::Fraction::new(resolution.fps as i32, 1))
                    .build(),
            )
            .build()
            .map_err(|e| CoreError::PipelineBuildFailed(format!("capsfilter: {e}")))?;

        let tee = gst::ElementFactory::make("tee")
            .name(format!("tee_{}", camera.id))
            .property("allow-not-linked", true)
            .build()
            .map_err(|e| CoreError::PipelineBuildFailed(format!("tee: {e}")))?;

        pipeline
            .add_many([&source, &rate, &colorspace, &scale, &caps, &tee])
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;
        gst::Element::link_many([&source, &rate, &colorspace, &scale, &caps, &tee])
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;

        // Streaming branch: software encoder, zero-latency baseline, always on.
        let stream_queue = gst::ElementFactory::make("queue")
            .build()
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;
        configure_leaky_queue(&stream_queue, MAX_BRANCH_BUFFER_SECONDS);

        let stream_encoder = gst::ElementFactory::make("x264enc")
            .build()
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;
        stream_encoder.set_property_from_str("tune", "zerolatency");
        stream_encoder.set_property_from_str("speed-preset", "ultrafast");
        stream_encoder.set_property("bitrate", camera.target_bitrate_kbps);
        stream_encoder.set_property("key-int-max", resolution.fps.max(1));
        if stream_encoder.has_property("profile", None) {
            stream_encoder.set_property_from_str("profile", "baseline");
        }

        let stream_parser = gst::ElementFactory::make("h264parse")
            .property("config-interval", -1i32)
            .build()
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;

        let rtsp_sink = gst::ElementFactory::make("rtspclientsink")
            .property(
                "location",
                format!(
                    "rtsp://{}:{}/{}",
                    media_server.rtsp_host, media_server.rtsp_port, camera.id
                ),
            )
            .property_from_str("protocols", "tcp")
            .build()
            .map_err(|e| CoreError::PipelineBuildFailed(format!("rtspclientsink: {e}")))?;

        pipeline
            .add_many([&stream_queue, &stream_encoder, &stream_parser, &rtsp_sink])
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;
        gst::Element::link_many([&stream_queue, &stream_encoder, &stream_parser, &rtsp_sink])
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;

        let (preroll_tx, preroll_rx) = oneshot::channel::<()>();
        let preroll_tx = Arc::new(Mutex::new(Some(preroll_tx)));
        let rtsp_sink_pad = rtsp_sink
            .static_pad("sink")
            .ok_or_else(|| CoreError::PipelineBuildFailed("rtspclientsink has no sink pad".into()))?;
        rtsp_sink_pad.add_probe(gst::PadProbeType::BUFFER, move |_pad, _info| {
            if let Some(tx) = preroll_tx.lock().take() {
                let _ = tx.send(());
            }
            gst::PadProbeReturn::Ok
        });

        let tee_src_pad = tee
            .request_pad_simple("src_%u")
            .ok_or_else(|| CoreError::PipelineBuildFailed("failed to request tee pad for stream branch".into()))?;
        let queue_sink_pad = stream_queue
            .static_pad("sink")
            .ok_or_else(|| CoreError::PipelineBuildFailed("stream queue has no sink pad".into()))?;
        tee_src_pad
            .link(&queue_sink_pad)
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;

        let bus_watch = setup_bus_watch(&pipeline, format!("ingest/{}", camera.id), bus_tx)
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| CoreError::PipelineBuildFailed(format!("set PLAYING: {e}")))?;

        info!(camera = %camera.id, width = resolution.width, height = resolution.height, fps = resolution.fps, "ingest pipeline playing");

        Ok((
            Self {
                pipeline,
                tee,
                source,
                stream_placement: EncoderPlacement::Software,
                _bus_watch: bus_watch,
                recording: None,
            },
            preroll_rx,
        ))
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    /// Attaches the recording branch: requests a new tee pad, builds
    /// queue -> encoder(hw-first) -> parser -> splitmuxsink, and links it in.
    /// `path_template` must contain `{seq}`, replaced with the 3-digit file
    /// sequence number.
    pub fn attach_recording(
        &mut self,
        camera: &CameraConfig,
        recording_cfg: &RecordingConfig,
        dir: &std::path::Path,
        session_id: &str,
        vpu: &Arc<VpuBudget>,
    ) -> Result<AttachedRecordingInfo, CoreError> {
        if self.recording.is_some() {
            return Err(CoreError::BusyRecording(camera.id.clone()));
        }

        let queue = gst::ElementFactory::make("queue")
            .build()
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;
        configure_leaky_queue(&queue, MAX_BRANCH_BUFFER_SECONDS);

        let (encoder, placement, vpu_guard) = make_encoder(vpu, true)?;
        encoder.set_property_from_str("pass", "cbr");
        if encoder.has_property("bitrate", None) {
            encoder.set_property("bitrate", camera.target_bitrate_kbps);
        }
        if encoder.has_property("key-int-max", None) {
            encoder.set_property("key-int-max", 30u32);
        }

        let parser = gst::ElementFactory::make("h264parse")
            .property("config-interval", -1i32)
            .build()
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;

        let location = dir
            .join(format!(
                "cam{}_{}_{{:03}}.{}",
                camera.id, session_id, recording_cfg.container_extension
            ))
            .to_string_lossy()
            .replace("{:03}", "%03d");

        let splitmuxsink = gst::ElementFactory::make("splitmuxsink")
            .property("location", &location)
            .property(
                "max-size-time",
                gst::ClockTime::from_seconds(recording_cfg.rotate_seconds),
            )
            .property("max-size-bytes", recording_cfg.rotate_size_mb * 1024 * 1024)
            .property_from_str("muxer-factory", "matroskamux")
            .build()
            .map_err(|e| CoreError::PipelineBuildFailed(format!("splitmuxsink: {e}")))?;

        self.pipeline
            .add_many([&queue, &encoder, &parser, &splitmuxsink])
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;
        gst::Element::link_many([&queue, &encoder, &parser])
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;
        parser
            .link(&splitmuxsink)
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;

        let tee_src_pad = self
            .tee
            .request_pad_simple("src_%u")
            .ok_or_else(|| CoreError::PipelineBuildFailed("failed to request tee pad for recording branch".into()))?;
        let queue_sink_pad = queue
            .static_pad("sink")
            .ok_or_else(|| CoreError::PipelineBuildFailed("recording queue has no sink pad".into()))?;
        tee_src_pad
            .link(&queue_sink_pad)
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;

        queue
            .sync_state_with_parent()
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;
        encoder
            .sync_state_with_parent()
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;
        parser
            .sync_state_with_parent()
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;
        splitmuxsink
            .sync_state_with_parent()
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;

        let info = AttachedRecordingInfo { placement, file_sequence: 0 };

        self.recording = Some(RecordingBranch {
            tee_pad: PadGuard::new(tee_src_pad, &self.tee, format!("rec_pad_{}", camera.id)),
            queue: PipelineElement::new(queue, &self.pipeline, format!("rec_queue_{}", camera.id)),
            encoder: PipelineElement::new(encoder, &self.pipeline, format!("rec_encoder_{}", camera.id)),
            parser: PipelineElement::new(parser, &self.pipeline, format!("rec_parser_{}", camera.id)),
            splitmuxsink: PipelineElement::new(splitmuxsink, &self.pipeline, format!("rec_sink_{}", camera.id)),
            vpu_guard,
            placement,
            file_sequence: 0,
        });

        info!(camera = %camera.id, ?placement, "recording branch attached");
        Ok(info)
    }

    /// Sends EOS down the recording branch so the current file's fragment
    /// headers finalize cleanly, then drops the branch's guards (which
    /// unlink and remove the elements and release the tee pad and VPU slot).
    pub fn detach_recording(&mut self) -> Result<(), CoreError> {
        let Some(branch) = self.recording.take() else {
            return Ok(());
        };
        let sink_pad = branch
            .queue
            .element()
            .static_pad("sink")
            .ok_or_else(|| CoreError::Internal("recording queue missing sink pad on detach".into()))?;
        sink_pad.send_event(gst::event::Eos::new());
        drop(branch);
        Ok(())
    }

    /// Splits the current output file without a pipeline rebuild, using
    /// `splitmuxsink`'s `split-now` action signal (spec §4.4 rotate_recording:
    /// "atomically closes the current file and opens the next, without gap").
    pub fn rotate_recording(&mut self) -> Result<u32, CoreError> {
        let Some(branch) = self.recording.as_mut() else {
            return Err(CoreError::Conflict("no active recording leg to rotate".into()));
        };
        branch
            .splitmuxsink
            .element()
            .emit_by_name::<()>("split-now", &[]);
        branch.file_sequence += 1;
        Ok(branch.file_sequence)
    }

    pub fn recording_placement(&self) -> Option<EncoderPlacement> {
        self.recording.as_ref().map(|b| b.placement)
    }

    /// Tears the whole pipeline (streaming + recording branches) down to
    /// NULL. Called on worker stop (signal loss, resolution change, shutdown).
    pub fn stop(self) {
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!(error = %e, "failed to stop ingest pipeline cleanly");
        }
    }
}
