//! Mixer compositor pipeline (spec §4.3, §4.8):
//!
//! ```text
//! for each slot i:
//!   black_src ---------------------\
//!                                    >- input-selector.i -> scale(slot_wxh) -> queue -> compositor.sink_i
//!   dynamic_source_for(input) ------/
//! compositor(canvas,bg) -> encoder_program(software, zerolatency, baseline) -> parser -> rtspclientsink("program")
//! ```
//!
//! Scene switching rewrites compositor pad properties (xpos/ypos/width/height/
//! zorder/alpha) and flips each slot's `input-selector` active pad; it never
//! tears down the compositor or the program sink. Only a slot's *dynamic*
//! source chain is rebuilt when the camera/file/graphic bound to that slot
//! changes, and only while the slot's selector is pointed at the black branch,
//! so the compositor output never glitches.

use std::sync::Arc;
use std::time::Instant;

use gstreamer as gst;
use gstreamer::prelude::*;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::MediaServerConfig;
use crate::error::CoreError;
use crate::pipeline::{setup_bus_watch, BusEvent};
use crate::raii_guards::PipelineElement;
use crate::scenes::MixerInput;

pub struct MixerSlot {
    pub index: u32,
    input_selector: gst::Element,
    compositor_pad: gst::Pad,
    black_pad: gst::Pad,
    test_pattern_pad: gst::Pad,
    dynamic_pad: gst::Pad,
    dynamic_chain: Vec<PipelineElement>,
    pub bound_input: Option<MixerInput>,
}

pub struct MixerPipeline {
    pub pipeline: gst::Pipeline,
    pub compositor: gst::Element,
    pub slots: Vec<MixerSlot>,
    /// Updated by a buffer probe on the program sink's sink pad; the mixer's
    /// watchdog (spec §4.8: "no keyframe in 10s ... auto-restart once")
    /// polls this instead of parsing bitstream NAL units.
    pub last_output_at: Arc<Mutex<Instant>>,
    pub _bus_watch: gst::bus::BusWatchGuard,
}

impl MixerPipeline {
    pub fn build(
        canvas_width: u32,
        canvas_height: u32,
        frame_rate: u32,
        slot_count: u32,
        media_server: &MediaServerConfig,
        bitrate_kbps: u32,
        bus_tx: mpsc::UnboundedSender<BusEvent>,
    ) -> Result<Self, CoreError> {
        let pipeline = gst::Pipeline::new();

        let compositor = gst::ElementFactory::make("compositor")
            .name("program_compositor")
            .property_from_str("background", "black")
            .build()
            .map_err(|e| CoreError::PipelineBuildFailed(format!("compositor: {e}")))?;
        pipeline
            .add(&compositor)
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;

        let mut slots = Vec::with_capacity(slot_count as usize);
        for i in 0..slot_count {
            slots.push(Self::build_slot(&pipeline, &compositor, i, canvas_width, canvas_height)?);
        }

        let caps = gst::ElementFactory::make("capsfilter")
            .property(
                "caps",
                gst::Caps::builder("video/x-raw")
                    .field("width", canvas_width as i32)
                    .field("height", canvas_height as i32)
                    .field("framerate", gst::Fraction::new(frame_rate as i32, 1))
                    .build(),
            )
            .build()
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;

        let encoder = gst::ElementFactory::make("x264enc")
            .build()
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;
        encoder.set_property_from_str("tune", "zerolatency");
        encoder.set_property_from_str("speed-preset", "ultrafast");
        encoder.set_property("bitrate", bitrate_kbps);
        if encoder.has_property("profile", None) {
            encoder.set_property_from_str("profile", "baseline");
        }

        let parser = gst::ElementFactory::make("h264parse")
            .property("config-interval", -1i32)
            .build()
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;

        let rtsp_sink = gst::ElementFactory::make("rtspclientsink")
            .property(
                "location",
                format!("rtsp://{}:{}/program", media_server.rtsp_host, media_server.rtsp_port),
            )
            .property_from_str("protocols", "tcp")
            .build()
            .map_err(|e| CoreError::PipelineBuildFailed(format!("rtspclientsink: {e}")))?;

        pipeline
            .add_many([&caps, &encoder, &parser, &rtsp_sink])
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;
        gst::Element::link_many([&compositor, &caps, &encoder, &parser, &rtsp_sink])
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;

        let last_output_at = Arc::new(Mutex::new(Instant::now()));
        let rtsp_sink_pad = rtsp_sink
            .static_pad("sink")
            .ok_or_else(|| CoreError::PipelineBuildFailed("rtspclientsink has no sink pad".into()))?;
        let watchdog_clock = last_output_at.clone();
        rtsp_sink_pad.add_probe(gst::PadProbeType::BUFFER, move |_pad, _info| {
            *watchdog_clock.lock() = Instant::now();
            gst::PadProbeReturn::Ok
        });

        let bus_watch = setup_bus_watch(&pipeline, "mixer".to_string(), bus_tx)
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| CoreError::PipelineBuildFailed(format!("set PLAYING: {e}")))?;

        info!(slots = slot_count, canvas_width, canvas_height, "mixer pipeline playing");

        Ok(Self {
            pipeline,
            compositor,
            slots,
            last_output_at,
            _bus_watch: bus_watch,
        })
    }

    /// Seconds since the program sink last saw a buffer; the mixer actor
    /// polls this for the "no output in 10s" watchdog (spec §4.8).
    pub fn seconds_since_last_buffer(&self) -> f64 {
        self.last_output_at.lock().elapsed().as_secs_f64()
    }

    /// Builds one compositor slot with three permanently-wired
    /// `input-selector` branches: black (the resting/placeholder state),
    /// SMPTE bars (`MixerInput::TestPattern`), and one reusable "dynamic"
    /// sink pad that `rebind` relinks to a fresh decode chain per camera/
    /// file/graphic/guest input. Only the dynamic branch's upstream
    /// elements are ever added or removed; the selector's pad identities
    /// are stable for the slot's whole lifetime.
    fn build_slot(
        pipeline: &gst::Pipeline,
        compositor: &gst::Element,
        index: u32,
        canvas_width: u32,
        canvas_height: u32,
    ) -> Result<MixerSlot, CoreError> {
        let selector = gst::ElementFactory::make("input-selector")
            .name(format!("slot_selector_{index}"))
            .build()
            .map_err(|e| CoreError::PipelineBuildFailed(format!("input-selector: {e}")))?;
        pipeline
            .add(&selector)
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;

        let black_pad = Self::build_pattern_branch(pipeline, &selector, index, "black", canvas_width, canvas_height)?;
        let test_pattern_pad = Self::build_pattern_branch(pipeline, &selector, index, "smpte", canvas_width, canvas_height)?;
        let dynamic_pad = selector
            .request_pad_simple("sink_%u")
            .ok_or_else(|| CoreError::PipelineBuildFailed(format!("input-selector refused dynamic pad for slot {index}")))?;

        selector.set_property("active-pad", &black_pad);

        let scale = gst::ElementFactory::make("videoscale")
            .build()
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;
        let queue = gst::ElementFactory::make("queue")
            .build()
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;
        crate::pipeline::configure_leaky_queue(&queue, 1);

        pipeline
            .add_many([&scale, &queue])
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;
        gst::Element::link_many([&selector, &scale, &queue])
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;

        let compositor_pad = compositor
            .request_pad_simple("sink_%u")
            .ok_or_else(|| CoreError::PipelineBuildFailed(format!("compositor refused sink pad for slot {index}")))?;
        let queue_src = queue
            .static_pad("src")
            .ok_or_else(|| CoreError::PipelineBuildFailed("slot queue has no src pad".into()))?;
        queue_src
            .link(&compositor_pad)
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;

        compositor_pad.set_property("xpos", 0i32);
        compositor_pad.set_property("ypos", 0i32);
        compositor_pad.set_property("width", canvas_width as i32);
        compositor_pad.set_property("height", canvas_height as i32);
        compositor_pad.set_property("zorder", index);
        compositor_pad.set_property("alpha", 0.0f64);

        Ok(MixerSlot {
            index,
            input_selector: selector,
            compositor_pad,
            black_pad,
            test_pattern_pad,
            dynamic_pad,
            dynamic_chain: Vec::new(),
            bound_input: None,
        })
    }

    fn build_pattern_branch(
        pipeline: &gst::Pipeline,
        selector: &gst::Element,
        index: u32,
        pattern: &str,
        canvas_width: u32,
        canvas_height: u32,
    ) -> Result<gst::Pad, CoreError> {
        let src = gst::ElementFactory::make("videotestsrc")
            .name(format!("slot_{index}_{pattern}_src"))
            .property("is-live", true)
            .property_from_str("pattern", pattern)
            .build()
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;
        let caps = gst::ElementFactory::make("capsfilter")
            .property(
                "caps",
                gst::Caps::builder("video/x-raw")
                    .field("width", canvas_width as i32)
                    .field("height", canvas_height as i32)
                    .build(),
            )
            .build()
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;
        pipeline
            .add_many([&src, &caps])
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;
        gst::Element::link_many([&src, &caps])
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;

        let sink_pad = selector
            .request_pad_simple("sink_%u")
            .ok_or_else(|| CoreError::PipelineBuildFailed(format!("input-selector refused {pattern} pad for slot {index}")))?;
        let caps_src = caps
            .static_pad("src")
            .ok_or_else(|| CoreError::PipelineBuildFailed(format!("{pattern} capsfilter has no src pad")))?;
        caps_src
            .link(&sink_pad)
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;
        Ok(sink_pad)
    }

    /// Rewrites this slot's compositor geometry/stacking/opacity without
    /// touching the pipeline graph (spec §4.8 CUT semantics when applied to
    /// all slots in one batch by the caller).
    pub fn set_slot_geometry(&self, index: u32, x: i32, y: i32, width: i32, height: i32, zorder: u32, alpha: f64) {
        if let Some(slot) = self.slots.get(index as usize) {
            slot.compositor_pad.set_property("xpos", x);
            slot.compositor_pad.set_property("ypos", y);
            slot.compositor_pad.set_property("width", width);
            slot.compositor_pad.set_property("height", height);
            slot.compositor_pad.set_property("zorder", zorder);
            slot.compositor_pad.set_property("alpha", alpha);
        }
    }

    /// Rewrites only a slot's opacity, used by the MIX/AUTO crossfade ramp
    /// (spec §4.8) where geometry is already settled and only `alpha` steps
    /// every tick.
    pub fn set_slot_alpha(&self, index: u32, alpha: f64) {
        if let Some(slot) = self.slots.get(index as usize) {
            slot.compositor_pad.set_property("alpha", alpha.clamp(0.0, 1.0));
        }
    }

    pub fn slot_count(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Tears the whole compositor pipeline (all slots, the encoder and the
    /// program sink) down to NULL. Called on mixer stop or watchdog restart.
    pub fn stop(self) {
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!(error = %e, "failed to stop mixer pipeline cleanly");
        }
    }
}

impl MixerSlot {
    /// Rebinds this slot to a new input. Tears down any previous dynamic
    /// source chain, builds the new one if needed, and flips the selector
    /// only once the new chain has reached the pipeline's state — so the
    /// compositor never sees a half-built branch. `None` (a missing or
    /// unresolvable input, spec §3 MixerState invariant) and
    /// `MixerInput::TestPattern` both park the slot on one of the two
    /// permanent branches without touching the dynamic chain at all.
    pub fn rebind(
        &mut self,
        pipeline: &gst::Pipeline,
        input: Option<MixerInput>,
        source_uri: Option<String>,
    ) -> Result<(), CoreError> {
        // Flip to black first so tearing down any previous dynamic chain is glitch-free.
        self.input_selector.set_property("active-pad", &self.black_pad);
        for element in self.dynamic_chain.drain(..) {
            drop(element);
        }

        let Some(input) = input else {
            self.bound_input = None;
            return Ok(());
        };

        if matches!(input, MixerInput::TestPattern) {
            self.input_selector.set_property("active-pad", &self.test_pattern_pad);
            self.bound_input = Some(input);
            return Ok(());
        }

        let Some(uri) = source_uri else {
            warn!(slot = self.index, "no resolvable source for input, staying on black");
            self.bound_input = None;
            return Ok(());
        };

        let decodebin = gst::ElementFactory::make("uridecodebin")
            .property("uri", &uri)
            .build()
            .map_err(|e| CoreError::PipelineBuildFailed(format!("uridecodebin: {e}")))?;
        let videoconvert = gst::ElementFactory::make("videoconvert")
            .build()
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;

        pipeline
            .add_many([&decodebin, &videoconvert])
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;

        let convert_src = videoconvert
            .static_pad("src")
            .ok_or_else(|| CoreError::PipelineBuildFailed("videoconvert has no src pad".into()))?;
        convert_src
            .link(&self.dynamic_pad)
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;

        let looped = matches!(&input, MixerInput::File { looped: true, .. });
        if looped {
            let weak_decodebin = decodebin.downgrade();
            convert_src.add_probe(gst::PadProbeType::EVENT_DOWNSTREAM, move |pad, info| {
                let Some(gst::PadProbeData::Event(event)) = &info.data else {
                    return gst::PadProbeReturn::Ok;
                };
                if event.type_() != gst::EventType::Eos {
                    return gst::PadProbeReturn::Ok;
                }
                let Some(decodebin) = weak_decodebin.upgrade() else {
                    return gst::PadProbeReturn::Ok;
                };
                let _ = decodebin.seek_simple(
                    gst::SeekFlags::FLUSH,
                    gst::ClockTime::ZERO,
                );
                let _ = pad;
                gst::PadProbeReturn::Drop
            });
        }

        let videoconvert_weak = videoconvert.downgrade();
        decodebin.connect_pad_added(move |_dbin, pad| {
            let Some(videoconvert) = videoconvert_weak.upgrade() else { return };
            let Some(sink_pad) = videoconvert.static_pad("sink") else { return };
            if sink_pad.is_linked() {
                return;
            }
            if let Some(caps) = pad.current_caps() {
                if caps.structure(0).map(|s| s.name().starts_with("video/")).unwrap_or(false) {
                    let _ = pad.link(&sink_pad);
                }
            }
        });

        decodebin
            .sync_state_with_parent()
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;
        videoconvert
            .sync_state_with_parent()
            .map_err(|e| CoreError::PipelineBuildFailed(e.to_string()))?;

        self.input_selector.set_property("active-pad", &self.dynamic_pad);

        self.dynamic_chain.push(PipelineElement::new(
            decodebin,
            pipeline,
            format!("slot_{}_decodebin", self.index),
        ));
        self.dynamic_chain.push(PipelineElement::new(
            videoconvert,
            pipeline,
            format!("slot_{}_convert", self.index),
        ));
        self.bound_input = Some(input);
        Ok(())
    }
}
