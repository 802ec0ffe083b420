//! C3 — Pipeline Builder: pure(ish) functions from a spec to a built GStreamer
//! pipeline (spec §4.3). `ingest` builds the per-camera dual-output pipeline,
//! `mixer` builds the single long-lived compositor pipeline. Shared helpers
//! (leaky queue configuration, bus-message classification) live here.

pub mod ingest;
pub mod mixer;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer::MessageView;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::vpu::VpuKind;

/// Where an encoder instance actually runs. Hardware encoder plugins are
/// consumed as opaque named elements (spec §1 Non-goals); this crate only
/// ever asks for one concrete element (`v4l2h264enc`) standing in for the
/// platform's VPU encoder, with `x264enc` as the software fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderPlacement {
    Hardware,
    Software,
}

impl EncoderPlacement {
    pub fn vpu_kind(self) -> Option<VpuKind> {
        match self {
            EncoderPlacement::Hardware => Some(VpuKind::Encode),
            EncoderPlacement::Software => None,
        }
    }
}

/// Bounded, leak-downstream queue per spec §4.3: buffered duration capped at
/// `max_seconds`, oldest buffers dropped rather than blocking upstream.
pub fn configure_leaky_queue(queue: &gst::Element, max_seconds: u64) {
    queue.set_property("max-size-buffers", 0u32);
    queue.set_property("max-size-bytes", 0u32);
    queue.set_property(
        "max-size-time",
        gst::ClockTime::from_seconds(max_seconds.max(1)),
    );
    queue.set_property_from_str("leaky", "downstream");
    queue.set_property("silent", true);
}

/// Outcome of a bus message, classified per spec §4.4's transient/fatal split.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// Recoverable: the owning worker should restart with exponential backoff.
    Transient(String),
    /// Unrecoverable for this pipeline; the owning worker should go to ERROR.
    Fatal(String),
    Eos,
    StateChanged { old: gst::State, current: gst::State },
}

/// Installs a bus watch that forwards classified messages to `tx`. The
/// classification itself is conservative: anything from a decoder/encoder/
/// source element is treated as transient (these commonly recover after a
/// device hiccup); anything else erroring is fatal.
pub fn setup_bus_watch(
    pipeline: &gst::Pipeline,
    label: String,
    tx: mpsc::UnboundedSender<BusEvent>,
) -> Result<gst::bus::BusWatchGuard, anyhow::Error> {
    let bus = pipeline
        .bus()
        .ok_or_else(|| anyhow::anyhow!("pipeline {label} has no bus"))?;
    let watch_label = label.clone();
    let guard = bus.add_watch(move |_bus, msg| {
        match msg.view() {
            MessageView::Error(err) => {
                let src = err.src().map(|s| s.path_string()).unwrap_or_default();
                let factory = err
                    .src()
                    .and_then(|s| s.downcast_ref::<gst::Element>().cloned())
                    .and_then(|e| e.factory())
                    .map(|f| f.name().to_string())
                    .unwrap_or_default();
                error!(pipeline = %watch_label, src = %src, factory = %factory, error = %err.error(), debug = ?err.debug(), "gst bus error");
                let transient = matches!(
                    factory.as_str(),
                    "v4l2h264enc" | "v4l2h264dec" | "x264enc" | "rtspclientsink" | "queue"
                );
                let event = if transient {
                    BusEvent::Transient(err.error().to_string())
                } else {
                    BusEvent::Fatal(err.error().to_string())
                };
                let _ = tx.send(event);
            }
            MessageView::Warning(w) => {
                let src = w.src().map(|s| s.path_string()).unwrap_or_default();
                warn!(pipeline = %watch_label, src = %src, error = %w.error(), "gst bus warning");
            }
            MessageView::StateChanged(sc) if sc.src().map(|s| s.type_() == gst::Pipeline::static_type()).unwrap_or(false) => {
                debug!(pipeline = %watch_label, old = ?sc.old(), current = ?sc.current(), "pipeline state change");
                let _ = tx.send(BusEvent::StateChanged { old: sc.old(), current: sc.current() });
            }
            MessageView::Eos(_) => {
                warn!(pipeline = %watch_label, "gst EOS");
                let _ = tx.send(BusEvent::Eos);
            }
            MessageView::StreamStart(ss) => {
                let src = ss.src().map(|s| s.path_string()).unwrap_or_default();
                info!(pipeline = %watch_label, src = %src, "gst stream start");
            }
            _ => {}
        }
        gst::glib::ControlFlow::Continue
    })?;
    Ok(guard)
}

/// Tries the hardware element first (consuming one VPU slot via `budget`),
/// falling back to the matching software element when the VPU is exhausted
/// or the hardware element cannot be constructed. Returns the built element,
/// its placement, and the VPU guard if one was acquired (spec §4.1 policy).
pub fn make_encoder(
    budget: &std::sync::Arc<crate::vpu::VpuBudget>,
    prefer_hardware: bool,
) -> Result<(gst::Element, EncoderPlacement, Option<crate::vpu::VpuGuard>), crate::error::CoreError>
{
    if prefer_hardware {
        if let Some(guard) = budget.try_acquire(VpuKind::Encode, 1) {
            match gst::ElementFactory::make("v4l2h264enc").build() {
                Ok(el) => return Ok((el, EncoderPlacement::Hardware, Some(guard))),
                Err(e) => {
                    warn!(error = %e, "hardware encoder element unavailable, falling back to software");
                }
            }
        } else {
            debug!("VPU encode budget exhausted, using software encoder");
        }
    }
    let el = gst::ElementFactory::make("x264enc")
        .build()
        .map_err(|e| crate::error::CoreError::PipelineBuildFailed(e.to_string()))?;
    Ok((el, EncoderPlacement::Software, None))
}

/// Ensures `gst::init()` has run exactly once for the test binary. Production
/// startup does this in `main`; unit tests that build real pipelines (ingest,
/// mixer, supervisor) call this first since `cargo test` never runs `main`.
#[cfg(test)]
pub(crate) fn test_gst_init() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        gst::init().expect("gstreamer init for tests");
    });
}
