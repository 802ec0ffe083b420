//! RAII guards for GStreamer resource cleanup. A guard's `Drop` impl is the
//! only place cleanup happens — on the happy path, on early return, and on
//! panic unwind alike.

use std::mem::ManuallyDrop;
use std::sync::Arc;

use gstreamer as gst;
use gstreamer::prelude::*;
use tracing::{debug, info, warn};

/// Guarantees an element is unlinked, set to NULL, and removed from its
/// pipeline when dropped.
pub struct PipelineElement {
    element: ManuallyDrop<gst::Element>,
    pipeline: gst::Pipeline,
    name: String,
}

impl PipelineElement {
    pub fn new(element: gst::Element, pipeline: &gst::Pipeline, name: String) -> Self {
        debug!(element = %name, "created RAII guard for element");
        Self {
            element: ManuallyDrop::new(element),
            pipeline: pipeline.clone(),
            name,
        }
    }

    pub fn element(&self) -> &gst::Element {
        &self.element
    }

    /// Takes ownership of the element, skipping this guard's cleanup.
    pub fn into_inner(mut self) -> gst::Element {
        unsafe { ManuallyDrop::take(&mut self.element) }
    }
}

impl Drop for PipelineElement {
    fn drop(&mut self) {
        info!(element = %self.name, "dropping PipelineElement");

        if let Err(e) = self.element.set_state(gst::State::Ready) {
            warn!(element = %self.name, error = %e, "failed to set element to READY");
        }

        if let Some(sink_pad) = self.element.static_pad("sink") {
            if let Some(peer) = sink_pad.peer() {
                if let Err(e) = peer.unlink(&sink_pad) {
                    debug!(element = %self.name, error = %e, "failed to unlink sink pad");
                }
            }
        }
        if let Some(src_pad) = self.element.static_pad("src") {
            if let Some(peer) = src_pad.peer() {
                if let Err(e) = src_pad.unlink(&peer) {
                    debug!(element = %self.name, error = %e, "failed to unlink src pad");
                }
            }
        }

        if let Err(e) = self.element.set_state(gst::State::Null) {
            warn!(element = %self.name, error = %e, "failed to set element to NULL");
        }

        if let Err(e) = self.pipeline.remove(&*self.element) {
            warn!(element = %self.name, error = %e, "failed to remove element from pipeline");
        }

        unsafe { ManuallyDrop::drop(&mut self.element) };
        debug!(element = %self.name, "element cleanup complete");
    }
}

/// Guarantees a request pad is unlinked and released back to its parent
/// element when dropped.
pub struct PadGuard {
    pad: gst::Pad,
    parent: gst::Element,
    name: String,
}

impl PadGuard {
    pub fn new(pad: gst::Pad, parent: &gst::Element, name: String) -> Self {
        debug!(pad = %name, "created RAII guard for pad");
        Self {
            pad,
            parent: parent.clone(),
            name,
        }
    }

    pub fn pad(&self) -> &gst::Pad {
        &self.pad
    }
}

impl Drop for PadGuard {
    fn drop(&mut self) {
        info!(pad = %self.name, "dropping PadGuard");

        if let Some(peer) = self.pad.peer() {
            if let Err(e) = self.pad.unlink(&peer) {
                debug!(pad = %self.name, error = %e, "failed to unlink pad");
            }
        }

        self.parent.release_request_pad(&self.pad);
        debug!(pad = %self.name, "pad released");
    }
}

/// Guarantees a pipeline is stopped and flushed when dropped.
pub struct PipelineGuard {
    pipeline: ManuallyDrop<gst::Pipeline>,
    name: String,
}

impl PipelineGuard {
    pub fn new(pipeline: gst::Pipeline, name: String) -> Self {
        info!(pipeline = %name, "created RAII guard for pipeline");
        Self {
            pipeline: ManuallyDrop::new(pipeline),
            name,
        }
    }

    pub fn pipeline(&self) -> &gst::Pipeline {
        &self.pipeline
    }

    pub fn into_inner(mut self) -> gst::Pipeline {
        unsafe { ManuallyDrop::take(&mut self.pipeline) }
    }
}

impl Drop for PipelineGuard {
    fn drop(&mut self) {
        info!(pipeline = %self.name, "dropping PipelineGuard");

        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!(pipeline = %self.name, error = %e, "failed to stop pipeline");
        }
        let _ = self.pipeline.send_event(gst::event::FlushStart::new());
        let _ = self
            .pipeline
            .send_event(gst::event::FlushStop::builder(true).build());

        unsafe { ManuallyDrop::drop(&mut self.pipeline) };
        debug!(pipeline = %self.name, "pipeline stopped and flushed");
    }
}

/// Runs an arbitrary cleanup closure once, on drop. Used where the above
/// guards don't fit: deregistering from the event bus, removing a stale
/// metadata file, releasing a VPU guard held alongside other state.
pub struct CleanupGuard<F: FnOnce()> {
    cleanup: Option<F>,
    name: String,
}

impl<F: FnOnce()> CleanupGuard<F> {
    pub fn new(cleanup: F, name: String) -> Self {
        debug!(guard = %name, "created cleanup guard");
        Self {
            cleanup: Some(cleanup),
            name,
        }
    }
}

impl<F: FnOnce()> Drop for CleanupGuard<F> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            debug!(guard = %self.name, "running cleanup");
            cleanup();
        }
    }
}

/// Reference-counted cleanup that runs once the last clone is dropped.
#[derive(Clone)]
pub struct SharedCleanupGuard {
    inner: Arc<CleanupGuardInner>,
}

struct CleanupGuardInner {
    cleanup: parking_lot::Mutex<Option<Box<dyn FnOnce() + Send>>>,
    name: String,
}

impl SharedCleanupGuard {
    pub fn new<F: FnOnce() + Send + 'static>(cleanup: F, name: String) -> Self {
        Self {
            inner: Arc::new(CleanupGuardInner {
                cleanup: parking_lot::Mutex::new(Some(Box::new(cleanup))),
                name,
            }),
        }
    }

    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl Drop for CleanupGuardInner {
    fn drop(&mut self) {
        info!(guard = %self.name, "running shared cleanup");
        if let Some(cleanup) = self.cleanup.lock().take() {
            cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    #[test]
    fn cleanup_guard_runs_on_drop() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        {
            let _guard = CleanupGuard::new(move || ran_clone.store(true, Ordering::SeqCst), "test".into());
            assert!(!ran.load(Ordering::SeqCst));
        }
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn cleanup_guard_runs_on_panic() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        let result = std::panic::catch_unwind(|| {
            let _guard = CleanupGuard::new(move || ran_clone.store(true, Ordering::SeqCst), "panic_test".into());
            panic!("intentional panic");
        });
        assert!(result.is_err());
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn multiple_cleanup_guards_all_run() {
        let counter = Arc::new(AtomicU32::new(0));
        {
            let c1 = counter.clone();
            let _g1 = CleanupGuard::new(move || { c1.fetch_add(1, Ordering::SeqCst); }, "g1".into());
            let c2 = counter.clone();
            let _g2 = CleanupGuard::new(move || { c2.fetch_add(10, Ordering::SeqCst); }, "g2".into());
            let c3 = counter.clone();
            let _g3 = CleanupGuard::new(move || { c3.fetch_add(100, Ordering::SeqCst); }, "g3".into());
            assert_eq!(counter.load(Ordering::SeqCst), 0);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 111);
    }

    #[test]
    fn cleanup_guards_drop_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let o1 = order.clone();
            let _g1 = CleanupGuard::new(move || o1.lock().unwrap().push("first"), "g1".into());
            let o2 = order.clone();
            let _g2 = CleanupGuard::new(move || o2.lock().unwrap().push("second"), "g2".into());
            let o3 = order.clone();
            let _g3 = CleanupGuard::new(move || o3.lock().unwrap().push("third"), "g3".into());
        }
        assert_eq!(*order.lock().unwrap(), vec!["third", "second", "first"]);
    }

    #[test]
    fn shared_cleanup_guard_runs_once_last_clone_drops() {
        let ran = Arc::new(AtomicU32::new(0));
        let ran_clone = ran.clone();
        let guard = SharedCleanupGuard::new(move || { ran_clone.fetch_add(1, Ordering::SeqCst); }, "shared".into());
        let guard2 = guard.clone();
        assert_eq!(guard.strong_count(), 2);
        drop(guard);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        drop(guard2);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
