//! C2 — Device Probe: bounded-latency capability queries against a capture
//! device without opening a streaming session (spec §4.2). The ingest worker
//! and supervisor both poll through this trait rather than touching `/dev/videoN`
//! directly, so tests can substitute synthetic signal without real hardware.

use std::time::Instant;

use tracing::{debug, warn};
use v4l::video::Capture;
use v4l::Device;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Queried once per supervisor tick and once at ingest worker startup.
/// Implementations must return within ~100ms typical, 50ms best-effort
/// (spec §4.2) — no blocking reads of frame data here.
pub trait DeviceProbe: Send + Sync {
    fn is_present(&self, device: &str) -> bool;

    /// `None` means no signal (cable unplugged, source powered off, or format
    /// the driver cannot negotiate). `Some` carries the currently negotiated
    /// resolution and frame rate.
    fn current_signal(&self, device: &str) -> Option<Resolution>;
}

/// Queries the real V4L2 subdevice via `VIDIOC_G_FMT`/`VIDIOC_ENUM_FRAMESIZES`.
/// Opening the device here is a control-path open only; it never starts
/// streaming, so it does not compete with the ingest worker's capture open.
pub struct V4lDeviceProbe;

impl V4lDeviceProbe {
    pub fn new() -> Self {
        Self
    }
}

impl Default for V4lDeviceProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceProbe for V4lDeviceProbe {
    fn is_present(&self, device: &str) -> bool {
        Device::with_path(device).is_ok()
    }

    fn current_signal(&self, device: &str) -> Option<Resolution> {
        let started = Instant::now();
        let dev = match Device::with_path(device) {
            Ok(d) => d,
            Err(e) => {
                debug!(device, error = %e, "device probe: open failed");
                return None;
            }
        };
        let format = match dev.format() {
            Ok(f) => f,
            Err(e) => {
                debug!(device, error = %e, "device probe: no negotiated format, treating as no signal");
                return None;
            }
        };
        let params = match dev.params() {
            Ok(p) => p,
            Err(e) => {
                warn!(device, error = %e, "device probe: format present but no stream parameters");
                return None;
            }
        };
        let fps = if params.interval.denominator > 0 {
            params.interval.denominator / params.interval.numerator.max(1)
        } else {
            0
        };
        let elapsed = started.elapsed();
        if elapsed.as_millis() > 100 {
            warn!(device, elapsed_ms = elapsed.as_millis(), "device probe exceeded typical latency budget");
        }
        if format.width == 0 || format.height == 0 || fps == 0 {
            return None;
        }
        Some(Resolution {
            width: format.width,
            height: format.height,
            fps,
        })
    }
}

/// Synthetic probe for `--test-mode` and integration tests: signal state per
/// camera id is set directly rather than read from hardware.
pub struct TestDeviceProbe {
    signals: parking_lot::Mutex<std::collections::HashMap<String, Option<Resolution>>>,
}

impl TestDeviceProbe {
    pub fn new() -> Self {
        Self {
            signals: parking_lot::Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn set_signal(&self, device: &str, resolution: Option<Resolution>) {
        self.signals.lock().insert(device.to_string(), resolution);
    }
}

impl Default for TestDeviceProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceProbe for TestDeviceProbe {
    fn is_present(&self, device: &str) -> bool {
        self.signals.lock().contains_key(device)
    }

    fn current_signal(&self, device: &str) -> Option<Resolution> {
        self.signals.lock().get(device).copied().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_reports_no_signal_until_set() {
        let probe = TestDeviceProbe::new();
        probe.set_signal("/dev/video0", None);
        assert!(probe.is_present("/dev/video0"));
        assert_eq!(probe.current_signal("/dev/video0"), None);
    }

    #[test]
    fn test_probe_reports_configured_resolution() {
        let probe = TestDeviceProbe::new();
        let res = Resolution { width: 1920, height: 1080, fps: 30 };
        probe.set_signal("/dev/video0", Some(res));
        assert_eq!(probe.current_signal("/dev/video0"), Some(res));
    }

    #[test]
    fn test_probe_unknown_device_is_absent() {
        let probe = TestDeviceProbe::new();
        assert!(!probe.is_present("/dev/video9"));
        assert_eq!(probe.current_signal("/dev/video9"), None);
    }
}
