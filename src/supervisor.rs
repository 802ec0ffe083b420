//! C5 — Supervisor: one periodic tick loop driving every camera's signal
//! detection (spec §4.5). Probes fan out in parallel across cameras; the
//! resulting transition decision for each camera is sent to that camera's
//! own ingest actor, so it still serializes behind that actor's inbox
//! alongside any concurrent API-driven command.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::device_probe::DeviceProbe;
use crate::ingest::IngestHandle;

pub struct Supervisor {
    probe: Arc<dyn DeviceProbe>,
    /// (device path, worker handle) pairs; the probe is keyed by device path,
    /// the command is addressed to the worker that owns that device.
    workers: Vec<(String, IngestHandle)>,
    tick_period: Duration,
}

impl Supervisor {
    pub fn new(probe: Arc<dyn DeviceProbe>, workers: Vec<(String, IngestHandle)>, tick_seconds: u64) -> Self {
        Self {
            probe,
            workers,
            tick_period: Duration::from_secs(tick_seconds.clamp(2, 30)),
        }
    }

    /// Runs the tick loop until `shutdown` resolves. Each tick probes every
    /// camera's device concurrently (spec §5 item 2: "fans out per-camera
    /// probes in parallel, merges results serially").
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.tick_period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("supervisor shutting down");
                        return;
                    }
                }
            }
        }
    }

    async fn tick(&self) {
        let probes: Vec<_> = self
            .workers
            .iter()
            .map(|(device, _)| {
                let probe = Arc::clone(&self.probe);
                let device = device.clone();
                async move { tokio::task::spawn_blocking(move || probe.current_signal(&device)).await }
            })
            .collect();
        let results = futures_util::future::join_all(probes).await;

        for ((_device, worker), result) in self.workers.iter().zip(results) {
            match result {
                Ok(resolution) => {
                    debug!(camera = worker.camera_id(), ?resolution, "supervisor tick: signal probed");
                    worker.probe_signal(resolution);
                }
                Err(e) => {
                    debug!(camera = worker.camera_id(), error = %e, "device probe task panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CameraConfig, CodecPreference, MediaServerConfig};
    use crate::device_probe::{Resolution, TestDeviceProbe};
    use crate::events::EventBus;
    use crate::ingest;
    use crate::vpu::VpuBudget;

    fn test_camera(id: &str) -> CameraConfig {
        CameraConfig {
            id: id.into(),
            device: format!("/dev/{id}"),
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
    async fn tick_propagates_probed_signal_to_worker() {
        crate::pipeline::test_gst_init();
        let probe = Arc::new(TestDeviceProbe::new());
        probe.set_signal(
            "/dev/cam0",
            Some(Resolution { width: 1920, height: 1080, fps: 30 }),
        );

        let handle = ingest::spawn(
            test_camera("cam0"),
            MediaServerConfig::default(),
            VpuBudget::new(4, 4),
            EventBus::new(16),
            true,
        );
        handle.enable().await;

        let supervisor = Supervisor::new(
            probe.clone() as Arc<dyn DeviceProbe>,
            vec![("/dev/cam0".to_string(), handle.clone())],
            10,
        );
        supervisor.tick().await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        let snapshot = handle.describe().await;
        assert_eq!(snapshot.resolution, Some(Resolution { width: 1920, height: 1080, fps: 30 }));
    }
}
