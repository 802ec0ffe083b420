//! C9 — Event Bus: in-process multi-producer/multi-consumer pub/sub (spec
//! §4.9), generalized from the teacher's `FrameDistributor` (which broadcasts
//! `Arc<Bytes>` video frames to WebRTC clients) to broadcasting `Arc<Event>`
//! domain events to API subscribers and the webhook dispatcher. Delivery
//! ordering is per-publisher FIFO via `tokio::sync::broadcast`; a slow
//! subscriber lags and misses events rather than blocking the publisher.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::WebhookConfig;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum EventPayload {
    IngestStateChanged { camera_id: String, state: String },
    SignalLost { camera_id: String },
    SignalRecovered { camera_id: String, outage_seconds: f64 },
    ResolutionChanged { camera_id: String, from: Option<(u32, u32)>, to: (u32, u32) },
    RecordingStarted { session_id: String, camera_id: String, file_path: String },
    RecordingStopped { session_id: String, camera_id: String },
    FileRotated { session_id: String, camera_id: String, file_path: String, sequence: u32 },
    MixerTransitionCompleted { scene_id: String, transition: String },
    TallyChanged { program: Vec<String>, preview: Vec<String> },
    DiskLow { free_gb: f64, warning_threshold_gb: f64 },
    EncoderDegraded { camera_id: String, reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Stable kind string, used by the webhook JSON envelope (spec §6.4) and
    /// to let subscribers filter by variant without matching the payload.
    pub fn kind(&self) -> &'static str {
        match &self.payload {
            EventPayload::IngestStateChanged { .. } => "ingest_state_changed",
            EventPayload::SignalLost { .. } => "signal_lost",
            EventPayload::SignalRecovered { .. } => "signal_recovered",
            EventPayload::ResolutionChanged { .. } => "resolution_changed",
            EventPayload::RecordingStarted { .. } => "recording_started",
            EventPayload::RecordingStopped { .. } => "recording_stopped",
            EventPayload::FileRotated { .. } => "file_rotated",
            EventPayload::MixerTransitionCompleted { .. } => "mixer_transition_completed",
            EventPayload::TallyChanged { .. } => "tally_changed",
            EventPayload::DiskLow { .. } => "disk_low",
            EventPayload::EncoderDegraded { .. } => "encoder_degraded",
        }
    }

    /// Whether a slow push-channel consumer is allowed to miss this event
    /// because a later event supersedes it (spec §4.10: never drop
    /// state-change events with no subsequent superseding event).
    pub fn is_droppable_if_superseded(&self) -> bool {
        matches!(self.payload, EventPayload::TallyChanged { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EventBusStats {
    pub published: u64,
    pub dropped_lagged: u64,
}

/// Broadcast pub/sub over `Arc<Event>`. Grounded directly on
/// `streaming/frame_distributor.rs`'s `broadcast::Sender<Arc<Bytes>>` +
/// atomic counters pattern.
pub struct EventBus {
    tx: broadcast::Sender<Arc<Event>>,
    published: AtomicU64,
    dropped_lagged: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(capacity.max(16));
        Arc::new(Self {
            tx,
            published: AtomicU64::new(0),
            dropped_lagged: AtomicU64::new(0),
        })
    }

    pub fn publish(&self, event: Event) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let event = Arc::new(event);
        match self.tx.send(event.clone()) {
            Ok(subscriber_count) => {
                debug!(kind = event.kind(), subscribers = subscriber_count, "event published");
            }
            Err(_) => {
                debug!(kind = event.kind(), "event published with no subscribers");
            }
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            rx: self.tx.subscribe(),
        }
    }

    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            published: self.published.load(Ordering::Relaxed),
            dropped_lagged: self.dropped_lagged.load(Ordering::Relaxed),
        }
    }

    pub fn note_lag(&self, n: u64) {
        self.dropped_lagged.fetch_add(n, Ordering::Relaxed);
    }
}

pub struct EventReceiver {
    rx: broadcast::Receiver<Arc<Event>>,
}

#[derive(Debug)]
pub enum EventRecvError {
    Lagged(u64),
    Closed,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<Arc<Event>, EventRecvError> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Ok(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "event subscriber lagged, skipping to latest");
                    return Err(EventRecvError::Lagged(n));
                }
                Err(broadcast::error::RecvError::Closed) => return Err(EventRecvError::Closed),
            }
        }
    }
}

/// Per-event-kind filter applied by a push-channel subscriber (spec §6.1 WS
/// `/events` `{subscribe:[...]}` frame).
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    kinds: Option<std::collections::HashSet<String>>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self { kinds: None }
    }

    pub fn only(kinds: Vec<String>) -> Self {
        Self {
            kinds: Some(kinds.into_iter().collect()),
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        match &self.kinds {
            None => true,
            Some(set) => set.contains(event.kind()),
        }
    }
}

/// Delivers events to outbound webhook URLs with retry/backoff and a
/// bounded on-disk dead-letter queue (spec §4.9, §6.4; dead-letter format
/// decided in SPEC_FULL.md §B since no original_source/ detail survived).
pub struct WebhookDispatcher {
    client: reqwest::Client,
    config: WebhookConfig,
    deadletter_path: std::path::PathBuf,
}

impl WebhookDispatcher {
    pub fn new(config: WebhookConfig, recording_root: &std::path::Path) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            deadletter_path: recording_root.join("deadletter").join("webhooks.jsonl"),
        }
    }

    pub async fn run(self: Arc<Self>, mut events: EventReceiver) {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(EventRecvError::Lagged(_)) => continue,
                Err(EventRecvError::Closed) => return,
            };
            if self.config.urls.is_empty() {
                continue;
            }
            for url in self.config.urls.clone() {
                let dispatcher = self.clone();
                let event = event.clone();
                tokio::spawn(async move {
                    dispatcher.deliver_with_retry(&url, &event).await;
                });
            }
        }
    }

    async fn deliver_with_retry(&self, url: &str, event: &Event) {
        let body = serde_json::json!({
            "event": event.kind(),
            "timestamp": event.timestamp.to_rfc3339(),
            "payload": event.payload,
        });

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self
                .client
                .post(url)
                .timeout(std::time::Duration::from_secs(self.config.timeout_seconds))
                .json(&body)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    debug!(url, kind = event.kind(), attempt, "webhook delivered");
                    return;
                }
                Ok(resp) => {
                    warn!(url, kind = event.kind(), attempt, status = %resp.status(), "webhook rejected");
                }
                Err(e) => {
                    warn!(url, kind = event.kind(), attempt, error = %e, "webhook delivery failed");
                }
            }

            if attempt >= self.config.max_attempts {
                self.dead_letter(url, &body).await;
                return;
            }

            let backoff_ms = 500u64.saturating_mul(1u64 << attempt.min(5));
            let jitter_ms = rand::random::<u64>() % 250;
            tokio::time::sleep(std::time::Duration::from_millis(backoff_ms + jitter_ms)).await;
        }
    }

    async fn dead_letter(&self, url: &str, body: &serde_json::Value) {
        warn!(url, "webhook delivery exhausted retries, dead-lettering");
        if let Some(parent) = self.deadletter_path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let line = serde_json::json!({ "url": url, "body": body, "dead_lettered_at": Utc::now().to_rfc3339() });
        let Ok(serialized) = serde_json::to_string(&line) else { return };
        use tokio::io::AsyncWriteExt;
        if let Ok(mut file) = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.deadletter_path)
            .await
        {
            let _ = file.write_all(serialized.as_bytes()).await;
            let _ = file.write_all(b"\n").await;
        }
        self.truncate_if_needed().await;
    }

    /// Keeps the dead-letter file bounded to `deadletter_max_entries` lines,
    /// dropping the oldest entries first. Runs on every dead-letter write
    /// rather than on a timer since the file is only ever touched here.
    async fn truncate_if_needed(&self) {
        let max = self.config.deadletter_max_entries as usize;
        let Ok(contents) = tokio::fs::read_to_string(&self.deadletter_path).await else {
            return;
        };
        let lines: Vec<&str> = contents.lines().collect();
        if lines.len() <= max {
            return;
        }
        let kept = lines[lines.len() - max..].join("\n") + "\n";
        if let Err(e) = tokio::fs::write(&self.deadletter_path, kept).await {
            warn!(error = %e, "failed to truncate dead-letter file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn basic_publish_and_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(Event::new(EventPayload::SignalLost { camera_id: "cam0".into() }));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "signal_lost");
        assert_eq!(bus.stats().published, 1);
    }

    #[tokio::test]
    async fn slow_subscriber_lags_without_blocking_publisher() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..10 {
            bus.publish(Event::new(EventPayload::DiskLow { free_gb: 1.0, warning_threshold_gb: 20.0 }));
        }
        match rx.recv().await {
            Err(EventRecvError::Lagged(_)) => {}
            other => panic!("expected Lagged, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_error() {
        let bus = EventBus::new(16);
        bus.publish(Event::new(EventPayload::EncoderDegraded {
            camera_id: "cam1".into(),
            reason: "vpu_exhausted".into(),
        }));
        assert_eq!(bus.stats().published, 1);
    }

    #[test]
    fn filter_matches_only_named_kinds() {
        let filter = EventFilter::only(vec!["disk_low".to_string()]);
        let disk_low = Event::new(EventPayload::DiskLow { free_gb: 1.0, warning_threshold_gb: 20.0 });
        let signal_lost = Event::new(EventPayload::SignalLost { camera_id: "cam0".into() });
        assert!(filter.matches(&disk_low));
        assert!(!filter.matches(&signal_lost));
    }
}
