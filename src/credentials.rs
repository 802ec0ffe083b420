//! External credential service client (spec §6.5): the process consumes
//! signed media-relay credentials from a fixed HTTPS endpoint, caches them
//! until `expires_at`, and refreshes at 80% of TTL with ±10% jitter. Any
//! failure here degrades the capability it backs; it is never fatal to the
//! process (spec §1: "TURN credential minting and identity — consumed as an
//! external signed-credentials service").

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::CredentialConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct RelayCredentials {
    pub username: String,
    pub password: String,
    pub urls: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    /// No endpoint configured; feature is simply inactive.
    Disabled,
    /// Endpoint configured but the last fetch failed; cached value (if any)
    /// is still served until it expires.
    Degraded,
    Fresh,
}

/// Process-wide singleton caching the last successfully fetched credential
/// set. A background task refreshes it proactively; callers never block on
/// a live HTTPS round-trip in the common case.
pub struct CredentialCache {
    client: reqwest::Client,
    config: CredentialConfig,
    state: RwLock<Option<RelayCredentials>>,
    degraded: std::sync::atomic::AtomicBool,
}

impl CredentialCache {
    pub fn new(config: CredentialConfig) -> Arc<Self> {
        Arc::new(Self {
            client: reqwest::Client::new(),
            config,
            state: RwLock::new(None),
            degraded: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn current(&self) -> Option<RelayCredentials> {
        self.state.read().clone()
    }

    pub fn status(&self) -> CredentialStatus {
        if self.config.endpoint.is_none() {
            return CredentialStatus::Disabled;
        }
        if self.degraded.load(std::sync::atomic::Ordering::Relaxed) {
            CredentialStatus::Degraded
        } else {
            CredentialStatus::Fresh
        }
    }

    /// Runs forever, fetching once at startup and then at 80% of each
    /// credential's TTL (±10% jitter) until shutdown is signalled.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let Some(endpoint) = self.config.endpoint.clone() else {
            debug!("no credential endpoint configured, cache disabled");
            return;
        };
        loop {
            let next_delay = match self.fetch(&endpoint).await {
                Ok(creds) => {
                    self.degraded.store(false, std::sync::atomic::Ordering::Relaxed);
                    let ttl = (creds.expires_at - Utc::now()).to_std().unwrap_or(Duration::from_secs(60));
                    let base = ttl.mul_f64(0.8);
                    let jitter_frac = (rand::random::<f64>() - 0.5) * 0.2;
                    *self.state.write() = Some(creds);
                    base.mul_f64(1.0 + jitter_frac).max(Duration::from_secs(1))
                }
                Err(e) => {
                    warn!(error = %e, "credential fetch failed, serving stale/absent cache");
                    self.degraded.store(true, std::sync::atomic::Ordering::Relaxed);
                    Duration::from_secs(30)
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(next_delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn fetch(&self, endpoint: &str) -> anyhow::Result<RelayCredentials> {
        let resp = self
            .client
            .get(endpoint)
            .timeout(Duration::from_secs(self.config.timeout_seconds))
            .send()
            .await?
            .error_for_status()?;
        let creds: RelayCredentials = resp.json().await?;
        Ok(creds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_without_endpoint() {
        let cache = CredentialCache::new(CredentialConfig { endpoint: None, timeout_seconds: 5 });
        assert_eq!(cache.status(), CredentialStatus::Disabled);
        assert!(cache.current().is_none());
    }
}
