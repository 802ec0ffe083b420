//! Durable session metadata (spec §6.3): one JSON file per session, written
//! on every state-change so a crash mid-session leaves a recoverable record.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegState {
    Armed,
    Recording,
    Rotating,
    Finished,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegMetadata {
    pub files: Vec<String>,
    pub state: LegState,
    pub bytes: u64,
    pub duration_s: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub id: String,
    pub name: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cameras: HashMap<String, LegMetadata>,
}

impl SessionMetadata {
    pub fn path(root: &Path, session_id: &str) -> PathBuf {
        root.join("sessions").join(format!("{session_id}.json"))
    }

    pub async fn save(&self, root: &Path) -> std::io::Result<()> {
        let path = Self::path(root, &self.id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(self).expect("session metadata is always serializable");
        tokio::fs::write(&path, body).await
    }

    pub async fn load(root: &Path, session_id: &str) -> std::io::Result<Self> {
        let path = Self::path(root, session_id);
        let body = tokio::fs::read(&path).await?;
        serde_json::from_slice(&body).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Lists every session json file found under `{root}/sessions/`, used at
    /// startup to resume crash recovery (spec §4.6).
    pub async fn list_all(root: &Path) -> Vec<Self> {
        let dir = root.join("sessions");
        let mut out = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            return out;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(body) => match serde_json::from_slice::<Self>(&body) {
                    Ok(meta) => out.push(meta),
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable session metadata"),
                },
                Err(e) => warn!(path = %path.display(), error = %e, "failed to read session metadata"),
            }
        }
        out
    }
}
