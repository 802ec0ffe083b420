//! Process configuration (spec §6.3, §6.6). TOML file read once at startup;
//! individual fields may be overridden by `CAMSWITCH_<SECTION>_<FIELD>` env vars
//! applied after parsing. Hot-reload is explicitly not required.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub cameras: Vec<CameraConfig>,
    #[serde(default)]
    pub vpu: VpuConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub media_server: MediaServerConfig,
    #[serde(default)]
    pub mixer: MixerConfig,
    #[serde(default)]
    pub webhooks: WebhookConfig,
    #[serde(default)]
    pub credentials: CredentialConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            api_port: default_api_port(),
        }
    }
}

fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_api_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureClass {
    DirectHdmi,
    BridgedSubdevice,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CodecPreference {
    H264,
}

impl Default for CodecPreference {
    fn default() -> Self {
        CodecPreference::H264
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CameraConfig {
    /// Small stable id, e.g. `cam0`.
    pub id: String,
    pub device: String,
    #[serde(default)]
    pub capture_class: Option<CaptureClass>,
    #[serde(default = "default_max_width")]
    pub max_width: u32,
    #[serde(default = "default_max_height")]
    pub max_height: u32,
    #[serde(default = "default_max_fps")]
    pub max_fps: u32,
    #[serde(default)]
    pub codec_preference: CodecPreference,
    #[serde(default = "default_bitrate_kbps")]
    pub target_bitrate_kbps: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_max_width() -> u32 {
    1920
}
fn default_max_height() -> u32 {
    1080
}
fn default_max_fps() -> u32 {
    30
}
fn default_bitrate_kbps() -> u32 {
    6000
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct VpuConfig {
    #[serde(default = "default_vpu_bound")]
    pub max_encode: u32,
    #[serde(default = "default_vpu_bound")]
    pub max_decode: u32,
}

impl Default for VpuConfig {
    fn default() -> Self {
        Self {
            max_encode: default_vpu_bound(),
            max_decode: default_vpu_bound(),
        }
    }
}

fn default_vpu_bound() -> u32 {
    4
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SupervisorConfig {
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick_seconds: default_tick_seconds(),
        }
    }
}

fn default_tick_seconds() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RecordingConfig {
    #[serde(default = "default_recording_root")]
    pub root: String,
    #[serde(default = "default_min_free_gb")]
    pub min_free_gb: f64,
    #[serde(default = "default_warning_free_gb")]
    pub warning_free_gb: f64,
    #[serde(default = "default_disk_hysteresis_gb")]
    pub disk_hysteresis_gb: f64,
    #[serde(default = "default_rotate_size_mb")]
    pub rotate_size_mb: u64,
    #[serde(default = "default_rotate_seconds")]
    pub rotate_seconds: u64,
    #[serde(default = "default_container_ext")]
    pub container_extension: String,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            root: default_recording_root(),
            min_free_gb: default_min_free_gb(),
            warning_free_gb: default_warning_free_gb(),
            disk_hysteresis_gb: default_disk_hysteresis_gb(),
            rotate_size_mb: default_rotate_size_mb(),
            rotate_seconds: default_rotate_seconds(),
            container_extension: default_container_ext(),
        }
    }
}

fn default_recording_root() -> String {
    "/var/lib/camswitch/recordings".to_string()
}
fn default_min_free_gb() -> f64 {
    5.0
}
fn default_warning_free_gb() -> f64 {
    20.0
}
fn default_disk_hysteresis_gb() -> f64 {
    2.0
}
fn default_rotate_size_mb() -> u64 {
    2048
}
fn default_rotate_seconds() -> u64 {
    900
}
fn default_container_ext() -> String {
    "mkv".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct MediaServerConfig {
    #[serde(default = "default_media_host")]
    pub rtsp_host: String,
    #[serde(default = "default_media_rtsp_port")]
    pub rtsp_port: u16,
    #[serde(default)]
    pub status_url: Option<String>,
}

impl Default for MediaServerConfig {
    fn default() -> Self {
        Self {
            rtsp_host: default_media_host(),
            rtsp_port: default_media_rtsp_port(),
            status_url: None,
        }
    }
}

fn default_media_host() -> String {
    "127.0.0.1".to_string()
}
fn default_media_rtsp_port() -> u16 {
    8554
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TakeQueuePolicy {
    Queue,
    Reject,
}

impl Default for TakeQueuePolicy {
    fn default() -> Self {
        TakeQueuePolicy::Queue
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct MixerConfig {
    #[serde(default = "default_canvas_width")]
    pub canvas_width: u32,
    #[serde(default = "default_canvas_height")]
    pub canvas_height: u32,
    #[serde(default = "default_canvas_fps")]
    pub frame_rate: u32,
    #[serde(default = "default_mixer_bitrate_kbps")]
    pub target_bitrate_kbps: u32,
    #[serde(default = "default_bitrate_floor_ratio")]
    pub bitrate_floor_ratio: f64,
    #[serde(default = "default_bitrate_peak_ratio")]
    pub bitrate_peak_ratio: f64,
    #[serde(default)]
    pub take_queue_policy: TakeQueuePolicy,
    #[serde(default = "default_default_scene")]
    pub default_scene_id: String,
    /// Directory holding still-image assets addressable by `Graphic{id}`
    /// (resolved as `{graphics_root}/{id}.png`).
    #[serde(default = "default_graphics_root")]
    pub graphics_root: String,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            canvas_width: default_canvas_width(),
            canvas_height: default_canvas_height(),
            frame_rate: default_canvas_fps(),
            target_bitrate_kbps: default_mixer_bitrate_kbps(),
            bitrate_floor_ratio: default_bitrate_floor_ratio(),
            bitrate_peak_ratio: default_bitrate_peak_ratio(),
            take_queue_policy: TakeQueuePolicy::default(),
            default_scene_id: default_default_scene(),
            graphics_root: default_graphics_root(),
        }
    }
}

fn default_canvas_width() -> u32 {
    1920
}
fn default_canvas_height() -> u32 {
    1080
}
fn default_canvas_fps() -> u32 {
    30
}
fn default_mixer_bitrate_kbps() -> u32 {
    4000
}
fn default_bitrate_floor_ratio() -> f64 {
    0.5
}
fn default_bitrate_peak_ratio() -> f64 {
    1.2
}
fn default_default_scene() -> String {
    "quad".to_string()
}
fn default_graphics_root() -> String {
    "/var/lib/camswitch/graphics".to_string()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct WebhookConfig {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default = "default_webhook_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_webhook_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_deadletter_max_entries")]
    pub deadletter_max_entries: u64,
}

fn default_webhook_timeout_seconds() -> u64 {
    5
}
fn default_webhook_max_attempts() -> u32 {
    5
}
fn default_deadletter_max_entries() -> u64 {
    10_000
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CredentialConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_credential_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_credential_timeout_seconds() -> u64 {
    5
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CoreError> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            CoreError::ConfigInvalid(format!("failed to read {}: {e}", path.as_ref().display()))
        })?;
        let mut config: Config = toml::from_str(&content)
            .map_err(|e| CoreError::ConfigInvalid(format!("failed to parse config: {e}")))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Applies `CAMSWITCH_<SECTION>_<FIELD>` overrides. Only scalar fields with
    /// an obvious single env knob are covered here; camera list entries are not
    /// addressable by env var (spec §6.6 lists per-camera device path as
    /// file-configurable, not an env-var surface).
    fn apply_env_overrides(&mut self) {
        let env = std::env::vars().collect::<HashMap<_, _>>();
        macro_rules! override_from_env {
            ($key:expr, $target:expr, $parse:expr) => {
                if let Some(v) = env.get($key) {
                    if let Ok(parsed) = $parse(v) {
                        $target = parsed;
                    }
                }
            };
        }

        override_from_env!("CAMSWITCH_RECORDING_ROOT", self.recording.root, |v: &String| Ok::<_, ()>(v.clone()));
        override_from_env!("CAMSWITCH_RECORDING_MIN_FREE_GB", self.recording.min_free_gb, |v: &String| v.parse::<f64>().map_err(|_| ()));
        override_from_env!("CAMSWITCH_RECORDING_WARNING_FREE_GB", self.recording.warning_free_gb, |v: &String| v.parse::<f64>().map_err(|_| ()));
        override_from_env!("CAMSWITCH_VPU_MAX_ENCODE", self.vpu.max_encode, |v: &String| v.parse::<u32>().map_err(|_| ()));
        override_from_env!("CAMSWITCH_VPU_MAX_DECODE", self.vpu.max_decode, |v: &String| v.parse::<u32>().map_err(|_| ()));
        override_from_env!("CAMSWITCH_SUPERVISOR_TICK_SECONDS", self.supervisor.tick_seconds, |v: &String| v.parse::<u64>().map_err(|_| ()));
        override_from_env!("CAMSWITCH_SERVER_API_PORT", self.server.api_port, |v: &String| v.parse::<u16>().map_err(|_| ()));
        override_from_env!("CAMSWITCH_SERVER_BIND_IP", self.server.bind_ip, |v: &String| Ok::<_, ()>(v.clone()));
        override_from_env!("CAMSWITCH_MEDIA_SERVER_RTSP_HOST", self.media_server.rtsp_host, |v: &String| Ok::<_, ()>(v.clone()));
        override_from_env!("CAMSWITCH_MEDIA_SERVER_RTSP_PORT", self.media_server.rtsp_port, |v: &String| v.parse::<u16>().map_err(|_| ()));

        if let Some(urls) = env.get("CAMSWITCH_WEBHOOKS_URLS") {
            self.webhooks.urls = urls.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        }
        if let Some(endpoint) = env.get("CAMSWITCH_CREDENTIALS_ENDPOINT") {
            self.credentials.endpoint = Some(endpoint.clone());
        }
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.cameras.is_empty() {
            return Err(CoreError::ConfigInvalid("at least one camera must be configured".into()));
        }
        if self.cameras.len() > 4 {
            return Err(CoreError::ConfigInvalid("at most four cameras are supported".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for cam in &self.cameras {
            if !seen.insert(cam.id.clone()) {
                return Err(CoreError::ConfigInvalid(format!("duplicate camera id {}", cam.id)));
            }
        }
        if self.vpu.max_encode == 0 && self.vpu.max_decode == 0 {
            return Err(CoreError::ConfigInvalid("vpu.max-encode and vpu.max-decode cannot both be zero".into()));
        }
        if !(2..=30).contains(&self.supervisor.tick_seconds) {
            return Err(CoreError::ConfigInvalid("supervisor.tick-seconds must be in range 2..=30".into()));
        }
        if self.recording.warning_free_gb < self.recording.min_free_gb {
            return Err(CoreError::ConfigInvalid("recording.warning-free-gb must be >= min-free-gb".into()));
        }
        Ok(())
    }

    pub fn camera(&self, id: &str) -> Option<&CameraConfig> {
        self.cameras.iter().find(|c| c.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toml() -> &'static str {
        r#"
            [[cameras]]
            id = "cam0"
            device = "/dev/video0"

            [vpu]
            max-encode = 4
            max-decode = 4
        "#
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config: Config = toml::from_str(sample_toml()).unwrap();
        assert_eq!(config.cameras.len(), 1);
        assert_eq!(config.cameras[0].max_width, 1920);
        assert_eq!(config.vpu.max_encode, 4);
        assert_eq!(config.recording.min_free_gb, 5.0);
    }

    #[test]
    fn validate_rejects_empty_cameras() {
        let config = Config {
            server: ServerConfig::default(),
            cameras: vec![],
            vpu: VpuConfig::default(),
            supervisor: SupervisorConfig::default(),
            recording: RecordingConfig::default(),
            media_server: MediaServerConfig::default(),
            mixer: MixerConfig::default(),
            webhooks: WebhookConfig::default(),
            credentials: CredentialConfig::default(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_camera_ids() {
        let mut config: Config = toml::from_str(sample_toml()).unwrap();
        config.cameras.push(config.cameras[0].clone());
        assert!(config.validate().is_err());
    }
}
