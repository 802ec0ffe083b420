//! Closed error surface shared by the control API, the event bus, and logs (spec §7).

use serde::Serialize;
use thiserror::Error;

/// Stable error kinds. The wire representation (`kind()`) never changes shape —
/// add a variant here only when spec §7 grows, never rename one.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("config invalid: {0}")]
    ConfigInvalid(String),

    #[error("no capture device present for camera {0}")]
    DeviceMissing(String),

    #[error("camera {0} has no signal")]
    NoSignal(String),

    #[error("camera {0} already has an active recording leg")]
    BusyRecording(String),

    #[error("disk free space below minimum threshold")]
    DiskLow,

    #[error("VPU {0:?} slots exhausted, falling back to software")]
    VpuExhausted(crate::vpu::VpuKind),

    #[error("failed to build pipeline: {0}")]
    PipelineBuildFailed(String),

    #[error("pipeline emitted a fatal bus error: {0}")]
    PipelineFatal(String),

    #[error("preroll timed out waiting for first frame")]
    PrerollTimeout,

    #[error("{0} not found")]
    NotFound(String),

    #[error("operation not valid in current state: {0}")]
    Conflict(String),

    #[error("operation timed out")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// The stable `kind` string used in the API error envelope, webhook payloads,
    /// and event `Event::*` variants that carry an error.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::ConfigInvalid(_) => "config_invalid",
            CoreError::DeviceMissing(_) => "device_missing",
            CoreError::NoSignal(_) => "no_signal",
            CoreError::BusyRecording(_) => "busy_recording",
            CoreError::DiskLow => "disk_low",
            CoreError::VpuExhausted(_) => "vpu_exhausted",
            CoreError::PipelineBuildFailed(_) => "pipeline_build_failed",
            CoreError::PipelineFatal(_) => "pipeline_fatal",
            CoreError::PrerollTimeout => "preroll_timeout",
            CoreError::NotFound(_) => "not_found",
            CoreError::Conflict(_) => "conflict",
            CoreError::Timeout => "timeout",
            CoreError::Internal(_) => "internal",
        }
    }

    /// Whether this kind is expected to be recovered locally with bounded retry
    /// rather than surfaced to the caller as a persistent failure (spec §7).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::VpuExhausted(_) | CoreError::Timeout
        )
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            error: ErrorBody {
                kind: self.kind(),
                message: self.to_string(),
                details: None,
            },
        }
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(e: anyhow::Error) -> Self {
        CoreError::Internal(e.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_stable_string() {
        assert_eq!(CoreError::DiskLow.kind(), "disk_low");
        assert_eq!(CoreError::NotFound("scene:x".into()).kind(), "not_found");
    }

    #[test]
    fn envelope_serializes_with_error_wrapper() {
        let env = CoreError::Conflict("mixer stopped".into()).envelope();
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["error"]["kind"], "conflict");
    }
}
