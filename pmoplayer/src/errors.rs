//! Error types for the playback engine

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for playback operations
pub type Result<T> = std::result::Result<T, PlayerError>;

/// Errors raised by pipelines, backends and the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    /// An external stage could not be launched or exited right after launch
    #[error("Failed to start pipeline stage '{stage}': {reason}")]
    BackendStartFailure { stage: String, reason: String },

    /// The renderer control channel refused or failed a request
    #[error("Control channel error: {0}")]
    ControlChannel(String),

    /// Nobody listens on the control socket (missing or refused)
    #[error("Control socket {path} unreachable: {source}")]
    ControlUnavailable {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Resume was requested without a paused session to restart
    #[error("No paused session to resume")]
    NoPausedSession,

    /// Volume outside of 0-100
    #[error("Invalid volume {0}, expected a value between 0 and 100")]
    InvalidVolume(i64),

    /// A stage ignored the graceful terminate signal
    #[error("Pipeline stage '{stage}' did not exit within {timeout:?}")]
    PipelineTerminationTimeout { stage: String, timeout: Duration },

    /// AirPlay device without a network address
    #[error("AirPlay device '{0}' has no address")]
    MissingDeviceAddress(String),

    /// No relay binary is shipped for this CPU
    #[error("Unsupported architecture for the AirPlay relay: {0}")]
    UnsupportedArchitecture(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding failed on the control channel
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error (from pmoconfig/anyhow)
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),
}

impl PlayerError {
    pub fn start_failure(stage: impl Into<String>, reason: impl ToString) -> Self {
        Self::BackendStartFailure {
            stage: stage.into(),
            reason: reason.to_string(),
        }
    }

    pub fn control_channel(msg: impl Into<String>) -> Self {
        Self::ControlChannel(msg.into())
    }

    /// True for failures that the best-effort paths log and retry.
    ///
    /// An unreachable control socket is not transient: once the renderer
    /// has answered, losing its socket means the renderer is gone.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ControlChannel(_))
    }
}
