use thiserror::Error;

/// Errors surfaced to the host by the control and analysis paths.
///
/// The render path never returns these; it degrades to silence and reports
/// a [`crate::command::RenderFault`] instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("invalid parameter `{name}` = {value}: {reason}")]
    InvalidParameter {
        name: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid block size {0}")]
    InvalidBlockSize(usize),

    /// Finalizing a recording failed. The captured samples are kept so the
    /// export can be retried.
    #[error("encoding failure: {0}")]
    EncodingFailure(String),

    #[error("command queue is full")]
    QueueFull,

    #[error("configuration error: {0}")]
    Config(String),

    #[cfg(feature = "playback")]
    #[error("output stream error: {0}")]
    Stream(String),
}

impl EngineError {
    pub(crate) fn param(name: &'static str, value: impl std::fmt::Display, reason: &'static str) -> Self {
        EngineError::InvalidParameter {
            name,
            value: value.to_string(),
            reason,
        }
    }

    pub(crate) fn state(msg: impl Into<String>) -> Self {
        EngineError::InvalidState(msg.into())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Config(e.to_string())
    }
}

impl From<hound::Error> for EngineError {
    fn from(e: hound::Error) -> Self {
        EngineError::EncodingFailure(e.to_string())
    }
}

/// Reject NaN/infinite values and values outside `[min, max]`.
pub(crate) fn check_range(name: &'static str, value: f32, min: f32, max: f32) -> Result<f32, EngineError> {
    if !value.is_finite() {
        return Err(EngineError::param(name, value, "must be finite"));
    }
    if value < min || value > max {
        return Err(EngineError::param(name, value, "out of range"));
    }
    Ok(value)
}
