use thiserror::Error;

/// All errors produced by parley-core.
#[derive(Debug, Error)]
pub enum ParleyError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no input device found")]
    NoInputDevice,

    #[error("capture encoding error: {0}")]
    Capture(String),

    #[error("playback error: {0}")]
    Playback(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<hound::Error> for ParleyError {
    fn from(err: hound::Error) -> Self {
        ParleyError::Capture(err.to_string())
    }
}

impl From<serde_json::Error> for ParleyError {
    fn from(err: serde_json::Error) -> Self {
        ParleyError::Protocol(err.to_string())
    }
}

impl From<base64::DecodeError> for ParleyError {
    fn from(err: base64::DecodeError) -> Self {
        ParleyError::Protocol(format!("invalid base64 payload: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;
