use std::time::Duration;

use thiserror::Error;

use crate::events::SessionState;

/// All errors produced by cadenza-core.
#[derive(Debug, Error)]
pub enum CadenzaError {
    #[error("failed to connect to generation service: {0}")]
    ConnectFailed(String),

    #[error("timed out after {0:?} waiting for the generation stream")]
    ConnectTimeout(Duration),

    #[error("operation not allowed while session is {0:?}")]
    InvalidState(SessionState),

    #[error("session is not connected")]
    NotConnected,

    #[error("session background context has shut down")]
    SessionClosed,

    #[error("invalid generation config: {0}")]
    InvalidConfig(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("invalid session config: {0}")]
    InvalidSessionConfig(String),

    #[error("recording of {0} bytes exceeds the WAV size limit")]
    RecordingTooLarge(usize),

    #[error("WAV encoding error: {0}")]
    Wav(#[from] hound::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CadenzaError>;
