//! Error taxonomy for the voice pipeline.

use thiserror::Error;

use crate::graph::GraphError;

/// Errors surfaced by the audio engine and its capture backends.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AudioError {
    /// The user or OS refused microphone access. Recoverable by re-prompting.
    #[error("Microphone permission denied")]
    PermissionDenied,

    /// Hardware/platform failure while acquiring or reading the stream.
    #[error("Audio device error: {0}")]
    DeviceError(String),

    /// An effect topology could not be constructed.
    #[error("Failed to build effect chain: {0}")]
    ChainBuildError(#[from] GraphError),

    /// Operation attempted after `dispose`.
    #[error("Audio session is closed")]
    SessionClosed,
}

impl AudioError {
    pub fn device(err: impl std::fmt::Display) -> Self {
        AudioError::DeviceError(err.to_string())
    }
}

impl From<anyhow::Error> for AudioError {
    fn from(err: anyhow::Error) -> Self {
        AudioError::DeviceError(format!("{:#}", err))
    }
}
