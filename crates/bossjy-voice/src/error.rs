//! Error types for the voice conversation pipeline

use crate::synthesis::BackendKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur anywhere in the pipeline
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("Recognition error: {0}")]
    Recognition(String),

    #[error("VAD error: {0}")]
    Vad(String),

    #[error("Response generation failed: {0}")]
    ResponseGeneration(String),

    #[error("{backend} synthesis failed: {reason}")]
    Synthesis { backend: BackendKind, reason: String },

    #[error("All synthesis backends failed: {0}")]
    AllBackendsFailed(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse error category carried to the UI boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DeviceUnavailable,
    Recognition,
    ResponseGeneration,
    Synthesis,
    Internal,
}

impl VoiceError {
    pub fn synthesis(backend: BackendKind, reason: impl Into<String>) -> Self {
        VoiceError::Synthesis {
            backend,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            VoiceError::DeviceUnavailable(_) | VoiceError::AudioStream(_) => {
                ErrorKind::DeviceUnavailable
            }
            VoiceError::Recognition(_) | VoiceError::Vad(_) => ErrorKind::Recognition,
            VoiceError::ResponseGeneration(_) => ErrorKind::ResponseGeneration,
            VoiceError::Synthesis { .. }
            | VoiceError::AllBackendsFailed(_)
            | VoiceError::Playback(_) => ErrorKind::Synthesis,
            VoiceError::Config(_) | VoiceError::ChannelClosed(_) | VoiceError::Io(_) => {
                ErrorKind::Internal
            }
        }
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}
