//! Text-to-speech with ordered fallback.
//!
//! [`SpeechSynthesizer`] tries each backend in turn (remote first, then local) and
//! reports which one produced audio. Cancellation ends the attempt on whichever
//! backend is active and never triggers a fallback.

mod local;
mod remote;

pub use local::{LocalSpeechEvent, LocalSynthesizer};
pub use remote::RemoteSynthesizer;

use crate::audio::PlaybackEnd;
use crate::error::{VoiceError, VoiceResult};
use crate::speech_text::Emotion;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Remote,
    Local,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Remote => "remote",
            BackendKind::Local => "local",
        })
    }
}

/// Per-request voice settings layered over each backend's configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpeechOptions {
    pub voice: Option<String>,
    /// Multiplier on the backend's configured speed
    pub speed: Option<f32>,
    pub emotion: Emotion,
}

impl SpeechOptions {
    pub fn with_emotion(emotion: Emotion) -> Self {
        Self {
            emotion,
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Speak `text` until done or cancelled. Returns `Cancelled` once the token fires.
    async fn speak(
        &self,
        text: &str,
        options: &SpeechOptions,
        cancel: &CancellationToken,
    ) -> VoiceResult<PlaybackEnd>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendFailure {
    pub backend: BackendKind,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisOutcome {
    /// Audio played to the end. `failures` lists backends that were tried first.
    Completed {
        backend: BackendKind,
        failures: Vec<BackendFailure>,
    },
    Cancelled { backend: Option<BackendKind> },
    AllFailed(Vec<BackendFailure>),
}

impl SynthesisOutcome {
    /// Backend that produced (or was producing) the audio.
    pub fn backend(&self) -> Option<BackendKind> {
        match self {
            SynthesisOutcome::Completed { backend, .. } => Some(*backend),
            SynthesisOutcome::Cancelled { backend } => *backend,
            SynthesisOutcome::AllFailed(_) => None,
        }
    }

    pub fn into_error(self) -> Option<VoiceError> {
        match self {
            SynthesisOutcome::AllFailed(failures) => Some(VoiceError::AllBackendsFailed(
                failures
                    .iter()
                    .map(|f| format!("{}: {}", f.backend, f.reason))
                    .collect::<Vec<_>>()
                    .join("; "),
            )),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct SpeechSynthesizer {
    backends: Vec<Arc<dyn SynthesisBackend>>,
}

impl SpeechSynthesizer {
    /// Backends are tried in the order given.
    pub fn new(backends: Vec<Arc<dyn SynthesisBackend>>) -> Self {
        Self { backends }
    }

    pub async fn speak(
        &self,
        text: &str,
        options: &SpeechOptions,
        cancel: &CancellationToken,
    ) -> SynthesisOutcome {
        let mut failures = Vec::new();
        for backend in &self.backends {
            let kind = backend.kind();
            if cancel.is_cancelled() {
                return SynthesisOutcome::Cancelled { backend: None };
            }
            match backend.speak(text, options, cancel).await {
                Ok(PlaybackEnd::Finished) => {
                    info!("🔊 Speech completed via {} backend", kind);
                    return SynthesisOutcome::Completed {
                        backend: kind,
                        failures,
                    };
                }
                Ok(PlaybackEnd::Cancelled) => {
                    info!("⏹️ Speech cancelled on {} backend", kind);
                    return SynthesisOutcome::Cancelled {
                        backend: Some(kind),
                    };
                }
                Err(_) if cancel.is_cancelled() => {
                    return SynthesisOutcome::Cancelled {
                        backend: Some(kind),
                    };
                }
                Err(e) => {
                    warn!("{} backend failed, falling back: {}", kind, e);
                    failures.push(BackendFailure {
                        backend: kind,
                        reason: e.to_string(),
                    });
                }
            }
        }
        SynthesisOutcome::AllFailed(failures)
    }
}
