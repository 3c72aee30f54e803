//! # Bossjy Voice - full-duplex voice conversation
//!
//! Microphone audio is recognized as it streams, each finished utterance becomes
//! a turn for an external response generator, and the reply is spoken through a
//! remote TTS service with an on-device engine as fallback. The user can talk
//! over the assistant at any time; playback stops and the pipeline listens.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                    Conversation Orchestrator                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐            │
//! │  │   Audio In   │→ │  Recognizer  │→ │  Turn-taking │→ Generator │
//! │  │    (cpal)    │  │ (VAD + STT)  │  │ state machine│            │
//! │  └──────────────┘  └──────┬───────┘  └──────┬───────┘            │
//! │                           │ speech          ↓                    │
//! │                    ┌──────┴───────┐  ┌──────────────┐            │
//! │                    │ Interruption │→ │  Synthesizer │ remote →   │
//! │                    │  Controller  │  │ (cancellable)│ local      │
//! │                    └──────────────┘  └──────────────┘            │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod generator;
pub mod interruption;
pub mod orchestrator;
pub mod playback;
pub mod recognizer;
pub mod session;
pub mod speech_text;
pub mod synthesis;

pub use audio::{
    AudioCaptureSource, AudioChunk, AudioOutput, AudioStream, CaptureHandle, CpalMicrophone,
    MicrophoneDevice, PlaybackEnd, SpeakerOutput,
};
pub use config::VoiceConfig;
pub use error::{ErrorKind, VoiceError, VoiceResult};
pub use generator::{ChatCompletionGenerator, GeneratedResponse, ResponseGenerator, ResponseRequest};
pub use interruption::InterruptionController;
pub use orchestrator::{
    Command, ConversationOrchestrator, OrchestratorHandle, PipelineState, SessionSnapshot, UiEvent,
};
pub use playback::{PlaybackHandle, PlaybackSlot, PlaybackStatus};
pub use recognizer::{
    RecognitionStream, RecognizerEvent, SpeechDetector, SpeechRecognizer, VadRecognizer,
};
pub use session::{ConversationSession, Message, Role, Utterance};
pub use speech_text::Emotion;
pub use synthesis::{
    BackendKind, LocalSynthesizer, RemoteSynthesizer, SpeechOptions, SpeechSynthesizer,
    SynthesisBackend, SynthesisOutcome,
};
