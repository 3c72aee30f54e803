//! Streaming speech recognition.
//!
//! A [`SpeechRecognizer`] consumes an [`AudioStream`] and produces a
//! [`RecognitionStream`] of interim and final [`Utterance`]s. Once stopped it
//! emits nothing further, and a fresh `start` begins an independent stream.

mod streaming;
mod transcriber;
mod turn;
mod vad;

pub use streaming::{DetectorFactory, VadRecognizer};
pub use transcriber::{encode_wav, RemoteTranscriber, Transcriber};
pub use turn::{TurnEvent, TurnSettings, TurnTracker};
pub use vad::{SpeechDetector, VadDetector};

use crate::audio::AudioStream;
use crate::error::VoiceResult;
use crate::session::Utterance;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum RecognizerEvent {
    Utterance(Utterance),
    /// The stream failed and will produce nothing more.
    Error(String),
}

pub type RecognitionSender = mpsc::UnboundedSender<RecognizerEvent>;

/// Events from one recognizer run. Ends when the recognizer stops or fails.
pub struct RecognitionStream {
    rx: mpsc::UnboundedReceiver<RecognizerEvent>,
}

impl RecognitionStream {
    pub fn channel() -> (RecognitionSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    pub async fn recv(&mut self) -> Option<RecognizerEvent> {
        self.rx.recv().await
    }
}

impl Stream for RecognitionStream {
    type Item = RecognizerEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

pub trait SpeechRecognizer: Send + 'static {
    fn start(&mut self, audio: AudioStream) -> VoiceResult<RecognitionStream>;

    /// Stop the current run. Safe to call when not running.
    fn stop(&mut self);
}
