//! Turn detection ("gap logic").
//!
//! A turn opens on the first speech frame and is committed once `gap` of
//! continuous silence follows it, or when it has run for `max_turn`. Time is
//! counted in frames, so the tracker behaves the same whether it is fed live
//! audio or a recording.

use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// First speech frame of a new turn.
    Started,
    /// The turn closed with enough speech to transcribe.
    Committed {
        samples: Vec<f32>,
        duration: Duration,
        /// Share of frames in the turn the VAD classified as speech.
        confidence: f32,
    },
    /// The turn closed but was shorter than `min_speech`.
    Discarded { duration: Duration },
}

#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub frame: Duration,
    pub gap: Duration,
    pub min_speech: Duration,
    pub max_turn: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Speaking,
    Trailing,
}

pub struct TurnTracker {
    settings: TurnSettings,
    phase: Phase,
    buffer: Vec<f32>,
    /// Frames since the turn opened
    frames: u32,
    speech_frames: u32,
    /// Frame index of the last speech frame
    last_speech: u32,
    silent_run: u32,
}

impl TurnTracker {
    pub fn new(settings: TurnSettings) -> Self {
        Self {
            settings,
            phase: Phase::Idle,
            buffer: Vec::new(),
            frames: 0,
            speech_frames: 0,
            last_speech: 0,
            silent_run: 0,
        }
    }

    fn span(&self, frames: u32) -> Duration {
        self.settings.frame * frames
    }

    pub fn in_turn(&self) -> bool {
        self.phase != Phase::Idle
    }

    /// Audio gathered so far in the open turn.
    pub fn buffered(&self) -> &[f32] {
        &self.buffer
    }

    /// Length of the open turn.
    pub fn elapsed(&self) -> Duration {
        self.span(self.frames)
    }

    pub fn feed(&mut self, is_speech: bool, frame: &[f32]) -> Option<TurnEvent> {
        match (self.phase, is_speech) {
            (Phase::Idle, false) => None,
            (Phase::Idle, true) => {
                debug!("🎤 Speech started");
                self.phase = Phase::Speaking;
                self.buffer.clear();
                self.buffer.extend_from_slice(frame);
                self.frames = 1;
                self.speech_frames = 1;
                self.last_speech = 1;
                self.silent_run = 0;
                Some(TurnEvent::Started)
            }
            (_, true) => {
                self.phase = Phase::Speaking;
                self.buffer.extend_from_slice(frame);
                self.frames += 1;
                self.speech_frames += 1;
                self.last_speech = self.frames;
                self.silent_run = 0;
                if self.elapsed() >= self.settings.max_turn {
                    warn!("⏱️ Max turn duration reached, auto-committing");
                    return Some(self.close());
                }
                None
            }
            (_, false) => {
                self.phase = Phase::Trailing;
                self.buffer.extend_from_slice(frame);
                self.frames += 1;
                self.silent_run += 1;
                if self.span(self.silent_run) >= self.settings.gap
                    || self.elapsed() >= self.settings.max_turn
                {
                    return Some(self.close());
                }
                None
            }
        }
    }

    fn close(&mut self) -> TurnEvent {
        let duration = self.span(self.last_speech);
        let confidence = self.speech_frames as f32 / self.frames.max(1) as f32;
        let samples = std::mem::take(&mut self.buffer);
        self.phase = Phase::Idle;
        self.frames = 0;
        self.speech_frames = 0;
        self.last_speech = 0;
        self.silent_run = 0;

        if duration < self.settings.min_speech {
            debug!("⏭️ Speech too short ({:?}), ignoring", duration);
            return TurnEvent::Discarded { duration };
        }
        info!("🎯 Turn committed: {:?}, {} samples", duration, samples.len());
        TurnEvent::Committed {
            samples,
            duration,
            confidence,
        }
    }
}
