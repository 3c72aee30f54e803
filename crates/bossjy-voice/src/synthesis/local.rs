//! On-device TTS through an espeak-ng compatible engine, one child process per segment.

use super::{BackendKind, SpeechOptions, SynthesisBackend};
use crate::audio::PlaybackEnd;
use crate::config::LocalSynthesisConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::speech_text::{self, Emotion, SpeechSegment};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// espeak-ng speaks at 175 words per minute at rate 1.0.
const BASE_WPM: f32 = 175.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalSpeechEvent {
    Start,
    End,
    Error(String),
    Paused,
    Resumed,
}

fn fail(reason: impl Into<String>) -> VoiceError {
    VoiceError::synthesis(BackendKind::Local, reason)
}

pub struct LocalSynthesizer {
    config: LocalSynthesisConfig,
    events: broadcast::Sender<LocalSpeechEvent>,
    /// Pid of the engine process currently speaking
    speaking: Arc<Mutex<Option<u32>>>,
}

impl LocalSynthesizer {
    pub fn new(config: LocalSynthesisConfig) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            config,
            events,
            speaking: Arc::new(Mutex::new(None)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LocalSpeechEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: LocalSpeechEvent) {
        let _ = self.events.send(event);
    }

    fn set_speaking(&self, pid: Option<u32>) {
        *self.speaking.lock().unwrap_or_else(PoisonError::into_inner) = pid;
    }

    fn speaking_pid(&self) -> Option<u32> {
        *self.speaking.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Engine voice: explicit setting, else derived from the language tag.
    pub fn voice(&self) -> String {
        if let Some(voice) = &self.config.voice {
            return voice.clone();
        }
        let tag = self.config.language_tag.to_ascii_lowercase();
        if tag.starts_with("zh") || tag.starts_with("cmn") {
            "cmn".to_string()
        } else {
            tag.split(['-', '_']).next().unwrap_or("en").to_string()
        }
    }

    /// Command-line arguments for one segment.
    pub fn engine_args(&self, segment: &SpeechSegment, options: &SpeechOptions) -> Vec<String> {
        let emotion = if segment.emotion != Emotion::Neutral {
            segment.emotion
        } else {
            options.emotion
        };
        let (pitch_factor, rate_factor) = emotion.prosody();
        let rate = self.config.rate * segment.speed * rate_factor * options.speed.unwrap_or(1.0);
        let wpm = (BASE_WPM * rate).round().clamp(80.0, 450.0) as u32;
        let pitch = (50.0 * self.config.pitch * pitch_factor).round().clamp(0.0, 99.0) as u32;
        let amplitude = (100.0 * self.config.volume).round().clamp(0.0, 200.0) as u32;
        vec![
            "-v".to_string(),
            options.voice.clone().unwrap_or_else(|| self.voice()),
            "-s".to_string(),
            wpm.to_string(),
            "-p".to_string(),
            pitch.to_string(),
            "-a".to_string(),
            amplitude.to_string(),
            "--".to_string(),
            segment.text.clone(),
        ]
    }

    async fn speak_segment(
        &self,
        segment: &SpeechSegment,
        options: &SpeechOptions,
        cancel: &CancellationToken,
    ) -> VoiceResult<PlaybackEnd> {
        let mut child = Command::new(&self.config.program)
            .args(self.engine_args(segment, options))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| fail(format!("failed to launch {}: {}", self.config.program, e)))?;
        self.set_speaking(child.id());

        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };
        let result = match status {
            Some(Ok(s)) if s.success() => Ok(PlaybackEnd::Finished),
            Some(Ok(s)) => Err(fail(format!("{} exited with {}", self.config.program, s))),
            Some(Err(e)) => Err(fail(e.to_string())),
            None => {
                if let Err(e) = child.kill().await {
                    warn!("failed to stop local speech engine: {}", e);
                }
                Ok(PlaybackEnd::Cancelled)
            }
        };
        self.set_speaking(None);
        result
    }

    /// Suspend the engine mid-utterance. Returns `false` when nothing is speaking.
    pub fn pause(&self) -> VoiceResult<bool> {
        let Some(pid) = self.speaking_pid() else {
            return Ok(false);
        };
        signal(pid, Signal::Stop)?;
        self.emit(LocalSpeechEvent::Paused);
        Ok(true)
    }

    pub fn resume(&self) -> VoiceResult<bool> {
        let Some(pid) = self.speaking_pid() else {
            return Ok(false);
        };
        signal(pid, Signal::Continue)?;
        self.emit(LocalSpeechEvent::Resumed);
        Ok(true)
    }
}

enum Signal {
    Stop,
    Continue,
}

#[cfg(unix)]
fn signal(pid: u32, signal: Signal) -> VoiceResult<()> {
    let sig = match signal {
        Signal::Stop => libc::SIGSTOP,
        Signal::Continue => libc::SIGCONT,
    };
    // SAFETY: kill(2) with a pid we spawned and still hold; it has no memory effects.
    let rc = unsafe { libc::kill(pid as libc::pid_t, sig) };
    if rc == 0 {
        Ok(())
    } else {
        Err(fail(std::io::Error::last_os_error().to_string()))
    }
}

#[cfg(not(unix))]
fn signal(_pid: u32, _signal: Signal) -> VoiceResult<()> {
    Err(fail("pause/resume is not supported on this platform"))
}

#[async_trait]
impl SynthesisBackend for LocalSynthesizer {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn speak(
        &self,
        text: &str,
        options: &SpeechOptions,
        cancel: &CancellationToken,
    ) -> VoiceResult<PlaybackEnd> {
        if cancel.is_cancelled() {
            return Ok(PlaybackEnd::Cancelled);
        }
        let segments = speech_text::segment(text);
        if segments.is_empty() {
            return Ok(PlaybackEnd::Finished);
        }
        info!("🗣️ Local speech: {} segment(s) via {}", segments.len(), self.config.program);
        self.emit(LocalSpeechEvent::Start);

        let last = segments.len() - 1;
        for (i, segment) in segments.iter().enumerate() {
            match self.speak_segment(segment, options, cancel).await {
                Ok(PlaybackEnd::Finished) => {}
                Ok(PlaybackEnd::Cancelled) => {
                    self.emit(LocalSpeechEvent::End);
                    return Ok(PlaybackEnd::Cancelled);
                }
                Err(e) => {
                    self.emit(LocalSpeechEvent::Error(e.to_string()));
                    return Err(e);
                }
            }
            if i < last {
                tokio::select! {
                    _ = tokio::time::sleep(segment.pause) => {}
                    _ = cancel.cancelled() => {
                        self.emit(LocalSpeechEvent::End);
                        return Ok(PlaybackEnd::Cancelled);
                    }
                }
            }
        }
        debug!("local speech finished");
        self.emit(LocalSpeechEvent::End);
        Ok(PlaybackEnd::Finished)
    }
}
