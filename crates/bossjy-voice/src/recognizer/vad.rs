//! Voice Activity Detection using WebRTC VAD

use crate::error::{VoiceError, VoiceResult};
use tracing::debug;
use webrtc_vad::{SampleRate, Vad, VadMode};

fn vad_mode(mode: u8) -> VadMode {
    match mode {
        0 => VadMode::Quality,
        1 => VadMode::LowBitrate,
        2 => VadMode::Aggressive,
        _ => VadMode::VeryAggressive,
    }
}

fn vad_rate(sample_rate: u32) -> VoiceResult<SampleRate> {
    match sample_rate {
        8000 => Ok(SampleRate::Rate8kHz),
        16000 => Ok(SampleRate::Rate16kHz),
        32000 => Ok(SampleRate::Rate32kHz),
        48000 => Ok(SampleRate::Rate48kHz),
        other => Err(VoiceError::Config(format!(
            "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {}",
            other
        ))),
    }
}

/// Per-frame speech/silence classifier. Not `Send`; build it on the thread that uses it.
pub struct VadDetector {
    vad: Vad,
    frame_len: usize,
}

impl VadDetector {
    pub fn new(sample_rate: u32, mode: u8, frame_len: usize) -> VoiceResult<Self> {
        let rate = vad_rate(sample_rate)?;
        if mode > 3 {
            return Err(VoiceError::Config(format!("VAD mode must be 0-3, got {}", mode)));
        }
        let mut vad = Vad::new();
        vad.set_mode(vad_mode(mode));
        vad.set_sample_rate(rate);
        debug!(
            "VAD ready ({}Hz, mode {}, {} samples/frame)",
            sample_rate, mode, frame_len
        );
        Ok(Self { vad, frame_len })
    }
}

/// Speech/silence decision for one capture frame.
pub trait SpeechDetector {
    fn is_speech(&mut self, frame: &[f32]) -> VoiceResult<bool>;
}

impl SpeechDetector for VadDetector {
    /// The frame must be exactly `frame_len` samples.
    fn is_speech(&mut self, frame: &[f32]) -> VoiceResult<bool> {
        if frame.len() != self.frame_len {
            return Err(VoiceError::Vad(format!(
                "Expected {} samples, got {}",
                self.frame_len,
                frame.len()
            )));
        }
        let pcm: Vec<i16> = frame
            .iter()
            .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
            .collect();
        self.vad
            .is_voice_segment(&pcm)
            .map_err(|_| VoiceError::Vad("invalid frame length for VAD".to_string()))
    }
}
