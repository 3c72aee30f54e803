//! Pipeline configuration.
//!
//! Precedence: built-in defaults < TOML file (`BOSSJY_VOICE_CONFIG`, default
//! `config/voice.toml`) < environment (`BOSSJY__SECTION__KEY`, e.g.
//! `BOSSJY__SYNTHESIS__REMOTE__API_KEY`).

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for the whole pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub capture: CaptureConfig,
    pub recognizer: RecognizerConfig,
    pub orchestrator: OrchestratorConfig,
    pub synthesis: SynthesisConfig,
    pub generator: GeneratorConfig,
}

/// Microphone capture settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,
    /// Number of channels (default: 1 for mono)
    pub channels: u16,
    /// Samples per chunk (default: 480 = 30ms at 16kHz)
    pub chunk_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            chunk_size: 480,
        }
    }
}

/// Streaming recognizer settings (VAD, turn gap, transcription endpoint)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizerConfig {
    pub language_tag: String,
    /// WebRTC VAD aggressiveness, 0-3
    pub vad_mode: u8,
    /// Silence after speech that closes a turn
    pub gap_ms: u64,
    /// Turns shorter than this are dropped
    pub min_speech_ms: u64,
    /// A turn is force-closed after this much speech
    pub max_turn_ms: u64,
    /// Interval between interim transcriptions while the user is talking
    pub partial_interval_ms: u64,
    pub stt_api_url: String,
    pub stt_api_key: Option<String>,
    pub stt_model: String,
    pub stt_timeout_ms: u64,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            language_tag: "zh-TW".to_string(),
            vad_mode: 2,
            gap_ms: 800,
            min_speech_ms: 200,
            max_turn_ms: 10_000,
            partial_interval_ms: 1200,
            stt_api_url: "https://api.openai.com/v1".to_string(),
            stt_api_key: None,
            stt_model: "whisper-1".to_string(),
            stt_timeout_ms: 30_000,
        }
    }
}

impl RecognizerConfig {
    pub fn gap(&self) -> Duration {
        Duration::from_millis(self.gap_ms)
    }

    pub fn min_speech(&self) -> Duration {
        Duration::from_millis(self.min_speech_ms)
    }

    pub fn max_turn(&self) -> Duration {
        Duration::from_millis(self.max_turn_ms)
    }

    pub fn partial_interval(&self) -> Duration {
        Duration::from_millis(self.partial_interval_ms)
    }
}

/// Turn-taking settings for the conversation state machine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Pause after natural playback end before listening again
    pub settle_delay_ms: u64,
    /// Messages kept in the conversation window
    pub history_limit: usize,
    /// Delay before retrying a recognizer that failed to start
    pub restart_delay_ms: u64,
    /// Capacity of the UI event broadcast
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 500,
            history_limit: 20,
            restart_delay_ms: 1000,
            event_capacity: 256,
        }
    }
}

impl OrchestratorConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub remote: RemoteSynthesisConfig,
    pub local: LocalSynthesisConfig,
}

/// OpenAI-compatible `/audio/speech` endpoint (GLM, OpenAI, OpenRouter)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSynthesisConfig {
    /// Base URL without trailing slash
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub voice: String,
    pub speed: f32,
    pub timeout_ms: u64,
}

impl Default for RemoteSynthesisConfig {
    fn default() -> Self {
        Self {
            api_url: "https://open.bigmodel.cn/api/paas/v4".to_string(),
            api_key: None,
            model: "tts-1".to_string(),
            voice: "tongtong".to_string(),
            speed: 1.0,
            timeout_ms: 15_000,
        }
    }
}

impl RemoteSynthesisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// On-device speech engine, driven as a child process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSynthesisConfig {
    pub program: String,
    /// Engine voice; derived from `language_tag` when unset
    pub voice: Option<String>,
    pub language_tag: String,
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
}

impl Default for LocalSynthesisConfig {
    fn default() -> Self {
        Self {
            program: "espeak-ng".to_string(),
            voice: None,
            language_tag: "zh-TW".to_string(),
            rate: 1.1,
            pitch: 1.0,
            volume: 1.0,
        }
    }
}

/// External response generator (OpenAI-compatible chat completions)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub system_prompt: String,
    pub timeout_ms: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            api_url: "https://open.bigmodel.cn/api/paas/v4".to_string(),
            api_key: None,
            model: "glm-4-flash".to_string(),
            system_prompt: "你是豆包，一位親切自然的瓦斯配送客服助理。請用繁體中文簡短口語化地回答。"
                .to_string(),
            timeout_ms: 30_000,
        }
    }
}

impl GeneratorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl VoiceConfig {
    /// Load config from file and environment.
    pub fn load() -> VoiceResult<Self> {
        let config_path =
            std::env::var("BOSSJY_VOICE_CONFIG").unwrap_or_else(|_| "config/voice.toml".to_string());
        let builder = config::Config::builder();

        let path = Path::new(&config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("BOSSJY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut cfg: VoiceConfig = built.try_deserialize()?;
        cfg.apply_key_fallbacks();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Plain API-key variables (`GLM_API_KEY`, `TTS_API_KEY`, `STT_API_KEY`) fill
    /// keys the structured sources left empty.
    fn apply_key_fallbacks(&mut self) {
        fn first_env(names: &[&str]) -> Option<String> {
            names
                .iter()
                .filter_map(|n| std::env::var(n).ok())
                .map(|v| v.trim().to_string())
                .find(|v| !v.is_empty())
        }
        if self.synthesis.remote.api_key.is_none() {
            self.synthesis.remote.api_key = first_env(&["TTS_API_KEY", "GLM_API_KEY"]);
        }
        if self.generator.api_key.is_none() {
            self.generator.api_key = first_env(&["GLM_API_KEY", "OPENAI_API_KEY"]);
        }
        if self.recognizer.stt_api_key.is_none() {
            self.recognizer.stt_api_key = first_env(&["STT_API_KEY", "OPENAI_API_KEY"]);
        }
    }

    pub fn validate(&self) -> VoiceResult<()> {
        let rate = self.capture.sample_rate;
        if !matches!(rate, 8000 | 16000 | 32000 | 48000) {
            return Err(VoiceError::Config(format!(
                "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {}",
                rate
            )));
        }
        let frame_ms = self.capture.chunk_size as u64 * 1000 / rate as u64;
        if !matches!(frame_ms, 10 | 20 | 30) || self.capture.chunk_size as u64 * 1000 % rate as u64 != 0 {
            return Err(VoiceError::Config(format!(
                "chunk_size {} is not a 10/20/30ms frame at {}Hz",
                self.capture.chunk_size, rate
            )));
        }
        if self.capture.channels != 1 {
            return Err(VoiceError::Config("capture must be mono".to_string()));
        }
        if self.recognizer.vad_mode > 3 {
            return Err(VoiceError::Config(format!(
                "VAD mode must be 0-3, got {}",
                self.recognizer.vad_mode
            )));
        }
        if self.orchestrator.history_limit == 0 {
            return Err(VoiceError::Config("history_limit must be positive".to_string()));
        }
        if self.orchestrator.event_capacity == 0 {
            return Err(VoiceError::Config("event_capacity must be positive".to_string()));
        }
        let local = &self.synthesis.local;
        if !(0.1..=10.0).contains(&local.rate)
            || !(0.0..=2.0).contains(&local.pitch)
            || !(0.0..=1.0).contains(&local.volume)
        {
            return Err(VoiceError::Config(format!(
                "local voice out of range (rate {}, pitch {}, volume {})",
                local.rate, local.pitch, local.volume
            )));
        }
        if self.synthesis.remote.speed <= 0.0 {
            return Err(VoiceError::Config("remote speed must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = VoiceConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.orchestrator.history_limit, 20);
        assert_eq!(cfg.orchestrator.settle_delay(), Duration::from_millis(500));
        assert_eq!(cfg.recognizer.language_tag, "zh-TW");
    }

    #[test]
    fn rejects_unsupported_sample_rate() {
        let mut cfg = VoiceConfig::default();
        cfg.capture.sample_rate = 44100;
        assert!(matches!(cfg.validate(), Err(VoiceError::Config(_))));
    }

    #[test]
    fn rejects_odd_frame_size() {
        let mut cfg = VoiceConfig::default();
        cfg.capture.chunk_size = 500;
        assert!(cfg.validate().is_err());

        cfg.capture.chunk_size = 320;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_empty_history_window() {
        let mut cfg = VoiceConfig::default();
        cfg.orchestrator.history_limit = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let built = config::Config::builder()
            .add_source(config::File::from_str(
                "[orchestrator]\nsettle_delay_ms = 250\n[synthesis.remote]\nvoice = \"xiaochen\"\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let cfg: VoiceConfig = built.try_deserialize().unwrap();
        assert_eq!(cfg.orchestrator.settle_delay_ms, 250);
        assert_eq!(cfg.orchestrator.history_limit, 20);
        assert_eq!(cfg.synthesis.remote.voice, "xiaochen");
        assert_eq!(cfg.synthesis.remote.model, "tts-1");
    }
}
