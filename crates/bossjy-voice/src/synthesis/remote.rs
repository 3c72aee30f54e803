//! Remote TTS: OpenAI-compatible `/audio/speech` (GLM, OpenAI, OpenRouter).

use super::{BackendKind, SpeechOptions, SynthesisBackend};
use crate::audio::{AudioOutput, PlaybackEnd};
use crate::config::RemoteSynthesisConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::speech_text::clean_for_speech;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct RemoteSynthesizer {
    config: RemoteSynthesisConfig,
    client: reqwest::Client,
    output: Arc<dyn AudioOutput>,
}

fn fail(reason: impl Into<String>) -> VoiceError {
    VoiceError::synthesis(BackendKind::Remote, reason)
}

impl RemoteSynthesizer {
    pub fn new(config: RemoteSynthesisConfig, output: Arc<dyn AudioOutput>) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| VoiceError::Config(format!("TTS client: {}", e)))?;
        Ok(Self {
            config,
            client,
            output,
        })
    }

    async fn fetch_audio(&self, text: &str, options: &SpeechOptions) -> VoiceResult<Vec<u8>> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| fail("API key not configured"))?;
        let url = format!("{}/audio/speech", self.config.api_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.config.model,
            "input": text,
            "voice": options.voice.as_deref().unwrap_or(&self.config.voice),
            "speed": self.config.speed * options.speed.unwrap_or(1.0),
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(fail(format!("TTS API error {}: {}", status, body)));
        }
        let bytes = res.bytes().await.map_err(|e| fail(e.to_string()))?;
        if bytes.is_empty() {
            return Err(fail("TTS API returned no audio"));
        }
        debug!("remote TTS returned {} bytes", bytes.len());
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl SynthesisBackend for RemoteSynthesizer {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn speak(
        &self,
        text: &str,
        options: &SpeechOptions,
        cancel: &CancellationToken,
    ) -> VoiceResult<PlaybackEnd> {
        let text = clean_for_speech(text);
        if text.is_empty() {
            return Ok(PlaybackEnd::Finished);
        }
        let audio = tokio::select! {
            res = self.fetch_audio(&text, options) => res?,
            _ = cancel.cancelled() => return Ok(PlaybackEnd::Cancelled),
        };
        // Undecodable audio surfaces here as a playback error and falls back like any other failure
        self.output
            .play(audio, cancel.clone())
            .await
            .map_err(|e| fail(e.to_string()))
    }
}
