//! Speech-to-text for a span of captured audio.

use crate::config::RecognizerConfig;
use crate::error::{VoiceError, VoiceResult};
use once_cell::sync::OnceCell;
use std::io::Cursor;
use std::time::Duration;

/// Converts PCM (mono f32) to text. Blocking; called from the recognizer thread.
pub trait Transcriber: Send + Sync {
    /// Return an empty string when nothing intelligible was said.
    fn transcribe(&self, samples: &[f32], sample_rate: u32) -> VoiceResult<String>;
}

/// Encode mono f32 PCM as 16-bit WAV for upload.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> VoiceResult<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| VoiceError::Recognition(format!("WAV encode failed: {}", e)))?;
        for &s in samples {
            writer
                .write_sample((s.clamp(-1.0, 1.0) * 32767.0).round() as i16)
                .map_err(|e| VoiceError::Recognition(format!("WAV encode failed: {}", e)))?;
        }
        writer
            .finalize()
            .map_err(|e| VoiceError::Recognition(format!("WAV encode failed: {}", e)))?;
    }
    Ok(cursor.into_inner())
}

/// OpenAI-compatible `/audio/transcriptions` endpoint.
#[derive(Debug, Clone)]
pub struct RemoteTranscriber {
    base_url: String,
    api_key: Option<String>,
    model: String,
    /// ISO-639-1 code sent as the `language` hint, e.g. "zh" for zh-TW
    language: String,
    timeout: Duration,
    /// Built on first use, on the recognizer thread rather than the async runtime
    client: OnceCell<reqwest::blocking::Client>,
}

impl RemoteTranscriber {
    pub fn new(config: &RecognizerConfig) -> Self {
        let language = config
            .language_tag
            .split(['-', '_'])
            .next()
            .unwrap_or("zh")
            .to_lowercase();
        Self {
            base_url: config.stt_api_url.trim_end_matches('/').to_string(),
            api_key: config.stt_api_key.clone(),
            model: config.stt_model.clone(),
            language,
            timeout: Duration::from_millis(config.stt_timeout_ms),
            client: OnceCell::new(),
        }
    }

    fn client(&self) -> VoiceResult<&reqwest::blocking::Client> {
        self.client.get_or_try_init(|| {
            reqwest::blocking::Client::builder()
                .timeout(self.timeout)
                .build()
                .map_err(|e| VoiceError::Recognition(e.to_string()))
        })
    }
}

impl Transcriber for RemoteTranscriber {
    fn transcribe(&self, samples: &[f32], sample_rate: u32) -> VoiceResult<String> {
        if samples.is_empty() {
            return Ok(String::new());
        }
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| VoiceError::Recognition("STT API key not configured".to_string()))?;
        let wav = encode_wav(samples, sample_rate)?;
        let url = format!("{}/audio/transcriptions", self.base_url);
        let part = reqwest::blocking::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Recognition(e.to_string()))?;
        let form = reqwest::blocking::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("language", self.language.clone());
        let res = self
            .client()?
            .post(&url)
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .map_err(|e| VoiceError::Recognition(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(VoiceError::Recognition(format!(
                "STT API error {}: {}",
                status, body
            )));
        }
        let json: serde_json::Value = res
            .json()
            .map_err(|e| VoiceError::Recognition(e.to_string()))?;
        Ok(json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string())
    }
}
