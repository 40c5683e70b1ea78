//! **Speech-to-Text (STT)**: turn 16-bit PCM into text for the gap recognizer.
//!
//! Implement `SttBackend` for a local model or a remote transcription API.

use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use realtalk_core::RecognizerConfig;
use std::time::Duration;

/// Backend for converting PCM to text.
#[async_trait]
pub trait SttBackend: Send + Sync {
    /// Transcribe mono 16-bit PCM. Returns an empty string if nothing was recognized.
    async fn transcribe(&self, samples: &[i16], sample_rate: u32) -> VoiceResult<String>;
}

/// Wrap mono 16-bit PCM in a WAV container for API upload.
pub fn pcm_i16_to_wav(samples: &[i16], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let mut buf = Vec::with_capacity(44 + data_len as usize);
    // RIFF header
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_len).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    // fmt subchunk
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&1u16.to_le_bytes()); // mono
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&(sample_rate * 2).to_le_bytes()); // byte rate
    buf.extend_from_slice(&2u16.to_le_bytes()); // block align
    buf.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    // data subchunk
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    for s in samples {
        buf.extend_from_slice(&s.to_le_bytes());
    }
    buf
}

/// Placeholder STT: returns a fixed string. Use for exercising the turn loop without an API.
#[derive(Debug, Default)]
pub struct PlaceholderStt {
    /// If set, return this instead of the default description.
    pub response: Option<String>,
}

impl PlaceholderStt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(s: impl Into<String>) -> Self {
        Self { response: Some(s.into()) }
    }
}

#[async_trait]
impl SttBackend for PlaceholderStt {
    async fn transcribe(&self, samples: &[i16], sample_rate: u32) -> VoiceResult<String> {
        if let Some(ref r) = self.response {
            return Ok(r.clone());
        }
        let secs = samples.len() as f32 / sample_rate.max(1) as f32;
        Ok(format!("I spoke for {:.1} seconds", secs))
    }
}

/// OpenAI-compatible transcription API (`POST {base}/audio/transcriptions`, multipart).
#[derive(Debug, Clone)]
pub struct OpenAiCompatStt {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    pub api_key: String,
    /// whisper-1, gpt-4o-transcribe, etc.
    pub model: String,
    client: reqwest::Client,
}

impl OpenAiCompatStt {
    /// Build from the recognizer config. Returns `None` when no key is configured.
    pub fn from_config(cfg: &RecognizerConfig) -> Option<VoiceResult<Self>> {
        let key = cfg.stt_api_key.as_deref()?.trim();
        if key.is_empty() {
            return None;
        }
        Some(Self::new(&cfg.stt_api_url, key, &cfg.stt_model))
    }

    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }
}

#[async_trait]
impl SttBackend for OpenAiCompatStt {
    async fn transcribe(&self, samples: &[i16], sample_rate: u32) -> VoiceResult<String> {
        if samples.is_empty() {
            return Ok(String::new());
        }
        let wav = pcm_i16_to_wav(samples, sample_rate);
        let url = format!("{}/audio/transcriptions", self.base_url);
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Stt(format!("STT API error {}: {}", status, body)));
        }
        let json: serde_json::Value = res.json().await.map_err(|e| VoiceError::Stt(e.to_string()))?;
        Ok(json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_header_describes_payload() {
        let wav = pcm_i16_to_wav(&[1, -1, 300], 16000);
        assert_eq!(wav.len(), 44 + 6);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(u32::from_le_bytes([wav[4], wav[5], wav[6], wav[7]]), 36 + 6);
        assert_eq!(u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]), 16000);
        assert_eq!(u32::from_le_bytes([wav[40], wav[41], wav[42], wav[43]]), 6);
        assert_eq!(&wav[44..46], &1i16.to_le_bytes());
    }

    #[tokio::test]
    async fn placeholder_prefers_configured_response() {
        let stt = PlaceholderStt::with_response("hi");
        assert_eq!(stt.transcribe(&[0; 160], 16000).await.unwrap(), "hi");
        let described = PlaceholderStt::new().transcribe(&[0; 16000], 16000).await.unwrap();
        assert_eq!(described, "I spoke for 1.0 seconds");
    }

    #[test]
    fn from_config_needs_a_key() {
        let mut cfg = RecognizerConfig::default();
        assert!(OpenAiCompatStt::from_config(&cfg).is_none());
        cfg.stt_api_key = Some("sk-test".into());
        let stt = OpenAiCompatStt::from_config(&cfg).unwrap().unwrap();
        assert_eq!(stt.model, "whisper-1");
    }
}
