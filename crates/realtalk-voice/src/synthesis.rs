//! **Synthesis**: text-to-speech backends and the per-generation synthesis worker.
//!
//! The worker waits for the quick-answer gate, voices the quick answer, then the final
//! segment when one is expected. PCM is split into fixed-size chunks and pushed onto the
//! generation record, where the dispatcher picks them up. Abortion stops it at the next chunk.

use crate::error::{VoiceError, VoiceResult};
use crate::generation::GenerationRecord;
use async_trait::async_trait;
use realtalk_core::TtsConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Backend that turns text into raw 16-bit PCM. Implement for OpenAI-compatible or local TTS.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize text to PCM bytes. Return an empty vec to skip the segment.
    async fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>>;
}

/// Bytes of silence produced per word by [`PlaceholderTts`] (100ms of 24kHz 16-bit mono).
const PLACEHOLDER_BYTES_PER_WORD: usize = 4800;

/// Placeholder TTS: a short stretch of silence per word, so the dispatch path can be
/// exercised without an API.
#[derive(Debug, Default)]
pub struct PlaceholderTts;

#[async_trait]
impl Synthesizer for PlaceholderTts {
    async fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>> {
        let words = text.split_whitespace().count();
        Ok(vec![0u8; words * PLACEHOLDER_BYTES_PER_WORD])
    }
}

/// Production TTS backend: OpenAI-compatible `/audio/speech` returning raw PCM.
#[derive(Debug, Clone)]
pub struct OpenAiCompatTts {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    /// Bearer API key.
    pub api_key: String,
    /// TTS model: tts-1 (fast) or tts-1-hd (higher quality).
    pub model: String,
    /// alloy, echo, fable, onyx, nova, shimmer, etc.
    pub voice: String,
    client: reqwest::Client,
}

impl OpenAiCompatTts {
    /// Build from the TTS config. Returns `None` when no key is configured.
    pub fn from_config(cfg: &TtsConfig) -> Option<VoiceResult<Self>> {
        let key = cfg.api_key.as_deref()?.trim();
        if key.is_empty() {
            return None;
        }
        Some(Self::new(&cfg.api_url, key, &cfg.model).map(|tts| tts.with_voice(&cfg.voice)))
    }

    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            voice: "nova".to_string(),
            client,
        })
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }
}

#[async_trait]
impl Synthesizer for OpenAiCompatTts {
    async fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/audio/speech", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": self.voice,
            "response_format": "pcm",
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Tts(format!("TTS API error {}: {}", status, body)));
        }
        let bytes = res.bytes().await.map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Drive synthesis for one generation until its audio is finished or it is aborted.
pub async fn run_synthesis(record: Arc<GenerationRecord>, synth: Arc<dyn Synthesizer>, chunk_bytes: usize) {
    let chunk_bytes = chunk_bytes.max(2);

    record
        .wait_for(|r| r.is_aborting() || (r.is_quick_tts_allowed() && (r.quick_answer_provided() || r.is_llm_finished())))
        .await;
    if record.is_aborting() {
        return;
    }

    let quick = record.quick_answer();
    if !voice_segment(&record, synth.as_ref(), &quick, chunk_bytes).await {
        return;
    }
    record.mark_audio_quick_finished();
    debug!(target: "realtalk::synthesis", generation = record.id(), "Quick answer voiced");

    record.wait_for(|r| r.is_aborting() || r.is_llm_finished()).await;
    if record.is_aborting() {
        return;
    }
    if record.final_expected() {
        let final_part = record.final_answer();
        if !voice_segment(&record, synth.as_ref(), &final_part, chunk_bytes).await {
            return;
        }
    }
    record.mark_audio_final_finished();
    info!(target: "realtalk::synthesis", generation = record.id(), "🔊 Synthesis complete");
}

/// Synthesize `text` and queue it chunk by chunk. Returns `false` once the record is aborting.
async fn voice_segment(record: &GenerationRecord, synth: &dyn Synthesizer, text: &str, chunk_bytes: usize) -> bool {
    if text.trim().is_empty() {
        return !record.is_aborting();
    }
    let pcm = match synth.synthesize(text).await {
        Ok(pcm) => pcm,
        Err(e) => {
            warn!(target: "realtalk::synthesis", generation = record.id(), "TTS failed, segment skipped: {}", e);
            return !record.is_aborting();
        }
    };
    for chunk in pcm.chunks(chunk_bytes) {
        if !record.push_audio(chunk.to_vec()) {
            debug!(target: "realtalk::synthesis", generation = record.id(), "Aborted, dropping remaining audio");
            return false;
        }
        tokio::task::yield_now().await;
    }
    !record.is_aborting()
}
