//! OpenAI-compatible streaming backend (`/chat/completions` with `stream: true`).
//!
//! Works against OpenAI, OpenRouter and most self-hosted gateways that speak the same SSE format.

use super::backend::{ChatTurn, FragmentStream, GenerationRequest, LlmBackend};
use crate::config::LlmConfig;
use crate::error::{FaultKind, ProviderFault};
use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatTurn>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

pub struct OpenAiCompatBackend {
    base_url: String,
    api_key: String,
    model: String,
    temperature: Option<f32>,
    read_timeout: Duration,
    client: reqwest::Client,
}

impl OpenAiCompatBackend {
    /// Build from config. Returns `None` when no API key is configured.
    pub fn from_config(cfg: &LlmConfig) -> Option<Self> {
        let key = cfg.api_key.as_deref()?.trim().to_string();
        if key.is_empty() {
            return None;
        }
        Some(
            Self::new(&cfg.api_url, key, &cfg.model, cfg.connect_timeout(), cfg.read_timeout())
                .with_temperature(cfg.temperature),
        )
    }

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: None,
            read_timeout,
            client,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

#[async_trait]
impl LlmBackend for OpenAiCompatBackend {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn open_stream(&self, request: &GenerationRequest) -> Result<FragmentStream, ProviderFault> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: request.messages(),
            stream: true,
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderFault::new(FaultKind::Unclassified, format!("Request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let detail: String = detail.chars().take(300).collect();
            return Err(ProviderFault::new(
                classify_status(status.as_u16()),
                format!("API error {status}: {detail}"),
            ));
        }

        let read_timeout = self.read_timeout;
        let mut bytes = response.bytes_stream();
        Ok(Box::pin(stream! {
            let mut parser = SseParser::default();
            let mut done = false;
            while !done {
                let chunk = match tokio::time::timeout(read_timeout, bytes.next()).await {
                    Err(_) => {
                        yield Err(ProviderFault::new(
                            FaultKind::Unclassified,
                            format!("No data for {read_timeout:?}"),
                        ));
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        yield Err(ProviderFault::new(FaultKind::Unclassified, format!("Stream error: {e}")));
                        break;
                    }
                    Ok(Some(Ok(chunk))) => chunk,
                };
                for event in parser.push(&chunk) {
                    match event {
                        SseEvent::Delta(text) => {
                            yield Ok(text);
                        }
                        SseEvent::Failed(fault) => {
                            yield Err(fault);
                            done = true;
                            break;
                        }
                        SseEvent::Done => {
                            done = true;
                            break;
                        }
                    }
                }
            }
        }))
    }
}

/// Map an HTTP status to the provider fault taxonomy.
pub fn classify_status(status: u16) -> FaultKind {
    match status {
        400 | 422 => FaultKind::InvalidRequest,
        401 | 403 => FaultKind::AccessDenied,
        404 => FaultKind::ResourceNotFound,
        429 => FaultKind::Throttled,
        500..=599 => FaultKind::ProviderInternalError,
        _ => FaultKind::Unclassified,
    }
}

#[derive(Debug, PartialEq)]
enum SseEvent {
    Delta(String),
    Failed(ProviderFault),
    Done,
}

/// Line-buffered parser for `data: {...}` events. Lines may span network chunks.
#[derive(Debug, Default)]
struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']);
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim_start();
            if data == "[DONE]" {
                events.push(SseEvent::Done);
                break;
            }
            match serde_json::from_str::<serde_json::Value>(data) {
                Ok(json) => {
                    if let Some(error) = json.get("error") {
                        let message = error["message"].as_str().unwrap_or("provider error").to_string();
                        events.push(SseEvent::Failed(ProviderFault::new(FaultKind::ProviderInternalError, message)));
                        break;
                    }
                    if let Some(delta) = json["choices"][0]["delta"]["content"].as_str() {
                        if !delta.is_empty() {
                            events.push(SseEvent::Delta(delta.to_string()));
                        }
                    }
                }
                Err(e) => debug!(target: "realtalk::llm", "Skipping malformed SSE payload: {}", e),
            }
        }
        events
    }
}
