//! Shared gateway state: collaborators built once at startup and handed to every connection.

use realtalk_core::{
    LlmBackend, LlmStreamClient, MetricsSink, OpenAiCompatBackend, PerformanceMonitor, PlaceholderBackend,
    RealtalkConfig, RetryPolicy,
};
use realtalk_voice::{
    GapRecognizerFactory, OpenAiCompatStt, OpenAiCompatTts, PlaceholderStt, PlaceholderTts, SessionDeps, SttBackend,
    Synthesizer,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

const PLACEHOLDER_REPLY: &str = "I can hear you, but no language model is configured yet.";

#[derive(Clone)]
pub struct AppState {
    pub deps: Arc<SessionDeps>,
    pub monitor: Arc<PerformanceMonitor>,
    active: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(deps: SessionDeps, monitor: Arc<PerformanceMonitor>) -> Self {
        Self {
            deps: Arc::new(deps),
            monitor,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Count a connection for as long as the returned guard lives.
    pub fn track_connection(&self) -> ConnectionGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            active: Arc::clone(&self.active),
        }
    }
}

pub struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Build the shared collaborators from config, falling back to placeholders when a
/// provider has no API key.
pub fn build_deps(config: &RealtalkConfig, monitor: Arc<PerformanceMonitor>) -> SessionDeps {
    let metrics: Arc<dyn MetricsSink> = monitor;

    let backend: Arc<dyn LlmBackend> = match OpenAiCompatBackend::from_config(&config.llm) {
        Some(backend) => {
            info!(target: "realtalk::ws", "LLM: [OpenAI-compatible] {} ({})", config.llm.api_url, config.llm.model);
            Arc::new(backend)
        }
        None => {
            warn!(target: "realtalk::ws", "LLM: [Placeholder] (set OPENAI_API_KEY or REALTALK__LLM__API_KEY)");
            Arc::new(PlaceholderBackend::new(PLACEHOLDER_REPLY))
        }
    };
    let llm = Arc::new(LlmStreamClient::new(
        backend,
        RetryPolicy::from_config(&config.llm),
        Arc::clone(&metrics),
    ));

    let stt: Arc<dyn SttBackend> = match OpenAiCompatStt::from_config(&config.recognizer) {
        Some(Ok(stt)) => {
            info!(target: "realtalk::ws", "STT: [OpenAI-compatible] ({})", config.recognizer.stt_model);
            Arc::new(stt)
        }
        Some(Err(e)) => {
            warn!(target: "realtalk::ws", "STT init failed: {}, using placeholder", e);
            Arc::new(PlaceholderStt::new())
        }
        None => {
            warn!(target: "realtalk::ws", "STT: [Placeholder] (set STT_API_KEY for real transcription)");
            Arc::new(PlaceholderStt::new())
        }
    };

    let synthesizer: Arc<dyn Synthesizer> = match OpenAiCompatTts::from_config(&config.tts) {
        Some(Ok(tts)) => {
            info!(target: "realtalk::ws", "TTS: [OpenAI-compatible] voice {}", config.tts.voice);
            Arc::new(tts)
        }
        Some(Err(e)) => {
            warn!(target: "realtalk::ws", "TTS init failed: {}, using placeholder", e);
            Arc::new(PlaceholderTts)
        }
        None => {
            warn!(target: "realtalk::ws", "TTS: [Placeholder] (set TTS_API_KEY for spoken replies)");
            Arc::new(PlaceholderTts)
        }
    };

    let system_prompt = Some(config.llm.system_prompt.trim().to_string()).filter(|p| !p.is_empty());

    SessionDeps {
        llm,
        recognizers: Arc::new(GapRecognizerFactory::new(config.recognizer.clone(), stt)),
        synthesizer: Some(synthesizer),
        metrics,
        config: config.session.clone(),
        system_prompt,
    }
}
