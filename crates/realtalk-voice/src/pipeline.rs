//! Pipeline manager: at most one running generation per connection, plus the conversation history.
//!
//! `prepare_generation` always supersedes whatever is running. The LLM worker streams fragments
//! into the record and reports the accumulated text through [`GenerationEvents`]; the synthesis
//! worker (when a synthesizer is configured) turns that text into audio.

use crate::generation::GenerationRecord;
use crate::synthesis::{run_synthesis, Synthesizer};
use futures::StreamExt;
use realtalk_core::{ChatTurn, GenerationRequest, LlmStreamClient, MetricEvent, MetricsSink, SessionConfig};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Words from the end of each text compared by the abort check.
const ABORT_CHECK_WORDS: usize = 5;

/// Receives text progress of running generations.
pub trait GenerationEvents: Send + Sync {
    /// `text` is everything generated so far for `generation_id`.
    fn on_partial_assistant_text(&self, generation_id: u64, text: &str);
}

#[derive(Default)]
struct PipelineState {
    running: Option<Arc<GenerationRecord>>,
    history: Vec<ChatTurn>,
    next_id: u64,
}

pub struct PipelineManager {
    session_id: String,
    llm: Arc<LlmStreamClient>,
    synthesizer: Option<Arc<dyn Synthesizer>>,
    metrics: Arc<dyn MetricsSink>,
    config: SessionConfig,
    system_prompt: Option<String>,
    events: Weak<dyn GenerationEvents>,
    state: Mutex<PipelineState>,
}

impl PipelineManager {
    pub fn new(
        session_id: impl Into<String>,
        llm: Arc<LlmStreamClient>,
        synthesizer: Option<Arc<dyn Synthesizer>>,
        metrics: Arc<dyn MetricsSink>,
        config: SessionConfig,
        events: Weak<dyn GenerationEvents>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            llm,
            synthesizer,
            metrics,
            config,
            system_prompt: None,
            events,
            state: Mutex::new(PipelineState::default()),
        }
    }

    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt.filter(|p| !p.trim().is_empty());
        self
    }

    fn state(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a generation for `text`, superseding any running one. Returns the new record.
    pub fn prepare_generation(&self, text: &str) -> Arc<GenerationRecord> {
        let (record, stream) = {
            let mut state = self.state();
            if let Some(previous) = state.running.take() {
                self.abort_record(&previous, "superseded");
            }
            state.next_id += 1;
            let request_id = Uuid::new_v4().to_string();
            let record = Arc::new(GenerationRecord::new(
                state.next_id,
                request_id.clone(),
                text,
                self.config.quick_answer_min_chars,
            ));
            let mut request = GenerationRequest::new(text, self.session_id.clone())
                .with_request_id(request_id)
                .with_history(state.history.clone());
            if let Some(prompt) = &self.system_prompt {
                request = request.with_system_prompt(prompt.clone());
            }
            // Registered with the client here, so an abort before the worker runs still cancels it.
            let stream = self.llm.generate(request);
            state.running = Some(Arc::clone(&record));
            (record, stream)
        };

        info!(
            target: "realtalk::session",
            session_id = %self.session_id,
            generation = record.id(),
            "🧠 Generation prepared for: {}",
            text
        );
        self.metrics.record(MetricEvent::GenerationStarted);

        let worker_record = Arc::clone(&record);
        let events = self.events.clone();
        let metrics = Arc::clone(&self.metrics);
        let voiced = self.synthesizer.is_some();
        tokio::spawn(async move {
            let mut stream = Box::pin(stream);
            while let Some(item) = stream.next().await {
                if worker_record.is_aborting() {
                    break;
                }
                match item {
                    Ok(fragment) => {
                        worker_record.append_text(&fragment);
                        if let Some(events) = events.upgrade() {
                            events.on_partial_assistant_text(worker_record.id(), &worker_record.full_answer());
                        }
                    }
                    Err(e) => {
                        error!(target: "realtalk::llm", generation = worker_record.id(), "LLM generation failed: {}", e);
                        metrics.record(MetricEvent::LlmError { kind: e.kind() });
                        break;
                    }
                }
            }
            if worker_record.is_aborting() {
                return;
            }
            worker_record.mark_llm_finished();
            if !voiced {
                worker_record.mark_audio_quick_finished();
                worker_record.mark_audio_final_finished();
            }
            debug!(target: "realtalk::llm", generation = worker_record.id(), "LLM stream finished");
        });

        if let Some(synth) = &self.synthesizer {
            tokio::spawn(run_synthesis(Arc::clone(&record), Arc::clone(synth), self.config.tts_chunk_bytes));
        }
        record
    }

    fn abort_record(&self, record: &GenerationRecord, reason: &str) {
        if record.start_abort() {
            self.llm.cancel(Some(record.request_id()));
            self.metrics.record(MetricEvent::GenerationAborted);
            info!(
                target: "realtalk::session",
                session_id = %self.session_id,
                generation = record.id(),
                "🛑 Generation aborted: {}",
                reason
            );
        }
    }

    /// Abort the running generation, if any. Idempotent.
    pub fn abort_generation(&self, reason: &str) -> bool {
        let running = self.state().running.take();
        match running {
            Some(record) => {
                self.abort_record(&record, reason);
                true
            }
            None => false,
        }
    }

    /// A running generation exists and is not aborting.
    pub fn is_valid_gen(&self) -> bool {
        self.state().running.as_ref().is_some_and(|r| !r.is_aborting())
    }

    pub fn running_generation(&self) -> Option<Arc<GenerationRecord>> {
        self.state().running.clone()
    }

    pub fn is_current(&self, generation_id: u64) -> bool {
        self.state().running.as_ref().is_some_and(|r| r.id() == generation_id)
    }

    /// Clear the running reference once its delivery completed. Ignored if a newer generation runs.
    pub fn finish_generation(&self, generation_id: u64) -> bool {
        let mut state = self.state();
        if state.running.as_ref().is_some_and(|r| r.id() == generation_id) {
            state.running = None;
            return true;
        }
        false
    }

    /// Clear history and abort any running generation.
    pub fn reset(&self) {
        self.state().history.clear();
        self.abort_generation("reset");
    }

    pub fn history(&self) -> Vec<ChatTurn> {
        self.state().history.clone()
    }

    pub fn append_history(&self, turn: ChatTurn) {
        let mut state = self.state();
        state.history.push(turn);
        let limit = self.config.history_limit;
        if limit > 0 && state.history.len() > limit {
            let excess = state.history.len() - limit;
            state.history.drain(..excess);
        }
    }

    /// Abort a speculative generation whose prompt no longer matches what the user is saying.
    /// Generations whose audio gate already opened are never aborted here.
    pub fn check_abort(&self, text: &str, reason: &str) -> bool {
        if text.trim().is_empty() {
            return false;
        }
        let Some(record) = self.running_generation() else {
            return false;
        };
        if record.is_aborting() || record.is_quick_tts_allowed() {
            return false;
        }
        let similarity = word_similarity(text, record.prompt());
        if similarity >= self.config.abort_similarity_threshold {
            return false;
        }
        debug!(
            target: "realtalk::session",
            generation = record.id(),
            "Prompt drifted (similarity {:.2}): '{}' vs '{}'",
            similarity,
            text,
            record.prompt()
        );
        let mut state = self.state();
        if state.running.as_ref().is_some_and(|r| r.id() == record.id()) {
            state.running = None;
            drop(state);
            self.abort_record(&record, reason);
            return true;
        }
        false
    }
}

fn tail_words(text: &str) -> Vec<String> {
    let words: Vec<String> = text
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty())
        .collect();
    let skip = words.len().saturating_sub(ABORT_CHECK_WORDS);
    words.into_iter().skip(skip).collect()
}

/// Similarity of the last few words of two texts: `2 * matches / total`, where matches is
/// the longest common subsequence of words. Two empty texts are identical.
pub fn word_similarity(a: &str, b: &str) -> f64 {
    let a = tail_words(a);
    let b = tail_words(b);
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let mut table = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for i in 1..=a.len() {
        for j in 1..=b.len() {
            table[i][j] = if a[i - 1] == b[j - 1] {
                table[i - 1][j - 1] + 1
            } else {
                table[i - 1][j].max(table[i][j - 1])
            };
        }
    }
    2.0 * table[a.len()][b.len()] as f64 / (a.len() + b.len()) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use realtalk_core::{NoopMetrics, RetryPolicy, Role, ScriptStep, ScriptedBackend};

    #[derive(Default)]
    struct Texts(Mutex<Vec<(u64, String)>>);

    impl GenerationEvents for Texts {
        fn on_partial_assistant_text(&self, generation_id: u64, text: &str) {
            self.0.lock().unwrap().push((generation_id, text.to_string()));
        }
    }

    fn manager(backend: ScriptedBackend, events: &Arc<Texts>) -> (PipelineManager, Arc<LlmStreamClient>) {
        let llm = Arc::new(LlmStreamClient::new(Arc::new(backend), RetryPolicy::default(), Arc::new(NoopMetrics)));
        let weak = Arc::downgrade(events);
        let weak: Weak<dyn GenerationEvents> = weak;
        let manager = PipelineManager::new("s1", Arc::clone(&llm), None, Arc::new(NoopMetrics), SessionConfig::default(), weak);
        (manager, llm)
    }

    #[tokio::test]
    async fn generation_streams_into_record() {
        let events = Arc::new(Texts::default());
        let (manager, _llm) = manager(ScriptedBackend::replying(&["Hello", " world"]), &events);
        let record = manager.prepare_generation("hi");
        assert!(manager.is_valid_gen());
        record.wait_for(|r| r.is_llm_finished()).await;
        assert_eq!(record.full_answer(), "Hello world");
        assert!(record.is_audio_final_finished(), "no synthesizer: audio counts as done");
        let texts = events.0.lock().unwrap().clone();
        assert_eq!(texts.last(), Some(&(1, "Hello world".to_string())));
    }

    #[tokio::test]
    async fn repeated_prepare_keeps_only_latest() {
        let events = Arc::new(Texts::default());
        let backend = ScriptedBackend::new().with_fallback(vec![ScriptStep::Hang]);
        let (manager, llm) = manager(backend, &events);
        let first = manager.prepare_generation("what is");
        let second = manager.prepare_generation("what is the time");
        assert!(first.is_aborting());
        assert!(!second.is_aborting());
        assert!(manager.is_current(second.id()));
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert!(!llm.is_registered(first.request_id()), "superseded request is cancelled and deregistered");
        assert!(llm.is_registered(second.request_id()));
        assert!(manager.abort_generation("test"));
        assert!(!manager.abort_generation("test"), "second abort is a no-op");
        assert!(second.is_aborting());
    }

    #[tokio::test]
    async fn history_respects_limit_and_reset() {
        let events = Arc::new(Texts::default());
        let backend = ScriptedBackend::replying(&["ok"]);
        let llm = Arc::new(LlmStreamClient::new(Arc::new(backend), RetryPolicy::default(), Arc::new(NoopMetrics)));
        let weak = Arc::downgrade(&events);
        let weak: Weak<dyn GenerationEvents> = weak;
        let config = SessionConfig {
            history_limit: 2,
            ..SessionConfig::default()
        };
        let manager = PipelineManager::new("s1", llm, None, Arc::new(NoopMetrics), config, weak);
        manager.append_history(ChatTurn::user("one"));
        manager.append_history(ChatTurn::assistant("two"));
        manager.append_history(ChatTurn::user("three"));
        let history = manager.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::Assistant);
        manager.prepare_generation("x");
        manager.reset();
        assert!(manager.history().is_empty());
        assert!(manager.running_generation().is_none());
    }

    #[tokio::test]
    async fn check_abort_only_hits_speculative_generations() {
        let events = Arc::new(Texts::default());
        let backend = ScriptedBackend::new().with_fallback(vec![ScriptStep::Hang]);
        let (manager, _llm) = manager(backend, &events);

        let record = manager.prepare_generation("book a table for two");
        assert!(!manager.check_abort("book a table for two", "partial"));
        assert!(manager.check_abort("book a table for four people tonight", "partial"));
        assert!(record.is_aborting());
        assert!(manager.running_generation().is_none());

        let gated = manager.prepare_generation("hello");
        gated.allow_quick_tts();
        assert!(!manager.check_abort("something else entirely", "partial"));
        assert!(!gated.is_aborting());
    }

    #[tokio::test]
    async fn finish_ignores_stale_ids() {
        let events = Arc::new(Texts::default());
        let (manager, _llm) = manager(ScriptedBackend::replying(&["a"]), &events);
        let first = manager.prepare_generation("a");
        let second = manager.prepare_generation("b");
        assert!(!manager.finish_generation(first.id()));
        assert!(manager.finish_generation(second.id()));
        assert!(!manager.is_valid_gen());
    }

    #[test]
    fn similarity_uses_trailing_words() {
        assert_eq!(word_similarity("Hello there!", "hello there"), 1.0);
        assert_eq!(word_similarity("", ""), 1.0);
        assert_eq!(word_similarity("a b", ""), 0.0);
        assert!((word_similarity("one two three", "one two four") - 2.0 * 2.0 / 6.0).abs() < 1e-9);
        // Only the last five words count.
        assert_eq!(word_similarity("x y z a b c d e", "a b c d e"), 1.0);
    }
}
