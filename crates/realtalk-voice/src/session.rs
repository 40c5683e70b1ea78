//! Turn-taking state machine for one connection.
//!
//! ```text
//!             partial / recording start
//!   Idle ───────────────────────────────▶ UserSpeaking
//!    ▲                                        │ before final
//!    │ dispatcher delivers final answer       ▼
//!    └──────────── AssistantSpeaking ◀──── TurnEnding
//!                         │  first tts_chunk sent
//!                         ▼
//!                    Interrupted (barge-in, from any speaking state)
//! ```
//!
//! All mutable connection state lives behind one mutex that is never held across an await.
//! Lock order: session state, then pipeline, then generation record.

use crate::abort_check::spawn_abort_check;
use crate::mic::MicGate;
use crate::pipeline::{GenerationEvents, PipelineManager};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::recognizer::{Recognizer, RecognizerEvents, RecognizerFactory};
use crate::sentence::{normalize_answer, SentenceTracker};
use crate::synthesis::Synthesizer;
use realtalk_core::{ChatTurn, LlmStreamClient, MetricEvent, MetricsSink, SessionConfig};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Collaborators shared by every connection. Connection-exclusive pieces (pipeline,
/// recognizer, queues) are built from these per session.
pub struct SessionDeps {
    pub llm: Arc<LlmStreamClient>,
    pub recognizers: Arc<dyn RecognizerFactory>,
    pub synthesizer: Option<Arc<dyn Synthesizer>>,
    pub metrics: Arc<dyn MetricsSink>,
    pub config: SessionConfig,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    UserSpeaking,
    TurnEnding,
    AssistantSpeaking,
    Interrupted,
}

/// Copy of the observable session flags.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub turn: TurnState,
    pub tts_to_client: bool,
    pub user_interrupted: bool,
    pub tts_client_playing: bool,
    pub user_finished_turn: bool,
    pub silence_active: bool,
    pub potential_abort: bool,
    pub tts_chunk_sent: bool,
    pub final_answer_sent: bool,
    pub mic_muted: bool,
    pub partial_transcription: String,
    pub final_transcription: String,
    pub assistant_answer: String,
}

pub(crate) struct SessionState {
    pub(crate) turn: TurnState,
    pub(crate) tts_to_client: bool,
    pub(crate) user_interrupted: bool,
    pub(crate) tts_client_playing: bool,
    pub(crate) user_finished_turn: bool,
    pub(crate) silence_active: bool,
    pub(crate) potential_abort: bool,
    pub(crate) tts_chunk_sent: bool,
    pub(crate) final_answer_sent: bool,
    pub(crate) partial_transcription: String,
    pub(crate) final_transcription: String,
    pub(crate) last_displayed_partial: String,
    pub(crate) assistant_answer: String,
    pub(crate) sentences: SentenceTracker,
    pub(crate) mic: MicGate,
    pub(crate) turn_ended_at: Option<Instant>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            turn: TurnState::Idle,
            tts_to_client: false,
            user_interrupted: false,
            tts_client_playing: false,
            user_finished_turn: false,
            silence_active: true,
            potential_abort: false,
            tts_chunk_sent: false,
            final_answer_sent: false,
            partial_transcription: String::new(),
            final_transcription: String::new(),
            last_displayed_partial: String::new(),
            assistant_answer: String::new(),
            sentences: SentenceTracker::new(),
            mic: MicGate::default(),
            turn_ended_at: None,
        }
    }
}

pub struct ConnectionSession {
    id: String,
    config: SessionConfig,
    pipeline: Arc<PipelineManager>,
    recognizer: Arc<dyn Recognizer>,
    metrics: Arc<dyn MetricsSink>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    abort_text: watch::Sender<String>,
    abort_worker: Mutex<Option<JoinHandle<()>>>,
    state: Mutex<SessionState>,
}

impl ConnectionSession {
    /// Build the session and its connection-exclusive collaborators. Must be called inside a
    /// tokio runtime (the abort-check worker is spawned here).
    pub fn new(id: impl Into<String>, deps: &SessionDeps, outbound: mpsc::UnboundedSender<ServerMessage>) -> Arc<Self> {
        let id = id.into();
        let (abort_text, abort_rx) = watch::channel(String::new());
        let session = Arc::new_cyclic(|weak: &Weak<ConnectionSession>| {
            let events: Weak<dyn GenerationEvents> = weak.clone();
            let pipeline = PipelineManager::new(
                id.clone(),
                Arc::clone(&deps.llm),
                deps.synthesizer.clone(),
                Arc::clone(&deps.metrics),
                deps.config.clone(),
                events,
            )
            .with_system_prompt(deps.system_prompt.clone());
            ConnectionSession {
                recognizer: deps.recognizers.create(&id),
                id: id.clone(),
                config: deps.config.clone(),
                pipeline: Arc::new(pipeline),
                metrics: Arc::clone(&deps.metrics),
                outbound,
                abort_text,
                abort_worker: Mutex::new(None),
                state: Mutex::new(SessionState::default()),
            }
        });
        let worker = spawn_abort_check(abort_rx, Arc::clone(&session.pipeline));
        *session.abort_worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(worker);
        info!(target: "realtalk::session", session_id = %session.id, "Session created");
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &Arc<PipelineManager> {
        &self.pipeline
    }

    pub fn recognizer(&self) -> Arc<dyn Recognizer> {
        Arc::clone(&self.recognizer)
    }

    pub(crate) fn metrics(&self) -> &dyn MetricsSink {
        self.metrics.as_ref()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a message for the writer. Dropped silently once the connection is closing.
    pub fn emit(&self, message: ServerMessage) {
        if self.outbound.send(message).is_err() {
            debug!(target: "realtalk::session", session_id = %self.id, "Outbound closed, message dropped");
        }
    }

    /// The writer side of the outbound queue is gone.
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    pub fn history(&self) -> Vec<ChatTurn> {
        self.pipeline.history()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let st = self.lock_state();
        SessionSnapshot {
            turn: st.turn,
            tts_to_client: st.tts_to_client,
            user_interrupted: st.user_interrupted,
            tts_client_playing: st.tts_client_playing,
            user_finished_turn: st.user_finished_turn,
            silence_active: st.silence_active,
            potential_abort: st.potential_abort,
            tts_chunk_sent: st.tts_chunk_sent,
            final_answer_sent: st.final_answer_sent,
            mic_muted: st.mic.is_muted(),
            partial_transcription: st.partial_transcription.clone(),
            final_transcription: st.final_transcription.clone(),
            assistant_answer: st.assistant_answer.clone(),
        }
    }

    /// Apply a client control message.
    pub fn handle_client_message(&self, message: ClientMessage) {
        match message {
            ClientMessage::TtsStart => {
                info!(target: "realtalk::session", session_id = %self.id, "▶️ Client playing TTS");
                self.lock_state().tts_client_playing = true;
            }
            ClientMessage::TtsStop => {
                info!(target: "realtalk::session", session_id = %self.id, "⏹️ Client stopped TTS");
                self.lock_state().tts_client_playing = false;
            }
            ClientMessage::ClearHistory => {
                info!(target: "realtalk::session", session_id = %self.id, "🧹 History cleared");
                self.pipeline.reset();
            }
            ClientMessage::SetSpeed { speed } => {
                self.recognizer.set_speed(speed / 100.0);
            }
        }
    }

    /// Whether inbound audio should reach the recognizer. Releases an expired mic mute first.
    pub fn accepts_audio(&self) -> bool {
        let mut st = self.lock_state();
        self.poll_mic_release_locked(&mut st, Instant::now());
        !st.mic.is_muted()
    }

    pub(crate) fn poll_mic_release_locked(&self, st: &mut SessionState, now: Instant) {
        if st.mic.poll_release(now, self.config.interruption_release()) {
            info!(target: "realtalk::session", session_id = %self.id, "🎙️ Microphone released");
        }
    }

    /// Deliver the best available assistant answer, at most once per turn.
    pub(crate) fn send_final_assistant_answer_locked(&self, st: &mut SessionState, forced: bool) -> bool {
        if st.final_answer_sent {
            return false;
        }
        let answer = if !st.assistant_answer.is_empty() {
            st.assistant_answer.clone()
        } else {
            match self.pipeline.running_generation() {
                Some(record) if !record.is_aborting() => record.full_answer(),
                _ => String::new(),
            }
        };
        let cleaned = normalize_answer(&answer);
        if cleaned.is_empty() {
            if forced {
                debug!(target: "realtalk::session", session_id = %self.id, "No assistant answer to force-send");
            } else {
                warn!(target: "realtalk::session", session_id = %self.id, "Final assistant answer was empty, not sending");
            }
            return false;
        }
        info!(target: "realtalk::session", session_id = %self.id, "✅ Assistant: \"{}\"", cleaned);
        self.emit(ServerMessage::FinalAssistantAnswer {
            content: cleaned.clone(),
        });
        self.pipeline.append_history(ChatTurn::assistant(cleaned));
        st.final_answer_sent = true;
        true
    }

    /// Back to `Idle` after a completed turn. The client's playing flag and the mic gate persist.
    pub(crate) fn reset_turn_locked(&self, st: &mut SessionState) {
        st.turn = TurnState::Idle;
        st.tts_to_client = false;
        st.user_interrupted = false;
        st.user_finished_turn = false;
        st.silence_active = true;
        st.potential_abort = false;
        st.tts_chunk_sent = false;
        st.final_answer_sent = false;
        st.partial_transcription.clear();
        st.final_transcription.clear();
        st.last_displayed_partial.clear();
        st.assistant_answer.clear();
        st.sentences.reset();
        st.turn_ended_at = None;
    }

    fn emit_new_sentences_locked(&self, st: &mut SessionState) {
        if !st.tts_to_client || st.user_interrupted {
            return;
        }
        let answer = st.assistant_answer.clone();
        for (sentence_id, content) in st.sentences.take_new(&answer) {
            debug!(target: "realtalk::session", session_id = %self.id, sentence_id, "💬 {}", content);
            self.emit(ServerMessage::AssistantSentence { content, sentence_id });
        }
    }

    /// Abort everything and stop background work. Called once at connection teardown.
    pub fn shutdown(&self) {
        self.pipeline.reset();
        if let Some(worker) = self.abort_worker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            worker.abort();
        }
        info!(target: "realtalk::session", session_id = %self.id, "Session shut down");
    }
}

impl RecognizerEvents for ConnectionSession {
    fn on_partial(&self, text: &str) {
        {
            let mut st = self.lock_state();
            st.final_answer_sent = false;
            st.final_transcription.clear();
            st.partial_transcription = text.to_string();
            if matches!(st.turn, TurnState::Idle | TurnState::Interrupted) {
                st.turn = TurnState::UserSpeaking;
            }
            st.last_displayed_partial = text.to_string();
            self.emit(ServerMessage::PartialUserRequest {
                content: text.to_string(),
            });
        }
        self.abort_text.send_replace(text.to_string());
    }

    fn on_potential_sentence(&self, text: &str) {
        {
            let mut st = self.lock_state();
            if st.user_finished_turn {
                // The previous turn is still being delivered; the new utterance replaces it.
                self.send_final_assistant_answer_locked(&mut st, true);
                st.user_finished_turn = false;
                st.tts_to_client = false;
                st.tts_chunk_sent = false;
                st.final_answer_sent = false;
                st.sentences.reset();
                st.turn = TurnState::UserSpeaking;
            }
            st.assistant_answer.clear();
            if st.last_displayed_partial != text {
                st.last_displayed_partial = text.to_string();
                self.emit(ServerMessage::PartialUserRequest {
                    content: text.to_string(),
                });
            }
        }
        debug!(target: "realtalk::session", session_id = %self.id, "Potential sentence: '{}'", text);
        self.pipeline.prepare_generation(text);
    }

    fn on_before_final(&self, text: &str) {
        let now = Instant::now();
        let mut st = self.lock_state();
        info!(target: "realtalk::session", session_id = %self.id, "🏁 User turn end");
        st.user_finished_turn = true;
        st.user_interrupted = false;
        st.turn = TurnState::TurnEnding;
        st.turn_ended_at = Some(now);

        let running = self.pipeline.running_generation().filter(|r| !r.is_aborting());
        if let Some(record) = &running {
            info!(target: "realtalk::session", session_id = %self.id, generation = record.id(), "🔊 TTS allowed");
            record.allow_quick_tts();
        }

        if !st.mic.is_muted() {
            info!(target: "realtalk::session", session_id = %self.id, "🎙️ Microphone muted (end of turn)");
            st.mic.mute(now);
        }
        st.tts_to_client = true;

        let content = if !text.trim().is_empty() {
            text.to_string()
        } else if !st.final_transcription.is_empty() {
            st.final_transcription.clone()
        } else {
            st.partial_transcription.clone()
        };
        self.emit(ServerMessage::FinalUserRequest {
            content: content.clone(),
        });

        if let Some(record) = &running {
            let quick = record.quick_answer();
            if !quick.is_empty() {
                st.assistant_answer = record.full_answer();
                self.emit(ServerMessage::PartialAssistantAnswer { content: quick });
            }
        }
        self.emit_new_sentences_locked(&mut st);

        self.pipeline.append_history(ChatTurn::user(content));
    }

    fn on_final(&self, text: &str) {
        info!(target: "realtalk::session", session_id = %self.id, "👤 User said: \"{}\"", text);
        let mut st = self.lock_state();
        if st.final_transcription.is_empty() {
            st.final_transcription = text.to_string();
        }
    }

    fn on_recording_start(&self) {
        let mut st = self.lock_state();
        debug!(target: "realtalk::session", session_id = %self.id, "🎤 Recording started");
        if st.turn == TurnState::Idle {
            st.turn = TurnState::UserSpeaking;
        }
        if !st.tts_client_playing {
            return;
        }

        info!(target: "realtalk::session", session_id = %self.id, "❗ Barge-in: interrupting TTS");
        st.tts_to_client = false;
        st.user_interrupted = true;
        st.turn = TurnState::Interrupted;
        self.send_final_assistant_answer_locked(&mut st, true);
        // The interrupted turn is closed; its answer must not be delivered again.
        st.user_finished_turn = false;
        st.assistant_answer.clear();
        st.tts_chunk_sent = false;
        self.emit(ServerMessage::StopTts);
        self.pipeline.abort_generation("user interrupts while TTS playing");
        self.emit(ServerMessage::TtsInterruption);
        self.metrics.record(MetricEvent::Interruption);
    }

    fn on_silence_active(&self, active: bool) {
        self.lock_state().silence_active = active;
    }

    fn on_potential_abort(&self) {
        self.lock_state().potential_abort = true;
    }
}

impl GenerationEvents for ConnectionSession {
    fn on_partial_assistant_text(&self, generation_id: u64, text: &str) {
        let mut st = self.lock_state();
        if !self.pipeline.is_current(generation_id) || st.user_interrupted {
            return;
        }
        st.assistant_answer = text.to_string();
        self.emit_new_sentences_locked(&mut st);
    }
}
