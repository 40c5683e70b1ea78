//! Outbound audio dispatcher.
//!
//! Polls the running generation for synthesized chunks and sends them as `tts_chunk` events
//! through the same ordered queue the session uses for text events. Each iteration holds the
//! session lock, so a barge-in is never interleaved with a half-finished dispatch step.

use crate::generation::GenerationRecord;
use crate::protocol::ServerMessage;
use crate::session::{ConnectionSession, TurnState};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use realtalk_core::MetricEvent;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Result of one dispatcher iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Nothing sendable right now.
    Idle,
    /// One audio chunk was queued for the client.
    Sent,
    /// The turn finished: final answer delivered and state back to idle.
    Completed,
}

/// Run one dispatcher step.
pub fn dispatch_once(session: &ConnectionSession) -> DispatchOutcome {
    let now = Instant::now();
    let mut st = session.lock_state();
    session.poll_mic_release_locked(&mut st, now);

    if !st.tts_to_client {
        return DispatchOutcome::Idle;
    }
    let Some(record) = session.pipeline().running_generation() else {
        return DispatchOutcome::Idle;
    };
    if record.is_aborting() {
        return DispatchOutcome::Idle;
    }
    if st.user_finished_turn && !record.is_audio_quick_finished() {
        record.allow_quick_tts();
    }
    if !record.first_chunk_ready() && !record.is_audio_quick_finished() {
        return DispatchOutcome::Idle;
    }

    if let Some(chunk) = record.try_pop_audio() {
        session.emit(ServerMessage::TtsChunk {
            content: STANDARD.encode(&chunk),
        });
        debug!(target: "realtalk::dispatch", generation = record.id(), bytes = chunk.len(), "🔊 tts_chunk");
        if !st.tts_chunk_sent {
            st.tts_chunk_sent = true;
            st.turn = TurnState::AssistantSpeaking;
            st.mic.schedule_release(now + session.config().chunk_release());
            if let Some(ended) = st.turn_ended_at {
                let elapsed = now.saturating_duration_since(ended);
                info!(target: "realtalk::dispatch", generation = record.id(), "⚡ First audio {:?} after turn end", elapsed);
                session.metrics().record(MetricEvent::TimeToFirstAudio { elapsed });
            }
        }
        return DispatchOutcome::Sent;
    }

    if turn_audio_complete(&record) {
        session.send_final_assistant_answer_locked(&mut st, false);
        session.pipeline().finish_generation(record.id());
        if let Some(ended) = st.turn_ended_at {
            session.metrics().record(MetricEvent::TurnCompleted {
                elapsed: now.saturating_duration_since(ended),
            });
        }
        session.reset_turn_locked(&mut st);
        info!(target: "realtalk::dispatch", generation = record.id(), "🏁 Turn complete");
        return DispatchOutcome::Completed;
    }
    DispatchOutcome::Idle
}

/// All audio for the record has been produced. `llm_finished` is read before the final
/// text so a segment appended just before the stream ended is never missed.
fn turn_audio_complete(record: &GenerationRecord) -> bool {
    if !record.is_llm_finished() || !record.is_audio_quick_finished() {
        return false;
    }
    !record.final_expected() || record.is_audio_final_finished()
}

/// Drive [`dispatch_once`] until the outbound queue closes.
pub async fn run_dispatcher(session: Arc<ConnectionSession>) {
    let idle = session.config().dispatcher_idle();
    info!(target: "realtalk::dispatch", session_id = %session.id(), "Dispatcher started");
    while !session.is_closed() {
        match dispatch_once(&session) {
            DispatchOutcome::Sent => tokio::task::yield_now().await,
            DispatchOutcome::Idle | DispatchOutcome::Completed => tokio::time::sleep(idle).await,
        }
    }
    debug!(target: "realtalk::dispatch", session_id = %session.id(), "Dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VoiceResult;
    use crate::ingress::AudioFrame;
    use crate::protocol::ClientMessage;
    use crate::recognizer::{Recognizer, RecognizerEvents, RecognizerFactory};
    use crate::session::SessionDeps;
    use crate::synthesis::Synthesizer;
    use async_trait::async_trait;
    use realtalk_core::{LlmStreamClient, NoopMetrics, RetryPolicy, ScriptStep, ScriptedBackend, SessionConfig};
    use tokio::sync::mpsc;

    struct NullRecognizer;

    #[async_trait]
    impl Recognizer for NullRecognizer {
        async fn feed(&self, _frame: &AudioFrame, _events: &dyn RecognizerEvents) -> VoiceResult<()> {
            Ok(())
        }
        fn set_speed(&self, _factor: f32) {}
    }

    impl RecognizerFactory for NullRecognizer {
        fn create(&self, _session_id: &str) -> Arc<dyn Recognizer> {
            Arc::new(NullRecognizer)
        }
    }

    /// Four bytes of audio per character.
    struct ByteTts;

    #[async_trait]
    impl Synthesizer for ByteTts {
        async fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>> {
            Ok(vec![7u8; text.len() * 4])
        }
    }

    fn session(backend: ScriptedBackend) -> (Arc<ConnectionSession>, mpsc::UnboundedReceiver<ServerMessage>) {
        let deps = SessionDeps {
            llm: Arc::new(LlmStreamClient::new(Arc::new(backend), RetryPolicy::default(), Arc::new(NoopMetrics))),
            recognizers: Arc::new(NullRecognizer),
            synthesizer: Some(Arc::new(ByteTts)),
            metrics: Arc::new(NoopMetrics),
            config: SessionConfig {
                tts_chunk_bytes: 8,
                ..SessionConfig::default()
            },
            system_prompt: None,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionSession::new("s1", &deps, tx), rx)
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn idles_until_turn_end() {
        let (session, _rx) = session(ScriptedBackend::replying(&["Hi"]));
        session.on_potential_sentence("hello");
        settle().await;
        assert_eq!(dispatch_once(&session), DispatchOutcome::Idle);
        assert_eq!(session.pipeline().running_generation().unwrap().pending_audio(), 0);
    }

    #[tokio::test]
    async fn sends_chunks_then_completes_turn() {
        let (session, mut rx) = session(ScriptedBackend::replying(&["Hi"]));
        session.on_potential_sentence("hello");
        session.on_before_final("hello");
        let record = session.pipeline().running_generation().unwrap();
        record.wait_for(|r| r.is_audio_final_finished()).await;

        assert_eq!(dispatch_once(&session), DispatchOutcome::Sent);
        assert!(session.snapshot().tts_chunk_sent);
        assert_eq!(session.snapshot().turn, TurnState::AssistantSpeaking);
        assert_eq!(dispatch_once(&session), DispatchOutcome::Completed);
        assert_eq!(session.snapshot().turn, TurnState::Idle);
        assert!(session.pipeline().running_generation().is_none());

        let kinds: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).map(|m| m.kind()).collect();
        assert_eq!(
            kinds,
            vec!["partial_user_request", "final_user_request", "tts_chunk", "final_assistant_answer"]
        );
    }

    #[tokio::test]
    async fn no_chunk_after_abort() {
        let (session, mut rx) = session(ScriptedBackend::new().with_fallback(vec![
            ScriptStep::text("Hello there friend. "),
            ScriptStep::text("And then some"),
            ScriptStep::Hang,
        ]));
        session.on_potential_sentence("hello");
        session.on_before_final("hello");
        let record = session.pipeline().running_generation().unwrap();
        record.wait_for(|r| r.first_chunk_ready()).await;
        assert!(record.pending_audio() > 0);
        session.handle_client_message(ClientMessage::TtsStart);
        while rx.try_recv().is_ok() {}

        session.on_recording_start();
        settle().await;
        assert!(record.is_aborting());
        assert_eq!(record.pending_audio(), 0);
        assert_eq!(dispatch_once(&session), DispatchOutcome::Idle);
        let kinds: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).map(|m| m.kind()).collect();
        assert!(!kinds.contains(&"tts_chunk"));
        assert_eq!(kinds.last(), Some(&"tts_interruption"));
    }

    #[test]
    fn turn_waits_for_final_segment_appended_at_stream_end() {
        let record = GenerationRecord::new(1, "req-1", "hello", 12);
        record.append_text("Hello there friend. ");
        assert!(!record.final_expected());
        record.mark_audio_quick_finished();
        assert!(!turn_audio_complete(&record));

        record.append_text("And more.");
        record.mark_llm_finished();
        assert!(record.final_expected());
        assert!(!turn_audio_complete(&record));

        record.mark_audio_final_finished();
        assert!(turn_audio_complete(&record));
    }

    #[test]
    fn whitespace_only_final_part_completes_after_quick_audio() {
        let record = GenerationRecord::new(1, "req-1", "hello", 12);
        record.append_text("Hello there friend. ");
        record.mark_llm_finished();
        record.mark_audio_quick_finished();
        assert!(turn_audio_complete(&record));
    }
}
