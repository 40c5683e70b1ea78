//! End-to-end connection tests over in-memory transports.
//!
//! A scripted recognizer replaces speech recognition, `ScriptedBackend` replaces the LLM,
//! and a fixed-size synthesizer makes the number of `tts_chunk` events predictable.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::channel::mpsc;
use futures::StreamExt;
use realtalk_core::{
    ChatTurn, LlmStreamClient, NoopMetrics, RetryPolicy, ScriptStep, ScriptedBackend, SessionConfig,
};
use realtalk_voice::{
    AudioFrame, Connection, InboundFrame, Recognizer, RecognizerEvents, RecognizerFactory, ServerMessage,
    SessionDeps, Synthesizer, TurnState, VoiceResult,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const CHUNK: usize = 4800;

/// First frame completes a "hi" turn; any later frame means the user started talking again.
#[derive(Default)]
struct ScriptedRecognizer {
    frames: AtomicUsize,
}

#[async_trait]
impl Recognizer for ScriptedRecognizer {
    async fn feed(&self, _frame: &AudioFrame, events: &dyn RecognizerEvents) -> VoiceResult<()> {
        if self.frames.fetch_add(1, Ordering::SeqCst) == 0 {
            events.on_recording_start();
            events.on_partial("hi");
            events.on_potential_sentence("hi");
            events.on_before_final("hi");
            events.on_final("hi");
        } else {
            events.on_recording_start();
        }
        Ok(())
    }

    fn set_speed(&self, _factor: f32) {}
}

struct ScriptedRecognizers;

impl RecognizerFactory for ScriptedRecognizers {
    fn create(&self, _session_id: &str) -> Arc<dyn Recognizer> {
        Arc::new(ScriptedRecognizer::default())
    }
}

/// Two chunks of audio for every segment.
struct TwoChunkTts;

#[async_trait]
impl Synthesizer for TwoChunkTts {
    async fn synthesize(&self, _text: &str) -> VoiceResult<Vec<u8>> {
        Ok(vec![0x11; CHUNK * 2])
    }
}

fn deps(backend: ScriptedBackend, config: SessionConfig) -> SessionDeps {
    SessionDeps {
        llm: Arc::new(LlmStreamClient::new(Arc::new(backend), RetryPolicy::default(), Arc::new(NoopMetrics))),
        recognizers: Arc::new(ScriptedRecognizers),
        synthesizer: Some(Arc::new(TwoChunkTts)),
        metrics: Arc::new(NoopMetrics),
        config,
        system_prompt: None,
    }
}

fn audio_frame(tts_playing: bool) -> InboundFrame {
    let mut bytes = 1000u32.to_be_bytes().to_vec();
    bytes.extend_from_slice(&u32::from(tts_playing).to_be_bytes());
    bytes.extend_from_slice(&[0u8; 320]);
    InboundFrame::Binary(bytes)
}

async fn next_message(rx: &mut mpsc::UnboundedReceiver<String>) -> ServerMessage {
    let text = timeout(Duration::from_secs(5), rx.next())
        .await
        .expect("message within 5s")
        .expect("writer still open");
    serde_json::from_str(&text).expect("valid server message")
}

#[tokio::test]
async fn single_turn_end_to_end() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let deps = deps(ScriptedBackend::replying(&["Hello", " world"]), SessionConfig::default());
    let (in_tx, in_rx) = mpsc::unbounded();
    let (out_tx, mut out_rx) = mpsc::unbounded();
    let connection = Connection::open("e2e", &deps);
    let session = connection.session();
    let running = tokio::spawn(connection.run(in_rx, out_tx));

    in_tx.unbounded_send(audio_frame(false)).unwrap();

    let mut seen = Vec::new();
    loop {
        let message = next_message(&mut out_rx).await;
        let done = matches!(message, ServerMessage::FinalAssistantAnswer { .. });
        seen.push(message);
        if done {
            break;
        }
    }

    let kinds: Vec<_> = seen.iter().map(ServerMessage::kind).collect();
    assert_eq!(
        kinds,
        vec![
            "status",
            "partial_user_request",
            "final_user_request",
            "tts_chunk",
            "tts_chunk",
            "final_assistant_answer"
        ]
    );
    assert_eq!(seen[1], ServerMessage::PartialUserRequest { content: "hi".into() });
    assert_eq!(seen[2], ServerMessage::FinalUserRequest { content: "hi".into() });
    for chunk in &seen[3..5] {
        let ServerMessage::TtsChunk { content } = chunk else {
            panic!("expected tts_chunk");
        };
        assert_eq!(STANDARD.decode(content).unwrap().len(), CHUNK);
    }
    assert_eq!(
        seen[5],
        ServerMessage::FinalAssistantAnswer {
            content: "Hello world".into()
        }
    );

    assert_eq!(
        session.history(),
        vec![ChatTurn::user("hi"), ChatTurn::assistant("Hello world")]
    );
    let snapshot = session.snapshot();
    assert_eq!(snapshot.turn, TurnState::Idle);
    assert!(!snapshot.tts_to_client);
    assert!(session.pipeline().running_generation().is_none());

    drop(in_tx);
    timeout(Duration::from_secs(5), running).await.unwrap().unwrap();
    assert!(session.history().is_empty(), "teardown clears history");
}

#[tokio::test]
async fn barge_in_cancels_audio_in_flight() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let backend = ScriptedBackend::new().with_fallback(vec![
        ScriptStep::text("Sure thing, here is the plan. "),
        ScriptStep::text("First we"),
        ScriptStep::Hang,
    ]);
    let config = SessionConfig {
        chunk_release_ms: 0,
        ..SessionConfig::default()
    };
    let deps = deps(backend, config);
    let (in_tx, in_rx) = mpsc::unbounded();
    let (out_tx, mut out_rx) = mpsc::unbounded();
    let connection = Connection::open("barge", &deps);
    let session = connection.session();
    let running = tokio::spawn(connection.run(in_rx, out_tx));

    in_tx.unbounded_send(audio_frame(false)).unwrap();
    loop {
        if next_message(&mut out_rx).await.kind() == "tts_chunk" {
            break;
        }
    }
    let record = session.pipeline().running_generation().expect("generation running");

    in_tx
        .unbounded_send(InboundFrame::Text(r#"{"type":"tts_start"}"#.into()))
        .unwrap();
    in_tx.unbounded_send(audio_frame(true)).unwrap();

    let mut after = Vec::new();
    loop {
        let message = next_message(&mut out_rx).await;
        let done = message == ServerMessage::TtsInterruption;
        after.push(message);
        if done {
            break;
        }
    }
    let stop_at = after
        .iter()
        .position(|m| *m == ServerMessage::StopTts)
        .expect("stop_tts sent");
    assert!(after[stop_at..].iter().all(|m| m.kind() != "tts_chunk"));
    let ServerMessage::FinalAssistantAnswer { content } = &after[stop_at - 1] else {
        panic!("final answer must precede stop_tts");
    };
    assert!(content.starts_with("Sure thing, here is the plan."));

    let snapshot = session.snapshot();
    assert!(!snapshot.tts_to_client);
    assert!(snapshot.user_interrupted);
    assert!(record.is_aborting());
    assert_eq!(record.pending_audio(), 0);

    // Nothing else is dispatched for the aborted generation.
    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Ok(Some(text)) = out_rx.try_next() {
        let message: ServerMessage = serde_json::from_str(&text).unwrap();
        assert_ne!(message.kind(), "tts_chunk");
    }

    drop(in_tx);
    timeout(Duration::from_secs(5), running).await.unwrap().unwrap();
}

#[tokio::test]
async fn malformed_input_is_ignored() {
    let deps = deps(ScriptedBackend::new(), SessionConfig::default());
    let (in_tx, in_rx) = mpsc::unbounded();
    let (out_tx, mut out_rx) = mpsc::unbounded();
    let connection = Connection::open("junk", &deps);
    let session = connection.session();
    let running = tokio::spawn(connection.run(in_rx, out_tx));
    assert_eq!(next_message(&mut out_rx).await, ServerMessage::status("ready", "Connected"));

    in_tx.unbounded_send(InboundFrame::Text("not json".into())).unwrap();
    in_tx.unbounded_send(InboundFrame::Text(r#"{"type":"dance"}"#.into())).unwrap();
    in_tx.unbounded_send(InboundFrame::Binary(vec![1, 2, 3])).unwrap();
    in_tx
        .unbounded_send(InboundFrame::Text(r#"{"type":"tts_start"}"#.into()))
        .unwrap();

    timeout(Duration::from_secs(5), async {
        while !session.snapshot().tts_client_playing {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("connection survives malformed input");
    assert_eq!(session.snapshot().turn, TurnState::Idle, "short frame never reached the recognizer");

    in_tx.unbounded_send(InboundFrame::Close).unwrap();
    timeout(Duration::from_secs(5), running).await.unwrap().unwrap();
    assert!(out_rx.next().await.is_none(), "writer closed the sink");
}
