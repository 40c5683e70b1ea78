//! # Realtalk Voice - Per-connection turn-taking engine
//!
//! One [`Connection`] per client. Audio frames flow in, recognized text drives a speculative
//! LLM generation, synthesized audio flows back out, and a user who starts talking over the
//! assistant cancels everything in flight.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Connection                                │
//! │  ┌──────────┐   ┌──────────────┐   ┌──────────────┐             │
//! │  │  Reader  │ → │ Ingress (50) │ → │  Recognizer  │──callbacks─┐ │
//! │  └──────────┘   └──────────────┘   └──────────────┘            ↓ │
//! │                                              ┌──────────────────┐│
//! │  ┌──────────┐   ┌──────────────┐   events    │ConnectionSession ││
//! │  │  Writer  │ ← │ Merge queue  │ ←───────────│ (turn state)     ││
//! │  └──────────┘   └──────────────┘             └──────────────────┘│
//! │                        ↑ tts_chunk                   ↓ prepare   │
//! │                 ┌──────────────┐  audio   ┌──────────────────┐   │
//! │                 │  Dispatcher  │ ←─────── │ PipelineManager  │   │
//! │                 └──────────────┘          │ LLM + synthesis  │   │
//! │                                           └──────────────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod abort_check;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod generation;
pub mod ingress;
pub mod mic;
pub mod pipeline;
pub mod protocol;
pub mod recognizer;
pub mod sentence;
pub mod session;
pub mod stt;
pub mod synthesis;
pub mod turn;

pub use connection::{run_connection, Connection, InboundFrame};
pub use dispatcher::{dispatch_once, run_dispatcher, DispatchOutcome};
pub use error::{VoiceError, VoiceResult};
pub use generation::GenerationRecord;
pub use ingress::{AudioFrame, AudioIngressQueue, IngressReceiver, IngressSender, FRAME_HEADER_LEN};
pub use pipeline::{word_similarity, GenerationEvents, PipelineManager};
pub use protocol::{ClientMessage, ServerMessage};
pub use recognizer::{GapRecognizer, GapRecognizerFactory, Recognizer, RecognizerEvents, RecognizerFactory};
pub use session::{ConnectionSession, SessionDeps, SessionSnapshot, TurnState};
pub use stt::{OpenAiCompatStt, PlaceholderStt, SttBackend};
pub use synthesis::{run_synthesis, OpenAiCompatTts, PlaceholderTts, Synthesizer};
pub use turn::{GapConfig, GapDetector, GapEvent};
