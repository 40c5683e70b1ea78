//! Language-model streaming.
//!
//! [`LlmStreamClient`] owns the retry/cancel contract; [`LlmBackend`] implementations only
//! know how to open one attempt against a provider.

mod backend;
mod client;
mod openai;
mod scripted;

pub use backend::{ChatTurn, FragmentStream, GenerationRequest, LlmBackend, PlaceholderBackend, Role};
pub use client::{spawn_stale_sweep, LlmStreamClient, RetryPolicy};
pub use openai::{classify_status, OpenAiCompatBackend};
pub use scripted::{ScriptStep, ScriptedBackend};
