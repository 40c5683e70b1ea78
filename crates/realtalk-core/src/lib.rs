//! # Realtalk Core
//!
//! Shared building blocks for the realtalk voice engine:
//!
//! - [`config`]: layered configuration (defaults, optional TOML file, `REALTALK__*` env vars).
//! - [`llm`]: provider-agnostic, cancellable, retrying text-generation stream with a request registry.
//! - [`metrics`]: fire-and-forget performance events and the process-wide [`PerformanceMonitor`].
//!
//! ```text
//! ┌──────────────┐   generate()   ┌────────────────┐  open_stream()  ┌──────────────┐
//! │  Pipeline    │ ─────────────→ │ LlmStreamClient│ ──────────────→ │  LlmBackend  │
//! │  (per conn)  │ ←── fragments ─│  retry/cancel  │ ←─ SSE deltas ──│ (OpenAI/...) │
//! └──────────────┘                └────────────────┘                 └──────────────┘
//!                                         │ MetricEvent
//!                                         ↓
//!                                 ┌────────────────┐
//!                                 │  MetricsSink   │
//!                                 └────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod llm;
pub mod metrics;

pub use config::{
    LlmConfig, RealtalkConfig, RecognizerConfig, ServerConfig, SessionConfig, TtsConfig,
};
pub use error::{ConfigError, FaultKind, LlmError, ProviderFault};
pub use llm::{
    spawn_stale_sweep, ChatTurn, FragmentStream, GenerationRequest, LlmBackend, LlmStreamClient,
    OpenAiCompatBackend, PlaceholderBackend, RetryPolicy, Role, ScriptStep, ScriptedBackend,
};
pub use metrics::{MetricEvent, MetricsSink, MetricsSummary, NoopMetrics, PerformanceMonitor};
