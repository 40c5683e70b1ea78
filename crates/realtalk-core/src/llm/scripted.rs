use super::backend::{FragmentStream, GenerationRequest, LlmBackend};
use crate::error::{FaultKind, ProviderFault};
use async_stream::stream;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// One step of a scripted provider attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    Text(String),
    /// Fail the stream with this classification.
    Fault(FaultKind),
    Delay(Duration),
    /// Never produce anything again.
    Hang,
}

impl ScriptStep {
    pub fn text(s: impl Into<String>) -> Self {
        ScriptStep::Text(s.into())
    }
}

#[derive(Debug, Clone)]
enum Attempt {
    Reject(FaultKind),
    Stream(Vec<ScriptStep>),
}

/// Deterministic backend for demos and tests. Queued attempts are consumed in order;
/// once they run out every attempt plays the fallback script.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    attempts: Mutex<VecDeque<Attempt>>,
    fallback: Vec<ScriptStep>,
    calls: AtomicUsize,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedBackend {
    /// Every attempt ends immediately without output.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every attempt streams these fragments.
    pub fn replying(fragments: &[&str]) -> Self {
        Self {
            fallback: fragments.iter().map(|f| ScriptStep::text(*f)).collect(),
            ..Self::default()
        }
    }

    pub fn with_fallback(mut self, steps: Vec<ScriptStep>) -> Self {
        self.fallback = steps;
        self
    }

    /// Next unqueued attempt fails before streaming.
    pub fn queue_reject(self, kind: FaultKind) -> Self {
        self.push(Attempt::Reject(kind))
    }

    /// Next unqueued attempt plays `steps`.
    pub fn queue_stream(self, steps: Vec<ScriptStep>) -> Self {
        self.push(Attempt::Stream(steps))
    }

    fn push(self, attempt: Attempt) -> Self {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(attempt);
        self
    }

    /// Number of `open_stream` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests seen so far, oldest first.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn open_stream(&self, request: &GenerationRequest) -> Result<FragmentStream, ProviderFault> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        let attempt = self
            .attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| Attempt::Stream(self.fallback.clone()));

        let steps = match attempt {
            Attempt::Reject(kind) => return Err(ProviderFault::new(kind, "scripted rejection")),
            Attempt::Stream(steps) => steps,
        };

        Ok(Box::pin(stream! {
            for step in steps {
                match step {
                    ScriptStep::Text(text) => {
                        yield Ok(text);
                    }
                    ScriptStep::Fault(kind) => {
                        yield Err(ProviderFault::new(kind, "scripted mid-stream fault"));
                        break;
                    }
                    ScriptStep::Delay(delay) => tokio::time::sleep(delay).await,
                    ScriptStep::Hang => futures::future::pending::<()>().await,
                }
            }
        }))
    }
}
