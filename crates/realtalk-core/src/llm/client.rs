use super::backend::{GenerationRequest, LlmBackend};
use crate::config::LlmConfig;
use crate::error::{LlmError, ProviderFault};
use crate::metrics::{MetricEvent, MetricsSink};
use async_stream::stream;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Linear backoff between attempts: `attempt × base_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &LlmConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: cfg.retry_base_delay(),
        }
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

#[derive(Debug, Default)]
struct CancelFlag {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    fn cancel(&self) -> bool {
        let first = !self.cancelled.swap(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        first
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug)]
struct RequestEntry {
    flag: Arc<CancelFlag>,
    session_id: String,
    started: Instant,
}

type Registry = Arc<DashMap<String, RequestEntry>>;

/// Removes the request from the registry when the generation stream is dropped,
/// whichever way it ends.
struct Registration {
    registry: Registry,
    request_id: String,
    flag: Arc<CancelFlag>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let flag = &self.flag;
        self.registry
            .remove_if(&self.request_id, |_, entry| Arc::ptr_eq(&entry.flag, flag));
        debug!(target: "realtalk::llm", request_id = %self.request_id, "LLM request deregistered");
    }
}

/// Cancellable, retrying text-generation client shared by every connection.
pub struct LlmStreamClient {
    backend: Arc<dyn LlmBackend>,
    registry: Registry,
    policy: RetryPolicy,
    metrics: Arc<dyn MetricsSink>,
}

impl LlmStreamClient {
    pub fn new(backend: Arc<dyn LlmBackend>, policy: RetryPolicy, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            backend,
            registry: Arc::new(DashMap::new()),
            policy,
            metrics,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Start a generation. The request is registered immediately, so it can be cancelled
    /// before the returned stream is first polled. The stream is finite and ends silently
    /// once cancelled; permanent or exhausted faults end it with one `Err` item.
    pub fn generate(&self, mut request: GenerationRequest) -> impl Stream<Item = Result<String, LlmError>> + Send + 'static {
        let request_id = request
            .request_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        let flag = Arc::new(CancelFlag::default());
        let started = Instant::now();
        self.registry.insert(
            request_id.clone(),
            RequestEntry {
                flag: Arc::clone(&flag),
                session_id: request.session_id.clone(),
                started,
            },
        );
        debug!(
            target: "realtalk::llm",
            request_id = %request_id,
            session_id = %request.session_id,
            backend = self.backend.name(),
            "LLM request registered"
        );

        let registration = Registration {
            registry: Arc::clone(&self.registry),
            request_id: request_id.clone(),
            flag: Arc::clone(&flag),
        };
        let backend = Arc::clone(&self.backend);
        let metrics = Arc::clone(&self.metrics);
        let policy = self.policy;

        stream! {
            let _registration = registration;
            let mut first_fragment_seen = false;
            let mut attempt: u32 = 0;

            'attempts: loop {
                attempt += 1;
                if flag.is_cancelled() {
                    debug!(target: "realtalk::llm", request_id = %request_id, "Cancelled before attempt {}", attempt);
                    break;
                }

                let opened = tokio::select! {
                    biased;
                    _ = flag.cancelled() => None,
                    opened = backend.open_stream(&request) => Some(opened),
                };
                let mut fragments = match opened {
                    None => break,
                    Some(Ok(fragments)) => fragments,
                    Some(Err(fault)) => {
                        if should_retry(&fault, attempt, &policy, false) {
                            note_retry(metrics.as_ref(), &request_id, &fault, attempt, &policy);
                            if !wait_backoff(&flag, policy.backoff(attempt)).await {
                                break;
                            }
                            continue;
                        }
                        note_failure(metrics.as_ref(), &request_id, &fault, attempt);
                        yield Err(LlmError::from(fault));
                        break;
                    }
                };

                let mut yielded_this_attempt = false;
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = flag.cancelled() => None,
                        next = fragments.next() => Some(next),
                    };
                    let Some(next) = next else {
                        debug!(target: "realtalk::llm", request_id = %request_id, "Cancelled mid-stream");
                        break 'attempts;
                    };
                    match next {
                        None => break 'attempts,
                        Some(Ok(fragment)) => {
                            if fragment.is_empty() {
                                continue;
                            }
                            if flag.is_cancelled() {
                                break 'attempts;
                            }
                            if !first_fragment_seen {
                                first_fragment_seen = true;
                                let elapsed = started.elapsed();
                                info!(target: "realtalk::llm", request_id = %request_id, "⚡ TTFT {:?} (attempt {})", elapsed, attempt);
                                metrics.record(MetricEvent::TimeToFirstFragment {
                                    request_id: request_id.clone(),
                                    elapsed,
                                });
                            }
                            yielded_this_attempt = true;
                            yield Ok(fragment);
                        }
                        Some(Err(fault)) => {
                            if should_retry(&fault, attempt, &policy, yielded_this_attempt) {
                                note_retry(metrics.as_ref(), &request_id, &fault, attempt, &policy);
                                if !wait_backoff(&flag, policy.backoff(attempt)).await {
                                    break 'attempts;
                                }
                                continue 'attempts;
                            }
                            note_failure(metrics.as_ref(), &request_id, &fault, attempt);
                            yield Err(LlmError::from(fault));
                            break 'attempts;
                        }
                    }
                }
            }
        }
    }

    /// Flag one request (or every request when `None`) as cancelled.
    /// Returns whether any registered request was flagged; unknown ids are a no-op.
    pub fn cancel(&self, request_id: Option<&str>) -> bool {
        match request_id {
            Some(id) => match self.registry.get(id) {
                Some(entry) => {
                    if entry.flag.cancel() {
                        info!(target: "realtalk::llm", request_id = %id, session_id = %entry.session_id, "🛑 LLM request cancelled");
                    }
                    true
                }
                None => {
                    debug!(target: "realtalk::llm", request_id = %id, "Cancel for unknown or finished request ignored");
                    false
                }
            },
            None => {
                let mut flagged = false;
                for entry in self.registry.iter() {
                    entry.flag.cancel();
                    flagged = true;
                }
                if flagged {
                    info!(target: "realtalk::llm", "🛑 All LLM requests cancelled");
                }
                flagged
            }
        }
    }

    /// Cancel requests registered longer than `timeout` ago. Returns how many were newly cancelled.
    pub fn cleanup_stale(&self, timeout: Duration) -> usize {
        let mut count = 0;
        for entry in self.registry.iter() {
            if entry.started.elapsed() >= timeout && entry.flag.cancel() {
                warn!(target: "realtalk::llm", request_id = %entry.key(), "Cancelling stale LLM request");
                count += 1;
            }
        }
        if count > 0 {
            self.metrics.record(MetricEvent::StaleRequestsCancelled { count });
        }
        count
    }

    pub fn active_requests(&self) -> usize {
        self.registry.len()
    }

    pub fn is_registered(&self, request_id: &str) -> bool {
        self.registry.contains_key(request_id)
    }
}

/// Periodically cancel requests older than `timeout`.
pub fn spawn_stale_sweep(client: Arc<LlmStreamClient>, interval: Duration, timeout: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let cancelled = client.cleanup_stale(timeout);
            if cancelled > 0 {
                info!(target: "realtalk::llm", "🧹 Stale sweep cancelled {} request(s)", cancelled);
            }
        }
    })
}

fn should_retry(fault: &ProviderFault, attempt: u32, policy: &RetryPolicy, yielded: bool) -> bool {
    !yielded && fault.kind.is_retryable() && attempt < policy.max_attempts
}

fn note_retry(metrics: &dyn MetricsSink, request_id: &str, fault: &ProviderFault, attempt: u32, policy: &RetryPolicy) {
    warn!(
        target: "realtalk::llm",
        request_id = %request_id,
        "Attempt {}/{} failed ({}), retrying in {:?}",
        attempt,
        policy.max_attempts,
        fault,
        policy.backoff(attempt)
    );
    metrics.record(MetricEvent::LlmRetry {
        attempt,
        kind: fault.kind,
    });
}

fn note_failure(metrics: &dyn MetricsSink, request_id: &str, fault: &ProviderFault, attempt: u32) {
    warn!(target: "realtalk::llm", request_id = %request_id, "LLM request failed after {} attempt(s): {}", attempt, fault);
    metrics.record(MetricEvent::LlmError { kind: fault.kind });
}

async fn wait_backoff(flag: &CancelFlag, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = flag.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
