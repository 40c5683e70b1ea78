//! Performance metrics.
//!
//! Engine components report [`MetricEvent`]s to a [`MetricsSink`] and never wait on it.
//! [`PerformanceMonitor`] is the in-memory sink used by the gateway: one lazily created
//! instance per process, summarized and closed by [`PerformanceMonitor::shutdown`].

use crate::error::FaultKind;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    /// A bounded queue rejected an item.
    QueueOverflow { queue: &'static str },
    /// First text fragment of an LLM request.
    TimeToFirstFragment { request_id: String, elapsed: Duration },
    /// First audio chunk of a turn sent to the client, measured from turn end.
    TimeToFirstAudio { elapsed: Duration },
    LlmRetry { attempt: u32, kind: FaultKind },
    LlmError { kind: FaultKind },
    GenerationStarted,
    GenerationAborted,
    Interruption,
    TurnCompleted { elapsed: Duration },
    StaleRequestsCancelled { count: usize },
}

/// Fire-and-forget receiver of metric events.
pub trait MetricsSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _event: MetricEvent) {}
}

#[derive(Debug, Default, Clone, Copy)]
struct LatencyStats {
    count: u64,
    total: Duration,
    min: Option<Duration>,
    max: Duration,
}

impl LatencyStats {
    fn observe(&mut self, sample: Duration) {
        self.count += 1;
        self.total += sample;
        self.min = Some(self.min.map_or(sample, |m| m.min(sample)));
        self.max = self.max.max(sample);
    }

    fn summary(&self) -> LatencySummary {
        let mean = if self.count == 0 {
            0.0
        } else {
            self.total.as_secs_f64() * 1000.0 / self.count as f64
        };
        LatencySummary {
            count: self.count,
            mean_ms: mean,
            min_ms: self.min.map_or(0.0, |d| d.as_secs_f64() * 1000.0),
            max_ms: self.max.as_secs_f64() * 1000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

/// Point-in-time copy of the monitor's counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub queue_overflows: u64,
    pub llm_retries: u64,
    pub llm_errors: u64,
    pub generations_started: u64,
    pub generations_aborted: u64,
    pub interruptions: u64,
    pub turns_completed: u64,
    pub stale_requests_cancelled: u64,
    pub ttft: LatencySummary,
    pub time_to_first_audio: LatencySummary,
    pub turn_duration: LatencySummary,
}

#[derive(Debug, Default)]
struct Latencies {
    ttft: LatencyStats,
    first_audio: LatencyStats,
    turn: LatencyStats,
}

/// In-memory latency/quality/throughput counters.
#[derive(Debug, Default)]
pub struct PerformanceMonitor {
    queue_overflows: AtomicU64,
    llm_retries: AtomicU64,
    llm_errors: AtomicU64,
    generations_started: AtomicU64,
    generations_aborted: AtomicU64,
    interruptions: AtomicU64,
    turns_completed: AtomicU64,
    stale_requests_cancelled: AtomicU64,
    latencies: Mutex<Latencies>,
    closed: AtomicBool,
}

static GLOBAL_MONITOR: Lazy<Arc<PerformanceMonitor>> = Lazy::new(|| {
    info!(target: "realtalk::metrics", "Performance monitor initialized");
    Arc::new(PerformanceMonitor::new())
});

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide monitor, created on first use.
    pub fn global() -> Arc<PerformanceMonitor> {
        Arc::clone(&GLOBAL_MONITOR)
    }

    pub fn summary(&self) -> MetricsSummary {
        let latencies = self.latencies.lock().unwrap_or_else(|e| e.into_inner());
        MetricsSummary {
            queue_overflows: self.queue_overflows.load(Ordering::Relaxed),
            llm_retries: self.llm_retries.load(Ordering::Relaxed),
            llm_errors: self.llm_errors.load(Ordering::Relaxed),
            generations_started: self.generations_started.load(Ordering::Relaxed),
            generations_aborted: self.generations_aborted.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
            turns_completed: self.turns_completed.load(Ordering::Relaxed),
            stale_requests_cancelled: self.stale_requests_cancelled.load(Ordering::Relaxed),
            ttft: latencies.ttft.summary(),
            time_to_first_audio: latencies.first_audio.summary(),
            turn_duration: latencies.turn.summary(),
        }
    }

    /// Stop accepting events and log the final summary. Later calls return the same figures.
    pub fn shutdown(&self) -> MetricsSummary {
        let summary = self.summary();
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(
                target: "realtalk::metrics",
                turns = summary.turns_completed,
                interruptions = summary.interruptions,
                overflows = summary.queue_overflows,
                llm_errors = summary.llm_errors,
                ttft_mean_ms = summary.ttft.mean_ms,
                "📊 Performance monitor shut down"
            );
        }
        summary
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn observe(&self, pick: impl FnOnce(&mut Latencies) -> &mut LatencyStats, sample: Duration) {
        let mut latencies = self.latencies.lock().unwrap_or_else(|e| e.into_inner());
        pick(&mut latencies).observe(sample);
    }
}

impl MetricsSink for PerformanceMonitor {
    fn record(&self, event: MetricEvent) {
        if self.is_closed() {
            return;
        }
        match event {
            MetricEvent::QueueOverflow { .. } => {
                self.queue_overflows.fetch_add(1, Ordering::Relaxed);
            }
            MetricEvent::TimeToFirstFragment { elapsed, .. } => self.observe(|l| &mut l.ttft, elapsed),
            MetricEvent::TimeToFirstAudio { elapsed } => self.observe(|l| &mut l.first_audio, elapsed),
            MetricEvent::LlmRetry { .. } => {
                self.llm_retries.fetch_add(1, Ordering::Relaxed);
            }
            MetricEvent::LlmError { .. } => {
                self.llm_errors.fetch_add(1, Ordering::Relaxed);
            }
            MetricEvent::GenerationStarted => {
                self.generations_started.fetch_add(1, Ordering::Relaxed);
            }
            MetricEvent::GenerationAborted => {
                self.generations_aborted.fetch_add(1, Ordering::Relaxed);
            }
            MetricEvent::Interruption => {
                self.interruptions.fetch_add(1, Ordering::Relaxed);
            }
            MetricEvent::TurnCompleted { elapsed } => {
                self.turns_completed.fetch_add(1, Ordering::Relaxed);
                self.observe(|l| &mut l.turn, elapsed);
            }
            MetricEvent::StaleRequestsCancelled { count } => {
                self.stale_requests_cancelled.fetch_add(count as u64, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_latencies_accumulate() {
        let monitor = PerformanceMonitor::new();
        monitor.record(MetricEvent::QueueOverflow { queue: "audio_ingress" });
        monitor.record(MetricEvent::QueueOverflow { queue: "audio_ingress" });
        monitor.record(MetricEvent::TimeToFirstFragment {
            request_id: "r1".into(),
            elapsed: Duration::from_millis(100),
        });
        monitor.record(MetricEvent::TimeToFirstFragment {
            request_id: "r2".into(),
            elapsed: Duration::from_millis(300),
        });

        let summary = monitor.summary();
        assert_eq!(summary.queue_overflows, 2);
        assert_eq!(summary.ttft.count, 2);
        assert!((summary.ttft.mean_ms - 200.0).abs() < 1e-6);
        assert!((summary.ttft.min_ms - 100.0).abs() < 1e-6);
        assert!((summary.ttft.max_ms - 300.0).abs() < 1e-6);
    }

    #[test]
    fn events_after_shutdown_are_ignored() {
        let monitor = PerformanceMonitor::new();
        monitor.record(MetricEvent::Interruption);
        let first = monitor.shutdown();
        monitor.record(MetricEvent::Interruption);
        assert_eq!(first.interruptions, 1);
        assert_eq!(monitor.shutdown(), first);
    }

    #[test]
    fn global_monitor_is_shared() {
        let a = PerformanceMonitor::global();
        let b = PerformanceMonitor::global();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
