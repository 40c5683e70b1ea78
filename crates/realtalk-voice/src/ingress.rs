//! Inbound audio: binary frame parsing and the bounded ingress queue.
//!
//! Frame layout (client → server):
//!
//! ```text
//! ┌──────────────────┬──────────────────┬─────────────────────────┐
//! │ u32 BE timestamp │ u32 BE flags     │ PCM payload (i16 LE)    │
//! │ (client ms)      │ bit0 = TTS plays │                         │
//! └──────────────────┴──────────────────┴─────────────────────────┘
//! ```

use crate::error::{VoiceError, VoiceResult};
use chrono::{DateTime, Utc};
use realtalk_core::{MetricEvent, MetricsSink};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

pub const FRAME_HEADER_LEN: usize = 8;

const FLAG_TTS_PLAYING: u32 = 0x1;

/// One inbound audio frame. Immutable once parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub receive_timestamp: DateTime<Utc>,
    pub client_timestamp_ms: u32,
    /// Client reported it was playing assistant audio when the frame was captured.
    pub tts_playing: bool,
    pub pcm: Vec<u8>,
}

impl AudioFrame {
    pub fn parse(bytes: &[u8]) -> VoiceResult<Self> {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(VoiceError::FrameTooShort { len: bytes.len() });
        }
        let client_timestamp_ms = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let flags = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Ok(Self {
            receive_timestamp: Utc::now(),
            client_timestamp_ms,
            tts_playing: flags & FLAG_TTS_PLAYING != 0,
            pcm: bytes[FRAME_HEADER_LEN..].to_vec(),
        })
    }

    /// Payload decoded as 16-bit little-endian samples. A trailing odd byte is ignored.
    pub fn samples(&self) -> Vec<i16> {
        self.pcm
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    }
}

/// Bounded FIFO between the network reader and the recognizer feeder.
///
/// When full, the newest frame is rejected; frames already accepted keep their order.
pub struct AudioIngressQueue;

impl AudioIngressQueue {
    pub fn bounded(capacity: usize, metrics: Arc<dyn MetricsSink>) -> (IngressSender, IngressReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            IngressSender {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
                metrics,
            },
            IngressReceiver { rx },
        )
    }
}

#[derive(Clone)]
pub struct IngressSender {
    tx: mpsc::Sender<AudioFrame>,
    dropped: Arc<AtomicU64>,
    metrics: Arc<dyn MetricsSink>,
}

impl IngressSender {
    /// Enqueue without waiting. Returns `false` if the frame was dropped.
    pub fn offer(&self, frame: AudioFrame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                self.metrics.record(MetricEvent::QueueOverflow { queue: "audio_ingress" });
                warn!(target: "realtalk::ingress", total_dropped = total, "Audio ingress full, dropping newest frame");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Frames rejected because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct IngressReceiver {
    rx: mpsc::Receiver<AudioFrame>,
}

impl IngressReceiver {
    /// Wait for the next frame; `None` once every sender is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<AudioFrame> {
        self.rx.recv().await
    }

    /// Next frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<AudioFrame> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use realtalk_core::PerformanceMonitor;
    use tokio_test::{assert_pending, assert_ready, task};

    fn frame(ts: u32) -> AudioFrame {
        let mut bytes = ts.to_be_bytes().to_vec();
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(&[1, 0, 2, 0]);
        AudioFrame::parse(&bytes).unwrap()
    }

    #[test]
    fn parses_big_endian_header() {
        let mut bytes = vec![0, 0, 0x01, 0x00];
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&[0x34, 0x12, 0xff]);
        let parsed = AudioFrame::parse(&bytes).unwrap();
        assert_eq!(parsed.client_timestamp_ms, 256);
        assert!(parsed.tts_playing);
        assert_eq!(parsed.samples(), vec![0x1234]);
    }

    #[test]
    fn short_frames_are_rejected() {
        match AudioFrame::parse(&[0, 1, 2]) {
            Err(VoiceError::FrameTooShort { len }) => assert_eq!(len, 3),
            other => panic!("expected FrameTooShort, got {other:?}"),
        }
    }

    #[test]
    fn full_queue_drops_newest_and_keeps_order() {
        let monitor = Arc::new(PerformanceMonitor::new());
        let (tx, mut rx) = AudioIngressQueue::bounded(3, monitor.clone());

        assert!(tx.offer(frame(1)));
        assert!(tx.offer(frame(2)));
        assert!(tx.offer(frame(3)));
        assert!(!tx.offer(frame(4)));

        assert_eq!(tx.dropped(), 1);
        assert_eq!(monitor.summary().queue_overflows, 1);
        let order: Vec<u32> = std::iter::from_fn(|| rx.try_recv()).map(|f| f.client_timestamp_ms).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn recv_waits_for_a_frame() {
        let monitor = Arc::new(PerformanceMonitor::new());
        let (tx, mut rx) = AudioIngressQueue::bounded(2, monitor);

        let mut next = task::spawn(rx.recv());
        assert_pending!(next.poll());
        assert!(tx.offer(frame(7)));
        assert!(next.is_woken());
        let received = assert_ready!(next.poll());
        assert_eq!(received.map(|f| f.client_timestamp_ms), Some(7));
    }
}
