//! Recognizer seam: the speech-recognition collaborator and the callbacks it drives.
//!
//! A [`Recognizer`] is created per connection by a [`RecognizerFactory`] and fed audio frames
//! by the connection's feeder task. It reports progress through [`RecognizerEvents`], which
//! the connection session implements.

use crate::error::VoiceResult;
use crate::ingress::AudioFrame;
use crate::stt::SttBackend;
use crate::turn::{GapConfig, GapDetector, GapEvent};
use async_trait::async_trait;
use realtalk_core::RecognizerConfig;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Callbacks a recognizer drives. Implementations must not block.
pub trait RecognizerEvents: Send + Sync {
    /// Intermediate transcription of the current utterance.
    fn on_partial(&self, text: &str);
    /// The utterance may be complete; speculative generation can start.
    fn on_potential_sentence(&self, text: &str);
    /// The turn ended; `text` is the best transcription so far.
    fn on_before_final(&self, text: &str);
    /// Authoritative transcription of the finished turn.
    fn on_final(&self, text: &str);
    /// The user started speaking.
    fn on_recording_start(&self);
    fn on_silence_active(&self, active: bool);
    /// Speech resumed after a pause that looked like the end of the turn.
    fn on_potential_abort(&self);
}

/// Per-connection speech recognizer.
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Process one inbound frame, invoking `events` for anything it completes.
    async fn feed(&self, frame: &AudioFrame, events: &dyn RecognizerEvents) -> VoiceResult<()>;

    /// Adjust turn-end eagerness. `factor` is in `0.0..=1.0`, higher ends turns sooner.
    fn set_speed(&self, factor: f32);
}

/// Builds one recognizer per connection.
pub trait RecognizerFactory: Send + Sync {
    fn create(&self, session_id: &str) -> Arc<dyn Recognizer>;
}

/// Turn gap for a speed factor: linear between `slow` (factor 0) and `fast` (factor 1).
pub fn gap_for_speed(factor: f32, fast: Duration, slow: Duration) -> Duration {
    let factor = if factor.is_finite() { factor.clamp(0.0, 1.0) } else { 0.0 };
    let (fast, slow) = (fast.as_millis() as f64, slow.as_millis() as f64);
    let ms = slow - (slow - fast) * factor as f64;
    Duration::from_millis(ms.round().max(0.0) as u64)
}

/// Energy-gated gap recognizer: a [`GapDetector`] for turn boundaries plus an
/// [`SttBackend`] for the words.
pub struct GapRecognizer {
    session_id: String,
    detector: Mutex<GapDetector>,
    stt: Arc<dyn SttBackend>,
    sample_rate: u32,
    fast_gap: Duration,
    slow_gap: Duration,
    last_speculative: Mutex<String>,
}

impl GapRecognizer {
    pub fn new(session_id: impl Into<String>, config: &RecognizerConfig, stt: Arc<dyn SttBackend>) -> Self {
        Self {
            session_id: session_id.into(),
            detector: Mutex::new(GapDetector::new(GapConfig::from_config(config))),
            stt,
            sample_rate: config.sample_rate.max(1),
            fast_gap: Duration::from_millis(config.fast_gap_ms),
            slow_gap: Duration::from_millis(config.slow_gap_ms),
            last_speculative: Mutex::new(String::new()),
        }
    }

    /// Current commit gap.
    pub fn gap(&self) -> Duration {
        self.detector.lock().unwrap_or_else(|e| e.into_inner()).gap()
    }

    async fn transcribe(&self, samples: &[i16]) -> Option<String> {
        match self.stt.transcribe(samples, self.sample_rate).await {
            Ok(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
            Ok(_) => None,
            Err(e) => {
                warn!(target: "realtalk::recognizer", session_id = %self.session_id, "STT failed: {}", e);
                None
            }
        }
    }

    fn swap_speculative(&self, text: &str) -> String {
        let mut last = self.last_speculative.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *last, text.to_string())
    }
}

#[async_trait]
impl Recognizer for GapRecognizer {
    async fn feed(&self, frame: &AudioFrame, events: &dyn RecognizerEvents) -> VoiceResult<()> {
        let samples = frame.samples();
        let gap_events = self.detector.lock().unwrap_or_else(|e| e.into_inner()).process(&samples);

        for event in gap_events {
            match event {
                GapEvent::SpeechStarted => {
                    self.swap_speculative("");
                    events.on_silence_active(false);
                    events.on_recording_start();
                }
                GapEvent::SpeechResumed => {
                    events.on_silence_active(false);
                    events.on_potential_abort();
                }
                GapEvent::PotentialGap { samples } => {
                    events.on_silence_active(true);
                    if let Some(text) = self.transcribe(&samples).await {
                        debug!(target: "realtalk::recognizer", session_id = %self.session_id, "Speculative: {}", text);
                        events.on_partial(&text);
                        if self.swap_speculative(&text) != text {
                            events.on_potential_sentence(&text);
                        }
                    }
                }
                GapEvent::TurnCommitted { samples, duration } => {
                    events.on_silence_active(true);
                    let Some(text) = self.transcribe(&samples).await else {
                        debug!(target: "realtalk::recognizer", session_id = %self.session_id, "Turn of {:?} had no words", duration);
                        continue;
                    };
                    info!(target: "realtalk::recognizer", session_id = %self.session_id, "📝 Turn: {}", text);
                    if self.swap_speculative("") != text {
                        events.on_partial(&text);
                        events.on_potential_sentence(&text);
                    }
                    events.on_before_final(&text);
                    events.on_final(&text);
                }
                GapEvent::TooShort { .. } => {
                    events.on_silence_active(true);
                }
            }
        }
        Ok(())
    }

    fn set_speed(&self, factor: f32) {
        let gap = gap_for_speed(factor, self.fast_gap, self.slow_gap);
        self.detector.lock().unwrap_or_else(|e| e.into_inner()).set_gap(gap);
        info!(target: "realtalk::recognizer", session_id = %self.session_id, "Turn gap set to {:?} (speed {:.2})", gap, factor);
    }
}

pub struct GapRecognizerFactory {
    config: RecognizerConfig,
    stt: Arc<dyn SttBackend>,
}

impl GapRecognizerFactory {
    pub fn new(config: RecognizerConfig, stt: Arc<dyn SttBackend>) -> Self {
        Self { config, stt }
    }
}

impl RecognizerFactory for GapRecognizerFactory {
    fn create(&self, session_id: &str) -> Arc<dyn Recognizer> {
        Arc::new(GapRecognizer::new(session_id, &self.config, Arc::clone(&self.stt)))
    }
}
