//! Gap-based turn detection over raw PCM.
//!
//! Implements the "Gap Logic": a turn is committed once the user has been silent for
//! the configured gap (800ms by default). A shorter "potential gap" triggers speculative
//! transcription. Time is measured in samples, so results do not depend on wall-clock jitter.

use realtalk_core::RecognizerConfig;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Events emitted by the gap detector
#[derive(Debug, Clone, PartialEq)]
pub enum GapEvent {
    /// User started speaking
    SpeechStarted,

    /// User paused long enough for a speculative transcription
    PotentialGap { samples: Vec<i16> },

    /// User resumed after a pause
    SpeechResumed,

    /// Turn is committed (ready for final transcription)
    TurnCommitted { samples: Vec<i16>, duration: Duration },

    /// Speech ended but was too short to be a turn
    TooShort { duration: Duration },
}

/// Configuration for gap detection
#[derive(Debug, Clone)]
pub struct GapConfig {
    /// RMS level (fraction of full scale) that counts as speech
    pub energy_threshold: f32,

    /// Silence before a speculative transcription (default: 300ms)
    pub potential_gap: Duration,

    /// Silence before committing a turn (default: 800ms)
    pub gap: Duration,

    /// Minimum speech duration to be considered a valid turn (default: 200ms)
    pub min_speech: Duration,

    /// Maximum turn duration before auto-commit (default: 30s)
    pub max_turn: Duration,

    /// Sample rate for audio (default: 16000 Hz)
    pub sample_rate: u32,
}

impl Default for GapConfig {
    fn default() -> Self {
        Self::from_config(&RecognizerConfig::default())
    }
}

impl GapConfig {
    pub fn from_config(cfg: &RecognizerConfig) -> Self {
        Self {
            energy_threshold: cfg.energy_threshold,
            potential_gap: Duration::from_millis(cfg.potential_gap_ms),
            gap: Duration::from_millis(cfg.gap_ms),
            min_speech: Duration::from_millis(cfg.min_speech_ms),
            max_turn: Duration::from_millis(cfg.max_turn_ms),
            sample_rate: cfg.sample_rate.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DetectorState {
    Idle,
    Speaking,
    SilenceDetected,
}

/// Tracks one speaker's turns from frame energy
pub struct GapDetector {
    config: GapConfig,
    state: DetectorState,

    // Timing, in samples since creation
    clock: u64,
    speech_start: u64,
    last_speech: u64,
    potential_emitted: bool,

    // Audio of the current turn, silence included
    buffer: Vec<i16>,
}

impl GapDetector {
    pub fn new(config: GapConfig) -> Self {
        Self {
            config,
            state: DetectorState::Idle,
            clock: 0,
            speech_start: 0,
            last_speech: 0,
            potential_emitted: false,
            buffer: Vec::new(),
        }
    }

    /// Change the commit gap (the potential gap never exceeds it).
    pub fn set_gap(&mut self, gap: Duration) {
        self.config.gap = gap;
    }

    pub fn gap(&self) -> Duration {
        self.config.gap
    }

    /// Feed one frame of samples and collect the resulting events.
    pub fn process(&mut self, samples: &[i16]) -> Vec<GapEvent> {
        let mut events = Vec::new();
        if samples.is_empty() {
            return events;
        }
        let is_speech = rms(samples) >= self.config.energy_threshold;
        let frame_start = self.clock;
        self.clock += samples.len() as u64;
        let now = self.clock;

        match (self.state, is_speech) {
            // Idle -> Speaking: User started talking
            (DetectorState::Idle, true) => {
                info!(target: "realtalk::recognizer", "🎤 Speech started");
                self.state = DetectorState::Speaking;
                self.speech_start = frame_start;
                self.last_speech = now;
                self.potential_emitted = false;
                self.buffer.clear();
                self.buffer.extend_from_slice(samples);
                events.push(GapEvent::SpeechStarted);
            }

            // Speaking -> Speaking: Continue recording
            (DetectorState::Speaking, true) => {
                self.last_speech = now;
                self.buffer.extend_from_slice(samples);
                if self.span(now - self.speech_start) >= self.config.max_turn {
                    warn!(target: "realtalk::recognizer", "⏱️ Max turn duration reached, auto-committing");
                    self.commit(&mut events);
                }
            }

            // Speaking -> SilenceDetected: User paused
            (DetectorState::Speaking, false) => {
                debug!(target: "realtalk::recognizer", "🤫 Silence detected");
                self.state = DetectorState::SilenceDetected;
                self.buffer.extend_from_slice(samples);
                self.check_silence(now, &mut events);
            }

            // SilenceDetected -> Speaking: User resumed
            (DetectorState::SilenceDetected, true) => {
                debug!(target: "realtalk::recognizer", "🎤 Speech resumed");
                self.state = DetectorState::Speaking;
                self.last_speech = now;
                self.potential_emitted = false;
                self.buffer.extend_from_slice(samples);
                events.push(GapEvent::SpeechResumed);
            }

            // SilenceDetected -> SilenceDetected: Check if we should commit
            (DetectorState::SilenceDetected, false) => {
                self.buffer.extend_from_slice(samples);
                self.check_silence(now, &mut events);
            }

            (DetectorState::Idle, false) => {}
        }

        events
    }

    fn check_silence(&mut self, now: u64, events: &mut Vec<GapEvent>) {
        let silence = self.span(now - self.last_speech);
        if silence >= self.config.gap {
            info!(target: "realtalk::recognizer", "✅ Gap reached, committing turn");
            self.commit(events);
        } else if silence >= self.config.potential_gap.min(self.config.gap) && !self.potential_emitted {
            self.potential_emitted = true;
            events.push(GapEvent::PotentialGap {
                samples: self.buffer.clone(),
            });
        }
    }

    fn commit(&mut self, events: &mut Vec<GapEvent>) {
        let duration = self.span(self.last_speech - self.speech_start);
        if duration < self.config.min_speech {
            debug!(target: "realtalk::recognizer", "⏭️ Speech too short ({:?}), ignoring", duration);
            events.push(GapEvent::TooShort { duration });
        } else {
            info!(target: "realtalk::recognizer", "🎯 Turn committed: {:?} duration, {} samples", duration, self.buffer.len());
            events.push(GapEvent::TurnCommitted {
                samples: std::mem::take(&mut self.buffer),
                duration,
            });
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.state = DetectorState::Idle;
        self.potential_emitted = false;
        self.buffer.clear();
    }

    fn span(&self, samples: u64) -> Duration {
        let nanos = samples as u128 * 1_000_000_000 / self.config.sample_rate as u128;
        Duration::from_nanos(nanos as u64)
    }

    /// Get the current state (for testing/debugging)
    pub fn state(&self) -> &str {
        match self.state {
            DetectorState::Idle => "idle",
            DetectorState::Speaking => "speaking",
            DetectorState::SilenceDetected => "silence_detected",
        }
    }
}

/// Root-mean-square level as a fraction of i16 full scale.
fn rms(samples: &[i16]) -> f32 {
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / i16::MAX as f64;
            v * v
        })
        .sum();
    (sum / samples.len() as f64).sqrt() as f32
}
