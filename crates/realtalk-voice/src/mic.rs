//! Microphone mute gate. The mic is muted when the user's turn ends so the start of the
//! assistant's reply is not fed back to the recognizer, then released by timeout.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default, Clone)]
pub struct MicGate {
    muted_at: Option<Instant>,
    release_at: Option<Instant>,
}

impl MicGate {
    pub fn mute(&mut self, now: Instant) {
        self.muted_at = Some(now);
        self.release_at = None;
    }

    pub fn unmute(&mut self) {
        self.muted_at = None;
        self.release_at = None;
    }

    pub fn is_muted(&self) -> bool {
        self.muted_at.is_some()
    }

    pub fn muted_at(&self) -> Option<Instant> {
        self.muted_at
    }

    /// Arm a one-shot release at `deadline`. Ignored if not muted or already armed.
    pub fn schedule_release(&mut self, deadline: Instant) {
        if self.muted_at.is_some() && self.release_at.is_none() {
            self.release_at = Some(deadline);
        }
    }

    /// Release the mute if `max_mute` elapsed since muting or the armed deadline passed.
    /// Returns `true` when this call released it.
    pub fn poll_release(&mut self, now: Instant, max_mute: Duration) -> bool {
        let Some(muted_at) = self.muted_at else {
            return false;
        };
        let timed_out = now.saturating_duration_since(muted_at) >= max_mute;
        let deadline_passed = self.release_at.is_some_and(|at| now >= at);
        if timed_out || deadline_passed {
            self.unmute();
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn releases_after_max_mute() {
        let start = Instant::now();
        let mut gate = MicGate::default();
        gate.mute(start);
        assert!(!gate.poll_release(start + Duration::from_millis(1999), Duration::from_secs(2)));
        assert!(gate.poll_release(start + Duration::from_secs(2), Duration::from_secs(2)));
        assert!(!gate.is_muted());
        assert!(!gate.poll_release(start + Duration::from_secs(3), Duration::from_secs(2)));
    }

    #[test]
    fn armed_release_fires_first_and_only_once_armed() {
        let start = Instant::now();
        let mut gate = MicGate::default();
        gate.mute(start);
        gate.schedule_release(start + Duration::from_millis(500));
        gate.schedule_release(start + Duration::from_millis(1500));
        assert!(gate.poll_release(start + Duration::from_millis(600), Duration::from_secs(2)));
    }

    #[test]
    fn schedule_without_mute_is_ignored() {
        let mut gate = MicGate::default();
        gate.schedule_release(Instant::now());
        assert!(!gate.is_muted());
        assert!(!gate.poll_release(Instant::now(), Duration::from_secs(2)));
    }
}
