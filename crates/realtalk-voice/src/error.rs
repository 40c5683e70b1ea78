//! Error types for the realtalk voice engine

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while running a voice connection
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Audio frame too short: {len} bytes (header needs 8)")]
    FrameTooShort { len: usize },

    #[error("STT error: {0}")]
    Stt(String),

    #[error("TTS error: {0}")]
    Tts(String),
}
