//! Error types for Alloaudio core buffers

use thiserror::Error;

/// Core error type
///
/// Every variant is `Copy` so the audio thread can build and return one
/// without allocating.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioError {
    #[error("Buffer size mismatch: expected {expected}, got {got}")]
    BufferMismatch { expected: usize, got: usize },

    #[error("Channel count mismatch: expected {expected}, got {got}")]
    ChannelMismatch { expected: usize, got: usize },

    #[error("Invalid capacity: {0}")]
    InvalidCapacity(usize),
}

/// Result type alias
pub type AudioResult<T> = Result<T, AudioError>;
