//! Error types for the convolution engine

use thiserror::Error;

/// Convolver status codes
///
/// `Copy` and string-free so `process_block` can fail without allocating.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvolverError {
    /// Impulse-response count does not fit the I/O shape
    #[error("Shape mismatch: expected {expected} impulse responses, got {got}")]
    ShapeMismatch { expected: usize, got: usize },

    #[error("Impulse response length must be positive")]
    InvalidIrLength,

    /// An impulse-response slice holds fewer samples than the declared length
    #[error("Impulse response {index} has {got} samples, {expected} required")]
    IrTooShort {
        index: usize,
        expected: usize,
        got: usize,
    },

    #[error("Invalid channel index {index} ({available} available)")]
    InvalidChannelIndex { index: usize, available: usize },

    /// Raw routing index other than -1 or a channel number
    #[error("Invalid routing index {0}")]
    InvalidRouting(i64),

    #[error("Unsupported partition size {partition} for block size {block}")]
    UnsupportedPartitionSize { partition: usize, block: usize },

    #[error("Block size mismatch: configured {expected}, got {got}")]
    BlockSizeMismatch { expected: usize, got: usize },

    #[error("Channel count mismatch: configured {expected}, got {got}")]
    ChannelMismatch { expected: usize, got: usize },

    #[error("Convolver is not configured")]
    NotConfigured,

    #[error("Convolver has been shut down")]
    ShutDown,

    #[error("FFT processing failed")]
    Transform,
}

/// Result type for convolver operations
pub type ConvolverResult<T> = Result<T, ConvolverError>;
