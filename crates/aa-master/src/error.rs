//! Error types for the output master

use aa_core::AudioError;
use aa_dsp::ConvolverError;
use thiserror::Error;

/// Output master error type
#[derive(Error, Debug)]
pub enum MasterError {
    /// Invalid construction parameters
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Channel {channel} out of range ({available} channels)")]
    InvalidChannel { channel: usize, available: usize },

    #[error("At most {max} subwoofers are supported, got {got}")]
    TooManySubwoofers { max: usize, got: usize },

    /// Invalid parameter value
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Raw bass management mode outside 0..=4
    #[error("Invalid bass management mode {0}")]
    InvalidBassMode(i32),

    #[error("Parameter queue full ({capacity} pending changes)")]
    QueueFull { capacity: usize },

    /// The io buffer does not carry one output per managed channel
    #[error("Channel count mismatch: expected {expected}, got {got}")]
    ChannelMismatch { expected: usize, got: usize },

    #[error("Output master has been shut down")]
    ShutDown,

    /// Room compensation convolution failed
    #[error("Room compensation: {0}")]
    Convolver(#[from] ConvolverError),

    #[error(transparent)]
    Audio(#[from] AudioError),

    /// Malformed JSON configuration
    #[error("Config parse error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// OSC packet could not be encoded or decoded
    #[error("OSC error: {0}")]
    Osc(String),
}

/// Result type for output master operations
pub type MasterResult<T> = Result<T, MasterError>;
