//! aa-dsp: DSP processors for Alloaudio
//!
//! ## Modules
//! - `biquad` - TDF-II biquad sections (lowpass, highpass)
//! - `bass_management` - per-channel 4th-order crossover bank for subwoofer routing
//! - `convolution` - uniformly partitioned multichannel FFT convolution

pub mod bass_management;
pub mod biquad;
pub mod convolution;
mod error;

pub use bass_management::{BassManagementFilterBank, CrossoverState};
pub use convolution::{Convolver, ConvolverConfig, ConvolverOptions, Routing};
pub use error::{ConvolverError, ConvolverResult};

/// Trait for all DSP processors
pub trait Processor: Send {
    /// Reset processor state
    fn reset(&mut self);

    /// Get latency in samples
    fn latency(&self) -> usize {
        0
    }
}
