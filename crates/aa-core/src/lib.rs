//! aa-core: Shared types and real-time plumbing for Alloaudio
//!
//! This crate provides the foundational types used across all Alloaudio crates:
//! the sample type, multichannel block buffers handed over by the audio driver,
//! and the lock-free ring buffer that carries meter data out of the audio thread.

mod error;
mod io;
mod ring;
mod sample;

pub use error::*;
pub use io::*;
pub use ring::*;
pub use sample::*;

/// Convert a linear gain to decibels (silence maps to -inf)
#[inline]
pub fn gain_to_db(gain: f64) -> f64 {
    if gain <= 0.0 {
        f64::NEG_INFINITY
    } else {
        20.0 * gain.log10()
    }
}
