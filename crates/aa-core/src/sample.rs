//! Sample types and multichannel buffer definitions

use crate::{AudioError, AudioResult};

/// Type alias for audio samples (f64 end to end, converted at the driver edge)
pub type Sample = f64;

/// Audio buffer trait for generic buffer operations
pub trait AudioBuffer {
    /// Number of frames per channel
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn clear(&mut self);
}

/// Non-interleaved multichannel buffer
///
/// All channels live in one allocation, channel-major, so a block can be
/// handed around without per-channel heap objects.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelBuffer {
    samples: Vec<Sample>,
    channels: usize,
    frames: usize,
}

impl ChannelBuffer {
    pub fn new(channels: usize, frames: usize) -> Self {
        Self {
            samples: vec![0.0; channels * frames],
            channels,
            frames,
        }
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    #[inline]
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Borrow one channel. Panics if `channel >= self.channels()`.
    #[inline]
    pub fn channel(&self, channel: usize) -> &[Sample] {
        let start = channel * self.frames;
        &self.samples[start..start + self.frames]
    }

    #[inline]
    pub fn channel_mut(&mut self, channel: usize) -> &mut [Sample] {
        let start = channel * self.frames;
        &mut self.samples[start..start + self.frames]
    }

    /// Flat channel-major view of every sample
    #[inline]
    pub fn as_slice(&self) -> &[Sample] {
        &self.samples
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [Sample] {
        &mut self.samples
    }

    /// Copy another buffer of identical shape into this one
    pub fn copy_from(&mut self, other: &ChannelBuffer) -> AudioResult<()> {
        if other.channels != self.channels {
            return Err(AudioError::ChannelMismatch {
                expected: self.channels,
                got: other.channels,
            });
        }
        if other.frames != self.frames {
            return Err(AudioError::BufferMismatch {
                expected: self.frames,
                got: other.frames,
            });
        }
        self.samples.copy_from_slice(&other.samples);
        Ok(())
    }
}

impl AudioBuffer for ChannelBuffer {
    fn len(&self) -> usize {
        self.frames
    }

    fn clear(&mut self) {
        self.samples.fill(0.0);
    }
}
