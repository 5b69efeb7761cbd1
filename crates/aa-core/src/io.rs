//! Per-callback audio I/O block
//!
//! The audio driver fills the input channels, the processing chain writes
//! the output channels in place. Shape is fixed at construction.

use serde::{Deserialize, Serialize};

use crate::{ChannelBuffer, Sample};

/// Input/output channel counts and frames per block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoShape {
    pub inputs: usize,
    pub outputs: usize,
    pub frames: usize,
}

impl IoShape {
    pub const fn new(inputs: usize, outputs: usize, frames: usize) -> Self {
        Self {
            inputs,
            outputs,
            frames,
        }
    }
}

/// One block of driver audio: inputs plus in-place outputs
#[derive(Debug, Clone)]
pub struct AudioIoData {
    inputs: ChannelBuffer,
    outputs: ChannelBuffer,
}

impl AudioIoData {
    pub fn new(frames: usize, inputs: usize, outputs: usize) -> Self {
        Self {
            inputs: ChannelBuffer::new(inputs, frames),
            outputs: ChannelBuffer::new(outputs, frames),
        }
    }

    #[inline]
    pub fn shape(&self) -> IoShape {
        IoShape::new(
            self.inputs.channels(),
            self.outputs.channels(),
            self.outputs.frames(),
        )
    }

    #[inline]
    pub fn frames(&self) -> usize {
        self.outputs.frames()
    }

    #[inline]
    pub fn input(&self, channel: usize) -> &[Sample] {
        self.inputs.channel(channel)
    }

    #[inline]
    pub fn input_mut(&mut self, channel: usize) -> &mut [Sample] {
        self.inputs.channel_mut(channel)
    }

    #[inline]
    pub fn output(&self, channel: usize) -> &[Sample] {
        self.outputs.channel(channel)
    }

    #[inline]
    pub fn output_mut(&mut self, channel: usize) -> &mut [Sample] {
        self.outputs.channel_mut(channel)
    }

    #[inline]
    pub fn inputs(&self) -> &ChannelBuffer {
        &self.inputs
    }

    #[inline]
    pub fn outputs(&self) -> &ChannelBuffer {
        &self.outputs
    }

    #[inline]
    pub fn outputs_mut(&mut self) -> &mut ChannelBuffer {
        &mut self.outputs
    }

    /// Inputs for reading and outputs for writing at the same time
    #[inline]
    pub fn split_mut(&mut self) -> (&ChannelBuffer, &mut ChannelBuffer) {
        (&self.inputs, &mut self.outputs)
    }
}
