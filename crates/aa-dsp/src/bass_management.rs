//! Bass management crossover bank
//!
//! Each channel is split into a low band and a high band by two cascaded
//! Butterworth sections per band (4th-order Linkwitz-Riley alignment). Both
//! bands share the same phase response, so `low + high` is allpass and
//! recombines with flat magnitude.
//!
//! All channel state lives in one arena allocated at construction and is
//! indexed by channel, so processing never allocates.

use std::f64::consts::FRAC_1_SQRT_2;

use aa_core::Sample;

use crate::biquad::{BiquadCoeffs, BiquadState};
use crate::Processor;

/// Q of each Butterworth section in the cascade
pub const BUTTERWORTH_Q: f64 = FRAC_1_SQRT_2;

/// Crossover frequency used until one is set
pub const DEFAULT_CROSSOVER_HZ: f64 = 150.0;

/// Lowest accepted crossover frequency
pub const MIN_CROSSOVER_HZ: f64 = 10.0;

/// Highest accepted crossover frequency as a fraction of the sample rate
const MAX_CROSSOVER_RATIO: f64 = 0.45;

/// Filter memory for one channel: two lowpass and two highpass sections
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CrossoverState {
    lowpass: [BiquadState; 2],
    highpass: [BiquadState; 2],
}

impl CrossoverState {
    #[inline]
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    #[inline]
    pub fn is_silent(&self) -> bool {
        self.lowpass.iter().chain(&self.highpass).all(BiquadState::is_silent)
    }
}

/// Per-channel crossover filters sharing one coefficient set
#[derive(Debug, Clone)]
pub struct BassManagementFilterBank {
    sample_rate: f64,
    frequency: f64,
    lowpass: BiquadCoeffs,
    highpass: BiquadCoeffs,
    states: Vec<CrossoverState>,
}

impl BassManagementFilterBank {
    pub fn new(num_channels: usize, sample_rate: f64) -> Self {
        let mut bank = Self {
            sample_rate,
            frequency: DEFAULT_CROSSOVER_HZ,
            lowpass: BiquadCoeffs::bypass(),
            highpass: BiquadCoeffs::bypass(),
            states: vec![CrossoverState::default(); num_channels],
        };
        bank.update_coefficients();
        bank
    }

    #[inline]
    pub fn num_channels(&self) -> usize {
        self.states.len()
    }

    #[inline]
    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    #[inline]
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Clamp a requested crossover frequency into the usable range
    pub fn clamp_frequency(&self, frequency: f64) -> f64 {
        let max = self.sample_rate * MAX_CROSSOVER_RATIO;
        if frequency.is_finite() {
            frequency.clamp(MIN_CROSSOVER_HZ, max)
        } else {
            DEFAULT_CROSSOVER_HZ.min(max)
        }
    }

    /// Move the crossover point
    ///
    /// Coefficients are recomputed and every channel's memory is cleared,
    /// since state accumulated at the old cutoff is meaningless at the new one.
    pub fn set_frequency(&mut self, frequency: f64) {
        self.frequency = self.clamp_frequency(frequency);
        self.update_coefficients();
        self.reset();
    }

    /// Recompute coefficients for the current frequency, keeping filter memory
    pub fn update_coefficients(&mut self) {
        self.lowpass = BiquadCoeffs::lowpass(self.frequency, BUTTERWORTH_Q, self.sample_rate);
        self.highpass = BiquadCoeffs::highpass(self.frequency, BUTTERWORTH_Q, self.sample_rate);
    }

    /// Split one sample of `channel` into (low, high)
    #[inline]
    pub fn split_sample(&mut self, channel: usize, input: Sample) -> (Sample, Sample) {
        let state = &mut self.states[channel];
        let stage = state.lowpass[0].process(&self.lowpass, input);
        let low = state.lowpass[1].process(&self.lowpass, stage);
        let stage = state.highpass[0].process(&self.highpass, input);
        let high = state.highpass[1].process(&self.highpass, stage);
        (low, high)
    }

    #[inline]
    pub fn state(&self, channel: usize) -> &CrossoverState {
        &self.states[channel]
    }
}

impl Processor for BassManagementFilterBank {
    fn reset(&mut self) {
        for state in &mut self.states {
            state.reset();
        }
    }
}
