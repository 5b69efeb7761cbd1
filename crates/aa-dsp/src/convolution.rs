//! Multichannel Partitioned Convolution Engine
//!
//! Uniformly partitioned overlap-add convolution for fixed impulse responses:
//! - RealFFT for 2x efficiency over complex FFT
//! - Frequency-domain delay line (FDL) per input channel, shared by every
//!   output fed from that input
//! - Many-to-many (IR i: input i -> output i) and one-to-many
//!   (IR j: input k -> output j) routing
//! - Disabled outputs skipped entirely
//! - Optional lane-interleaved spectrum layout for contiguous multiply-accumulate
//!
//! Latency is `partition_size - block_size` frames, zero when they are equal.
//! Everything is allocated in [`Convolver::configure`]; `process_block` only
//! touches preallocated buffers.

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use aa_core::{AudioIoData, ChannelBuffer, IoShape, Sample};

use crate::{ConvolverError, ConvolverResult, Processor};

// ============ Constants ============

/// Forward+inverse passes timed per candidate plan in measure mode
const MEASURE_ROUNDS: usize = 16;

const ZERO: Complex<f64> = Complex { re: 0.0, im: 0.0 };

// ============ Options ============

/// Configure-time option bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConvolverOptions(u32);

impl ConvolverOptions {
    /// Time candidate FFT plans and keep the fastest (instead of estimating)
    pub const MEASURE: Self = Self(1);
    /// Interleave partition spectra across output lanes
    pub const VECTOR: Self = Self(1 << 1);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ConvolverOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ============ Routing ============

/// How impulse responses map inputs to outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Routing {
    /// IR `i` convolves input `i` into output `i`
    #[default]
    ManyToMany,
    /// Every IR convolves the same input; IR `j` feeds output `j`
    OneToMany { input: usize },
}

impl Routing {
    /// Map the raw channel index convention (-1 = many-to-many)
    pub fn from_channel_index(index: i64) -> ConvolverResult<Self> {
        match index {
            -1 => Ok(Routing::ManyToMany),
            i if i >= 0 => Ok(Routing::OneToMany { input: i as usize }),
            i => Err(ConvolverError::InvalidRouting(i)),
        }
    }
}

/// Everything `configure` needs besides the shape and the impulse responses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvolverConfig {
    pub routing: Routing,
    /// Zero disabled outputs every block (otherwise leave them untouched)
    pub track_disabled: bool,
    pub disabled_outputs: Vec<usize>,
    /// Defaults to the block size
    pub partition_size: Option<usize>,
    pub options: ConvolverOptions,
}

impl Default for ConvolverConfig {
    fn default() -> Self {
        Self {
            routing: Routing::ManyToMany,
            track_disabled: true,
            disabled_outputs: Vec::new(),
            partition_size: None,
            options: ConvolverOptions::empty(),
        }
    }
}

// ============ Transform ============

/// FFT plan for one transform length plus its scratch space
enum Transform {
    /// Real-input FFT (half spectrum computed directly)
    Real {
        forward: Arc<dyn RealToComplex<f64>>,
        inverse: Arc<dyn ComplexToReal<f64>>,
        scratch: Vec<Complex<f64>>,
    },
    /// Full complex FFT on zero-imaginary input
    Complex {
        forward: Arc<dyn Fft<f64>>,
        inverse: Arc<dyn Fft<f64>>,
        buffer: Vec<Complex<f64>>,
        scratch: Vec<Complex<f64>>,
    },
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Transform {
    fn real(len: usize, planner: &mut RealFftPlanner<f64>) -> Self {
        let forward = planner.plan_fft_forward(len);
        let inverse = planner.plan_fft_inverse(len);
        let scratch_len = forward.get_scratch_len().max(inverse.get_scratch_len());
        Transform::Real {
            forward,
            inverse,
            scratch: vec![ZERO; scratch_len],
        }
    }

    fn complex(len: usize, planner: &mut FftPlanner<f64>) -> Self {
        let forward = planner.plan_fft_forward(len);
        let inverse = planner.plan_fft_inverse(len);
        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());
        Transform::Complex {
            forward,
            inverse,
            buffer: vec![ZERO; len],
            scratch: vec![ZERO; scratch_len],
        }
    }

    /// Pick a plan for `len`, timing both candidates when `measure` is set
    fn plan(len: usize, measure: bool) -> Self {
        let mut real = Transform::real(len, &mut RealFftPlanner::new());
        if !measure {
            return real;
        }

        let mut complex = Transform::complex(len, &mut FftPlanner::new());
        let real_time = real.benchmark(len);
        let complex_time = complex.benchmark(len);
        log::debug!(
            "FFT plan timing (len {}): real {:?}, complex {:?}",
            len,
            real_time,
            complex_time
        );

        if complex_time < real_time { complex } else { real }
    }

    fn benchmark(&mut self, len: usize) -> Duration {
        let mut time: Vec<f64> = (0..len).map(|i| ((i * 7) % 13) as f64 - 6.0).collect();
        let mut spectrum = vec![ZERO; len / 2 + 1];

        let start = Instant::now();
        for _ in 0..MEASURE_ROUNDS {
            // A failing candidate simply loses the race
            if self.forward(&mut time, &mut spectrum).is_err()
                || self.inverse(&mut spectrum, &mut time).is_err()
            {
                return Duration::MAX;
            }
        }
        start.elapsed()
    }

    fn name(&self) -> &'static str {
        match self {
            Transform::Real { .. } => "real",
            Transform::Complex { .. } => "complex",
        }
    }

    /// `time` (len N, clobbered) -> `spectrum` (N/2 + 1 bins)
    fn forward(&mut self, time: &mut [f64], spectrum: &mut [Complex<f64>]) -> ConvolverResult<()> {
        match self {
            Transform::Real {
                forward, scratch, ..
            } => forward
                .process_with_scratch(time, spectrum, scratch)
                .map_err(|_| ConvolverError::Transform),
            Transform::Complex {
                forward,
                buffer,
                scratch,
                ..
            } => {
                for (b, &t) in buffer.iter_mut().zip(time.iter()) {
                    *b = Complex::new(t, 0.0);
                }
                forward.process_with_scratch(buffer, scratch);
                spectrum.copy_from_slice(&buffer[..spectrum.len()]);
                Ok(())
            }
        }
    }

    /// `spectrum` (N/2 + 1 bins, clobbered) -> `time` (len N), unnormalized
    fn inverse(&mut self, spectrum: &mut [Complex<f64>], time: &mut [f64]) -> ConvolverResult<()> {
        let last = spectrum.len() - 1;
        // DC and Nyquist bins of a real signal are real
        spectrum[0].im = 0.0;
        spectrum[last].im = 0.0;

        match self {
            Transform::Real {
                inverse, scratch, ..
            } => inverse
                .process_with_scratch(spectrum, time, scratch)
                .map_err(|_| ConvolverError::Transform),
            Transform::Complex {
                inverse,
                buffer,
                scratch,
                ..
            } => {
                let len = buffer.len();
                buffer[..spectrum.len()].copy_from_slice(spectrum);
                for i in spectrum.len()..len {
                    buffer[i] = spectrum[len - i].conj();
                }
                inverse.process_with_scratch(buffer, scratch);
                for (t, b) in time.iter_mut().zip(buffer.iter()) {
                    *t = b.re;
                }
                Ok(())
            }
        }
    }
}

// ============ Engine ============

/// Memory layout of the cached impulse-response spectra
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpectrumLayout {
    /// `[lane][partition][bin]`
    LaneMajor,
    /// `[partition][bin][lane]`
    Interleaved,
}

/// One active convolution path
#[derive(Debug, Clone, Copy)]
struct Lane {
    /// Index into the engine's FDL / input staging slots
    input_slot: usize,
    output: usize,
}

/// Configured convolution state; dropped as a whole on shutdown
#[derive(Debug)]
struct Engine {
    shape: IoShape,
    partition_size: usize,
    num_partitions: usize,
    bins: usize,
    layout: SpectrumLayout,
    transform: Transform,
    lanes: Vec<Lane>,
    /// Input channel read into each FDL slot
    inputs: Vec<usize>,
    /// Outputs written with zeros every block
    silent_outputs: Vec<usize>,
    /// Cached IR partition spectra, scaled by 1/N (see `SpectrumLayout`)
    spectra: Vec<Complex<f64>>,
    /// `[input_slot][ring position][bin]`
    fdl: Vec<Complex<f64>>,
    fdl_head: usize,
    /// Interleaved-layout accumulator, `[bin][lane]`
    accumulator: Vec<Complex<f64>>,
    spectrum: Vec<Complex<f64>>,
    time: Vec<f64>,
    /// `[input_slot][partition_size]`
    input_stage: Vec<Sample>,
    /// `[lane][partition_size]`
    output_stage: Vec<Sample>,
    /// Overlap-add remainder, `[lane][partition_size]`
    tails: Vec<Sample>,
    /// Frames staged in the current partition
    fill: usize,
}

impl Engine {
    fn build(
        shape: IoShape,
        irs: &[&[Sample]],
        ir_length: usize,
        config: &ConvolverConfig,
        partition_size: usize,
    ) -> ConvolverResult<Self> {
        let fft_len = partition_size * 2;
        let bins = partition_size + 1;
        let num_partitions = ir_length.div_ceil(partition_size);
        let disabled = |ch: usize| config.disabled_outputs.contains(&ch);

        let mut lanes = Vec::with_capacity(irs.len());
        let mut lane_irs = Vec::with_capacity(irs.len());
        let mut inputs = Vec::new();
        match config.routing {
            Routing::ManyToMany => {
                for (i, &ir) in irs.iter().enumerate() {
                    if disabled(i) {
                        continue;
                    }
                    inputs.push(i);
                    lanes.push(Lane {
                        input_slot: inputs.len() - 1,
                        output: i,
                    });
                    lane_irs.push(ir);
                }
            }
            Routing::OneToMany { input } => {
                inputs.push(input);
                for (j, &ir) in irs.iter().enumerate() {
                    if disabled(j) {
                        continue;
                    }
                    lanes.push(Lane {
                        input_slot: 0,
                        output: j,
                    });
                    lane_irs.push(ir);
                }
            }
        }

        let silent_outputs: Vec<usize> = (0..shape.outputs)
            .filter(|&o| !lanes.iter().any(|lane| lane.output == o))
            .filter(|&o| config.track_disabled || !disabled(o))
            .collect();

        let layout = if config.options.contains(ConvolverOptions::VECTOR) {
            SpectrumLayout::Interleaved
        } else {
            SpectrumLayout::LaneMajor
        };
        let mut transform =
            Transform::plan(fft_len, config.options.contains(ConvolverOptions::MEASURE));

        let num_lanes = lanes.len();
        let mut spectra = vec![ZERO; num_lanes * num_partitions * bins];
        let mut time = vec![0.0; fft_len];
        let mut spectrum = vec![ZERO; bins];
        let norm = 1.0 / fft_len as f64;

        for (lane, ir) in lane_irs.iter().enumerate() {
            let ir = &ir[..ir_length];
            for k in 0..num_partitions {
                let start = k * partition_size;
                let segment = &ir[start..(start + partition_size).min(ir_length)];
                time.fill(0.0);
                time[..segment.len()].copy_from_slice(segment);
                transform.forward(&mut time, &mut spectrum)?;

                for (bin, &value) in spectrum.iter().enumerate() {
                    let index = match layout {
                        SpectrumLayout::LaneMajor => (lane * num_partitions + k) * bins + bin,
                        SpectrumLayout::Interleaved => (k * bins + bin) * num_lanes + lane,
                    };
                    spectra[index] = value * norm;
                }
            }
        }

        let accumulator = match layout {
            SpectrumLayout::LaneMajor => Vec::new(),
            SpectrumLayout::Interleaved => vec![ZERO; bins * num_lanes],
        };

        Ok(Self {
            shape,
            partition_size,
            num_partitions,
            bins,
            layout,
            transform,
            fdl: vec![ZERO; inputs.len() * num_partitions * bins],
            input_stage: vec![0.0; inputs.len() * partition_size],
            output_stage: vec![0.0; num_lanes * partition_size],
            tails: vec![0.0; num_lanes * partition_size],
            lanes,
            inputs,
            silent_outputs,
            spectra,
            fdl_head: 0,
            accumulator,
            spectrum,
            time,
            fill: 0,
        })
    }

    fn process(&mut self, inputs: &ChannelBuffer, outputs: &mut ChannelBuffer) -> ConvolverResult<()> {
        let block = self.shape.frames;
        if inputs.frames() != block {
            return Err(ConvolverError::BlockSizeMismatch {
                expected: block,
                got: inputs.frames(),
            });
        }
        if outputs.frames() != block {
            return Err(ConvolverError::BlockSizeMismatch {
                expected: block,
                got: outputs.frames(),
            });
        }
        if inputs.channels() != self.shape.inputs {
            return Err(ConvolverError::ChannelMismatch {
                expected: self.shape.inputs,
                got: inputs.channels(),
            });
        }
        if outputs.channels() != self.shape.outputs {
            return Err(ConvolverError::ChannelMismatch {
                expected: self.shape.outputs,
                got: outputs.channels(),
            });
        }

        let p = self.partition_size;
        for (slot, &channel) in self.inputs.iter().enumerate() {
            let start = slot * p + self.fill;
            self.input_stage[start..start + block].copy_from_slice(inputs.channel(channel));
        }
        self.fill += block;

        if self.fill == p {
            self.convolve_partition()?;
            self.fill = 0;
        }

        for (l, lane) in self.lanes.iter().enumerate() {
            let start = l * p + self.fill;
            outputs
                .channel_mut(lane.output)
                .copy_from_slice(&self.output_stage[start..start + block]);
        }
        for &channel in &self.silent_outputs {
            outputs.channel_mut(channel).fill(0.0);
        }
        Ok(())
    }

    /// Run one full partition step: transform staged input, multiply-accumulate
    /// across the FDL, inverse transform and overlap-add into the output stage
    fn convolve_partition(&mut self) -> ConvolverResult<()> {
        let p = self.partition_size;
        let k_count = self.num_partitions;
        let bins = self.bins;

        self.fdl_head = (self.fdl_head + 1) % k_count;
        for slot in 0..self.inputs.len() {
            self.time[..p].copy_from_slice(&self.input_stage[slot * p..(slot + 1) * p]);
            self.time[p..].fill(0.0);
            let start = (slot * k_count + self.fdl_head) * bins;
            self.transform
                .forward(&mut self.time, &mut self.fdl[start..start + bins])?;
        }

        match self.layout {
            SpectrumLayout::LaneMajor => {
                for l in 0..self.lanes.len() {
                    let slot = self.lanes[l].input_slot;
                    self.spectrum.fill(ZERO);
                    for k in 0..k_count {
                        let position = (self.fdl_head + k_count - k) % k_count;
                        let x_start = (slot * k_count + position) * bins;
                        let h_start = (l * k_count + k) * bins;
                        let x = &self.fdl[x_start..x_start + bins];
                        let h = &self.spectra[h_start..h_start + bins];
                        for ((acc, &xv), &hv) in self.spectrum.iter_mut().zip(x).zip(h) {
                            *acc += xv * hv;
                        }
                    }
                    self.finish_lane(l)?;
                }
            }
            SpectrumLayout::Interleaved => {
                let num_lanes = self.lanes.len();
                self.accumulator.fill(ZERO);
                for k in 0..k_count {
                    let position = (self.fdl_head + k_count - k) % k_count;
                    let h_block = &self.spectra[k * bins * num_lanes..(k + 1) * bins * num_lanes];
                    for bin in 0..bins {
                        let row = bin * num_lanes..(bin + 1) * num_lanes;
                        for ((acc, &hv), lane) in self.accumulator[row.clone()]
                            .iter_mut()
                            .zip(&h_block[row])
                            .zip(&self.lanes)
                        {
                            let xv = self.fdl[(lane.input_slot * k_count + position) * bins + bin];
                            *acc += xv * hv;
                        }
                    }
                }
                for l in 0..num_lanes {
                    for (bin, value) in self.spectrum.iter_mut().enumerate() {
                        *value = self.accumulator[bin * num_lanes + l];
                    }
                    self.finish_lane(l)?;
                }
            }
        }
        Ok(())
    }

    /// Inverse-transform the accumulated spectrum of lane `l` and overlap-add
    fn finish_lane(&mut self, l: usize) -> ConvolverResult<()> {
        let p = self.partition_size;
        self.transform.inverse(&mut self.spectrum, &mut self.time)?;

        let out = &mut self.output_stage[l * p..(l + 1) * p];
        let tail = &mut self.tails[l * p..(l + 1) * p];
        let (head, rest) = self.time.split_at(p);
        for i in 0..p {
            out[i] = head[i] + tail[i];
            tail[i] = rest[i];
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.fdl.fill(ZERO);
        self.accumulator.fill(ZERO);
        self.input_stage.fill(0.0);
        self.output_stage.fill(0.0);
        self.tails.fill(0.0);
        self.fdl_head = 0;
        self.fill = 0;
    }
}

// ============ Convolver ============

#[derive(Debug, Default)]
enum State {
    #[default]
    Unconfigured,
    Ready(Box<Engine>),
    ShutDown,
}

/// Multichannel partitioned convolver
///
/// ```rust,ignore
/// let mut conv = Convolver::new();
/// conv.configure(io.shape(), &[&ir_l, &ir_r], ir_len, ConvolverConfig::default())?;
/// conv.process_block(&mut io)?; // once per driver callback
/// conv.shutdown();
/// ```
#[derive(Debug, Default)]
pub struct Convolver {
    state: State,
}

impl Convolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the request, transform and cache every IR partition, and
    /// allocate all per-block state
    ///
    /// On error the previous configuration (if any) is left untouched.
    pub fn configure(
        &mut self,
        shape: IoShape,
        irs: &[&[Sample]],
        ir_length: usize,
        config: ConvolverConfig,
    ) -> ConvolverResult<()> {
        let block = shape.frames;
        let partition_size = config.partition_size.unwrap_or(block);
        if block == 0 || partition_size == 0 || partition_size % block != 0 {
            return Err(ConvolverError::UnsupportedPartitionSize {
                partition: partition_size,
                block,
            });
        }
        if ir_length == 0 {
            return Err(ConvolverError::InvalidIrLength);
        }
        for (index, ir) in irs.iter().enumerate() {
            if ir.len() < ir_length {
                return Err(ConvolverError::IrTooShort {
                    index,
                    expected: ir_length,
                    got: ir.len(),
                });
            }
        }

        match config.routing {
            Routing::ManyToMany => {
                let expected = shape.inputs.min(shape.outputs);
                if irs.len() != expected {
                    return Err(ConvolverError::ShapeMismatch {
                        expected,
                        got: irs.len(),
                    });
                }
            }
            Routing::OneToMany { input } => {
                if input >= shape.inputs {
                    return Err(ConvolverError::InvalidChannelIndex {
                        index: input,
                        available: shape.inputs,
                    });
                }
                if irs.is_empty() || irs.len() > shape.outputs {
                    return Err(ConvolverError::ShapeMismatch {
                        expected: shape.outputs,
                        got: irs.len(),
                    });
                }
            }
        }
        if let Some(&index) = config.disabled_outputs.iter().find(|&&o| o >= shape.outputs) {
            return Err(ConvolverError::InvalidChannelIndex {
                index,
                available: shape.outputs,
            });
        }

        let engine = Engine::build(shape, irs, ir_length, &config, partition_size)?;
        log::info!(
            "Convolver configured: {:?}, {} lanes, {} partitions of {} frames, {} FFT plan, {:?} layout",
            config.routing,
            engine.lanes.len(),
            engine.num_partitions,
            partition_size,
            engine.transform.name(),
            engine.layout
        );
        self.state = State::Ready(Box::new(engine));
        Ok(())
    }

    /// Convolve one driver block: read `io` inputs, write `io` outputs
    pub fn process_block(&mut self, io: &mut AudioIoData) -> ConvolverResult<()> {
        let (inputs, outputs) = io.split_mut();
        self.process(inputs, outputs)
    }

    /// Same as [`Self::process_block`] on raw buffers
    pub fn process(&mut self, inputs: &ChannelBuffer, outputs: &mut ChannelBuffer) -> ConvolverResult<()> {
        self.engine_mut()?.process(inputs, outputs)
    }

    /// Release spectra, delay lines and FFT plans. Idempotent.
    pub fn shutdown(&mut self) {
        if matches!(self.state, State::Ready(_)) {
            log::info!("Convolver shut down");
        }
        self.state = State::ShutDown;
    }

    pub fn is_configured(&self) -> bool {
        matches!(self.state, State::Ready(_))
    }

    /// Configured (inputs, outputs, frames), if live
    pub fn shape(&self) -> Option<IoShape> {
        match &self.state {
            State::Ready(engine) => Some(engine.shape),
            _ => None,
        }
    }

    pub fn partition_size(&self) -> Option<usize> {
        match &self.state {
            State::Ready(engine) => Some(engine.partition_size),
            _ => None,
        }
    }

    pub fn num_partitions(&self) -> Option<usize> {
        match &self.state {
            State::Ready(engine) => Some(engine.num_partitions),
            _ => None,
        }
    }

    fn engine_mut(&mut self) -> ConvolverResult<&mut Engine> {
        match &mut self.state {
            State::Ready(engine) => Ok(engine),
            State::Unconfigured => Err(ConvolverError::NotConfigured),
            State::ShutDown => Err(ConvolverError::ShutDown),
        }
    }
}

impl Processor for Convolver {
    fn reset(&mut self) {
        if let State::Ready(engine) = &mut self.state {
            engine.reset();
        }
    }

    fn latency(&self) -> usize {
        match &self.state {
            State::Ready(engine) => engine.partition_size - engine.shape.frames,
            _ => 0,
        }
    }
}

// ============ Tests ============
