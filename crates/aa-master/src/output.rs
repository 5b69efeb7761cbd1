//! Output master
//!
//! Final stage before the driver: applies scheduled parameter changes at
//! block boundaries, then runs room compensation, bass management, gains,
//! clipper, metering and mute over the output buffers in place.
//!
//! Remote control happens through [`OutputControl`], a cloneable handle that
//! only ever touches the parameter queue and the published sample clock.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use aa_core::{
    AudioIoData, ChannelBuffer, IoShape, RingBuffer, RingReader, RingWriter, Sample, gain_to_db,
};
use aa_dsp::{BassManagementFilterBank, Convolver, ConvolverConfig, ConvolverError, Processor};
use parking_lot::Mutex;
use portable_atomic::AtomicF64;

use crate::config::OutputMasterConfig;
use crate::control::ControlServer;
use crate::meter::MeterWorker;
use crate::params::{
    BassManagementMode, Parameter, ParameterChange, ParameterQueue, SubwooferSet,
    meter_update_samples,
};
use crate::{MasterError, MasterResult};

// ============ Output Control ============

/// Cloneable, thread-safe handle for scheduling parameter changes
///
/// Every setter validates its arguments, stamps the change with the current
/// audio clock and queues it; it takes effect at the next block boundary.
#[derive(Clone)]
pub struct OutputControl {
    queue: Arc<ParameterQueue>,
    clock: Arc<AtomicU64>,
    num_channels: usize,
    sample_rate: f64,
}

impl OutputControl {
    /// Sample clock at the start of the next block
    pub fn now(&self) -> u64 {
        self.clock.load(Ordering::Acquire)
    }

    /// Queue `parameter` to take effect at frame `at_frame`
    pub fn schedule(&self, parameter: Parameter, at_frame: u64) -> MasterResult<()> {
        validate_parameter(&parameter, self.num_channels)?;
        self.queue.push(ParameterChange::new(at_frame, parameter))
    }

    /// Queue `parameter` for the next block
    pub fn set(&self, parameter: Parameter) -> MasterResult<()> {
        self.schedule(parameter, self.now())
    }

    pub fn set_master_gain(&self, gain: f64) -> MasterResult<()> {
        self.set(Parameter::MasterGain(gain))
    }

    pub fn set_gain(&self, channel: usize, gain: f64) -> MasterResult<()> {
        self.set(Parameter::ChannelGain { channel, gain })
    }

    pub fn set_mute_all(&self, mute: bool) -> MasterResult<()> {
        self.set(Parameter::MuteAll(mute))
    }

    pub fn set_clipper_on(&self, on: bool) -> MasterResult<()> {
        self.set(Parameter::Clipper(on))
    }

    pub fn set_room_compensation_on(&self, on: bool) -> MasterResult<()> {
        self.set(Parameter::FiltersActive(on))
    }

    pub fn set_meter_update_freq(&self, freq_hz: f64) -> MasterResult<()> {
        self.set(Parameter::MeterUpdateSamples(meter_update_samples(
            freq_hz,
            self.sample_rate,
        )?))
    }

    pub fn set_bass_management_freq(&self, freq_hz: f64) -> MasterResult<()> {
        self.set(Parameter::BassFrequency(freq_hz))
    }

    pub fn set_bass_management_mode(&self, mode: BassManagementMode) -> MasterResult<()> {
        self.set(Parameter::BassMode(mode))
    }

    pub fn set_sw_indices(&self, indices: &[usize]) -> MasterResult<()> {
        self.set(Parameter::Subwoofers(SubwooferSet::new(indices)?))
    }

    pub fn set_meter_on(&self, on: bool) -> MasterResult<()> {
        self.set(Parameter::MeterOn(on))
    }

    /// Changes queued but not yet applied
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

fn validate_parameter(parameter: &Parameter, num_channels: usize) -> MasterResult<()> {
    match *parameter {
        Parameter::ChannelGain { channel, .. } if channel >= num_channels => {
            Err(MasterError::InvalidChannel {
                channel,
                available: num_channels,
            })
        }
        Parameter::Subwoofers(set) => set.validate(num_channels),
        Parameter::MeterUpdateSamples(0) => Err(MasterError::InvalidParameter(
            "meter update period must be at least one frame".into(),
        )),
        _ => Ok(()),
    }
}

// ============ Master State ============

/// Parameter values as seen by the audio thread
#[derive(Debug, Clone)]
struct MasterState {
    gains: Vec<f64>,
    master_gain: f64,
    mute_all: bool,
    clipper_on: bool,
    filters_active: bool,
    meter_on: bool,
    meter_update_samples: usize,
    bass_mode: BassManagementMode,
    bass_frequency: f64,
    subwoofers: SubwooferSet,
    /// Crossover frequency changed since the last coefficient update
    frequency_dirty: bool,
    /// Bass mode changed since the last coefficient update
    mode_dirty: bool,
}

/// Room compensation convolver plus the copy of the outputs it reads from
struct RoomCompensation {
    convolver: Convolver,
    scratch: ChannelBuffer,
}

/// Peak accumulation between meter publications
struct Metering {
    writer: RingWriter<f32>,
    reader: Arc<Mutex<RingReader<f32>>>,
    peaks: Vec<f32>,
    counter: usize,
    /// Update rate in Hz, read by the telemetry worker
    update_freq: Arc<AtomicF64>,
}

impl Metering {
    fn reset(&mut self) {
        self.peaks.fill(0.0);
        self.counter = 0;
    }
}

// ============ Output Master ============

/// Multichannel output processing stage
///
/// ```rust,ignore
/// let mut master = OutputMaster::new(OutputMasterConfig::new(8, 48000.0))?;
/// master.set_sw_indices(&[7])?;
/// master.set_bass_management_mode(BassManagementMode::Lowpass);
/// // audio callback
/// master.process_block(&mut io)?;
/// ```
pub struct OutputMaster {
    num_channels: usize,
    sample_rate: f64,
    state: MasterState,
    bass: BassManagementFilterBank,
    room: Option<RoomCompensation>,
    metering: Metering,
    queue: Arc<ParameterQueue>,
    /// Due changes drained each block, preallocated to the queue capacity
    due: Vec<ParameterChange>,
    clock: Arc<AtomicU64>,
    frame: u64,
    control_server: Option<ControlServer>,
    meter_worker: Option<MeterWorker>,
    shut_down: bool,
}

impl OutputMaster {
    /// Build the master and start the control/telemetry threads configured
    /// in `config`
    ///
    /// A thread that fails to start is logged; the master still works without
    /// that subsystem.
    pub fn new(config: OutputMasterConfig) -> MasterResult<Self> {
        config.validate()?;
        let n = config.num_channels;
        let sample_rate = config.sample_rate;

        let meter_samples = meter_update_samples(config.meter_update_freq, sample_rate)?;
        let subwoofers = SubwooferSet::new(&config.sw_indices)?;

        let mut bass = BassManagementFilterBank::new(n, sample_rate);
        bass.set_frequency(config.bass_management_freq);

        let (writer, reader) = RingBuffer::<f32>::with_capacity(config.meter_buffer_frames * n)?;
        let metering = Metering {
            writer,
            reader: Arc::new(Mutex::new(reader)),
            peaks: vec![0.0; n],
            counter: 0,
            update_freq: Arc::new(AtomicF64::new(sample_rate / meter_samples as f64)),
        };

        let queue = Arc::new(ParameterQueue::new(config.queue_capacity));
        let clock = Arc::new(AtomicU64::new(0));

        let mut master = Self {
            num_channels: n,
            sample_rate,
            state: MasterState {
                gains: vec![1.0; n],
                master_gain: 1.0,
                mute_all: false,
                clipper_on: false,
                filters_active: false,
                meter_on: config.meter_on,
                meter_update_samples: meter_samples,
                bass_mode: config.bass_management_mode,
                bass_frequency: bass.frequency(),
                subwoofers,
                frequency_dirty: false,
                mode_dirty: false,
            },
            bass,
            room: None,
            metering,
            due: Vec::with_capacity(config.queue_capacity),
            queue,
            clock,
            frame: 0,
            control_server: None,
            meter_worker: None,
            shut_down: false,
        };

        if let Some(addr) = config.control_addr {
            master.start_control_server(addr, Duration::from_millis(config.message_timeout_ms));
        }
        if let Some(addr) = config.telemetry_addr {
            master.start_meter_worker(addr);
        }

        log::info!(
            "OutputMaster: {} channels @ {} Hz, bass management {:?} at {:.1} Hz",
            n,
            sample_rate,
            master.state.bass_mode,
            master.state.bass_frequency
        );
        Ok(master)
    }

    fn start_control_server(&mut self, addr: SocketAddr, timeout: Duration) {
        let control = self.control();
        let handler = move |parameter: Parameter| {
            if let Err(e) = control.set(parameter) {
                log::warn!("Dropped OSC parameter {:?}: {}", parameter, e);
            }
        };
        match ControlServer::spawn(addr, timeout, self.sample_rate, handler) {
            Ok(server) => self.control_server = Some(server),
            Err(e) => log::error!(
                "Failed to start OSC control server on {}: {}. Remote control disabled.",
                addr,
                e
            ),
        }
    }

    fn start_meter_worker(&mut self, addr: SocketAddr) {
        match MeterWorker::spawn(
            Arc::clone(&self.metering.reader),
            self.num_channels,
            addr,
            Arc::clone(&self.metering.update_freq),
        ) {
            Ok(worker) => self.meter_worker = Some(worker),
            Err(e) => log::error!(
                "Failed to start meter telemetry to {}: {}. OSC meters disabled.",
                addr,
                e
            ),
        }
    }

    /// Handle for scheduling changes from other threads
    pub fn control(&self) -> OutputControl {
        OutputControl {
            queue: Arc::clone(&self.queue),
            clock: Arc::clone(&self.clock),
            num_channels: self.num_channels,
            sample_rate: self.sample_rate,
        }
    }

    /// Local address of the OSC control server, if running
    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.control_server.as_ref().map(ControlServer::local_addr)
    }

    pub fn num_chnls(&self) -> usize {
        self.num_channels
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Frames processed so far
    pub fn sample_clock(&self) -> u64 {
        self.frame
    }

    /// Room compensation delay in frames
    pub fn latency(&self) -> usize {
        self.room
            .as_ref()
            .map_or(0, |room| room.convolver.latency())
    }

    // ============ Direct Setters ============

    pub fn set_master_gain(&mut self, gain: f64) {
        log::debug!("Master gain {:.1} dB", gain_to_db(gain));
        self.apply(Parameter::MasterGain(gain));
    }

    pub fn set_gain(&mut self, channel: usize, gain: f64) -> MasterResult<()> {
        let parameter = Parameter::ChannelGain { channel, gain };
        validate_parameter(&parameter, self.num_channels)?;
        log::debug!("Channel {} gain {:.1} dB", channel, gain_to_db(gain));
        self.apply(parameter);
        Ok(())
    }

    pub fn set_mute_all(&mut self, mute: bool) {
        self.apply(Parameter::MuteAll(mute));
    }

    pub fn set_clipper_on(&mut self, on: bool) {
        self.apply(Parameter::Clipper(on));
    }

    pub fn set_room_compensation_on(&mut self, on: bool) {
        self.apply(Parameter::FiltersActive(on));
    }

    pub fn set_meter_update_freq(&mut self, freq_hz: f64) -> MasterResult<()> {
        let samples = meter_update_samples(freq_hz, self.sample_rate)?;
        self.apply(Parameter::MeterUpdateSamples(samples));
        Ok(())
    }

    pub fn set_bass_management_freq(&mut self, freq_hz: f64) {
        self.apply(Parameter::BassFrequency(freq_hz));
    }

    pub fn set_bass_management_mode(&mut self, mode: BassManagementMode) {
        self.apply(Parameter::BassMode(mode));
    }

    /// Mark up to four channels as subwoofers
    pub fn set_sw_indices(&mut self, indices: &[usize]) -> MasterResult<()> {
        let set = SubwooferSet::new(indices)?;
        set.validate(self.num_channels)?;
        self.apply(Parameter::Subwoofers(set));
        Ok(())
    }

    pub fn set_meter_on(&mut self, on: bool) {
        self.apply(Parameter::MeterOn(on));
    }

    pub fn master_gain(&self) -> f64 {
        self.state.master_gain
    }

    pub fn gain(&self, channel: usize) -> Option<f64> {
        self.state.gains.get(channel).copied()
    }

    pub fn is_muted(&self) -> bool {
        self.state.mute_all
    }

    pub fn bass_management_mode(&self) -> BassManagementMode {
        self.state.bass_mode
    }

    pub fn bass_management_freq(&self) -> f64 {
        self.state.bass_frequency
    }

    pub fn sw_indices(&self) -> &[usize] {
        self.state.subwoofers.as_slice()
    }

    /// Install one room compensation IR per channel for blocks of `block_size`
    ///
    /// Filtering only runs while room compensation is switched on.
    pub fn set_room_compensation_filters(
        &mut self,
        irs: &[&[Sample]],
        ir_length: usize,
        block_size: usize,
    ) -> MasterResult<()> {
        if self.shut_down {
            return Err(MasterError::ShutDown);
        }
        let n = self.num_channels;
        let mut convolver = Convolver::new();
        convolver.configure(
            IoShape::new(n, n, block_size),
            irs,
            ir_length,
            ConvolverConfig::default(),
        )?;
        self.room = Some(RoomCompensation {
            convolver,
            scratch: ChannelBuffer::new(n, block_size),
        });
        log::info!(
            "Room compensation filters installed: {} x {} taps",
            n,
            ir_length
        );
        Ok(())
    }

    // ============ Parameter Application ============

    fn apply(&mut self, parameter: Parameter) {
        let state = &mut self.state;
        match parameter {
            Parameter::ChannelGain { channel, gain } => {
                if let Some(g) = state.gains.get_mut(channel) {
                    *g = gain;
                }
            }
            Parameter::MasterGain(gain) => state.master_gain = gain,
            Parameter::MuteAll(mute) => state.mute_all = mute,
            Parameter::Clipper(on) => state.clipper_on = on,
            Parameter::FiltersActive(on) => state.filters_active = on,
            Parameter::BassFrequency(freq) => {
                let freq = self.bass.clamp_frequency(freq);
                state.bass_frequency = freq;
                // Only a new cutoff clears filter memory
                state.frequency_dirty = freq != self.bass.frequency();
            }
            Parameter::BassMode(mode) => {
                if mode != state.bass_mode {
                    state.bass_mode = mode;
                    state.mode_dirty = true;
                }
            }
            Parameter::Subwoofers(set) => state.subwoofers = set,
            Parameter::MeterOn(on) => {
                if on != state.meter_on {
                    state.meter_on = on;
                    self.metering.reset();
                }
            }
            Parameter::MeterUpdateSamples(samples) => {
                let samples = samples.max(1);
                state.meter_update_samples = samples;
                self.metering
                    .update_freq
                    .store(self.sample_rate / samples as f64, Ordering::Relaxed);
            }
        }
    }

    /// Drain due changes and apply them in (time, arrival) order
    fn apply_due_parameters(&mut self) {
        self.due.clear();
        if self.queue.drain_due(self.frame, &mut self.due) == 0 {
            return;
        }
        self.due.sort_unstable_by_key(ParameterChange::order_key);
        for i in 0..self.due.len() {
            let parameter = self.due[i].parameter;
            self.apply(parameter);
        }
        self.due.clear();
    }

    /// Bring crossover coefficients in line with the current frequency/mode
    fn update_crossover(&mut self) {
        let state = &mut self.state;
        if state.bass_mode == BassManagementMode::None
            || !(state.frequency_dirty || state.mode_dirty)
        {
            return;
        }
        if state.frequency_dirty {
            self.bass.set_frequency(state.bass_frequency);
        } else {
            self.bass.update_coefficients();
        }
        state.frequency_dirty = false;
        state.mode_dirty = false;
    }

    // ============ Processing ============

    /// Process the output buffers of `io` in place
    pub fn process_block(&mut self, io: &mut AudioIoData) -> MasterResult<()> {
        if self.shut_down {
            return Err(MasterError::ShutDown);
        }
        let outputs = io.outputs_mut();
        if outputs.channels() != self.num_channels {
            return Err(MasterError::ChannelMismatch {
                expected: self.num_channels,
                got: outputs.channels(),
            });
        }
        let frames = outputs.frames();

        self.apply_due_parameters();
        self.update_crossover();

        if self.state.filters_active {
            if let Some(room) = self.room.as_mut() {
                if room.scratch.frames() != frames {
                    return Err(MasterError::Convolver(ConvolverError::BlockSizeMismatch {
                        expected: room.scratch.frames(),
                        got: frames,
                    }));
                }
                room.scratch.copy_from(outputs)?;
                room.convolver.process(&room.scratch, outputs)?;
            }
        }

        if self.state.bass_mode != BassManagementMode::None {
            self.bass_management(outputs);
        }

        let samples = outputs.as_mut_slice();
        let master_gain = self.state.master_gain;
        for (channel, &gain) in samples.chunks_exact_mut(frames.max(1)).zip(&self.state.gains) {
            for s in channel.iter_mut() {
                *s = *s * gain * master_gain;
            }
        }

        if self.state.clipper_on {
            for s in samples.iter_mut() {
                *s = s.clamp(-1.0, 1.0);
            }
        }

        if self.state.meter_on {
            self.meter(outputs, frames);
        }

        if self.state.mute_all {
            outputs.as_mut_slice().fill(0.0);
        }

        self.frame += frames as u64;
        self.clock.store(self.frame, Ordering::Release);
        Ok(())
    }

    /// Crossover split and subwoofer routing, frame by frame
    fn bass_management(&mut self, outputs: &mut ChannelBuffer) {
        let frames = outputs.frames();
        let mode = self.state.bass_mode;
        let subwoofers = self.state.subwoofers;
        let samples = outputs.as_mut_slice();

        for i in 0..frames {
            let mut low_sum = 0.0;
            for ch in 0..self.num_channels {
                if subwoofers.contains(ch) {
                    continue;
                }
                let index = ch * frames + i;
                let (low, high) = self.bass.split_sample(ch, samples[index]);
                low_sum += low;
                if mode.highpasses_mains() {
                    samples[index] = high;
                }
            }

            for &sw in subwoofers.as_slice() {
                let index = sw * frames + i;
                match mode {
                    BassManagementMode::Mix | BassManagementMode::Full => samples[index] += low_sum,
                    BassManagementMode::Lowpass => samples[index] = low_sum,
                    BassManagementMode::Highpass | BassManagementMode::None => {}
                }
            }
        }
    }

    /// Accumulate per-channel peaks; publish one frame of values every
    /// `meter_update_samples` frames
    fn meter(&mut self, outputs: &ChannelBuffer, frames: usize) {
        let metering = &mut self.metering;
        let period = self.state.meter_update_samples;
        let samples = outputs.as_slice();

        for i in 0..frames {
            for (ch, peak) in metering.peaks.iter_mut().enumerate() {
                let magnitude = samples[ch * frames + i].abs() as f32;
                if magnitude > *peak {
                    *peak = magnitude;
                }
            }
            metering.counter += 1;
            if metering.counter >= period {
                metering.writer.push_slice(&metering.peaks);
                metering.reset();
            }
        }
    }

    /// Drain published meter values (whole frames of one value per channel)
    /// into `out`; returns the number of values written
    ///
    /// Competes with the OSC telemetry worker when one is running.
    pub fn get_meter_values(&self, out: &mut [f32]) -> usize {
        let whole = out.len() - out.len() % self.num_channels;
        self.metering.reader.lock().pop_into(&mut out[..whole])
    }

    // ============ Lifecycle ============

    /// Stop the control and telemetry threads and release the room
    /// compensation convolver. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        if let Some(mut server) = self.control_server.take() {
            server.shutdown();
        }
        if let Some(mut worker) = self.meter_worker.take() {
            worker.shutdown();
        }
        if let Some(mut room) = self.room.take() {
            room.convolver.shutdown();
        }
        self.queue.clear();
        log::info!("OutputMaster shut down after {} frames", self.frame);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

impl Drop for OutputMaster {
    fn drop(&mut self) {
        self.shutdown();
    }
}
