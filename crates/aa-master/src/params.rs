//! Timestamped parameter changes and the queue that carries them to the
//! audio thread

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{MasterError, MasterResult};

/// Maximum number of subwoofer channels
pub const MAX_SUBWOOFERS: usize = 4;

// ============ Bass Management Mode ============

/// Bass management routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BassManagementMode {
    /// No filtering, no routing
    #[default]
    None,
    /// Subwoofers receive the summed low band on top of their own signal;
    /// every channel stays full range
    Mix,
    /// Subwoofers carry only the summed low band; mains are highpassed
    Lowpass,
    /// Mains are highpassed; subwoofers untouched
    Highpass,
    /// Mains highpassed; subwoofers keep their signal plus the summed low band
    Full,
}

impl BassManagementMode {
    /// Decode the wire value (0 = none .. 4 = full)
    pub fn from_raw(value: i32) -> MasterResult<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Mix),
            2 => Ok(Self::Lowpass),
            3 => Ok(Self::Highpass),
            4 => Ok(Self::Full),
            other => Err(MasterError::InvalidBassMode(other)),
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            Self::None => 0,
            Self::Mix => 1,
            Self::Lowpass => 2,
            Self::Highpass => 3,
            Self::Full => 4,
        }
    }

    /// Whether non-subwoofer channels are replaced by their high band
    #[inline]
    pub fn highpasses_mains(self) -> bool {
        matches!(self, Self::Lowpass | Self::Highpass | Self::Full)
    }
}

// ============ Subwoofer Set ============

/// Up to [`MAX_SUBWOOFERS`] distinct channel indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubwooferSet {
    indices: [usize; MAX_SUBWOOFERS],
    len: usize,
}

impl SubwooferSet {
    pub const fn empty() -> Self {
        Self {
            indices: [0; MAX_SUBWOOFERS],
            len: 0,
        }
    }

    /// Build from channel indices; duplicates are collapsed
    pub fn new(indices: &[usize]) -> MasterResult<Self> {
        let mut set = Self::empty();
        for &index in indices {
            if set.contains(index) {
                continue;
            }
            if set.len == MAX_SUBWOOFERS {
                return Err(MasterError::TooManySubwoofers {
                    max: MAX_SUBWOOFERS,
                    got: indices.len(),
                });
            }
            set.indices[set.len] = index;
            set.len += 1;
        }
        Ok(set)
    }

    /// Build from raw wire indices, where negative entries mean "unused"
    pub fn from_raw(indices: &[i32]) -> MasterResult<Self> {
        let used: Vec<usize> = indices
            .iter()
            .filter(|&&i| i >= 0)
            .map(|&i| i as usize)
            .collect();
        Self::new(&used)
    }

    #[inline]
    pub fn as_slice(&self) -> &[usize] {
        &self.indices[..self.len]
    }

    #[inline]
    pub fn contains(&self, channel: usize) -> bool {
        self.as_slice().contains(&channel)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Check every index against the channel count
    pub fn validate(&self, num_channels: usize) -> MasterResult<()> {
        match self.as_slice().iter().find(|&&i| i >= num_channels) {
            Some(&channel) => Err(MasterError::InvalidChannel {
                channel,
                available: num_channels,
            }),
            None => Ok(()),
        }
    }
}

/// Frames between meter updates for an update rate in Hz
pub fn meter_update_samples(freq_hz: f64, sample_rate: f64) -> MasterResult<usize> {
    if !(freq_hz.is_finite() && freq_hz > 0.0) {
        return Err(MasterError::InvalidParameter(format!(
            "meter update frequency must be positive, got {}",
            freq_hz
        )));
    }
    Ok((sample_rate / freq_hz).round().max(1.0) as usize)
}

// ============ Parameters ============

/// One controllable parameter with its new value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Parameter {
    ChannelGain { channel: usize, gain: f64 },
    MasterGain(f64),
    MuteAll(bool),
    Clipper(bool),
    /// Room compensation convolution on/off
    FiltersActive(bool),
    BassFrequency(f64),
    BassMode(BassManagementMode),
    Subwoofers(SubwooferSet),
    MeterOn(bool),
    /// Frames between published meter values
    MeterUpdateSamples(usize),
}

/// A parameter change scheduled on the audio sample clock
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterChange {
    /// Frame position at which the change takes effect
    pub time: u64,
    /// Arrival order, stamped by the queue
    pub seq: u64,
    pub parameter: Parameter,
}

impl ParameterChange {
    pub fn new(time: u64, parameter: Parameter) -> Self {
        Self {
            time,
            seq: 0,
            parameter,
        }
    }

    /// Application order: scheduled time, then arrival
    #[inline]
    pub fn order_key(&self) -> (u64, u64) {
        (self.time, self.seq)
    }
}

// ============ Parameter Queue ============

struct QueueInner {
    entries: VecDeque<ParameterChange>,
    next_seq: u64,
}

/// Bounded FIFO of pending parameter changes
///
/// Producers (control thread, direct API callers) and the single consumer
/// (audio thread) share one short critical section; nothing inside it
/// allocates.
pub struct ParameterQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
}

impl ParameterQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                entries: VecDeque::with_capacity(capacity),
                next_seq: 0,
            }),
            capacity,
        }
    }

    /// Enqueue a change, stamping its arrival sequence number
    pub fn push(&self, mut change: ParameterChange) -> MasterResult<()> {
        let mut inner = self.inner.lock();
        if inner.entries.len() >= self.capacity {
            return Err(MasterError::QueueFull {
                capacity: self.capacity,
            });
        }
        change.seq = inner.next_seq;
        inner.next_seq = inner.next_seq.wrapping_add(1);
        inner.entries.push_back(change);
        Ok(())
    }

    /// Move every change due at or before `now` into `out`, in arrival order
    ///
    /// Later changes stay queued. Returns the number of changes moved.
    pub fn drain_due(&self, now: u64, out: &mut Vec<ParameterChange>) -> usize {
        let before = out.len();
        let mut inner = self.inner.lock();
        inner.entries.retain(|change| {
            if change.time <= now {
                out.push(*change);
                false
            } else {
                true
            }
        });
        out.len() - before
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }
}
