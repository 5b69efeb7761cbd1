//! Output master construction settings

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::params::{BassManagementMode, SubwooferSet};
use crate::{MasterError, MasterResult};

/// Default OSC control port
pub const DEFAULT_CONTROL_PORT: u16 = 19375;

/// Everything needed to build an [`OutputMaster`](crate::OutputMaster)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputMasterConfig {
    pub num_channels: usize,
    pub sample_rate: f64,
    /// Local address for the OSC control server (none = no remote control)
    pub control_addr: Option<SocketAddr>,
    /// Destination for OSC meter telemetry (none = meters only via
    /// `get_meter_values`)
    pub telemetry_addr: Option<SocketAddr>,
    /// Control socket receive timeout; also bounds shutdown latency
    pub message_timeout_ms: u64,
    /// Pending parameter changes before pushes are rejected
    pub queue_capacity: usize,
    /// Meter frames (one value per channel) buffered for readers
    pub meter_buffer_frames: usize,
    pub meter_update_freq: f64,
    pub meter_on: bool,
    pub bass_management_freq: f64,
    pub bass_management_mode: BassManagementMode,
    pub sw_indices: Vec<usize>,
}

impl Default for OutputMasterConfig {
    fn default() -> Self {
        Self {
            num_channels: 2,
            sample_rate: 44100.0,
            control_addr: None,
            telemetry_addr: None,
            message_timeout_ms: 50,
            queue_capacity: 1024,
            meter_buffer_frames: 256,
            meter_update_freq: 10.0,
            meter_on: false,
            bass_management_freq: aa_dsp::bass_management::DEFAULT_CROSSOVER_HZ,
            bass_management_mode: BassManagementMode::None,
            sw_indices: Vec::new(),
        }
    }
}

impl OutputMasterConfig {
    pub fn new(num_channels: usize, sample_rate: f64) -> Self {
        Self {
            num_channels,
            sample_rate,
            ..Default::default()
        }
    }

    /// Parse and validate a JSON document; missing fields take defaults
    pub fn from_json(json: &str) -> MasterResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> MasterResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> MasterResult<()> {
        if self.num_channels == 0 {
            return Err(MasterError::InvalidConfig(
                "channel count must be positive".into(),
            ));
        }
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(MasterError::InvalidConfig(format!(
                "sample rate must be positive, got {}",
                self.sample_rate
            )));
        }
        if self.queue_capacity == 0 {
            return Err(MasterError::InvalidConfig(
                "parameter queue capacity must be positive".into(),
            ));
        }
        if self.meter_buffer_frames == 0 {
            return Err(MasterError::InvalidConfig(
                "meter buffer must hold at least one frame".into(),
            ));
        }
        if self.meter_buffer_frames.checked_mul(self.num_channels).is_none() {
            return Err(MasterError::InvalidConfig(format!(
                "meter buffer of {} frames x {} channels overflows",
                self.meter_buffer_frames, self.num_channels
            )));
        }
        SubwooferSet::new(&self.sw_indices)?.validate(self.num_channels)
    }
}
