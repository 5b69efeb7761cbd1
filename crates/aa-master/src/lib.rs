//! aa-master: Multichannel output mastering for Alloaudio
//!
//! Last processing stage before the audio driver:
//!
//! ## Features
//! - **Scheduled Parameters**: changes stamped on the sample clock, applied at
//!   block boundaries in (time, arrival) order
//! - **Room Compensation**: per-channel FIR correction via the partitioned convolver
//! - **Bass Management**: 4th-order crossover with five subwoofer routing modes
//! - **Gain Staging**: per-channel and master gain, optional hard clipper, global mute
//! - **Peak Metering**: lock-free meter ring, read locally or sent as OSC telemetry
//! - **Remote Control**: OSC server mapping `/Alloaudio/...` messages onto parameters
//!
//! ## Usage
//!
//! ```rust,ignore
//! use aa_master::{BassManagementMode, OutputMaster, OutputMasterConfig};
//!
//! let mut master = OutputMaster::new(OutputMasterConfig::new(8, 48000.0))?;
//! master.set_sw_indices(&[7])?;
//! master.set_bass_management_mode(BassManagementMode::Lowpass);
//!
//! let control = master.control(); // hand to another thread
//! control.set_master_gain(0.5)?;
//!
//! master.process_block(&mut io)?; // audio callback
//! ```

// Per-frame routing uses explicit channel-major indexing
#![allow(clippy::needless_range_loop)]

pub mod config;
pub mod control;
mod error;
pub mod meter;
pub mod output;
pub mod params;

pub use config::OutputMasterConfig;
pub use error::{MasterError, MasterResult};
pub use output::{OutputControl, OutputMaster};
pub use params::{
    BassManagementMode, MAX_SUBWOOFERS, Parameter, ParameterChange, ParameterQueue, SubwooferSet,
};
