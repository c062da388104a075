//! RTL-SDR streaming acquisition
//!
//! Configures an RTL-SDR dongle, streams raw 8-bit IQ chunks off it on a
//! dedicated thread, and converts chunks to magnitudes for downstream
//! detectors.

pub mod config;
pub mod device;
pub mod error;
pub mod sdr;

pub use device::{AgcMode, Driver, GainMode, Radio, RadioSettings, RtlSdrProcess};
pub use error::{Error, Result};
pub use sdr::{
    convert_to_magnitudes, Acquisition, AcquisitionConfig, AcquisitionState, Mag, MagBuffer,
    MagnitudeLut, SampleBuffer, StopReason,
};
