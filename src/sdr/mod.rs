//! Native RTL-SDR sample pipeline
//!
//! 1. Pull raw interleaved IQ bytes off the device on a dedicated thread
//! 2. Hand each filled chunk to the consumer over a bounded channel
//! 3. Convert chunks to magnitude (floor(sqrt(I² + Q²))) via a lookup table

mod buffer;
pub mod capture;
mod magnitude;

pub use buffer::{convert_to_magnitudes, SampleBuffer, DEFAULT_BUFFER_SIZE};
pub use capture::{
    Acquisition, AcquisitionConfig, AcquisitionState, CancelToken, CaptureStats, StatsSnapshot,
    StopReason, DEFAULT_CHANNEL_DEPTH,
};
pub use magnitude::{convert_iq, Mag, MagBuffer, MagnitudeLut, IQ_CENTER, MAX_DEVIATION};
