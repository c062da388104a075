//! Hardware driver boundary
//!
//! Everything that talks to the dongle goes through [`Driver`]. Methods take
//! `&self` because the acquisition thread sits in `read_sync` while a control
//! thread may call `cancel_async` on the same driver; implementations are
//! responsible for their own internal locking.

use crate::error::Result;

/// Tuner gain handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GainMode {
    /// Tuner picks its own gain
    Auto,
    /// Gain set explicitly with `set_tuner_gain`
    #[default]
    Manual,
}

/// RTL2832 digital AGC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgcMode {
    Disabled,
    #[default]
    Enabled,
}

pub trait Driver: Send + Sync + 'static {
    /// Release the device
    fn close(&self) -> Result<()>;

    /// Drop any samples buffered on the device side
    fn reset_buffer(&self) -> Result<()>;

    /// Block until up to `buf.len()` bytes of interleaved IQ data are read.
    ///
    /// Returns the number of bytes written. Must return promptly once
    /// `cancel_async` is called from another thread.
    fn read_sync(&self, buf: &mut [u8]) -> Result<usize>;

    /// Abort any pending `read_sync`
    fn cancel_async(&self) -> Result<()>;

    /// Supported tuner gains in tenths of dB
    fn tuner_gains(&self) -> Result<Vec<i32>>;

    fn set_tuner_gain_mode(&self, mode: GainMode) -> Result<()>;

    /// Gain in tenths of dB (115 means 11.5 dB)
    fn set_tuner_gain(&self, gain: i32) -> Result<()>;

    fn tuner_gain(&self) -> Result<i32>;

    fn set_agc_mode(&self, mode: AgcMode) -> Result<()>;

    fn center_freq(&self) -> Result<u32>;

    fn set_center_freq(&self, freq_hz: u32) -> Result<()>;

    fn sample_rate(&self) -> Result<u32>;

    fn set_sample_rate(&self, rate: u32) -> Result<()>;

    /// Frequency correction in parts per million
    fn freq_correction(&self) -> i32;

    fn set_freq_correction(&self, ppm: i32) -> Result<()>;
}

/// Reject sample rates the RTL2832 cannot produce.
///
/// Valid ranges are 225001-300000 Hz and 900001-3200000 Hz; expect sample
/// loss above 2.4 MSPS.
pub fn validate_sample_rate(rate: u32) -> Result<()> {
    match rate {
        225_001..=300_000 | 900_001..=3_200_000 => Ok(()),
        _ => Err(crate::error::Error::invalid(
            "sample rate",
            format!(
                "{} Hz is outside 225001-300000 and 900001-3200000",
                rate
            ),
        )),
    }
}
