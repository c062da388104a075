//! Per-device configuration tracking

use super::driver::{AgcMode, GainMode};
use crate::sdr::{DEFAULT_BUFFER_SIZE, DEFAULT_CHANNEL_DEPTH};

/// Last values successfully applied to a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioSettings {
    pub ppm_error: i32,
    pub tuner_gain_mode: GainMode,
    /// Tenths of dB, as reported by the tuner
    pub gain_options: Vec<i32>,
    /// Tenths of dB (496 = 49.6 dB)
    pub gain: i32,
    pub agc_mode: AgcMode,
    pub center_freq_hz: u32,
    pub sample_rate: u32,
    /// Bytes per acquisition read
    pub buffer_size: usize,
    /// Buffers the hand-off channel holds before the producer blocks
    pub channel_depth: usize,
}

impl Default for RadioSettings {
    fn default() -> Self {
        Self {
            ppm_error: 0,
            tuner_gain_mode: GainMode::Manual,
            gain_options: Vec::new(),
            gain: 0,
            agc_mode: AgcMode::Enabled,
            center_freq_hz: 0,
            sample_rate: 0,
            buffer_size: DEFAULT_BUFFER_SIZE,
            channel_depth: DEFAULT_CHANNEL_DEPTH,
        }
    }
}

/// Everything guarded by the radio's configuration lock
#[derive(Debug, Default)]
pub(crate) struct RadioState {
    pub settings: RadioSettings,
    /// Set once the driver has been closed; guards against double release
    pub released: bool,
}
