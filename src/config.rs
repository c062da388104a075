//! Configuration loaded from environment variables

use std::path::PathBuf;
use std::str::FromStr;

use crate::device::DEFAULT_RTL_SDR_PATH;
use crate::sdr::{DEFAULT_BUFFER_SIZE, DEFAULT_CHANNEL_DEPTH};

/// Application configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Path to rtl_sdr executable
    pub rtl_sdr_path: PathBuf,

    /// RTL-SDR device index
    pub device_index: u32,

    /// Center frequency in Hz
    pub center_freq: u32,

    /// Sample rate in samples per second
    pub sample_rate: u32,

    /// Tuner gain in dB (use 0 for auto)
    pub gain_db: f32,

    /// PPM frequency correction
    pub ppm_error: i32,

    /// Bytes requested per device read
    pub buffer_size: usize,

    /// Filled buffers queued before the reader blocks
    pub channel_depth: usize,

    /// Magnitude statistics reporting interval in milliseconds
    pub stats_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup; missing or unparsable values
    /// fall back to defaults
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: FromStr>(value: Option<String>, default: T) -> T {
            value.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
        }

        Self {
            rtl_sdr_path: lookup("RTL_SDR_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_RTL_SDR_PATH)),

            device_index: parsed(lookup("DEVICE_INDEX"), 0),

            center_freq: parsed(lookup("CENTER_FREQ"), 1_090_000_000),

            sample_rate: parsed(lookup("SAMPLE_RATE"), 2_000_000),

            gain_db: parsed(lookup("DEVICE_GAIN"), 49.6),

            ppm_error: parsed(lookup("PPM_ERROR"), 0),

            buffer_size: parsed(lookup("BUFFER_SIZE"), DEFAULT_BUFFER_SIZE),

            channel_depth: parsed(lookup("CHANNEL_DEPTH"), DEFAULT_CHANNEL_DEPTH),

            stats_interval_ms: parsed(lookup("STATS_INTERVAL_MS"), 5000),
        }
    }

    /// Gain in tenths of dB, or `None` for automatic gain
    pub fn gain_tenths(&self) -> Option<i32> {
        if self.gain_db <= 0.0 {
            None
        } else {
            Some((self.gain_db * 10.0).round() as i32)
        }
    }
}
