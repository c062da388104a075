//! Device handle: configuration, lifecycle and streaming entry points
//!
//! All configuration and lifecycle operations run under one mutex. The
//! acquisition thread never takes it, and cancellation is always requested
//! with it released, so a close can never deadlock against a running loop.

use crossbeam_channel::Receiver;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use super::driver::{validate_sample_rate, AgcMode, Driver, GainMode};
use super::state::{RadioSettings, RadioState};
use crate::error::{Error, Result};
use crate::sdr::{Acquisition, AcquisitionConfig, AcquisitionState, SampleBuffer, StatsSnapshot};

/// An open RTL-SDR device. Call [`Radio::close`] when done; dropping an
/// unclosed radio closes it.
pub struct Radio<D: Driver> {
    driver: Arc<D>,
    state: Mutex<RadioState>,
    acquisition: Mutex<Option<Acquisition<D>>>,
}

impl<D: Driver> Radio<D> {
    /// Wrap an already opened driver
    pub fn new(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
            state: Mutex::new(RadioState::default()),
            acquisition: Mutex::new(None),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RadioState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_acquisition(&self) -> MutexGuard<'_, Option<Acquisition<D>>> {
        self.acquisition
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Configuration lock for a handle that is still open
    fn open_state(&self) -> Result<MutexGuard<'_, RadioState>> {
        let state = self.lock_state();
        if state.released {
            return Err(Error::Released);
        }
        Ok(state)
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn settings(&self) -> RadioSettings {
        self.lock_state().settings.clone()
    }

    pub fn is_released(&self) -> bool {
        self.lock_state().released
    }

    /// Query and cache the tuner's supported gains (tenths of dB)
    pub fn tuner_gains(&self) -> Result<Vec<i32>> {
        let mut state = self.open_state()?;
        let gains = self.driver.tuner_gains()?;
        if gains.is_empty() {
            return Err(Error::driver("tuner_gains", "tuner reported no gain values"));
        }
        state.settings.gain_options = gains.clone();
        Ok(gains)
    }

    pub fn set_tuner_gain_mode(&self, mode: GainMode) -> Result<()> {
        let mut state = self.open_state()?;
        self.driver.set_tuner_gain_mode(mode)?;
        state.settings.tuner_gain_mode = mode;
        Ok(())
    }

    /// Gain in tenths of dB; see [`Radio::tuner_gains`] for valid values
    pub fn set_tuner_gain(&self, gain: i32) -> Result<()> {
        let mut state = self.open_state()?;
        self.driver.set_tuner_gain(gain)?;
        state.settings.gain = gain;
        Ok(())
    }

    /// Gain the tuner is actually configured to
    pub fn tuner_gain(&self) -> Result<i32> {
        let _state = self.open_state()?;
        self.driver.tuner_gain()
    }

    pub fn set_agc_mode(&self, mode: AgcMode) -> Result<()> {
        let mut state = self.open_state()?;
        self.driver.set_agc_mode(mode)?;
        state.settings.agc_mode = mode;
        Ok(())
    }

    pub fn center_freq(&self) -> Result<u32> {
        let _state = self.open_state()?;
        self.driver.center_freq()
    }

    pub fn set_center_freq(&self, freq_hz: u32) -> Result<()> {
        if freq_hz == 0 {
            return Err(Error::invalid("center frequency", "must be non-zero"));
        }
        let mut state = self.open_state()?;
        self.driver.set_center_freq(freq_hz)?;
        state.settings.center_freq_hz = freq_hz;
        Ok(())
    }

    pub fn sample_rate(&self) -> Result<u32> {
        let _state = self.open_state()?;
        self.driver.sample_rate()
    }

    /// Also selects the baseband filters for tuners that support it
    pub fn set_sample_rate(&self, rate: u32) -> Result<()> {
        validate_sample_rate(rate)?;
        let mut state = self.open_state()?;
        self.driver.set_sample_rate(rate)?;
        state.settings.sample_rate = rate;
        Ok(())
    }

    pub fn freq_correction(&self) -> Result<i32> {
        let _state = self.open_state()?;
        Ok(self.driver.freq_correction())
    }

    pub fn set_freq_correction(&self, ppm: i32) -> Result<()> {
        let mut state = self.open_state()?;
        self.driver.set_freq_correction(ppm)?;
        state.settings.ppm_error = ppm;
        Ok(())
    }

    /// Bytes per read for the next acquisition
    pub fn set_buffer_size(&self, bytes: usize) -> Result<()> {
        if bytes == 0 {
            return Err(Error::invalid("buffer size", "must be non-zero"));
        }
        self.open_state()?.settings.buffer_size = bytes;
        Ok(())
    }

    /// Hand-off channel depth for the next acquisition
    pub fn set_channel_depth(&self, buffers: usize) -> Result<()> {
        self.open_state()?.settings.channel_depth = buffers;
        Ok(())
    }

    /// Drop samples buffered on the device.
    ///
    /// Fails with [`Error::AlreadyStarted`] while an acquisition is reading;
    /// every acquisition resets the buffer itself when it starts.
    pub fn reset_buffer(&self) -> Result<()> {
        let _state = self.open_state()?;
        let reading = matches!(
            self.acquisition_state(),
            Some(AcquisitionState::Running | AcquisitionState::Cancelling)
        );
        if reading {
            return Err(Error::AlreadyStarted);
        }
        self.driver.reset_buffer()
    }

    /// Start streaming on a dedicated thread and return the sample receiver.
    ///
    /// Fails with [`Error::AlreadyStarted`] while a previous acquisition is
    /// still running; a stopped one is replaced.
    pub fn read_async(&self) -> Result<Receiver<SampleBuffer>> {
        let state = self.open_state()?;
        let mut slot = self.lock_acquisition();

        if let Some(current) = slot.as_ref() {
            if current.state() != AcquisitionState::Stopped {
                return Err(Error::AlreadyStarted);
            }
        }

        let mut acquisition = Acquisition::new(
            Arc::clone(&self.driver),
            AcquisitionConfig {
                buffer_capacity: state.settings.buffer_size,
                channel_depth: state.settings.channel_depth,
            },
        );
        let rx = acquisition.start()?;

        if let Some(mut previous) = slot.replace(acquisition) {
            previous.join();
        }
        Ok(rx)
    }

    /// Stop the running acquisition, or abort pending driver reads if none
    /// is running
    pub fn cancel_async(&self) -> Result<()> {
        let slot = self.lock_acquisition();
        match slot.as_ref() {
            Some(acquisition) => acquisition.cancel()?,
            None => self.driver.cancel_async()?,
        }
        info!("Async operations cancelled");
        Ok(())
    }

    pub fn acquisition_state(&self) -> Option<AcquisitionState> {
        self.lock_acquisition().as_ref().map(|a| a.state())
    }

    pub fn capture_stats(&self) -> Option<StatsSnapshot> {
        self.lock_acquisition()
            .as_ref()
            .map(|a| a.stats().snapshot())
    }

    /// Cancel any acquisition and release the device.
    ///
    /// Only the first call reaches the driver; later calls return `Ok`.
    /// The handle counts as released even when the driver reports an error.
    pub fn close(&self) -> Result<()> {
        let acquisition = {
            let mut state = self.lock_state();
            if state.released {
                debug!("Radio already released");
                return Ok(());
            }
            state.released = true;
            self.lock_acquisition().take()
        };

        // Configuration lock is not held here
        if let Some(mut acquisition) = acquisition {
            if let Err(e) = acquisition.cancel() {
                warn!("Failed to cancel acquisition during close: {}", e);
            }
            acquisition.join();
        }

        info!("Releasing RTL-SDR device");
        let _state = self.lock_state();
        self.driver.close()
    }
}

impl<D: Driver> Drop for Radio<D> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close radio on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fake::{FakeDriver, Step};
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let radio = Radio::new(FakeDriver::scripted(Vec::new()));
        let settings = radio.settings();
        assert_eq!(settings.buffer_size, 256 * 1024);
        assert_eq!(settings.tuner_gain_mode, GainMode::Manual);
        assert_eq!(settings.agc_mode, AgcMode::Enabled);
        assert_eq!(settings.ppm_error, 0);
        assert!(radio.acquisition_state().is_none());
    }

    #[test]
    fn test_setters_reach_driver_and_settings() {
        let radio = Radio::new(FakeDriver::scripted(Vec::new()));
        radio.set_center_freq(1_090_000_000).unwrap();
        radio.set_sample_rate(2_000_000).unwrap();
        radio.set_tuner_gain_mode(GainMode::Auto).unwrap();
        radio.set_tuner_gain(496).unwrap();
        radio.set_agc_mode(AgcMode::Disabled).unwrap();
        radio.set_freq_correction(-3).unwrap();

        assert_eq!(radio.center_freq().unwrap(), 1_090_000_000);
        assert_eq!(radio.sample_rate().unwrap(), 2_000_000);
        assert_eq!(radio.tuner_gain().unwrap(), 496);
        assert_eq!(radio.freq_correction().unwrap(), -3);
        assert_eq!(radio.driver().gain_mode(), GainMode::Auto);
        assert_eq!(radio.driver().agc(), AgcMode::Disabled);

        let settings = radio.settings();
        assert_eq!(settings.center_freq_hz, 1_090_000_000);
        assert_eq!(settings.gain, 496);
        assert_eq!(settings.agc_mode, AgcMode::Disabled);
    }

    #[test]
    fn test_rejected_parameters_leave_settings_alone() {
        let radio = Radio::new(FakeDriver::scripted(Vec::new()));
        assert!(matches!(
            radio.set_sample_rate(500_000),
            Err(Error::InvalidParameter { .. })
        ));
        assert!(radio.set_center_freq(0).is_err());
        assert!(radio.set_buffer_size(0).is_err());
        assert!(radio.center_freq().is_err());

        let settings = radio.settings();
        assert_eq!(settings.sample_rate, 0);
        assert_eq!(settings.center_freq_hz, 0);
    }

    #[test]
    fn test_tuner_gains_are_replaced_not_appended() {
        let radio = Radio::new(FakeDriver::scripted(Vec::new()));
        let first = radio.tuner_gains().unwrap();
        let second = radio.tuner_gains().unwrap();
        assert_eq!(first, second);
        assert_eq!(radio.settings().gain_options.len(), 29);
    }

    #[test]
    fn test_close_is_idempotent() {
        let radio = Radio::new(FakeDriver::scripted(Vec::new()));
        radio.close().unwrap();
        radio.close().unwrap();
        assert!(radio.is_released());
        assert_eq!(radio.driver().closes(), 1);

        assert!(matches!(radio.set_tuner_gain(100), Err(Error::Released)));
        assert!(matches!(radio.read_async(), Err(Error::Released)));
        assert!(matches!(radio.reset_buffer(), Err(Error::Released)));
        drop(radio);
    }

    #[test]
    fn test_failed_close_still_releases() {
        let mut driver = FakeDriver::scripted(Vec::new());
        driver.fail_close = true;
        let radio = Radio::new(driver);
        assert!(radio.close().is_err());
        assert!(radio.is_released());
        radio.close().unwrap();
        assert_eq!(radio.driver().closes(), 1);
    }

    #[test]
    fn test_read_async_and_cancel() {
        let radio = Radio::new(FakeDriver::scripted(vec![
            Step::Data(vec![127, 127, 255, 255]),
            Step::Data(vec![0, 0]),
        ]));
        radio.set_buffer_size(4).unwrap();
        let rx = radio.read_async().unwrap();
        assert_eq!(radio.driver().resets(), 1);

        assert_eq!(rx.recv().unwrap().iq_to_mag().as_slice(), &[0, 181]);
        assert_eq!(rx.recv().unwrap().iq_to_mag().as_slice(), &[179]);
        assert!(matches!(radio.read_async(), Err(Error::AlreadyStarted)));

        radio.cancel_async().unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_err());
        assert_eq!(radio.acquisition_state(), Some(AcquisitionState::Stopped));
        assert_eq!(radio.capture_stats().unwrap().buffers_published, 2);

        // A fresh session after the previous one stopped
        let rx = radio.read_async().unwrap();
        assert_eq!(radio.driver().resets(), 2);
        assert_eq!(radio.acquisition_state(), Some(AcquisitionState::Running));
        radio.close().unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_err());
        assert_eq!(radio.driver().closes(), 1);
    }

    #[test]
    fn test_close_stops_running_acquisition() {
        let radio = Radio::new(FakeDriver::endless(vec![1, 2, 3, 4]));
        radio.set_buffer_size(4).unwrap();
        radio.set_channel_depth(1).unwrap();
        let rx = radio.read_async().unwrap();
        assert!(rx.recv().is_ok());

        radio.close().unwrap();
        assert!(radio.acquisition_state().is_none());
        assert!(rx.iter().count() <= 1);
    }

    #[test]
    fn test_reset_rejected_while_reading() {
        let radio = Radio::new(FakeDriver::endless(vec![1, 2, 3, 4]));
        radio.set_buffer_size(4).unwrap();
        let rx = radio.read_async().unwrap();
        assert!(rx.recv().is_ok());

        assert!(matches!(radio.reset_buffer(), Err(Error::AlreadyStarted)));
        assert_eq!(radio.driver().resets(), 1);

        // Configuration and close stay available
        radio.set_freq_correction(1).unwrap();
        assert_eq!(radio.settings().ppm_error, 1);

        radio.cancel_async().unwrap();
        while rx.recv_timeout(Duration::from_secs(2)).is_ok() {}
        radio.reset_buffer().unwrap();
        assert_eq!(radio.driver().resets(), 2);
        radio.close().unwrap();
    }

    #[test]
    fn test_cancel_without_acquisition_reaches_driver() {
        let radio = Radio::new(FakeDriver::scripted(Vec::new()));
        radio.cancel_async().unwrap();
        assert_eq!(radio.driver().cancels(), 1);
    }
}
