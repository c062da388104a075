//! In-memory driver for unit tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use super::driver::{AgcMode, Driver, GainMode};
use crate::error::{Error, Result};

pub(crate) enum Step {
    Data(Vec<u8>),
    Fail,
}

#[derive(Default)]
struct Tuning {
    center_freq: u32,
    sample_rate: u32,
    gain: i32,
    gain_mode: GainMode,
    agc: AgcMode,
    ppm: i32,
}

/// Plays back a script of reads, then either repeats `endless` forever or
/// blocks until cancelled.
pub(crate) struct FakeDriver {
    script: Mutex<VecDeque<Step>>,
    endless: Option<Vec<u8>>,
    cancelled: Mutex<bool>,
    wake: Condvar,
    tuning: Mutex<Tuning>,
    pub(crate) gains: Vec<i32>,
    pub(crate) fail_close: bool,
    resets: AtomicUsize,
    cancels: AtomicUsize,
    closes: AtomicUsize,
}

impl FakeDriver {
    pub(crate) fn scripted(steps: Vec<Step>) -> Self {
        Self::build(steps, None)
    }

    pub(crate) fn endless(chunk: Vec<u8>) -> Self {
        Self::build(Vec::new(), Some(chunk))
    }

    fn build(steps: Vec<Step>, endless: Option<Vec<u8>>) -> Self {
        Self {
            script: Mutex::new(steps.into()),
            endless,
            cancelled: Mutex::new(false),
            wake: Condvar::new(),
            tuning: Mutex::new(Tuning::default()),
            gains: vec![0, 9, 14, 27, 37, 77, 87, 125, 144, 157, 166, 197, 207, 229, 254, 280, 297, 328, 338, 364, 372, 386, 402, 421, 434, 439, 445, 480, 496],
            fail_close: false,
            resets: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }

    pub(crate) fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub(crate) fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn gain_mode(&self) -> GainMode {
        self.tuning.lock().unwrap().gain_mode
    }

    pub(crate) fn agc(&self) -> AgcMode {
        self.tuning.lock().unwrap().agc
    }

    fn is_cancelled(&self) -> bool {
        *self.cancelled.lock().unwrap()
    }

    fn copy_into(chunk: &[u8], buf: &mut [u8]) -> usize {
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        n
    }
}

impl Driver for FakeDriver {
    fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(Error::driver("close", "device busy"));
        }
        Ok(())
    }

    fn reset_buffer(&self) -> Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        *self.cancelled.lock().unwrap() = false;
        Ok(())
    }

    fn read_sync(&self, buf: &mut [u8]) -> Result<usize> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Step::Data(chunk)) => return Ok(Self::copy_into(&chunk, buf)),
            Some(Step::Fail) => return Err(Error::Read("scripted failure".to_string())),
            None => {}
        }

        if let Some(chunk) = &self.endless {
            return Ok(Self::copy_into(chunk, buf));
        }

        let mut cancelled = self.cancelled.lock().unwrap();
        while !*cancelled {
            cancelled = self.wake.wait(cancelled).unwrap();
        }
        Err(Error::Cancelled)
    }

    fn cancel_async(&self) -> Result<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        *self.cancelled.lock().unwrap() = true;
        self.wake.notify_all();
        Ok(())
    }

    fn tuner_gains(&self) -> Result<Vec<i32>> {
        Ok(self.gains.clone())
    }

    fn set_tuner_gain_mode(&self, mode: GainMode) -> Result<()> {
        self.tuning.lock().unwrap().gain_mode = mode;
        Ok(())
    }

    fn set_tuner_gain(&self, gain: i32) -> Result<()> {
        self.tuning.lock().unwrap().gain = gain;
        Ok(())
    }

    fn tuner_gain(&self) -> Result<i32> {
        Ok(self.tuning.lock().unwrap().gain)
    }

    fn set_agc_mode(&self, mode: AgcMode) -> Result<()> {
        self.tuning.lock().unwrap().agc = mode;
        Ok(())
    }

    fn center_freq(&self) -> Result<u32> {
        match self.tuning.lock().unwrap().center_freq {
            0 => Err(Error::driver("center_freq", "not tuned")),
            hz => Ok(hz),
        }
    }

    fn set_center_freq(&self, freq_hz: u32) -> Result<()> {
        self.tuning.lock().unwrap().center_freq = freq_hz;
        Ok(())
    }

    fn sample_rate(&self) -> Result<u32> {
        Ok(self.tuning.lock().unwrap().sample_rate)
    }

    fn set_sample_rate(&self, rate: u32) -> Result<()> {
        self.tuning.lock().unwrap().sample_rate = rate;
        Ok(())
    }

    fn freq_correction(&self) -> i32 {
        self.tuning.lock().unwrap().ppm
    }

    fn set_freq_correction(&self, ppm: i32) -> Result<()> {
        self.tuning.lock().unwrap().ppm = ppm;
        Ok(())
    }
}
