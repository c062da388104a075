//! RTL-SDR access through the stock `rtl_sdr` tool
//!
//! The dongle is driven by spawning `rtl_sdr ... -` and reading raw IQ bytes
//! from its stdout. Device discovery parses what `rtl_sdr` prints on stderr
//! at startup:
//!
//! ```text
//! Found 1 device(s):
//!   0:  Realtek, RTL2838UHIDIR, SN: 00000001
//!
//! Using device 0: Generic RTL2832U OEM
//! Found Rafael Micro R820T tuner
//! Supported gain values (29): 0.0 0.9 1.4 2.7 ... 48.0 49.6
//! ```
//!
//! Tuning changes are stored and applied when the stream is (re)started by
//! `reset_buffer`. Cancelling kills the child, which makes the blocked
//! stdout read return end-of-stream.

use std::io::{self, BufRead, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use tracing::{debug, info, warn};

use super::driver::{validate_sample_rate, AgcMode, Driver, GainMode};
use super::radio::Radio;
use crate::error::{Error, Result};

pub const DEFAULT_RTL_SDR_PATH: &str = "rtl_sdr";

/// USB descriptor strings of one dongle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsbStrings {
    pub manufacturer: String,
    pub product: String,
    pub serial: String,
}

/// One entry of the `Found N device(s):` listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub index: u32,
    pub usb: UsbStrings,
}

/// Everything `rtl_sdr` reported while starting up
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeReport {
    pub device_count: usize,
    pub devices: Vec<DeviceInfo>,
    /// Name from the `Using device N: NAME` line
    pub device_name: Option<String>,
    pub tuner: Option<String>,
    /// Supported gains in tenths of dB
    pub gains: Vec<i32>,
    /// Error lines, if the device could not be opened
    pub open_error: Option<String>,
}

/// Sanitize a string to only contain printable ASCII characters
fn sanitize_string(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_graphic() || *c == ' ')
        .collect::<String>()
        .trim()
        .to_string()
}

/// "49.6" -> 496
fn parse_tenths(value: &str) -> Option<i32> {
    value
        .parse::<f32>()
        .ok()
        .map(|db| (db * 10.0).round() as i32)
}

/// Parse a device listing line like "0:  Realtek, RTL2838UHIDIR, SN: 00000001"
fn parse_device_line(line: &str) -> Option<DeviceInfo> {
    let (index, info) = line.split_once(':')?;
    let index = index.trim().parse::<u32>().ok()?;

    let fields: Vec<&str> = info.split(',').collect();
    let mut usb = UsbStrings::default();
    if let Some(mfr) = fields.first() {
        usb.manufacturer = sanitize_string(mfr);
    }
    if let Some(prd) = fields.get(1) {
        usb.product = sanitize_string(prd);
    }
    if let Some(sn) = fields.get(2).and_then(|f| f.trim().strip_prefix("SN:")) {
        usb.serial = sanitize_string(sn);
    }

    Some(DeviceInfo { index, usb })
}

/// Parse the stderr banner `rtl_sdr` prints at startup
pub fn parse_probe(output: &str) -> ProbeReport {
    let mut report = ProbeReport::default();
    let mut errors: Vec<String> = Vec::new();

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix("Found ") {
            if let Some(count) = rest.strip_suffix(" device(s):") {
                report.device_count = count.trim().parse().unwrap_or(0);
            } else if let Some(tuner) = rest.strip_suffix(" tuner") {
                report.tuner = Some(sanitize_string(tuner));
            }
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix("Supported gain values") {
            if let Some((_, values)) = rest.split_once(':') {
                report.gains = values.split_whitespace().filter_map(parse_tenths).collect();
            }
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix("Using device") {
            if let Some((_, name)) = rest.split_once(':') {
                let name = sanitize_string(name);
                if !name.is_empty() {
                    report.device_name = Some(name);
                }
            }
            continue;
        }

        if trimmed.starts_with("No supported devices") {
            report.device_count = 0;
            errors.push(trimmed.to_string());
            continue;
        }

        if trimmed.starts_with("Failed to open") || trimmed.contains(" error ") {
            errors.push(trimmed.to_string());
            continue;
        }

        if let Some(device) = parse_device_line(trimmed) {
            report.devices.push(device);
        }
    }

    if !errors.is_empty() {
        report.open_error = Some(errors.join("; "));
    }
    report
}

/// Kills and reaps a child on every exit path
struct ChildGuard(Option<Child>);

impl ChildGuard {
    fn child_mut(&mut self) -> Option<&mut Child> {
        self.0.as_mut()
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Some(child) = self.0.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Run `rtl_sdr` briefly against `index` and parse its startup banner
pub fn probe(rtl_sdr_path: &str, index: u32) -> Result<ProbeReport> {
    let mut cmd = Command::new(rtl_sdr_path);
    cmd.arg("-d")
        .arg(index.to_string())
        .arg("-n")
        .arg("1") // Just read 1 sample then exit
        .arg("-")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let child = cmd.spawn().map_err(|e| Error::Open {
        index,
        reason: format!("failed to run {}: {}", rtl_sdr_path, e),
    })?;
    let mut guard = ChildGuard(Some(child));

    let mut raw = Vec::new();
    if let Some(stderr) = guard.child_mut().and_then(|c| c.stderr.as_mut()) {
        stderr.read_to_end(&mut raw)?;
    }

    Ok(parse_probe(&String::from_utf8_lossy(&raw)))
}

/// Number of RTL-SDR dongles attached
pub fn device_count(rtl_sdr_path: &str) -> Result<usize> {
    Ok(probe(rtl_sdr_path, 0)?.device_count)
}

/// Descriptive name of the dongle at `index`
pub fn device_name(rtl_sdr_path: &str, index: u32) -> Result<String> {
    let report = probe(rtl_sdr_path, index)?;
    report
        .device_name
        .or_else(|| {
            report
                .devices
                .into_iter()
                .find(|d| d.index == index)
                .map(|d| d.usb.product)
        })
        .ok_or_else(|| Error::driver("get_device_name", format!("no device at index {}", index)))
}

/// Manufacturer, product and serial strings of the dongle at `index`
pub fn device_usb_strings(rtl_sdr_path: &str, index: u32) -> Result<UsbStrings> {
    probe(rtl_sdr_path, index)?
        .devices
        .into_iter()
        .find(|d| d.index == index)
        .map(|d| d.usb)
        .ok_or_else(|| {
            Error::driver("get_device_usb_strings", format!("no device at index {}", index))
        })
}

/// Read until `buf` is full or the stream ends
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if filled > 0 => {
                debug!("Read error after {} bytes: {}", filled, e);
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[derive(Debug, Clone)]
struct Tuning {
    center_freq: u32,
    sample_rate: u32,
    gain_mode: GainMode,
    gain: i32, // Gain in tenths of dB (e.g., 496 = 49.6 dB)
    ppm_error: i32,
    agc_mode: AgcMode,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            center_freq: 1_090_000_000,
            sample_rate: 2_000_000,
            gain_mode: GainMode::Manual,
            gain: 496,
            ppm_error: 0,
            agc_mode: AgcMode::Disabled,
        }
    }
}

/// rtl_sdr -d <device> -f <freq> -s <rate> [-g <gain>] [-p <ppm>] -
fn stream_args(index: u32, tuning: &Tuning) -> Vec<String> {
    let mut args = vec![
        "-d".to_string(),
        index.to_string(),
        "-f".to_string(),
        tuning.center_freq.to_string(),
        "-s".to_string(),
        tuning.sample_rate.to_string(),
    ];
    // Omitting -g leaves the tuner in automatic gain
    if tuning.gain_mode == GainMode::Manual {
        args.push("-g".to_string());
        args.push(manual_gain_arg(tuning.gain));
    }
    if tuning.ppm_error != 0 {
        args.push("-p".to_string());
        args.push(tuning.ppm_error.to_string());
    }
    // The "-" at the end means output to stdout
    args.push("-".to_string());
    args
}

/// `-g` value for a manual gain in tenths of dB.
///
/// rtl_sdr reads `-g 0` as automatic gain, so a manual 0.0 dB is sent as
/// 0.1 dB, which rtl_sdr snaps to the tuner's 0.0 dB step.
fn manual_gain_arg(gain: i32) -> String {
    let gain = if gain == 0 { 1 } else { gain };
    (gain as f32 / 10.0).to_string()
}

#[derive(Default)]
struct ChildSlot {
    child: Option<Child>,
    /// Latched by `cancel_async`, cleared by `reset_buffer`
    cancelled: bool,
    /// Set while `reset_buffer` waits for the stream; readers must not respawn
    restarting: bool,
}

impl ChildSlot {
    fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!("rtl_sdr already exited: {}", e);
            }
            let _ = child.wait();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// [`Driver`] backed by an `rtl_sdr` subprocess
pub struct RtlSdrProcess {
    path: String,
    index: u32,
    report: ProbeReport,
    tuning: Mutex<Tuning>,
    // Lock order: stream before child
    stream: Mutex<Option<ChildStdout>>,
    child: Mutex<ChildSlot>,
    closed: AtomicBool,
}

impl RtlSdrProcess {
    /// Probe the dongle at `index`; fails if `rtl_sdr` cannot open it
    pub fn open(rtl_sdr_path: impl Into<String>, index: u32) -> Result<Self> {
        let path = rtl_sdr_path.into();
        let report = probe(&path, index)?;

        if let Some(reason) = report.open_error.clone() {
            return Err(Error::Open { index, reason });
        }
        if index as usize >= report.device_count {
            return Err(Error::Open {
                index,
                reason: format!("only {} device(s) found", report.device_count),
            });
        }

        info!(
            "Opened RTL-SDR device {}: {} ({} gain steps)",
            index,
            report.device_name.as_deref().unwrap_or("unknown"),
            report.gains.len()
        );
        if let Some(tuner) = &report.tuner {
            info!("  Tuner: {}", tuner);
        }

        Ok(Self {
            path,
            index,
            report,
            tuning: Mutex::new(Tuning::default()),
            stream: Mutex::new(None),
            child: Mutex::new(ChildSlot::default()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn probe_report(&self) -> &ProbeReport {
        &self.report
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Released);
        }
        Ok(())
    }

    /// Spawn a streaming child into `slot` and return its stdout
    fn spawn_stream(&self, slot: &mut ChildSlot) -> Result<ChildStdout> {
        let args = stream_args(self.index, &lock(&self.tuning));
        let mut cmd = Command::new(&self.path);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        info!("Executing: {} {}", self.path, args.join(" "));

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::driver("reset_buffer", format!("failed to spawn {}: {}", self.path, e)))?;

        let stdout = match child.stdout.take() {
            Some(s) => s,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::driver("reset_buffer", "failed to capture rtl_sdr stdout"));
            }
        };

        // Spawn stderr reader for logging
        if let Some(stderr) = child.stderr.take() {
            let spawned = thread::Builder::new()
                .name("rtl_sdr-stderr".to_string())
                .spawn(move || {
                    let reader = io::BufReader::new(stderr);
                    for line in reader.lines().map_while(|line| line.ok()) {
                        if !line.trim().is_empty() {
                            info!("[rtl_sdr] {}", line.trim());
                        }
                    }
                });
            if let Err(e) = spawned {
                warn!("Failed to spawn rtl_sdr stderr logger: {}", e);
            }
        }

        slot.child = Some(child);
        Ok(stdout)
    }
}

impl Driver for RtlSdrProcess {
    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Killing first unblocks any reader still holding the stream lock
        lock(&self.child).kill();
        lock(&self.stream).take();
        info!("RTL-SDR device {} closed", self.index);
        Ok(())
    }

    fn reset_buffer(&self) -> Result<()> {
        self.ensure_open()?;
        // A reader blocked on a stalled child holds the stream lock until
        // its read ends, so end it first
        {
            let mut slot = lock(&self.child);
            slot.restarting = true;
            slot.kill();
        }

        let mut stream = lock(&self.stream);
        let mut slot = lock(&self.child);
        slot.kill();
        stream.take();
        slot.cancelled = false;
        slot.restarting = false;
        *stream = Some(self.spawn_stream(&mut slot)?);
        debug!("rtl_sdr stream restarted");
        Ok(())
    }

    fn read_sync(&self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        let mut stream = lock(&self.stream);

        if stream.is_none() {
            // Spawn and cancel both hold the child lock, so a cancel can't slip in between
            let mut slot = lock(&self.child);
            if slot.cancelled {
                return Err(Error::Cancelled);
            }
            if slot.restarting {
                return Err(Error::StreamClosed);
            }
            slot.kill();
            warn!("rtl_sdr stream not running, restarting");
            *stream = Some(self.spawn_stream(&mut slot)?);
        }

        let stdout = stream.as_mut().ok_or(Error::StreamClosed)?;
        let n_read = match fill(stdout, buf) {
            Ok(n) => n,
            Err(e) => {
                stream.take();
                return Err(e.into());
            }
        };

        if n_read == 0 {
            stream.take();
            if lock(&self.child).cancelled {
                return Err(Error::Cancelled);
            }
            return Err(Error::StreamClosed);
        }
        Ok(n_read)
    }

    fn cancel_async(&self) -> Result<()> {
        let mut slot = lock(&self.child);
        slot.cancelled = true;
        slot.kill();
        debug!("rtl_sdr stream cancelled");
        Ok(())
    }

    fn tuner_gains(&self) -> Result<Vec<i32>> {
        self.ensure_open()?;
        if self.report.gains.is_empty() {
            return Err(Error::driver("get_tuner_gains", "rtl_sdr reported no gain values"));
        }
        Ok(self.report.gains.clone())
    }

    fn set_tuner_gain_mode(&self, mode: GainMode) -> Result<()> {
        self.ensure_open()?;
        lock(&self.tuning).gain_mode = mode;
        Ok(())
    }

    fn set_tuner_gain(&self, gain: i32) -> Result<()> {
        self.ensure_open()?;
        if !self.report.gains.is_empty() && !self.report.gains.contains(&gain) {
            debug!("Gain {} not in tuner table, rtl_sdr will pick the nearest", gain);
        }
        lock(&self.tuning).gain = gain;
        Ok(())
    }

    fn tuner_gain(&self) -> Result<i32> {
        self.ensure_open()?;
        let tuning = lock(&self.tuning);
        match tuning.gain_mode {
            GainMode::Manual => Ok(tuning.gain),
            GainMode::Auto => Err(Error::driver("get_tuner_gain", "tuner is in automatic gain mode")),
        }
    }

    fn set_agc_mode(&self, mode: AgcMode) -> Result<()> {
        self.ensure_open()?;
        if mode == AgcMode::Enabled {
            return Err(Error::Unsupported("digital AGC through rtl_sdr"));
        }
        lock(&self.tuning).agc_mode = mode;
        Ok(())
    }

    fn center_freq(&self) -> Result<u32> {
        self.ensure_open()?;
        Ok(lock(&self.tuning).center_freq)
    }

    fn set_center_freq(&self, freq_hz: u32) -> Result<()> {
        self.ensure_open()?;
        if freq_hz == 0 {
            return Err(Error::invalid("center frequency", "must be non-zero"));
        }
        lock(&self.tuning).center_freq = freq_hz;
        Ok(())
    }

    fn sample_rate(&self) -> Result<u32> {
        self.ensure_open()?;
        Ok(lock(&self.tuning).sample_rate)
    }

    fn set_sample_rate(&self, rate: u32) -> Result<()> {
        self.ensure_open()?;
        validate_sample_rate(rate)?;
        lock(&self.tuning).sample_rate = rate;
        Ok(())
    }

    fn freq_correction(&self) -> i32 {
        lock(&self.tuning).ppm_error
    }

    fn set_freq_correction(&self, ppm: i32) -> Result<()> {
        self.ensure_open()?;
        lock(&self.tuning).ppm_error = ppm;
        Ok(())
    }
}

impl Drop for RtlSdrProcess {
    fn drop(&mut self) {
        lock(&self.child).kill();
    }
}

impl Radio<RtlSdrProcess> {
    /// Open the dongle at `index` through the `rtl_sdr` executable
    pub fn open(rtl_sdr_path: impl Into<String>, index: u32) -> Result<Self> {
        let radio = Radio::new(RtlSdrProcess::open(rtl_sdr_path, index)?);
        if let Err(e) = radio.tuner_gains() {
            debug!("No tuner gain list: {}", e);
        }
        Ok(radio)
    }
}
