//! RTL-SDR Stream - raw IQ capture with magnitude conversion
//!
//! Opens an RTL-SDR through `rtl_sdr`, streams raw IQ chunks on a dedicated
//! thread and reports magnitude statistics until Ctrl+C.

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use rtlsdr_stream::config::Config;
use rtlsdr_stream::device::{AgcMode, Driver, GainMode, Radio};
use rtlsdr_stream::sdr::{convert_to_magnitudes, SampleBuffer};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("===========================================");
    info!("   RTL-SDR Stream - raw IQ capture");
    info!("===========================================");

    let config = Config::from_env();
    info!("Configuration:");
    info!("  rtl_sdr path: {:?}", config.rtl_sdr_path);
    info!("  Device index: {}", config.device_index);
    info!("  Center frequency: {} Hz", config.center_freq);
    info!("  Sample rate: {} S/s", config.sample_rate);
    match config.gain_tenths() {
        Some(gain) => info!("  Gain: {:.1} dB", gain as f32 / 10.0),
        None => info!("  Gain: auto"),
    }
    info!("  PPM error: {}", config.ppm_error);
    info!("  Buffer size: {} bytes", config.buffer_size);

    let rtl_sdr_path = config.rtl_sdr_path.to_string_lossy().to_string();
    let radio = Radio::open(rtl_sdr_path, config.device_index).with_context(|| {
        format!(
            "Failed to open RTL-SDR device {}. Make sure rtl_sdr is installed and the dongle is connected",
            config.device_index
        )
    })?;

    let report = radio.driver().probe_report();
    if let Some(device) = report.devices.iter().find(|d| d.index == config.device_index) {
        info!("  Manufacturer: {}", device.usb.manufacturer);
        info!("  Product: {}", device.usb.product);
        info!("  Serial: {}", device.usb.serial);
    }

    configure(&radio, &config)?;

    let radio = Arc::new(radio);
    let rx = radio.read_async().context("Failed to start acquisition")?;

    info!("===========================================");
    info!("  Starting capture...");
    info!("  Press Ctrl+C to stop.");
    info!("===========================================");

    let signal_radio = Arc::clone(&radio);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, stopping capture...");
            if let Err(e) = signal_radio.cancel_async() {
                error!("Failed to cancel acquisition: {}", e);
            }
        }
    });

    let interval = Duration::from_millis(config.stats_interval_ms.max(1));
    let summary = tokio::task::spawn_blocking(move || consume(rx, interval))
        .await
        .context("Consumer task failed")?;

    if let Some(stats) = radio.capture_stats() {
        info!(
            "Final stats: Buffers={}, Bytes={}, Read errors={}, Odd reads={}",
            stats.buffers_published, stats.bytes_read, stats.read_errors, stats.odd_reads
        );
    }
    info!(
        "Consumed {} buffers, {} magnitudes, peak {}",
        summary.buffers, summary.samples, summary.peak
    );

    radio.close().context("Failed to close RTL-SDR device")?;
    Ok(())
}

/// Apply the configured tuning to an open radio
fn configure<D: Driver>(radio: &Radio<D>, config: &Config) -> Result<()> {
    radio
        .set_center_freq(config.center_freq)
        .context("Failed to set center frequency")?;
    radio
        .set_sample_rate(config.sample_rate)
        .context("Failed to set sample rate")?;

    match config.gain_tenths() {
        Some(gain) => {
            radio.set_tuner_gain_mode(GainMode::Manual)?;
            radio.set_tuner_gain(gain).context("Failed to set tuner gain")?;
        }
        None => radio.set_tuner_gain_mode(GainMode::Auto)?,
    }

    radio
        .set_freq_correction(config.ppm_error)
        .context("Failed to set frequency correction")?;
    radio.set_agc_mode(AgcMode::Disabled)?;
    radio.set_buffer_size(config.buffer_size)?;
    radio.set_channel_depth(config.channel_depth)?;
    Ok(())
}

#[derive(Debug, Default)]
struct Summary {
    buffers: u64,
    samples: u64,
    peak: i16,
}

/// Drain the sample channel until the acquisition stops
fn consume(rx: Receiver<SampleBuffer>, interval: Duration) -> Summary {
    let mut summary = Summary::default();
    let mut last_report = Instant::now();
    let mut window_samples = 0u64;
    let mut window_sum = 0f64;
    let mut window_peak = 0i16;

    for buffer in rx.iter() {
        if summary.buffers == 0 {
            info!("First IQ data received! ({} bytes)", buffer.filled_len());
        }

        let mags = convert_to_magnitudes(&buffer);
        summary.buffers += 1;
        summary.samples += mags.len() as u64;
        summary.peak = summary.peak.max(mags.peak());

        window_samples += mags.len() as u64;
        window_sum += mags.mean() * mags.len() as f64;
        window_peak = window_peak.max(mags.peak());

        if last_report.elapsed() >= interval {
            let elapsed = last_report.elapsed().as_secs_f64();
            let mean = if window_samples > 0 {
                window_sum / window_samples as f64
            } else {
                0.0
            };

            info!(
                "[Magnitude] Rate: {:.2} MSPS | Mean: {:.1} | Peak: {} | Buffer #{} | Backlog: {}",
                window_samples as f64 / elapsed / 1_000_000.0,
                mean,
                window_peak,
                buffer.sequence(),
                rx.len()
            );

            last_report = Instant::now();
            window_samples = 0;
            window_sum = 0.0;
            window_peak = 0;
        }
    }

    summary
}
