//! Acquisition loop: a dedicated thread that keeps reading raw IQ chunks
//! from the driver and hands them to a consumer over a bounded channel.
//!
//! The channel back-pressures: when the consumer falls behind the producer
//! blocks instead of dropping buffers. There is no read timeout, so a stalled
//! device stalls the loop until [`Acquisition::cancel`] is called.

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use super::buffer::{SampleBuffer, DEFAULT_BUFFER_SIZE};
use crate::device::Driver;
use crate::error::{Error, Result};

/// Default number of filled buffers that may wait for the consumer
pub const DEFAULT_CHANNEL_DEPTH: usize = 16;

/// How often a producer blocked on a full channel re-checks cancellation
const PUBLISH_POLL: Duration = Duration::from_millis(50);

const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Acquisition parameters
#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    /// Bytes requested from the device per read
    pub buffer_capacity: usize,
    /// Bounded channel depth in buffers
    pub channel_depth: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_SIZE,
            channel_depth: DEFAULT_CHANNEL_DEPTH,
        }
    }
}

/// Lifecycle of one acquisition session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    Idle,
    Running,
    Cancelling,
    Stopped,
}

impl AcquisitionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => AcquisitionState::Idle,
            1 => AcquisitionState::Running,
            2 => AcquisitionState::Cancelling,
            _ => AcquisitionState::Stopped,
        }
    }
}

#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Arc<Self> {
        Arc::new(Self(AtomicU8::new(AcquisitionState::Idle as u8)))
    }

    fn load(&self) -> AcquisitionState {
        AcquisitionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn store(&self, state: AcquisitionState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    fn transition(&self, from: AcquisitionState, to: AcquisitionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Why the acquisition thread exited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `cancel` was requested
    Cancelled,
    /// Every receiver was dropped
    ConsumerDisconnected,
    /// A sample buffer could not be allocated
    AllocationFailed,
}

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Statistics for an acquisition (atomic for thread-safe access)
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub buffers_published: AtomicU64,
    pub bytes_read: AtomicU64,
    pub read_errors: AtomicU64,
    pub odd_reads: AtomicU64,
}

/// Point-in-time copy of [`CaptureStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub buffers_published: u64,
    pub bytes_read: u64,
    pub read_errors: u64,
    pub odd_reads: u64,
}

impl CaptureStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            buffers_published: self.buffers_published.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            odd_reads: self.odd_reads.load(Ordering::Relaxed),
        }
    }
}

/// One acquisition session on a driver. Single use: once stopped, build a
/// new one to stream again.
pub struct Acquisition<D: Driver> {
    driver: Arc<D>,
    config: AcquisitionConfig,
    state: Arc<StateCell>,
    cancel: CancelToken,
    stats: Arc<CaptureStats>,
    handle: Option<JoinHandle<StopReason>>,
}

impl<D: Driver> Acquisition<D> {
    pub fn new(driver: Arc<D>, config: AcquisitionConfig) -> Self {
        Self {
            driver,
            config,
            state: StateCell::new(),
            cancel: CancelToken::new(),
            stats: CaptureStats::new(),
            handle: None,
        }
    }

    /// Reset the device buffer and spawn the producer thread.
    ///
    /// Returns immediately with the receiving end of the hand-off channel.
    /// Reads have no timeout: if the device stops delivering data the loop
    /// waits until it is cancelled.
    pub fn start(&mut self) -> Result<Receiver<SampleBuffer>> {
        if self.state.load() != AcquisitionState::Idle {
            return Err(Error::AlreadyStarted);
        }
        if self.config.buffer_capacity == 0 {
            return Err(Error::invalid("buffer capacity", "must be non-zero"));
        }

        // Stale samples from before this session must not reach the consumer
        self.driver.reset_buffer()?;

        let (tx, rx) = bounded::<SampleBuffer>(self.config.channel_depth);

        if !self
            .state
            .transition(AcquisitionState::Idle, AcquisitionState::Running)
        {
            return Err(Error::AlreadyStarted);
        }

        let worker = Worker {
            driver: Arc::clone(&self.driver),
            buffer_capacity: self.config.buffer_capacity,
            cancel: self.cancel.clone(),
            state: Arc::clone(&self.state),
            stats: Arc::clone(&self.stats),
            tx,
        };

        let handle = thread::Builder::new()
            .name("sdr-acquisition".to_string())
            .spawn(move || worker.run());

        match handle {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(rx)
            }
            Err(e) => {
                self.state.store(AcquisitionState::Stopped);
                Err(Error::Spawn(e))
            }
        }
    }

    /// Request the loop to stop and abort the in-flight read.
    ///
    /// Idempotent. A session that was never started goes straight to
    /// `Stopped`.
    pub fn cancel(&self) -> Result<()> {
        self.cancel.cancel();

        if self
            .state
            .transition(AcquisitionState::Idle, AcquisitionState::Stopped)
        {
            debug!("Acquisition cancelled before start");
            return Ok(());
        }
        if !self
            .state
            .transition(AcquisitionState::Running, AcquisitionState::Cancelling)
        {
            return Ok(());
        }

        info!("Cancelling acquisition...");
        self.driver.cancel_async()
    }

    pub fn state(&self) -> AcquisitionState {
        self.state.load()
    }

    /// Poll until the loop reaches `Stopped` or `timeout` elapses
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        // No deadline when the timeout overflows the clock
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if self.state() == AcquisitionState::Stopped {
                return true;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Wait for the producer thread to exit. `None` if it was never started,
    /// was already joined, or panicked.
    pub fn join(&mut self) -> Option<StopReason> {
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(reason) => Some(reason),
            Err(_) => {
                error!("Acquisition thread panicked");
                None
            }
        }
    }

    pub fn stats(&self) -> &Arc<CaptureStats> {
        &self.stats
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

impl<D: Driver> Drop for Acquisition<D> {
    fn drop(&mut self) {
        if let Err(e) = self.cancel() {
            warn!("Failed to cancel acquisition on drop: {}", e);
        }
    }
}

enum Publish {
    Sent,
    Cancelled,
    Disconnected,
}

/// State moved onto the producer thread
struct Worker<D: Driver> {
    driver: Arc<D>,
    buffer_capacity: usize,
    cancel: CancelToken,
    state: Arc<StateCell>,
    stats: Arc<CaptureStats>,
    tx: Sender<SampleBuffer>,
}

impl<D: Driver> Worker<D> {
    fn run(self) -> StopReason {
        info!(
            "Acquisition started: {} byte buffers, channel depth {}",
            self.buffer_capacity,
            self.tx.capacity().unwrap_or(0)
        );

        let mut sequence = 0u64;
        let mut last_stats_time = Instant::now();
        let mut last_bytes = 0u64;

        let reason = loop {
            // Never allocate once cancellation is requested
            if self.cancel.is_cancelled() {
                break StopReason::Cancelled;
            }

            let mut buffer = match SampleBuffer::new(self.buffer_capacity) {
                Ok(b) => b,
                Err(e) => {
                    error!("{}", e);
                    break StopReason::AllocationFailed;
                }
            };

            let n_read = match self.driver.read_sync(buffer.storage_mut()) {
                Ok(n) => n,
                Err(e) => {
                    if self.cancel.is_cancelled() {
                        debug!("Read aborted by cancellation: {}", e);
                        break StopReason::Cancelled;
                    }
                    self.stats.read_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("read_sync failed: {}", e);
                    continue;
                }
            };

            if self.cancel.is_cancelled() {
                debug!("Discarding {} bytes read after cancellation", n_read);
                break StopReason::Cancelled;
            }

            if n_read % 2 != 0 {
                self.stats.odd_reads.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Odd read of {} bytes, trailing byte will not be converted",
                    n_read
                );
            }

            buffer.set_filled_len(n_read);
            buffer.stamp(sequence);
            self.stats
                .bytes_read
                .fetch_add(n_read as u64, Ordering::Relaxed);

            match self.publish(buffer) {
                Publish::Sent => {
                    sequence += 1;
                    self.stats.buffers_published.fetch_add(1, Ordering::Relaxed);
                }
                Publish::Cancelled => break StopReason::Cancelled,
                Publish::Disconnected => {
                    warn!("Sample receiver dropped, stopping acquisition");
                    break StopReason::ConsumerDisconnected;
                }
            }

            if last_stats_time.elapsed() >= STATS_INTERVAL {
                let bytes = self.stats.bytes_read.load(Ordering::Relaxed);
                let elapsed = last_stats_time.elapsed().as_secs_f32();
                let sample_rate = (bytes - last_bytes) as f32 / 2.0 / elapsed;

                info!(
                    "[Acquisition] Rate: {:.2} MSPS | Buffers: {} | Read errors: {} | Queued: {}",
                    sample_rate / 1_000_000.0,
                    sequence,
                    self.stats.read_errors.load(Ordering::Relaxed),
                    self.tx.len()
                );

                last_stats_time = Instant::now();
                last_bytes = bytes;
            }
        };

        self.state.store(AcquisitionState::Stopped);

        let stats = self.stats.snapshot();
        info!(
            "Acquisition stopped ({:?}): buffers={}, bytes={}, read errors={}, odd reads={}",
            reason, stats.buffers_published, stats.bytes_read, stats.read_errors, stats.odd_reads
        );

        reason
    }

    /// Blocking send that keeps an eye on the cancellation token
    fn publish(&self, mut buffer: SampleBuffer) -> Publish {
        loop {
            match self.tx.send_timeout(buffer, PUBLISH_POLL) {
                Ok(()) => return Publish::Sent,
                Err(SendTimeoutError::Timeout(returned)) => {
                    if self.cancel.is_cancelled() {
                        return Publish::Cancelled;
                    }
                    trace!("Sample channel full, waiting for consumer");
                    buffer = returned;
                }
                Err(SendTimeoutError::Disconnected(_)) => return Publish::Disconnected,
            }
        }
    }
}
