//! Raw sample buffers filled by the acquisition loop

use crate::error::{Error, Result};

use super::magnitude::{convert_iq, MagBuffer};

/// Default chunk size read from the device (256 KiB)
pub const DEFAULT_BUFFER_SIZE: usize = 256 * 1024;

/// The raw data coming off of the device: one acquisition chunk
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    bytes: Vec<u8>,
    filled_len: usize,
    sequence: u64,
    timestamp_ms: i64,
}

impl SampleBuffer {
    /// Allocate a zeroed buffer of `capacity` bytes with nothing filled yet
    pub fn new(capacity: usize) -> Result<Self> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(capacity)
            .map_err(|_| Error::Allocation(capacity))?;
        bytes.resize(capacity, 0);

        Ok(Self {
            bytes,
            filled_len: 0,
            sequence: 0,
            timestamp_ms: 0,
        })
    }

    /// Build an already-filled buffer from raw IQ bytes
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let filled_len = bytes.len();
        Self {
            bytes,
            filled_len,
            sequence: 0,
            timestamp_ms: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Bytes written by the last read
    pub fn filled_len(&self) -> usize {
        self.filled_len
    }

    /// Number of complete I/Q pairs in the filled region
    pub fn sample_count(&self) -> usize {
        self.filled_len / 2
    }

    /// The filled region
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.filled_len]
    }

    /// Whole storage, handed to the driver as the read destination
    pub(crate) fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub(crate) fn set_filled_len(&mut self, len: usize) {
        debug_assert!(len <= self.bytes.len(), "driver reported more bytes than requested");
        self.filled_len = len.min(self.bytes.len());
    }

    /// Position of this buffer in its acquisition session, starting at 0
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Wall-clock time the read completed, in Unix milliseconds
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    pub(crate) fn stamp(&mut self, sequence: u64) {
        self.sequence = sequence;
        self.timestamp_ms = chrono::Utc::now().timestamp_millis();
    }

    /// Convert the filled I/Q pairs to magnitudes
    pub fn iq_to_mag(&self) -> MagBuffer {
        convert_iq(self.as_bytes())
    }
}

/// Convert a filled sample buffer to one magnitude per I/Q pair.
///
/// Pure: the buffer is only read, and an odd trailing byte is ignored.
pub fn convert_to_magnitudes(buffer: &SampleBuffer) -> MagBuffer {
    buffer.iq_to_mag()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_buffer_is_zeroed_and_empty() {
        let buf = SampleBuffer::new(DEFAULT_BUFFER_SIZE).unwrap();
        assert_eq!(buf.capacity(), 262_144);
        assert_eq!(buf.filled_len(), 0);
        assert!(buf.as_bytes().is_empty());
        assert!(buf.bytes.iter().all(|&b| b == 0));
        assert!(buf.iq_to_mag().is_empty());
    }

    #[test]
    fn test_impossible_allocation_is_an_error() {
        let err = SampleBuffer::new(usize::MAX).unwrap_err();
        assert!(matches!(err, Error::Allocation(usize::MAX)));
    }

    #[test]
    fn test_length_law() {
        for len in 0..=9usize {
            let buf = SampleBuffer::from_bytes(vec![200; len]);
            assert_eq!(convert_to_magnitudes(&buf).len(), len / 2);
        }
    }

    #[test]
    fn test_odd_length_drops_last_byte() {
        let buf = SampleBuffer::from_bytes(hex::decode("7f7f0000ff").unwrap());
        assert_eq!(buf.filled_len(), 5);
        let mags = convert_to_magnitudes(&buf);
        assert_eq!(mags.as_slice(), &[0, 179]);
    }

    #[test]
    fn test_only_filled_region_is_converted() {
        let mut buf = SampleBuffer::new(8).unwrap();
        buf.storage_mut().copy_from_slice(&hex::decode("ffff7f7f00000000").unwrap());
        buf.set_filled_len(4);
        assert_eq!(buf.iq_to_mag().as_slice(), &[181, 0]);
    }

    #[test]
    fn test_order_and_determinism() {
        let bytes = hex::decode("ff7f7fff8383007f7f00").unwrap();
        let a = SampleBuffer::from_bytes(bytes.clone());
        let b = SampleBuffer::from_bytes(bytes.clone());

        let mags_a = convert_to_magnitudes(&a);
        assert_eq!(mags_a, convert_to_magnitudes(&b));
        assert_eq!(mags_a, convert_to_magnitudes(&a));

        let lut = super::super::MagnitudeLut::global();
        for (k, mag) in mags_a.iter().enumerate() {
            assert_eq!(*mag, lut.magnitude(bytes[2 * k], bytes[2 * k + 1]));
        }
        assert_eq!(mags_a.as_slice(), &[128, 128, 5, 127, 127]);
    }

    #[test]
    fn test_concurrent_conversion() {
        let bytes: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let expected = convert_iq(&bytes);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let buf = SampleBuffer::from_bytes(bytes.clone());
                std::thread::spawn(move || convert_to_magnitudes(&buf))
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), expected);
        }
    }
}
