//! Magnitude computation for IQ samples
//!
//! RTL-SDR outputs 8-bit unsigned IQ samples (I, Q pairs) centered at 127.
//! Downstream detectors work on magnitude, so every pair is reduced to
//! floor(sqrt(I² + Q²)) through a lookup table built once per process.

use std::sync::OnceLock;

/// A magnitude value
pub type Mag = i16;

/// Midpoint of the unsigned ADC range
pub const IQ_CENTER: i16 = 127;

/// Largest absolute deviation from the midpoint (byte value 255)
pub const MAX_DEVIATION: usize = 128;

const LUT_SIDE: usize = MAX_DEVIATION + 1;

static GLOBAL_LUT: OnceLock<MagnitudeLut> = OnceLock::new();

/// Pre-computed magnitude lookup table indexed by absolute I and Q deviation
pub struct MagnitudeLut {
    table: Box<[[Mag; LUT_SIDE]; LUT_SIDE]>,
}

impl MagnitudeLut {
    /// Build the 129x129 table of truncated square roots
    pub fn new() -> Self {
        let mut table = Box::new([[0 as Mag; LUT_SIDE]; LUT_SIDE]);

        for (i, row) in table.iter_mut().enumerate() {
            for (q, mag) in row.iter_mut().enumerate() {
                let sum_of_squares = (i * i + q * q) as f64;
                // sqrt is correctly rounded, so truncation yields the exact integer root
                *mag = sum_of_squares.sqrt().trunc() as Mag;
            }
        }

        Self { table }
    }

    /// Shared table, built on first use and never torn down
    pub fn global() -> &'static MagnitudeLut {
        GLOBAL_LUT.get_or_init(MagnitudeLut::new)
    }

    /// Magnitude for absolute deviations `i` and `q`.
    ///
    /// Both must lie in `0..=128`; anything larger is a caller bug and
    /// panics on the bounds check.
    #[inline(always)]
    pub fn get(&self, i: usize, q: usize) -> Mag {
        self.table[i][q]
    }

    /// Convert one raw IQ byte pair to magnitude
    #[inline(always)]
    pub fn magnitude(&self, i: u8, q: u8) -> Mag {
        self.get(deviation(i), deviation(q))
    }
}

impl Default for MagnitudeLut {
    fn default() -> Self {
        Self::new()
    }
}

/// Absolute distance of a raw sample from the midpoint, always in 0..=128
#[inline(always)]
fn deviation(sample: u8) -> usize {
    (sample as i16 - IQ_CENTER).unsigned_abs() as usize
}

/// A buffer of I/Q data converted to magnitudes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MagBuffer {
    mags: Vec<Mag>,
}

impl MagBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            mags: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn push(&mut self, mag: Mag) {
        self.mags.push(mag);
    }

    pub fn len(&self) -> usize {
        self.mags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mags.is_empty()
    }

    pub fn as_slice(&self) -> &[Mag] {
        &self.mags
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Mag> {
        self.mags.iter()
    }

    pub fn into_vec(self) -> Vec<Mag> {
        self.mags
    }

    /// Strongest magnitude in the buffer, 0 when empty
    pub fn peak(&self) -> Mag {
        self.mags.iter().copied().max().unwrap_or(0)
    }

    /// Average magnitude, 0.0 when empty
    pub fn mean(&self) -> f64 {
        if self.mags.is_empty() {
            return 0.0;
        }
        let sum: i64 = self.mags.iter().map(|&m| m as i64).sum();
        sum as f64 / self.mags.len() as f64
    }
}

impl std::ops::Index<usize> for MagBuffer {
    type Output = Mag;

    fn index(&self, index: usize) -> &Mag {
        &self.mags[index]
    }
}

impl<'a> IntoIterator for &'a MagBuffer {
    type Item = &'a Mag;
    type IntoIter = std::slice::Iter<'a, Mag>;

    fn into_iter(self) -> Self::IntoIter {
        self.mags.iter()
    }
}

/// Convert raw interleaved IQ bytes to magnitudes.
///
/// A trailing unpaired byte is ignored, so the output always holds
/// `iq_data.len() / 2` values in input order.
pub fn convert_iq(iq_data: &[u8]) -> MagBuffer {
    let lut = MagnitudeLut::global();
    let mut mags = MagBuffer::with_capacity(iq_data.len() / 2);
    for pair in iq_data.chunks_exact(2) {
        mags.push(lut.magnitude(pair[0], pair[1]));
    }
    mags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn isqrt(n: usize) -> usize {
        let mut r = 0;
        while (r + 1) * (r + 1) <= n {
            r += 1;
        }
        r
    }

    #[test]
    fn test_lut_matches_integer_sqrt() {
        let lut = MagnitudeLut::new();
        for i in 0..=MAX_DEVIATION {
            for q in 0..=MAX_DEVIATION {
                assert_eq!(
                    lut.get(i, q) as usize,
                    isqrt(i * i + q * q),
                    "mismatch at i={} q={}",
                    i,
                    q
                );
            }
        }
    }

    #[test]
    fn test_lut_is_symmetric() {
        let lut = MagnitudeLut::global();
        for i in 0..=MAX_DEVIATION {
            for q in 0..=MAX_DEVIATION {
                assert_eq!(lut.get(i, q), lut.get(q, i));
            }
        }
    }

    #[test]
    fn test_global_is_shared() {
        assert!(std::ptr::eq(MagnitudeLut::global(), MagnitudeLut::global()));
    }

    #[test]
    fn test_boundary_magnitudes() {
        let lut = MagnitudeLut::global();
        assert_eq!(lut.magnitude(127, 127), 0);
        assert_eq!(lut.magnitude(0, 0), 179);
        assert_eq!(lut.magnitude(255, 255), 181);
        assert_eq!(lut.magnitude(255, 127), 128);
        assert_eq!(lut.magnitude(127, 0), 127);
    }

    #[test]
    fn test_convert_iq_drops_trailing_byte() {
        let mags = convert_iq(&[127, 127, 0, 0, 255]);
        assert_eq!(mags.as_slice(), &[0, 179]);
    }

    #[test]
    fn test_mag_buffer_stats() {
        let mags = convert_iq(&[127, 127, 255, 255, 130, 131]);
        assert_eq!(mags.as_slice(), &[0, 181, 5]);
        assert_eq!(mags.peak(), 181);
        assert!((mags.mean() - 62.0).abs() < 1e-9);

        let empty = MagBuffer::default();
        assert_eq!(empty.peak(), 0);
        assert_eq!(empty.mean(), 0.0);
    }
}
