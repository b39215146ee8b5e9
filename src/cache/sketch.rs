//! Count-Min Sketch: the frequency arbiter of TinyLFU admission.
//!
//! Four rows of 4-bit counters, two per byte. Each row XORs the hash with
//! its own seed before masking, and `estimate` takes the minimum across
//! rows. Aging halves every counter in place.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{errdecode, Result};

/// Fixed number of rows for the cache sketch.
pub(crate) const CM_DEPTH: usize = 4;

pub(crate) struct CmSketch {
    rows: Vec<CmRow>,
    seeds: Vec<u64>,
    mask: u64,
}

impl CmSketch {
    /// A sketch with `CM_DEPTH` rows of `num_counters` counters, rounded up
    /// to a power of two so the modulo is a mask.
    pub(crate) fn new(num_counters: u64) -> Self {
        Self::with_depth(CM_DEPTH, num_counters)
    }

    /// Derives width and depth from an error bound: estimates are within a
    /// factor of `epsilon` with probability `delta`.
    pub(crate) fn with_estimates(epsilon: f64, delta: f64) -> Result<Self> {
        if epsilon <= 0.0 || epsilon >= 1.0 {
            return Err(errdecode!("cm sketch: epsilon must be in (0, 1)"));
        }
        if delta <= 0.0 || delta >= 1.0 {
            return Err(errdecode!("cm sketch: delta must be in (0, 1)"));
        }
        let width = (2.0 / epsilon).ceil() as u64;
        let depth = ((1.0 - delta).ln() / 0.5f64.ln()).ceil() as usize;
        Ok(Self::with_depth(depth.max(1), width))
    }

    fn with_depth(depth: usize, num_counters: u64) -> Self {
        assert!(num_counters > 0, "cm sketch: invalid counter count");
        let num_counters = num_counters.next_power_of_two();

        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        let mut source = StdRng::seed_from_u64(seed);

        Self {
            rows: (0..depth).map(|_| CmRow::new(num_counters)).collect(),
            seeds: (0..depth).map(|_| source.gen()).collect(),
            mask: num_counters - 1,
        }
    }

    pub(crate) fn increment(&mut self, hashed: u64) {
        for (row, seed) in self.rows.iter_mut().zip(&self.seeds) {
            row.increment((hashed ^ seed) & self.mask);
        }
    }

    /// Frequency estimate: the minimum counter across rows.
    pub(crate) fn estimate(&self, hashed: u64) -> u8 {
        self.rows
            .iter()
            .zip(&self.seeds)
            .map(|(row, seed)| row.get((hashed ^ seed) & self.mask))
            .min()
            .unwrap_or(0)
    }

    /// Halves every counter.
    pub(crate) fn reset(&mut self) {
        for row in &mut self.rows {
            row.reset();
        }
    }

    /// Zeroes every counter.
    pub(crate) fn clear(&mut self) {
        for row in &mut self.rows {
            row.clear();
        }
    }
}

/// One row of packed 4-bit counters.
struct CmRow(Vec<u8>);

impl CmRow {
    fn new(num_counters: u64) -> Self {
        Self(vec![0u8; (num_counters / 2) as usize])
    }

    fn get(&self, n: u64) -> u8 {
        (self.0[(n / 2) as usize] >> ((n & 1) * 4)) & 0x0f
    }

    fn increment(&mut self, n: u64) {
        let i = (n / 2) as usize;
        let shift = (n & 1) * 4;
        let v = (self.0[i] >> shift) & 0x0f;
        if v < 15 {
            self.0[i] += 1 << shift;
        }
    }

    fn reset(&mut self) {
        // Halves both nibbles of every byte in parallel.
        for b in &mut self.0 {
            *b = (*b >> 1) & 0x77;
        }
    }

    fn clear(&mut self) {
        self.0.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_and_estimate() {
        let mut s = CmSketch::new(16);
        for _ in 0..10 {
            s.increment(5);
        }
        assert_eq!(s.estimate(5), 10);
        // 105 differs from 5 in its low nibble, so it can never share a
        // counter slot in a 16-wide row.
        assert_eq!(s.estimate(105), 0);
    }

    #[test]
    fn test_reset_halves() {
        let mut s = CmSketch::new(16);
        for _ in 0..10 {
            s.increment(3093);
        }
        assert_eq!(s.estimate(3093), 10);
        s.reset();
        assert_eq!(s.estimate(3093), 5);
        s.reset();
        assert_eq!(s.estimate(3093), 2);
    }

    #[test]
    fn test_saturates_at_fifteen() {
        let mut s = CmSketch::new(16);
        for _ in 0..100 {
            s.increment(7);
        }
        assert_eq!(s.estimate(7), 15);
        s.reset();
        assert_eq!(s.estimate(7), 7);
    }

    #[test]
    fn test_clear() {
        let mut s = CmSketch::new(64);
        for i in 0..32 {
            s.increment(i);
        }
        s.clear();
        for i in 0..32 {
            assert_eq!(s.estimate(i), 0);
        }
    }

    #[test]
    fn test_estimate_never_undercounts() {
        let mut s = CmSketch::new(1024);
        for i in 0..200u64 {
            for _ in 0..(i % 16) {
                s.increment(i);
            }
        }
        for i in 0..200u64 {
            assert!(u64::from(s.estimate(i)) >= (i % 16).min(15));
        }
    }

    #[test]
    fn test_with_estimates_bounds() {
        assert!(CmSketch::with_estimates(0.01, 0.99).is_ok());
        assert!(CmSketch::with_estimates(0.0, 0.5).is_err());
        assert!(CmSketch::with_estimates(0.5, 1.0).is_err());
    }
}
