//! Carrier Frequency Offset Correction
//!
//! Applies a complex-exponential derotation to a block of samples. The
//! frequency is expressed as a fraction of the sampling rate, so correcting
//! an estimate of `f` subcarriers on a size-`N` symbol means passing
//! `-f / N`.

use crate::PhyError;
use num_complex::Complex32;
use num_traits::Zero;
use std::f32::consts::PI;

/// Correction strategy, chosen at construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CfoStrategy {
    /// Compute the rotation per sample. Always exact, no cached state.
    Direct,
    /// Cache the per-sample exponential vector and regenerate it only when
    /// the requested frequency moves by more than `tolerance` (fraction of
    /// the sampling rate).
    Table { tolerance: f32 },
}

/// Frequency offset corrector for a fixed maximum block length.
pub struct CfoCorrector {
    nsamples: usize,
    max_samples: usize,
    strategy: CfoStrategy,
    tolerance: f32,
    last_freq: Option<f32>,
    table: Vec<Complex32>,
}

impl CfoCorrector {
    /// Direct-computation corrector for blocks of up to `nsamples`.
    pub fn new(nsamples: usize) -> Result<Self, PhyError> {
        Self::with_strategy(nsamples, CfoStrategy::Direct)
    }

    pub fn with_strategy(nsamples: usize, strategy: CfoStrategy) -> Result<Self, PhyError> {
        if nsamples == 0 {
            return Err(PhyError::InvalidInput("CFO block length must be non-zero".into()));
        }
        let (tolerance, table) = match strategy {
            CfoStrategy::Direct => (0.0, Vec::new()),
            CfoStrategy::Table { tolerance } => {
                let mut table = Vec::new();
                table
                    .try_reserve_exact(nsamples)
                    .map_err(|e| PhyError::Allocation(format!("CFO table: {}", e)))?;
                table.resize(nsamples, Complex32::zero());
                (tolerance, table)
            }
        };
        Ok(Self {
            nsamples,
            max_samples: nsamples,
            strategy,
            tolerance,
            last_freq: None,
            table,
        })
    }

    /// Update the regeneration tolerance (fraction of the sampling rate).
    /// Has no effect on the `Direct` strategy, which is exact regardless.
    pub fn set_tolerance(&mut self, tolerance: f32) {
        self.tolerance = tolerance;
    }

    /// Shrink the block length within the reserved maximum.
    pub fn resize(&mut self, nsamples: usize) -> Result<(), PhyError> {
        if nsamples > self.max_samples {
            return Err(PhyError::InvalidInput(format!(
                "CFO resize {} exceeds initialized {}",
                nsamples, self.max_samples
            )));
        }
        self.nsamples = nsamples;
        // Force table regeneration at the new length.
        self.last_freq = None;
        Ok(())
    }

    pub fn nsamples(&self) -> usize {
        self.nsamples
    }

    /// Multiply each sample by `exp(j*2*pi*freq*i)`.
    ///
    /// `input` and `output` must hold at least `nsamples` samples; the same
    /// slice may not be passed as both.
    pub fn correct(&mut self, input: &[Complex32], output: &mut [Complex32], freq: f32) {
        let n = self.nsamples;
        debug_assert!(input.len() >= n && output.len() >= n);
        match self.strategy {
            CfoStrategy::Direct => {
                rotate(&input[..n], &mut output[..n], freq);
            }
            CfoStrategy::Table { .. } => {
                let stale = match self.last_freq {
                    Some(last) => (last - freq).abs() > self.tolerance,
                    None => true,
                };
                if stale {
                    regenerate(&mut self.table[..n], freq);
                    self.last_freq = Some(freq);
                }
                for ((x, t), y) in input[..n].iter().zip(self.table[..n].iter()).zip(output[..n].iter_mut()) {
                    *y = x * t;
                }
            }
        }
    }
}

/// `out[i] = in[i] * exp(j*2*pi*freq*i)`, incremental phase with wrap.
fn rotate(input: &[Complex32], output: &mut [Complex32], freq: f32) {
    let increment = 2.0 * PI * freq;
    let mut phase: f32 = 0.0;
    for (x, y) in input.iter().zip(output.iter_mut()) {
        *y = x * Complex32::new(phase.cos(), phase.sin());
        phase += increment;
        if phase > PI {
            phase -= 2.0 * PI;
        } else if phase < -PI {
            phase += 2.0 * PI;
        }
    }
}

fn regenerate(table: &mut [Complex32], freq: f32) {
    let increment = 2.0 * PI * freq;
    let mut phase: f32 = 0.0;
    for t in table.iter_mut() {
        *t = Complex32::new(phase.cos(), phase.sin());
        phase += increment;
        if phase > PI {
            phase -= 2.0 * PI;
        } else if phase < -PI {
            phase += 2.0 * PI;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Vec<Complex32> {
        (0..n)
            .map(|i| Complex32::new((i as f32 * 0.17).cos(), (i as f32 * 0.13).sin()))
            .collect()
    }

    #[test]
    fn test_zero_frequency_is_identity() {
        let input = ramp(256);
        let mut output = vec![Complex32::zero(); 256];
        let mut cfo = CfoCorrector::new(256).unwrap();
        cfo.correct(&input, &mut output, 0.0);
        for (a, b) in input.iter().zip(output.iter()) {
            assert!((a - b).norm() < 1e-6);
        }
    }

    #[test]
    fn test_correct_then_invert() {
        let input = ramp(512);
        let mut shifted = vec![Complex32::zero(); 512];
        let mut restored = vec![Complex32::zero(); 512];
        let mut cfo = CfoCorrector::new(512).unwrap();
        let f = 0.37 / 128.0;
        cfo.correct(&input, &mut shifted, f);
        cfo.correct(&shifted, &mut restored, -f);
        for (a, b) in input.iter().zip(restored.iter()) {
            assert!((a - b).norm() < 1e-4);
        }
    }

    #[test]
    fn test_table_matches_direct() {
        let input = ramp(384);
        let mut direct_out = vec![Complex32::zero(); 384];
        let mut table_out = vec![Complex32::zero(); 384];
        let mut direct = CfoCorrector::new(384).unwrap();
        let mut table =
            CfoCorrector::with_strategy(384, CfoStrategy::Table { tolerance: 0.0 }).unwrap();
        for f in [0.001, -0.0025, 0.001] {
            direct.correct(&input, &mut direct_out, f);
            table.correct(&input, &mut table_out, f);
            for (a, b) in direct_out.iter().zip(table_out.iter()) {
                assert!((a - b).norm() < 1e-4);
            }
        }
    }

    #[test]
    fn test_resize_bound() {
        let mut cfo = CfoCorrector::new(128).unwrap();
        assert!(cfo.resize(64).is_ok());
        assert_eq!(cfo.nsamples(), 64);
        assert!(cfo.resize(256).is_err());
    }
}
