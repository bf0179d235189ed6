//! Cyclic Prefix Synchronization and Length Detection
//!
//! Two related jobs built on the same CP autocorrelation: a sweep over
//! candidate symbol-start offsets whose complex output also feeds the
//! CP-based fractional CFO estimate, and the Normal/Extended length decision
//! from "SSS Detection Method for Initial Cell Search in 3GPP LTE FDD/TDD
//! Dual Mode Receiver" (Jung-In Kim et al.).

use super::{cp_len, CyclicPrefix, CP_EXT_SCALE, CP_NORM_SCALE};
use crate::vector;
use crate::PhyError;
use num_complex::Complex32;
use num_traits::Zero;
use tracing::trace;

const CP_EMA_ALPHA: f32 = 0.1;

/// CP correlator for one OFDM symbol size.
pub struct CpSynchronizer {
    symbol_sz: usize,
    max_symbol_sz: usize,
    corr: Vec<Complex32>,
    m_norm_avg: f32,
    m_ext_avg: f32,
    ema_alpha: f32,
}

impl CpSynchronizer {
    pub fn init(symbol_sz: usize) -> Result<Self, PhyError> {
        if symbol_sz == 0 {
            return Err(PhyError::InvalidInput("symbol size must be non-zero".into()));
        }
        let mut corr = Vec::new();
        corr.try_reserve_exact(symbol_sz)
            .map_err(|e| PhyError::Allocation(format!("CP correlation buffer: {}", e)))?;
        corr.resize(symbol_sz, Complex32::zero());
        Ok(Self {
            symbol_sz,
            max_symbol_sz: symbol_sz,
            corr,
            m_norm_avg: 0.0,
            m_ext_avg: 0.0,
            ema_alpha: CP_EMA_ALPHA,
        })
    }

    /// Shrink the symbol size within the reserved maximum.
    pub fn resize(&mut self, symbol_sz: usize) -> Result<(), PhyError> {
        if symbol_sz > self.max_symbol_sz {
            return Err(PhyError::InvalidInput(format!(
                "CP resize {} exceeds initialized {}",
                symbol_sz, self.max_symbol_sz
            )));
        }
        self.symbol_sz = symbol_sz;
        Ok(())
    }

    /// Clear the detection metric averages.
    pub fn reset(&mut self) {
        self.m_norm_avg = 0.0;
        self.m_ext_avg = 0.0;
    }

    /// Correlate each candidate offset's cyclic prefix against the symbol
    /// tail over `nof_symbols` consecutive symbols, and return the offset
    /// with the strongest correlation. Every 7th symbol is assumed to carry
    /// the one-sample-longer first-of-slot prefix.
    pub fn synchronize(
        &mut self,
        input: &[Complex32],
        max_offset: usize,
        nof_symbols: usize,
        cp_len: usize,
    ) -> usize {
        let span: usize = (0..nof_symbols)
            .map(|n| self.symbol_sz + if n % 7 == 0 { cp_len + 1 } else { cp_len })
            .sum();
        let max_offset = max_offset
            .min(self.symbol_sz)
            .min(input.len().saturating_sub(span));
        if max_offset == 0 || nof_symbols == 0 {
            return 0;
        }
        for i in 0..max_offset {
            let mut acc = Complex32::zero();
            let mut pos = i;
            for n in 0..nof_symbols {
                let cplen = if n % 7 == 0 { cp_len + 1 } else { cp_len };
                acc += vector::dot_prod_conj(
                    &input[pos..pos + cplen],
                    &input[pos + self.symbol_sz..pos + self.symbol_sz + cplen],
                ) / nof_symbols as f32;
                pos += self.symbol_sz + cplen;
            }
            self.corr[i] = acc;
        }
        vector::max_abs_index(&self.corr[..max_offset])
    }

    /// Complex correlation value at `offset` from the last `synchronize`
    /// sweep. Its argument carries the fractional CFO.
    pub fn corr_output(&self, offset: usize) -> Complex32 {
        if offset < self.symbol_sz {
            self.corr[offset]
        } else {
            Complex32::zero()
        }
    }

    /// Decide the CP length from up to 3 symbols preceding `peak_pos`.
    ///
    /// For each hypothesis the metric is `M = R / C` with `R` the real part
    /// of the prefix/tail correlation and `C` the prefix energy; the metric
    /// is averaged across calls and the larger average wins, falling back to
    /// the raw correlations on a tie. With no usable preceding symbol the
    /// decision defaults to Normal.
    pub fn detect(&mut self, input: &[Complex32], peak_pos: usize) -> CyclicPrefix {
        let fft_size = self.symbol_sz;
        let cp_norm_len = cp_len(fft_size, CP_NORM_SCALE);
        let cp_ext_len = cp_len(fft_size, CP_EXT_SCALE);

        let nof_symbols = (peak_pos / (fft_size + cp_ext_len)).min(3);
        if nof_symbols == 0 || peak_pos > input.len() {
            return CyclicPrefix::Normal;
        }

        let (r_norm, c_norm) = hypothesis_metric(
            input,
            peak_pos - nof_symbols * (fft_size + cp_norm_len),
            nof_symbols,
            fft_size,
            cp_norm_len,
        );
        let m_norm = if c_norm > 0.0 { r_norm / c_norm } else { 0.0 };
        self.m_norm_avg = vector::ema(m_norm / nof_symbols as f32, self.m_norm_avg, self.ema_alpha);

        let (r_ext, c_ext) = hypothesis_metric(
            input,
            peak_pos - nof_symbols * (fft_size + cp_ext_len),
            nof_symbols,
            fft_size,
            cp_ext_len,
        );
        let m_ext = if c_ext > 0.0 { r_ext / c_ext } else { 0.0 };
        self.m_ext_avg = vector::ema(m_ext / nof_symbols as f32, self.m_ext_avg, self.ema_alpha);

        trace!(
            "CP detect: M_norm_avg={:.4} M_ext_avg={:.4} R_norm={:.4} R_ext={:.4}",
            self.m_norm_avg,
            self.m_ext_avg,
            r_norm,
            r_ext
        );

        if self.m_norm_avg > self.m_ext_avg {
            CyclicPrefix::Normal
        } else if self.m_norm_avg < self.m_ext_avg {
            CyclicPrefix::Extended
        } else if r_norm > r_ext {
            CyclicPrefix::Normal
        } else {
            CyclicPrefix::Extended
        }
    }
}

/// Accumulated (R, C) for one CP-length hypothesis over `nof_symbols`
/// symbols starting at `start`.
fn hypothesis_metric(
    input: &[Complex32],
    start: usize,
    nof_symbols: usize,
    fft_size: usize,
    cplen: usize,
) -> (f32, f32) {
    let mut r = 0.0;
    let mut c = 0.0;
    let mut pos = start;
    for _ in 0..nof_symbols {
        r += vector::dot_prod_conj(
            &input[pos + fft_size..pos + fft_size + cplen],
            &input[pos..pos + cplen],
        )
        .re;
        c += cplen as f32 * vector::avg_power(&input[pos..pos + cplen]);
        pos += fft_size + cplen;
    }
    (r, c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const FFT: usize = 128;

    /// Stream of OFDM-shaped symbols: random data with a genuine cyclic
    /// prefix copied from the symbol tail.
    fn cp_stream(rng: &mut StdRng, nof_symbols: usize, cplen: usize) -> Vec<Complex32> {
        let mut out = Vec::new();
        for _ in 0..nof_symbols {
            let data: Vec<Complex32> = (0..FFT)
                .map(|_| Complex32::new(rng.gen::<f32>() - 0.5, rng.gen::<f32>() - 0.5))
                .collect();
            out.extend_from_slice(&data[FFT - cplen..]);
            out.extend_from_slice(&data);
        }
        out
    }

    #[test]
    fn test_detect_normal_cp() {
        let mut rng = StdRng::seed_from_u64(0x1507);
        let cp_norm = cp_len(FFT, CP_NORM_SCALE);
        let mut hits = 0;
        let trials = 40;
        for _ in 0..trials {
            let stream = cp_stream(&mut rng, 8, cp_norm);
            // peak at a random symbol boundary with >= 1 preceding symbol
            let k = rng.gen_range(1..=8);
            let peak = k * (FFT + cp_norm);
            let mut cp = CpSynchronizer::init(FFT).unwrap();
            if cp.detect(&stream, peak) == CyclicPrefix::Normal {
                hits += 1;
            }
        }
        assert!(hits * 100 >= trials * 95, "{}/{} normal", hits, trials);
    }

    #[test]
    fn test_detect_extended_cp() {
        let mut rng = StdRng::seed_from_u64(0x1508);
        let cp_ext = cp_len(FFT, CP_EXT_SCALE);
        let mut hits = 0;
        let trials = 40;
        for _ in 0..trials {
            let stream = cp_stream(&mut rng, 8, cp_ext);
            let k = rng.gen_range(1..=8);
            let peak = k * (FFT + cp_ext);
            let mut cp = CpSynchronizer::init(FFT).unwrap();
            if cp.detect(&stream, peak) == CyclicPrefix::Extended {
                hits += 1;
            }
        }
        assert!(hits * 100 >= trials * 95, "{}/{} extended", hits, trials);
    }

    #[test]
    fn test_detect_defaults_to_normal_without_room() {
        let stream = vec![Complex32::new(1.0, 0.0); 4 * FFT];
        let mut cp = CpSynchronizer::init(FFT).unwrap();
        assert_eq!(cp.detect(&stream, FFT / 2), CyclicPrefix::Normal);
    }

    /// Like `cp_stream` but with the first-of-slot one-sample-longer prefix
    /// every 7th symbol, matching the correlator's slot assumption.
    fn cp_stream_slot(rng: &mut StdRng, nof_symbols: usize, cplen: usize) -> Vec<Complex32> {
        let mut out = Vec::new();
        for n in 0..nof_symbols {
            let cp = if n % 7 == 0 { cplen + 1 } else { cplen };
            let data: Vec<Complex32> = (0..FFT)
                .map(|_| Complex32::new(rng.gen::<f32>() - 0.5, rng.gen::<f32>() - 0.5))
                .collect();
            out.extend_from_slice(&data[FFT - cp..]);
            out.extend_from_slice(&data);
        }
        out
    }

    #[test]
    fn test_synchronize_finds_symbol_boundary() {
        let mut rng = StdRng::seed_from_u64(0x2209);
        let cp_norm = cp_len(FFT, CP_NORM_SCALE);
        // low-power lead-in, then a run of slot-structured symbols
        let lead = 37;
        let mut stream: Vec<Complex32> = (0..lead)
            .map(|_| Complex32::new(rng.gen::<f32>() - 0.5, rng.gen::<f32>() - 0.5) * 0.01)
            .collect();
        stream.extend(cp_stream_slot(&mut rng, 6, cp_norm));

        let mut cp = CpSynchronizer::init(FFT).unwrap();
        let off = cp.synchronize(&stream, FFT, 3, cp_norm);
        assert_eq!(off, lead);
        assert!(cp.corr_output(off).norm() > 0.0);
    }

    #[test]
    fn test_corr_phase_carries_cfo() {
        let mut rng = StdRng::seed_from_u64(0x2210);
        let cp_norm = cp_len(FFT, CP_NORM_SCALE);
        let clean = cp_stream_slot(&mut rng, 6, cp_norm);
        let f_sc = 0.2; // subcarriers
        let f = f_sc / FFT as f32;
        let rotated: Vec<Complex32> = clean
            .iter()
            .enumerate()
            .map(|(i, v)| {
                v * Complex32::from_polar(1.0, 2.0 * std::f32::consts::PI * f * i as f32)
            })
            .collect();

        let mut cp = CpSynchronizer::init(FFT).unwrap();
        let off = cp.synchronize(&rotated, FFT, 3, cp_norm);
        assert_eq!(off, 0);
        let corr = cp.corr_output(off);
        let estimate = -corr.arg() / (2.0 * std::f32::consts::PI);
        assert!(
            (estimate - f_sc).abs() < 0.02,
            "estimate {} for {} subcarriers",
            estimate,
            f_sc
        );
    }
}
