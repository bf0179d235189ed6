//! Secondary Synchronization Signal Detection
//!
//! The SSS interleaves two length-31 m-sequences, scrambled by
//! PSS-dependent sequences, onto the even/odd subcarriers of one OFDM
//! symbol; the pair of cyclic shifts `(m0, m1)` encodes the cell identity
//! group and which half of the 10 ms frame the symbol sits in. Detection
//! extracts the two half-sequences and matches them against precomputed
//! shift tables with one of three correlation strategies.
//!
//! Partial and differential correlation follow "SSS Detection Method for
//! Initial Cell Search in 3GPP LTE FDD/TDD Dual Mode Receiver" by
//! Jung-In Kim et al.
//!
//! Reference: 3GPP TS 36.211 version 10.0.0 Release 10 Sec. 6.11.2

use crate::dft::{DftPlan, Direction};
use crate::vector;
use crate::PhyError;
use common::Pci;
use ndarray::Array2;
use num_complex::Complex32;
use num_traits::Zero;

/// Half-sequence length
const SSS_N: usize = 31;
/// Number of SSS subcarriers
pub const SSS_LEN: usize = 2 * SSS_N;

const MAX_FFT_SIZE: usize = 2048;
const MAX_PARTIAL_SEGMENTS: usize = 3;

/// Correlation strategy for the `(m0, m1)` search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SssAlgorithm {
    /// One coherent dot product across the whole half-sequence. Sharpest
    /// peak, assumes the channel is flat across the SSS band.
    Full,
    /// Split each half-sequence into `segments` equal parts correlated
    /// independently, summing the energies. Tolerates residual channel
    /// variation across the band at some loss of peak sharpness.
    Partial { segments: usize },
    /// Correlate consecutive-sample conjugate products, removing any common
    /// phase term. Most robust to an unequalized channel, least robust to
    /// noise.
    Differential,
}

/// Per-group-id correlation tables in floating point.
struct FcTables {
    /// 31 cyclic shifts of the `s` sequence, one row per candidate
    s: Array2<f32>,
    /// 31 de-rotation rows of the `z` sequence, indexed by `m0`
    z1: Array2<f32>,
    /// Consecutive-sample products of the `s` rows, for the differential path
    sd: Array2<f32>,
    /// Scrambling sequences for the even/odd half-sequences
    c0: [f32; SSS_N],
    c1: [f32; SSS_N],
}

/// SSS detector holding the correlation tables for all three group ids.
/// Tables are derived once from the closed-form generators at `init` and
/// never mutated afterwards.
pub struct SssDetector {
    dftp_input: DftPlan,
    fft_size: usize,
    max_fft_size: usize,
    n_id_2: u8,
    fc_tables: [FcTables; 3],
    n_id_1_table: [[Option<u16>; 30]; 30],
    corr_output_m0: [f32; SSS_N],
    corr_output_m1: [f32; SSS_N],
    input_fft: Vec<Complex32>,
}

impl SssDetector {
    pub fn init(fft_size: usize) -> Result<Self, PhyError> {
        if fft_size == 0 || fft_size > MAX_FFT_SIZE {
            return Err(PhyError::InvalidInput(format!("invalid fft_size {}", fft_size)));
        }
        let mut dftp_input = DftPlan::new(fft_size, Direction::Forward)?;
        dftp_input.set_mirror(true);
        dftp_input.set_dc(true);

        let fc_tables = [build_tables(0), build_tables(1), build_tables(2)];

        let mut n_id_1_table = [[None; 30]; 30];
        for n_id_1 in 0..168u16 {
            let (m0, m1) = generate_m0m1(n_id_1);
            n_id_1_table[m0][m1 - 1] = Some(n_id_1);
        }

        Ok(Self {
            dftp_input,
            fft_size,
            max_fft_size: fft_size,
            n_id_2: 0,
            fc_tables,
            n_id_1_table,
            corr_output_m0: [0.0; SSS_N],
            corr_output_m1: [0.0; SSS_N],
            input_fft: vec![Complex32::zero(); fft_size],
        })
    }

    /// Shrink the transform size within the reserved maximum.
    pub fn resize(&mut self, fft_size: usize) -> Result<(), PhyError> {
        if fft_size > self.max_fft_size {
            return Err(PhyError::InvalidInput(format!(
                "SSS resize {} exceeds initialized {}",
                fft_size, self.max_fft_size
            )));
        }
        self.dftp_input.replan(fft_size)?;
        self.fft_size = fft_size;
        Ok(())
    }

    /// Group id whose scrambling sequences are removed during extraction.
    pub fn set_n_id_2(&mut self, n_id_2: u8) -> Result<(), PhyError> {
        if n_id_2 > 2 {
            return Err(PhyError::InvalidInput(format!("invalid N_id_2 {}", n_id_2)));
        }
        self.n_id_2 = n_id_2;
        Ok(())
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Extract the de-interleaved, descrambled half-sequences from one
    /// SSS symbol, optionally equalizing with a channel estimate covering
    /// the central 62 subcarriers.
    fn extract_pair(
        &mut self,
        input: &[Complex32],
        ce: Option<&[Complex32]>,
    ) -> ([Complex32; SSS_N], [Complex32; SSS_N]) {
        self.dftp_input.run(input, &mut self.input_fft);
        let base = (self.fft_size - SSS_LEN) / 2;

        let mut band = [Complex32::zero(); SSS_LEN];
        band.copy_from_slice(&self.input_fft[base..base + SSS_LEN]);
        if let Some(ce) = ce {
            let mut equalized = [Complex32::zero(); SSS_LEN];
            vector::div(&band, &ce[..SSS_LEN], &mut equalized);
            band = equalized;
        }

        let tables = &self.fc_tables[self.n_id_2 as usize];
        let mut y0 = [Complex32::zero(); SSS_N];
        let mut y1 = [Complex32::zero(); SSS_N];
        for i in 0..SSS_N {
            y0[i] = band[2 * i] * tables.c0[i];
            y1[i] = band[2 * i + 1] * tables.c1[i];
        }
        (y0, y1)
    }

    /// Estimate `(m0, m1)` and their correlation values from one SSS symbol
    /// using the selected strategy. `input` must hold `fft_size` samples;
    /// `ce`, when given, must hold 62 taps.
    pub fn m0m1(
        &mut self,
        input: &[Complex32],
        ce: Option<&[Complex32]>,
        algorithm: SssAlgorithm,
    ) -> Result<(usize, f32, usize, f32), PhyError> {
        if input.len() < self.fft_size {
            return Err(PhyError::InvalidInput("SSS symbol window too short".into()));
        }
        if let Some(ce) = ce {
            if ce.len() < SSS_LEN {
                return Err(PhyError::InvalidInput("channel estimate too short".into()));
            }
        }
        let segments = match algorithm {
            SssAlgorithm::Full => 1,
            SssAlgorithm::Partial { segments } => {
                if segments == 0 || segments > MAX_PARTIAL_SEGMENTS {
                    return Err(PhyError::InvalidInput(format!(
                        "partial correlation supports 1-{} segments, got {}",
                        MAX_PARTIAL_SEGMENTS, segments
                    )));
                }
                segments
            }
            SssAlgorithm::Differential => 0,
        };

        let (y0, mut y1) = self.extract_pair(input, ce);
        let tables = &self.fc_tables[self.n_id_2 as usize];

        let (m0, m1) = if segments > 0 {
            correlate_segments(&y0, &tables.s, segments, &mut self.corr_output_m0);
            let m0 = vector::max_index(&self.corr_output_m0);
            rotate_by_z1(&mut y1, &tables.z1, m0);
            correlate_segments(&y1, &tables.s, segments, &mut self.corr_output_m1);
            let m1 = vector::max_index(&self.corr_output_m1);
            (m0, m1)
        } else {
            correlate_differential(&y0, &tables.sd, &mut self.corr_output_m0);
            let m0 = vector::max_index(&self.corr_output_m0);
            rotate_by_z1(&mut y1, &tables.z1, m0);
            correlate_differential(&y1, &tables.sd, &mut self.corr_output_m1);
            let m1 = vector::max_index(&self.corr_output_m1);
            (m0, m1)
        };

        Ok((
            m0,
            self.corr_output_m0[m0],
            m1,
            self.corr_output_m1[m1],
        ))
    }

    /// Cell identity group recovered from a shift pair, or `None` when the
    /// pair falls outside the table (possible for noisy inputs only).
    pub fn n_id_1(&self, m0: usize, m1: usize) -> Option<u16> {
        if m1 > m0 {
            if m0 < 30 && m1 - 1 < 30 {
                return self.n_id_1_table[m0][m1 - 1];
            }
        } else if let Some(col) = m0.checked_sub(1) {
            if m1 < 30 && col < 30 {
                return self.n_id_1_table[m1][col];
            }
        }
        None
    }

    /// Subframe carried by the shift pair ordering: 0 for the first half
    /// frame, 5 for the second.
    pub fn subframe_index(m0: usize, m1: usize) -> u32 {
        if m1 > m0 {
            0
        } else {
            5
        }
    }

    /// Transmit-side reference: the 62-length SSS sequences a cell sends in
    /// subframe 0 and subframe 5.
    pub fn generate(pci: Pci) -> ([f32; SSS_LEN], [f32; SSS_LEN]) {
        let (z_tilde, s_tilde, c_tilde) = generate_zsc_tilde();
        let (m0, m1) = generate_m0m1(pci.n_id_1());
        let n_id_2 = pci.n_id_2() as usize;

        let s0 = cyclic_shift(&s_tilde, m0);
        let s1 = cyclic_shift(&s_tilde, m1);
        let c0 = cyclic_shift(&c_tilde, n_id_2);
        let c1 = cyclic_shift(&c_tilde, n_id_2 + 3);
        let z1_m0 = cyclic_shift(&z_tilde, m0 % 8);
        let z1_m1 = cyclic_shift(&z_tilde, m1 % 8);

        let mut signal0 = [0.0; SSS_LEN];
        let mut signal5 = [0.0; SSS_LEN];
        for i in 0..SSS_N {
            signal0[2 * i] = s0[i] * c0[i];
            signal0[2 * i + 1] = s1[i] * z1_m0[i] * c1[i];
            signal5[2 * i] = s1[i] * c0[i];
            signal5[2 * i + 1] = s0[i] * z1_m1[i] * c1[i];
        }
        (signal0, signal5)
    }
}

/// Remove the `m0`-indexed `z` rotation from the odd half-sequence.
fn rotate_by_z1(y: &mut [Complex32; SSS_N], z1: &Array2<f32>, m0: usize) {
    let row = z1.row(m0);
    for (v, &z) in y.iter_mut().zip(row.iter()) {
        *v *= z;
    }
}

/// Correlate against all 31 candidate rows, splitting the sequence into
/// `segments` equal parts whose energies are summed.
fn correlate_segments(
    y: &[Complex32; SSS_N],
    s: &Array2<f32>,
    segments: usize,
    output: &mut [f32; SSS_N],
) {
    let nm = SSS_N / segments;
    output.fill(0.0);
    for j in 0..segments {
        for (m, out) in output.iter_mut().enumerate() {
            let row = s.row(m);
            let mut acc = Complex32::zero();
            for i in j * nm..(j + 1) * nm {
                acc += y[i] * row[i];
            }
            *out += acc.norm_sqr();
        }
    }
}

/// Correlate the consecutive-sample conjugate product against the
/// differential candidate rows.
fn correlate_differential(y: &[Complex32; SSS_N], sd: &Array2<f32>, output: &mut [f32; SSS_N]) {
    let mut yprod = [Complex32::zero(); SSS_N - 1];
    for i in 0..SSS_N - 1 {
        yprod[i] = y[i + 1] * y[i].conj();
    }
    for (m, out) in output.iter_mut().enumerate() {
        let row = sd.row(m);
        let mut acc = Complex32::zero();
        for i in 0..SSS_N - 1 {
            acc += yprod[i] * row[i];
        }
        *out = acc.norm_sqr();
    }
}

/// The three base m-sequences, BPSK mapped to +/-1.
fn generate_zsc_tilde() -> ([f32; SSS_N], [f32; SSS_N], [f32; SSS_N]) {
    fn m_sequence(taps: &[usize]) -> [f32; SSS_N] {
        let mut x = [0u8; SSS_N];
        x[4] = 1;
        for i in 0..SSS_N - 5 {
            x[i + 5] = taps.iter().map(|&t| x[i + t]).sum::<u8>() % 2;
        }
        let mut seq = [0.0; SSS_N];
        for (s, &b) in seq.iter_mut().zip(x.iter()) {
            *s = 1.0 - 2.0 * b as f32;
        }
        seq
    }
    let z_tilde = m_sequence(&[4, 2, 1, 0]);
    let s_tilde = m_sequence(&[2, 0]);
    let c_tilde = m_sequence(&[3, 0]);
    (z_tilde, s_tilde, c_tilde)
}

fn cyclic_shift(seq: &[f32; SSS_N], shift: usize) -> [f32; SSS_N] {
    let mut out = [0.0; SSS_N];
    for (i, v) in out.iter_mut().enumerate() {
        *v = seq[(i + shift) % SSS_N];
    }
    out
}

/// Closed-form `(m0, m1)` for a cell identity group (36.211 Table
/// 6.11.2.1-1). For all 168 valid groups `m0 < 30` and `1 <= m1 <= 30`.
fn generate_m0m1(n_id_1: u16) -> (usize, usize) {
    let n = n_id_1 as usize;
    let q_prime = n / 30;
    let q = (n + q_prime * (q_prime + 1) / 2) / 30;
    let m_prime = n + q * (q + 1) / 2;
    let m0 = m_prime % SSS_N;
    let m1 = (m0 + m_prime / SSS_N + 1) % SSS_N;
    (m0, m1)
}

fn build_tables(n_id_2: u8) -> FcTables {
    let (z_tilde, s_tilde, c_tilde) = generate_zsc_tilde();

    let s = Array2::from_shape_fn((SSS_N, SSS_N), |(m, i)| s_tilde[(i + m) % SSS_N]);
    let z1 = Array2::from_shape_fn((SSS_N, SSS_N), |(m, i)| z_tilde[(i + m % 8) % SSS_N]);
    let sd = Array2::from_shape_fn((SSS_N, SSS_N - 1), |(m, j)| {
        s_tilde[(j + 1 + m) % SSS_N] * s_tilde[(j + m) % SSS_N]
    });
    let c0 = cyclic_shift(&c_tilde, n_id_2 as usize);
    let c1 = cyclic_shift(&c_tilde, n_id_2 as usize + 3);

    FcTables { s, z1, sd, c0, c1 }
}
