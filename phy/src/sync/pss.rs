//! Primary Synchronization Signal Detection
//!
//! Generation of the length-62 Zadoff-Chu PSS sequences and their fast
//! cross-correlation against a window of baseband samples. The correlation
//! runs once per call in the frequency domain against a per-`N_id_2`
//! precomputed filter; successive magnitudes are blended into an
//! exponentially-averaged buffer so cell search can integrate over several
//! frames at low SNR.
//!
//! The peak position returned by [`PssDetector::find`] marks the *end* of
//! the PSS symbol data: the symbol occupies `[peak - fft_size, peak)` in the
//! searched window.
//!
//! Reference: 3GPP TS 36.211 version 10.0.0 Release 10 Sec. 6.11.1

use crate::convolution::ConvFft;
use crate::dft::{DftPlan, Direction};
use crate::vector;
use crate::PhyError;
use num_complex::Complex32;
use num_traits::Zero;
use std::f32::consts::PI;
use tracing::debug;

/// Number of PSS subcarriers
pub const PSS_LEN: usize = 62;

const MAX_FFT_SIZE: usize = 2048;

/// What gets accumulated into the smoothed correlation buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeakAccumulation {
    /// Squared magnitude of the correlator output (default)
    MagnitudeSquared,
    /// Plain magnitude
    Magnitude,
}

/// How the reported peak value is derived from the smoothed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeakValueMode {
    /// The smoothed correlation value at the peak (default)
    Absolute,
    /// Ratio of the peak to the strongest sidelobe outside the main lobe
    PeakToSidelobe,
}

/// Low-order anti-alias FIR used when the detector decimates its input.
struct DecimFilter {
    factor: usize,
    taps: Vec<f32>,
}

impl DecimFilter {
    fn new(factor: usize) -> Self {
        let num_taps = 3 * factor + 1;
        let cutoff = 0.45 / factor as f32;
        let m = (num_taps - 1) as f32;
        let mut taps: Vec<f32> = (0..num_taps)
            .map(|i| {
                let x = i as f32 - m / 2.0;
                let sinc = if x == 0.0 {
                    2.0 * cutoff
                } else {
                    (2.0 * PI * cutoff * x).sin() / (PI * x)
                };
                let window = 0.54 - 0.46 * (2.0 * PI * i as f32 / m).cos();
                sinc * window
            })
            .collect();
        let sum: f32 = taps.iter().sum();
        for t in taps.iter_mut() {
            *t /= sum;
        }
        Self { factor, taps }
    }

    /// Constant time shift (in decimated samples) introduced by the filter.
    fn group_delay(&self) -> usize {
        (self.taps.len() - 1) / (2 * self.factor)
    }

    /// Filter and downsample `input` into `output` (`input.len() / factor`
    /// samples).
    fn execute(&self, input: &[Complex32], output: &mut [Complex32]) {
        let n_out = input.len() / self.factor;
        for (k, out) in output[..n_out].iter_mut().enumerate() {
            let center = k * self.factor;
            let mut acc = Complex32::zero();
            for (t, &tap) in self.taps.iter().enumerate() {
                if t <= center {
                    acc += input[center - t] * tap;
                }
            }
            *out = acc;
        }
    }
}

/// PSS detector holding the per-group-id reference waveforms and the
/// smoothed correlation state. All buffers are sized at `init` for the
/// maximum frame/transform sizes; `find` never allocates.
pub struct PssDetector {
    n_id_2: Option<u8>,
    ema_alpha: f32,
    decimate: usize,

    fft_size: usize,
    frame_size: usize,
    max_fft_size: usize,
    max_frame_size: usize,

    dftp_input: DftPlan,
    idftp_input: DftPlan,

    /// Frequency-domain length-62 reference per group id
    pss_signal_freq: [Vec<Complex32>; 3],
    /// Conjugated, 1/62-scaled time-domain reference per group id
    pss_signal_time: [Vec<Complex32>; 3],
    /// Precomputed transform of the time reference for fast convolution
    pss_signal_freq_full: [Vec<Complex32>; 3],

    conv_fft: ConvFft,
    raw_input: Vec<Complex32>,
    tmp_input: Vec<Complex32>,
    conv_output: Vec<Complex32>,
    conv_output_abs: Vec<f32>,
    conv_output_avg: Vec<f32>,

    tmp_fft: Vec<Complex32>,
    tmp_fft2: Vec<Complex32>,
    tmp_filt: Vec<Complex32>,
    tmp_ce: Vec<Complex32>,

    decim_filter: Option<DecimFilter>,
    chest_on_filter: bool,
    cfo_filter_enable: bool,
    accumulation: PeakAccumulation,
    value_mode: PeakValueMode,
    peak_value: f32,
}

impl PssDetector {
    /// Deterministic length-62 Zadoff-Chu reference sequence for a group id.
    pub fn generate(n_id_2: u8) -> Result<Vec<Complex32>, PhyError> {
        const ROOTS: [f32; 3] = [25.0, 29.0, 34.0];
        if n_id_2 > 2 {
            return Err(PhyError::InvalidInput(format!("invalid N_id_2 {}", n_id_2)));
        }
        let root = ROOTS[n_id_2 as usize];
        let mut signal = Vec::with_capacity(PSS_LEN);
        for i in 0..PSS_LEN / 2 {
            let arg = -PI * root * (i as f32 * (i as f32 + 1.0)) / 63.0;
            signal.push(Complex32::new(arg.cos(), arg.sin()));
        }
        for i in PSS_LEN / 2..PSS_LEN {
            let arg = -PI * root * ((i as f32 + 2.0) * (i as f32 + 1.0)) / 63.0;
            signal.push(Complex32::new(arg.cos(), arg.sin()));
        }
        Ok(signal)
    }

    /// Build a detector for windows of up to `max_frame_size` samples at a
    /// transform size of up to `max_fft_size`. `offset` pre-shifts the
    /// frequency references by that many subcarriers (used for the integer
    /// CFO hypothesis detectors); `decimate` enables input decimation.
    pub fn init(
        max_frame_size: usize,
        max_fft_size: usize,
        offset: i32,
        decimate: usize,
    ) -> Result<Self, PhyError> {
        if max_fft_size > MAX_FFT_SIZE || max_fft_size == 0 || max_frame_size == 0 {
            return Err(PhyError::InvalidInput(format!(
                "invalid sizes frame={} fft={}",
                max_frame_size, max_fft_size
            )));
        }
        let decimate = decimate.max(1);
        let fft_size = max_fft_size / decimate;
        let frame_size = max_frame_size / decimate;
        let buffer_size = fft_size + frame_size + 1;

        let mut dftp_input = DftPlan::new(fft_size, Direction::Forward)?;
        dftp_input.set_mirror(true);
        dftp_input.set_dc(true);
        let mut idftp_input = DftPlan::new(fft_size, Direction::Backward)?;
        idftp_input.set_mirror(true);
        idftp_input.set_dc(true);

        let conv_fft = ConvFft::init(frame_size, fft_size)?;

        let mut raw_input = Vec::new();
        let mut tmp_input = Vec::new();
        let mut conv_output = Vec::new();
        let mut conv_output_abs: Vec<f32> = Vec::new();
        let mut conv_output_avg: Vec<f32> = Vec::new();
        raw_input
            .try_reserve_exact(max_frame_size)
            .and_then(|_| tmp_input.try_reserve_exact(buffer_size))
            .and_then(|_| conv_output.try_reserve_exact(buffer_size))
            .map_err(|e| PhyError::Allocation(format!("PSS buffers: {}", e)))?;
        conv_output_abs
            .try_reserve_exact(buffer_size)
            .and_then(|_| conv_output_avg.try_reserve_exact(buffer_size))
            .map_err(|e| PhyError::Allocation(format!("PSS buffers: {}", e)))?;
        raw_input.resize(max_frame_size, Complex32::zero());
        tmp_input.resize(buffer_size, Complex32::zero());
        conv_output.resize(buffer_size, Complex32::zero());
        conv_output_abs.resize(buffer_size, 0.0);
        conv_output_avg.resize(buffer_size, 0.0);

        let mut detector = Self {
            n_id_2: None,
            ema_alpha: 0.2,
            decimate,
            fft_size,
            frame_size,
            max_fft_size,
            max_frame_size,
            dftp_input,
            idftp_input,
            pss_signal_freq: [Vec::new(), Vec::new(), Vec::new()],
            pss_signal_time: [Vec::new(), Vec::new(), Vec::new()],
            pss_signal_freq_full: [Vec::new(), Vec::new(), Vec::new()],
            conv_fft,
            raw_input,
            tmp_input,
            conv_output,
            conv_output_abs,
            conv_output_avg,
            tmp_fft: vec![Complex32::zero(); fft_size],
            tmp_fft2: vec![Complex32::zero(); fft_size],
            tmp_filt: vec![Complex32::zero(); fft_size],
            // identity until the first band-filter run captures an estimate
            tmp_ce: vec![Complex32::new(1.0, 0.0); PSS_LEN],
            decim_filter: (decimate > 1).then(|| DecimFilter::new(decimate)),
            chest_on_filter: false,
            cfo_filter_enable: false,
            accumulation: PeakAccumulation::MagnitudeSquared,
            value_mode: PeakValueMode::Absolute,
            peak_value: 0.0,
        };
        for n_id_2 in 0..3u8 {
            detector.build_reference(n_id_2, offset, buffer_size)?;
        }
        detector.reset();
        debug!(
            "PSS init frame_size={} fft_size={} offset={} decimate={}",
            frame_size, fft_size, offset, decimate
        );
        Ok(detector)
    }

    /// In-place reconfiguration to sizes within the `init`-time maxima.
    /// Prior state is left untouched when the request is rejected.
    pub fn resize(&mut self, frame_size: usize, fft_size: usize, offset: i32) -> Result<(), PhyError> {
        if fft_size > self.max_fft_size || frame_size > self.max_frame_size {
            return Err(PhyError::InvalidInput(format!(
                "resize frame={} fft={} exceeds initialized frame={} fft={}",
                frame_size, fft_size, self.max_frame_size, self.max_fft_size
            )));
        }
        let fft_size = fft_size / self.decimate;
        let frame_size = frame_size / self.decimate;
        let buffer_size = fft_size + frame_size + 1;

        self.dftp_input.replan(fft_size)?;
        self.idftp_input.replan(fft_size)?;
        self.conv_fft.replan(frame_size, fft_size)?;

        self.fft_size = fft_size;
        self.frame_size = frame_size;
        vector::clear(&mut self.tmp_input);
        vector::clear(&mut self.conv_output);
        for v in self.conv_output_abs.iter_mut() {
            *v = 0.0;
        }

        for n_id_2 in 0..3u8 {
            self.build_reference(n_id_2, offset, buffer_size)?;
        }
        self.reset();
        Ok(())
    }

    /// Regenerate the three reference forms for one group id at the current
    /// transform size.
    fn build_reference(&mut self, n_id_2: u8, offset: i32, buffer_size: usize) -> Result<(), PhyError> {
        let fft_size = self.fft_size;
        let freq = Self::generate(n_id_2)?;

        // Zero-padded, carrier-centered spectrum, optionally shifted by the
        // integer-CFO hypothesis offset.
        let mut pad = vec![Complex32::zero(); fft_size];
        let base = (fft_size - PSS_LEN) as i32 / 2 + offset;
        if base < 0 || base as usize + PSS_LEN > fft_size {
            return Err(PhyError::InvalidInput(format!(
                "subcarrier offset {} out of range for fft_size {}",
                offset, fft_size
            )));
        }
        pad[base as usize..base as usize + PSS_LEN].copy_from_slice(&freq);

        let mut time = vec![Complex32::zero(); buffer_size];
        self.idftp_input.set_norm(true);
        self.idftp_input.run(&pad, &mut time[..fft_size]);
        self.idftp_input.set_norm(false);

        // The stored reference is the conjugated time signal scaled by 1/62,
        // so the convolution output peaks at unity for a clean symbol.
        for v in time[..fft_size].iter_mut() {
            *v = v.conj() / PSS_LEN as f32;
        }

        let olen = self.conv_fft.output_len();
        let mut freq_full = vec![Complex32::zero(); buffer_size.max(olen)];
        self.conv_fft.transform_filter(&time[..olen], &mut freq_full[..olen]);

        let idx = n_id_2 as usize;
        self.pss_signal_freq[idx] = freq;
        self.pss_signal_time[idx] = time;
        self.pss_signal_freq_full[idx] = freq_full;
        Ok(())
    }

    /// Group id the correlator searches for.
    pub fn set_n_id_2(&mut self, n_id_2: u8) -> Result<(), PhyError> {
        if n_id_2 > 2 {
            return Err(PhyError::InvalidInput(format!("invalid N_id_2 {}", n_id_2)));
        }
        self.n_id_2 = Some(n_id_2);
        Ok(())
    }

    /// Exponential averaging coefficient for the correlation buffer. Values
    /// outside (0, 1) disable the averaging.
    pub fn set_ema_alpha(&mut self, alpha: f32) {
        self.ema_alpha = alpha;
    }

    pub fn set_accumulation(&mut self, accumulation: PeakAccumulation) {
        self.accumulation = accumulation;
    }

    pub fn set_value_mode(&mut self, mode: PeakValueMode) {
        self.value_mode = mode;
    }

    /// Capture the channel estimate while band-filtering (see
    /// [`PssDetector::filter`]).
    pub fn set_chest_on_filter(&mut self, enable: bool) {
        self.chest_on_filter = enable;
    }

    /// Band-filter the symbol inside [`PssDetector::cfo_compute`].
    pub fn set_cfo_filter_enable(&mut self, enable: bool) {
        self.cfo_filter_enable = enable;
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Smoothed correlation value at the last peak.
    pub fn peak_value(&self) -> f32 {
        self.peak_value
    }

    /// Channel estimate captured by the last band-filter run.
    pub fn cached_channel_estimate(&self) -> &[Complex32] {
        &self.tmp_ce
    }

    /// Clear the smoothed correlation buffer. References and plans persist.
    pub fn reset(&mut self) {
        let buffer_size = self.fft_size + self.frame_size + 1;
        for v in self.conv_output_avg[..buffer_size].iter_mut() {
            *v = 0.0;
        }
    }

    /// Cross-correlate `input` against the reference for the configured
    /// group id and return `(peak_position, peak_value)`.
    ///
    /// `input` must hold at least `frame_size * decimate` samples. The peak
    /// position marks the end of the PSS symbol data in input samples
    /// (corrected for the filter group delay when decimating).
    pub fn find(&mut self, input: &[Complex32]) -> Result<(usize, f32), PhyError> {
        let n_id_2 = self
            .n_id_2
            .ok_or_else(|| PhyError::InvalidInput("N_id_2 not set before find".into()))? as usize;
        let needed = self.frame_size * self.decimate;
        if input.len() < needed {
            return Err(PhyError::InvalidInput(format!(
                "find window {} shorter than {}",
                input.len(),
                needed
            )));
        }

        if let Some(filter) = &self.decim_filter {
            self.raw_input[..needed].copy_from_slice(&input[..needed]);
            filter.execute(&self.raw_input[..needed], &mut self.tmp_input[..self.frame_size]);
        } else {
            self.tmp_input[..self.frame_size].copy_from_slice(&input[..self.frame_size]);
        }

        let olen = self.conv_fft.output_len();
        let valid = self.conv_fft.run(
            &self.tmp_input[..olen],
            &self.pss_signal_freq_full[n_id_2][..olen],
            &mut self.conv_output[..olen],
        ) - 1;

        match self.accumulation {
            PeakAccumulation::MagnitudeSquared => {
                vector::abs_square(&self.conv_output[..valid], &mut self.conv_output_abs[..valid]);
            }
            PeakAccumulation::Magnitude => {
                vector::abs(&self.conv_output[..valid], &mut self.conv_output_abs[..valid]);
            }
        }

        if self.ema_alpha > 0.0 && self.ema_alpha < 1.0 {
            for (avg, &new) in self.conv_output_avg[..valid]
                .iter_mut()
                .zip(self.conv_output_abs[..valid].iter())
            {
                *avg = vector::ema(new, *avg, self.ema_alpha);
            }
        } else {
            self.conv_output_avg[..valid].copy_from_slice(&self.conv_output_abs[..valid]);
        }

        let mut peak_pos = vector::max_index(&self.conv_output_avg[..valid]);
        self.peak_value = self.conv_output_avg[peak_pos];
        let value = match self.value_mode {
            PeakValueMode::Absolute => self.peak_value,
            PeakValueMode::PeakToSidelobe => {
                peak_to_sidelobe(&self.conv_output_avg[..valid], peak_pos)
            }
        };

        if let Some(filter) = &self.decim_filter {
            peak_pos = peak_pos.saturating_sub(filter.group_delay()) * filter.factor;
        }

        Ok((peak_pos, value))
    }

    /// One-tap per-subcarrier channel estimate at the detected PSS position.
    /// `input` is the PSS symbol (`fft_size` samples), `ce` receives 62 taps.
    pub fn channel_estimate(&mut self, input: &[Complex32], ce: &mut [Complex32]) -> Result<(), PhyError> {
        let n_id_2 = self
            .n_id_2
            .ok_or_else(|| PhyError::InvalidInput("N_id_2 not set before channel_estimate".into()))?
            as usize;
        if input.len() < self.fft_size || ce.len() < PSS_LEN {
            return Err(PhyError::InvalidInput(
                "channel_estimate buffer too short".into(),
            ));
        }
        self.dftp_input.run(input, &mut self.tmp_fft);
        let base = (self.fft_size - PSS_LEN) / 2;
        // The reference has unit magnitude, so the conjugate product divides
        // out the known symbol.
        vector::prod_conj(
            &self.tmp_fft[base..base + PSS_LEN],
            &self.pss_signal_freq[n_id_2],
            &mut ce[..PSS_LEN],
        );
        Ok(())
    }

    /// Band-filter one symbol to the central 62 subcarriers. When
    /// `chest_on_filter` is set the channel estimate is captured from the
    /// masked spectrum as a side effect.
    pub fn filter(&mut self, input: &[Complex32], output: &mut [Complex32]) {
        let base = (self.fft_size - PSS_LEN) / 2;
        self.dftp_input.run(input, &mut self.tmp_fft);
        vector::clear(&mut self.tmp_fft2);
        self.tmp_fft2[base..base + PSS_LEN].copy_from_slice(&self.tmp_fft[base..base + PSS_LEN]);
        if self.chest_on_filter {
            if let Some(n_id_2) = self.n_id_2 {
                vector::prod_conj(
                    &self.tmp_fft2[base..base + PSS_LEN],
                    &self.pss_signal_freq[n_id_2 as usize],
                    &mut self.tmp_ce,
                );
            }
        }
        self.idftp_input.run(&self.tmp_fft2, output);
    }

    /// PSS-based fractional CFO estimate in subcarrier units.
    ///
    /// Correlates each half of the received symbol against the stored
    /// reference halves; the phase advance between the halves is
    /// `pi * cfo`.
    pub fn cfo_compute(&mut self, pss_recv: &[Complex32]) -> Result<f32, PhyError> {
        let n_id_2 = self
            .n_id_2
            .ok_or_else(|| PhyError::InvalidInput("N_id_2 not set before cfo_compute".into()))?
            as usize;
        if pss_recv.len() < self.fft_size {
            return Err(PhyError::InvalidInput("cfo_compute window too short".into()));
        }
        let half = self.fft_size / 2;
        let (y0, y1) = if self.cfo_filter_enable {
            let mut filt = std::mem::take(&mut self.tmp_filt);
            self.filter(pss_recv, &mut filt);
            let y0 = vector::dot_prod(&self.pss_signal_time[n_id_2][..half], &filt[..half]);
            let y1 = vector::dot_prod(
                &self.pss_signal_time[n_id_2][half..2 * half],
                &filt[half..2 * half],
            );
            self.tmp_filt = filt;
            (y0, y1)
        } else {
            let y0 = vector::dot_prod(&self.pss_signal_time[n_id_2][..half], &pss_recv[..half]);
            let y1 = vector::dot_prod(
                &self.pss_signal_time[n_id_2][half..2 * half],
                &pss_recv[half..2 * half],
            );
            (y0, y1)
        };
        Ok((y0.conj() * y1).arg() / PI)
    }
}

/// Ratio of the peak to the strongest lobe outside the main lobe.
fn peak_to_sidelobe(avg: &[f32], peak: usize) -> f32 {
    let len = avg.len();
    // walk down the right slope of the main lobe
    let mut right = peak + 1;
    while right + 1 < len && avg[right + 1] <= avg[right] {
        right += 1;
    }
    // and the left slope
    let mut left = peak.saturating_sub(1);
    while left > 1 && avg[left - 1] <= avg[left] {
        left -= 1;
    }

    let mut sidelobe = 0.0f32;
    if right + 1 < len {
        sidelobe = sidelobe.max(avg[right + 1 + vector::max_index(&avg[right + 1..])]);
    }
    if left > 0 {
        sidelobe = sidelobe.max(avg[vector::max_index(&avg[..left])]);
    }
    if sidelobe > 0.0 {
        avg[peak] / sidelobe
    } else {
        avg[peak]
    }
}
