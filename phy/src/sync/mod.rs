//! Time and Frequency Synchronization
//!
//! Finds LTE frame timing and the transmitting cell identity in a window of
//! complex baseband samples using the PSS and SSS signals, estimates and
//! corrects the carrier frequency offset in up to three stages (integer,
//! cyclic-prefix based and PSS based), and detects the cyclic prefix length.
//!
//! The [`SyncEngine`] composes one [`PssDetector`] (plus two auxiliary
//! detectors for the integer-CFO hypotheses), one [`SssDetector`], one
//! [`CpSynchronizer`] and two [`CfoCorrector`]s. One call to
//! [`SyncEngine::find`] runs the whole pipeline for one candidate window;
//! the caller owns retry policy and radio control. No instance method is
//! safe to call from two threads at once; run one engine per thread.
//!
//! Reference: 3GPP TS 36.211 version 10.0.0 Release 10 Sec. 6.11.1, 6.11.2

pub mod cfo;
pub mod cp;
pub mod pss;
pub mod sss;

pub use cfo::{CfoCorrector, CfoStrategy};
pub use cp::CpSynchronizer;
pub use pss::{PeakAccumulation, PeakValueMode, PssDetector, PSS_LEN};
pub use sss::{SssAlgorithm, SssDetector, SSS_LEN};

use crate::vector;
use crate::PhyError;
use common::Pci;
use num_complex::Complex32;
use num_traits::Zero;
use std::f32::consts::PI;
use tracing::debug;

/// Smallest supported transform size
pub const SYNC_FFT_SZ_MIN: usize = 64;
/// Largest supported transform size
pub const SYNC_FFT_SZ_MAX: usize = 2048;

/// LTE subcarrier spacing
pub const SUBCARRIER_SPACING_HZ: f32 = 15_000.0;

const CFO_EMA_ALPHA: f32 = 0.1;
const DEFAULT_CFO_TOL_HZ: f32 = 0.0;
/// PSS-based CFO estimates beyond this are treated as outliers
const MAX_CFO_PSS_OFFSET_HZ: f32 = 7_000.0;

/// Reference CP lengths at a 2048-point transform
pub(crate) const CP_NORM_SCALE: usize = 144;
pub(crate) const CP_EXT_SCALE: usize = 512;

/// CP length for a transform size, from the 2048-point reference length
pub(crate) fn cp_len(symbol_sz: usize, scale: usize) -> usize {
    (scale * symbol_sz + 2047) / 2048
}

fn fft_size_is_valid(fft_size: usize) -> bool {
    (SYNC_FFT_SZ_MIN..=SYNC_FFT_SZ_MAX).contains(&fft_size) && fft_size % 64 == 0
}

/// Cyclic prefix type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclicPrefix {
    Normal,
    Extended,
}

/// Outcome of one [`SyncEngine::find`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncFindResult {
    /// Peak above threshold with room for SSS/CP analysis
    Found,
    /// Peak above threshold but too close to the window end; retry with a
    /// larger window or offset
    FoundNoSpace,
    /// No peak above threshold
    NotFound,
}

/// Working buffers for one `find` call, allocated once at `init`.
#[derive(Default)]
struct Scratch {
    /// Two frame-sized slots for the CFO-corrected working copies
    temp: Vec<Complex32>,
    pss_filt: Vec<Complex32>,
    sss_filt: Vec<Complex32>,
}

/// Which buffer currently holds the working signal.
#[derive(Clone, Copy, PartialEq)]
enum Buf {
    Input,
    SlotA,
    SlotB,
}

/// PSS/SSS synchronization engine.
///
/// All buffers are allocated in `init`/`resize`/`set_cfo_i_enable`; `find`
/// performs no heap allocation.
pub struct SyncEngine {
    pss: PssDetector,
    pss_i: Option<Box<[PssDetector; 2]>>,
    sss: SssDetector,
    cp_synch: CpSynchronizer,
    cfo_corr_frame: CfoCorrector,
    cfo_corr_symbol: CfoCorrector,
    /// Per-sample derotation for the -1/+1 integer-CFO hypotheses
    cfo_i_corr: [Vec<Complex32>; 2],
    scratch: Scratch,

    decimate: usize,
    fft_size: usize,
    frame_size: usize,
    max_offset: usize,
    max_frame_size: usize,

    threshold: f32,
    peak_value: f32,
    peak_pos: usize,

    n_id_2: Option<u8>,
    n_id_1: Option<u16>,
    sf_idx: u32,

    cp: CyclicPrefix,
    cp_len: usize,
    nof_symbols: usize,
    detect_cp: bool,
    sss_en: bool,
    sss_alg: SssAlgorithm,
    sss_channel_equalize: bool,
    pss_filtering_enabled: bool,

    cfo_i_enable: bool,
    cfo_cp_enable: bool,
    cfo_pss_enable: bool,
    cfo_cp_is_set: bool,
    cfo_pss_is_set: bool,
    cfo_cp_mean: f32,
    cfo_pss: f32,
    cfo_pss_mean: f32,
    cfo_i_value: i32,
    cfo_ema_alpha: f32,
    cfo_cp_nsymbols: usize,
    current_cfo_tol: f32,
}

impl SyncEngine {
    /// Build an engine searching windows of `frame_size` samples for a peak
    /// within the first `max_offset` positions, at the given transform size.
    pub fn init(frame_size: usize, max_offset: usize, fft_size: usize) -> Result<Self, PhyError> {
        Self::init_decim(frame_size, max_offset, fft_size, 1)
    }

    /// As [`SyncEngine::init`], decimating the PSS search by `decimate`.
    pub fn init_decim(
        frame_size: usize,
        max_offset: usize,
        fft_size: usize,
        decimate: usize,
    ) -> Result<Self, PhyError> {
        if !fft_size_is_valid(fft_size) {
            return Err(PhyError::InvalidInput(format!(
                "invalid fft_size {} (must be a multiple of 64 in [{}, {}])",
                fft_size, SYNC_FFT_SZ_MIN, SYNC_FFT_SZ_MAX
            )));
        }
        if max_offset > frame_size || max_offset == 0 {
            return Err(PhyError::InvalidInput(format!(
                "max_offset {} must be within frame_size {}",
                max_offset, frame_size
            )));
        }
        let decimate = decimate.max(1);

        let pss = PssDetector::init(max_offset, fft_size, 0, decimate)?;
        let sss = SssDetector::init(fft_size)?;
        let cp_synch = CpSynchronizer::init(fft_size)?;
        let cfo_corr_frame = CfoCorrector::new(frame_size)?;
        let cfo_corr_symbol = CfoCorrector::new(fft_size)?;

        let mut scratch = Scratch::default();
        scratch
            .temp
            .try_reserve_exact(2 * frame_size)
            .and_then(|_| scratch.pss_filt.try_reserve_exact(fft_size))
            .and_then(|_| scratch.sss_filt.try_reserve_exact(fft_size))
            .map_err(|e| PhyError::Allocation(format!("sync buffers: {}", e)))?;
        scratch.temp.resize(2 * frame_size, Complex32::zero());
        scratch.pss_filt.resize(fft_size, Complex32::zero());
        scratch.sss_filt.resize(fft_size, Complex32::zero());

        let mut cfo_i_corr = [Vec::new(), Vec::new()];
        for table in cfo_i_corr.iter_mut() {
            table
                .try_reserve_exact(frame_size)
                .map_err(|e| PhyError::Allocation(format!("integer CFO tables: {}", e)))?;
            table.resize(frame_size, Complex32::zero());
        }

        let mut engine = Self {
            pss,
            pss_i: None,
            sss,
            cp_synch,
            cfo_corr_frame,
            cfo_corr_symbol,
            cfo_i_corr,
            scratch,
            decimate,
            fft_size,
            frame_size,
            max_offset,
            max_frame_size: frame_size,
            threshold: 0.0,
            peak_value: 0.0,
            peak_pos: 0,
            n_id_2: None,
            n_id_1: None,
            sf_idx: 0,
            cp: CyclicPrefix::Normal,
            cp_len: 0,
            nof_symbols: 0,
            detect_cp: true,
            sss_en: true,
            sss_alg: SssAlgorithm::Full,
            sss_channel_equalize: false,
            pss_filtering_enabled: false,
            cfo_i_enable: false,
            cfo_cp_enable: false,
            cfo_pss_enable: false,
            cfo_cp_is_set: false,
            cfo_pss_is_set: false,
            cfo_cp_mean: 0.0,
            cfo_pss: 0.0,
            cfo_pss_mean: 0.0,
            cfo_i_value: 0,
            cfo_ema_alpha: CFO_EMA_ALPHA,
            cfo_cp_nsymbols: 3,
            current_cfo_tol: DEFAULT_CFO_TOL_HZ,
        };
        engine.set_cp(CyclicPrefix::Normal);
        engine.set_cfo_tolerance(DEFAULT_CFO_TOL_HZ);
        debug!(
            "SYNC init frame_size={} max_offset={} fft_size={} decimate={}",
            frame_size, max_offset, fft_size, decimate
        );
        Ok(engine)
    }

    /// In-place reconfiguration to a `frame_size` within the `init`-time
    /// maximum (cell bandwidth changes). Rejected requests leave prior state
    /// unmodified.
    pub fn resize(
        &mut self,
        frame_size: usize,
        max_offset: usize,
        fft_size: usize,
    ) -> Result<(), PhyError> {
        if !fft_size_is_valid(fft_size) {
            return Err(PhyError::InvalidInput(format!("invalid fft_size {}", fft_size)));
        }
        if frame_size > self.max_frame_size || max_offset > frame_size || max_offset == 0 {
            return Err(PhyError::InvalidInput(format!(
                "resize frame_size={} max_offset={} exceeds initialized frame_size={}",
                frame_size, max_offset, self.max_frame_size
            )));
        }

        self.pss.resize(max_offset, fft_size, 0)?;
        self.sss.resize(fft_size)?;
        self.cp_synch.resize(fft_size)?;
        self.cfo_corr_frame.resize(frame_size)?;
        self.cfo_corr_symbol.resize(fft_size)?;

        self.fft_size = fft_size;
        self.frame_size = frame_size;
        self.max_offset = max_offset;

        if self.pss_i.is_some() {
            self.rebuild_cfo_i()?;
        }
        self.set_cfo_tolerance(self.current_cfo_tol);
        self.set_cp(self.cp);
        debug!(
            "SYNC resize frame_size={} max_offset={} fft_size={}",
            frame_size, max_offset, fft_size
        );
        Ok(())
    }

    /// Group id to search for. Must be called before `find`.
    pub fn set_n_id_2(&mut self, n_id_2: u8) -> Result<(), PhyError> {
        if n_id_2 > 2 {
            return Err(PhyError::InvalidInput(format!("invalid N_id_2 {}", n_id_2)));
        }
        self.n_id_2 = Some(n_id_2);
        Ok(())
    }

    /// Peak detection threshold; 0 accepts every peak (acquisition mode).
    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
    }

    /// PSS correlation averaging coefficient.
    pub fn set_ema_alpha(&mut self, alpha: f32) {
        self.pss.set_ema_alpha(alpha);
    }

    /// CFO averaging coefficient for the CP and PSS stages.
    pub fn set_cfo_ema_alpha(&mut self, alpha: f32) {
        self.cfo_ema_alpha = alpha;
    }

    pub fn set_sss_algorithm(&mut self, algorithm: SssAlgorithm) {
        self.sss_alg = algorithm;
    }

    pub fn set_sss_enable(&mut self, enable: bool) {
        self.sss_en = enable;
    }

    pub fn set_cp_detection(&mut self, enable: bool) {
        self.detect_cp = enable;
    }

    /// Manual CP selection; also derives the CP length and symbol count for
    /// the current sizes.
    pub fn set_cp(&mut self, cp: CyclicPrefix) {
        self.cp = cp;
        self.cp_len = match cp {
            CyclicPrefix::Normal => cp_len(self.fft_size, CP_NORM_SCALE),
            CyclicPrefix::Extended => cp_len(self.fft_size, CP_EXT_SCALE),
        };
        self.nof_symbols = if self.frame_size < self.fft_size {
            1
        } else {
            self.frame_size / (self.fft_size + self.cp_len) - 1
        };
    }

    /// Enable the integer-CFO stage, lazily building the two pre-shifted
    /// auxiliary detectors on first use.
    pub fn set_cfo_i_enable(&mut self, enable: bool) -> Result<(), PhyError> {
        self.cfo_i_enable = enable;
        if enable && self.pss_i.is_none() {
            self.rebuild_cfo_i()?;
        }
        Ok(())
    }

    fn rebuild_cfo_i(&mut self) -> Result<(), PhyError> {
        let low = PssDetector::init(self.max_offset, self.fft_size, -1, 1)?;
        let high = PssDetector::init(self.max_offset, self.fft_size, 1, 1)?;
        self.pss_i = Some(Box::new([low, high]));
        for (table, offset) in self.cfo_i_corr.iter_mut().zip([-1.0f32, 1.0]) {
            for (t, v) in table[..self.frame_size].iter_mut().enumerate() {
                let arg = -2.0 * PI * offset * t as f32 / self.fft_size as f32;
                *v = Complex32::new(arg.cos(), arg.sin());
            }
        }
        Ok(())
    }

    /// Enable the CP-based fractional CFO stage using `nof_symbols` symbols
    /// per estimate.
    pub fn set_cfo_cp_enable(&mut self, enable: bool, nof_symbols: usize) {
        self.cfo_cp_enable = enable;
        self.cfo_cp_nsymbols = nof_symbols;
    }

    pub fn set_cfo_pss_enable(&mut self, enable: bool) {
        self.cfo_pss_enable = enable;
    }

    /// Filter the central PRBs before PSS-based CFO estimation.
    pub fn set_pss_filter_enable(&mut self, enable: bool) {
        self.pss_filtering_enabled = enable;
    }

    /// Equalize the SSS symbol with the PSS channel estimate (implies PSS
    /// filtering).
    pub fn set_sss_equalize_enable(&mut self, enable: bool) {
        self.sss_channel_equalize = enable;
        if enable {
            self.pss_filtering_enabled = true;
            self.pss.set_chest_on_filter(true);
        }
    }

    /// CFO corrector regeneration tolerance in Hz.
    pub fn set_cfo_tolerance(&mut self, tol_hz: f32) {
        self.current_cfo_tol = tol_hz;
        let normalized = tol_hz / (SUBCARRIER_SPACING_HZ * self.fft_size as f32);
        self.cfo_corr_frame.set_tolerance(normalized);
        self.cfo_corr_symbol.set_tolerance(normalized);
    }

    /// Physical cell id, meaningful once `find` returned `Found` with SSS
    /// detection enabled.
    pub fn cell_id(&self) -> Option<Pci> {
        match (self.n_id_1, self.n_id_2) {
            (Some(n_id_1), Some(n_id_2)) => Pci::from_ids(n_id_1, n_id_2),
            _ => None,
        }
    }

    /// Whether the last `find` recovered a valid secondary id.
    pub fn sss_detected(&self) -> bool {
        self.n_id_1.is_some()
    }

    /// Subframe index (0 or 5) from the last SSS detection.
    pub fn subframe_index(&self) -> u32 {
        self.sf_idx
    }

    /// Total CFO estimate in subcarrier units.
    pub fn cfo(&self) -> f32 {
        self.cfo_cp_mean + self.cfo_pss_mean + self.cfo_i_value as f32
    }

    /// Total CFO estimate in Hz.
    pub fn cfo_hz(&self) -> f32 {
        self.cfo() * SUBCARRIER_SPACING_HZ
    }

    pub fn peak_value(&self) -> f32 {
        self.peak_value
    }

    /// Position of the last correlation peak (end of the PSS symbol data,
    /// relative to the start of the searched window).
    pub fn peak_position(&self) -> usize {
        self.peak_pos
    }

    pub fn cp(&self) -> CyclicPrefix {
        self.cp
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// PSS search decimation factor.
    pub fn decimate(&self) -> usize {
        self.decimate
    }

    /// Number of whole OFDM symbols fitting in the frame for the current CP.
    pub fn nof_symbols(&self) -> usize {
        self.nof_symbols
    }

    /// Clear the CFO accumulators.
    pub fn reset_cfo(&mut self) {
        self.cfo_cp_mean = 0.0;
        self.cfo_cp_is_set = false;
        self.cfo_pss_mean = 0.0;
        self.cfo_pss_is_set = false;
    }

    /// Seed CFO state from another engine to avoid transients when handing
    /// a cell between searcher and tracker instances.
    pub fn copy_cfo_from(&mut self, other: &SyncEngine) {
        self.cfo_cp_mean = other.cfo_cp_mean;
        self.cfo_pss_mean = other.cfo_pss_mean;
        self.cfo_i_value = other.cfo_i_value;
        self.cfo_cp_is_set = false;
        self.cfo_pss_is_set = false;
    }

    /// Clear the smoothed PSS average and the CP decision averages.
    /// Configuration persists.
    pub fn reset(&mut self) {
        self.cp_synch.reset();
        self.pss.reset();
    }

    /// Find the PSS previously selected with [`SyncEngine::set_n_id_2`]
    /// starting at `find_offset` in `input`, then run the enabled CFO, SSS
    /// and CP stages around the peak.
    ///
    /// The caller's buffer is never modified; corrections are applied to
    /// internal copies. Detected results persist until the next call and are
    /// read through the getters.
    pub fn find(
        &mut self,
        input: &[Complex32],
        find_offset: usize,
    ) -> Result<SyncFindResult, PhyError> {
        let n_id_2 = self
            .n_id_2
            .ok_or_else(|| PhyError::InvalidInput("N_id_2 must be set before find".into()))?;
        if input.len() < self.frame_size || find_offset + self.max_offset > self.frame_size {
            return Err(PhyError::InvalidInput(format!(
                "window of {} samples with find_offset {} too short for frame_size {} + max_offset {}",
                input.len(),
                find_offset,
                self.frame_size,
                self.max_offset
            )));
        }

        let mut scratch = std::mem::take(&mut self.scratch);
        let result = self.find_inner(input, find_offset, n_id_2, &mut scratch);
        self.scratch = scratch;
        result
    }

    fn find_inner(
        &mut self,
        input: &[Complex32],
        find_offset: usize,
        n_id_2: u8,
        scratch: &mut Scratch,
    ) -> Result<SyncFindResult, PhyError> {
        let frame = self.frame_size;
        let fft = self.fft_size;
        let (slot_a, slot_b) = scratch.temp.split_at_mut(self.max_frame_size);
        let mut cur = Buf::Input;
        let mut peak_pos = 0usize;

        // First CFO estimation stage is integer: find the max PSS
        // correlation over the -1/0/+1 subcarrier-shifted reference sets.
        if self.cfo_i_enable {
            let pss_i = self
                .pss_i
                .as_mut()
                .ok_or_else(|| PhyError::Processing("integer CFO stage not initialized".into()))?;
            let (low, high) = pss_i.split_at_mut(1);
            let detectors: [&mut PssDetector; 3] = [&mut low[0], &mut self.pss, &mut high[0]];
            let mut best_value = f32::MIN;
            for (hypothesis, detector) in detectors.into_iter().enumerate() {
                detector.set_n_id_2(n_id_2)?;
                let (pos, value) = detector.find(&input[find_offset..])?;
                if value > best_value {
                    best_value = value;
                    peak_pos = pos;
                    self.cfo_i_value = hypothesis as i32 - 1;
                }
            }
            self.peak_value = best_value;

            // Correct using the precomputed exponential; the caller's buffer
            // stays untouched.
            if self.cfo_i_value != 0 {
                let table = &self.cfo_i_corr[if self.cfo_i_value < 0 { 0 } else { 1 }];
                vector::prod(&input[..frame], &table[..frame], &mut slot_a[..frame]);
                cur = Buf::SlotA;
                debug!("Compensating cfo_i={}", self.cfo_i_value);
            }
        }

        // Second stage: coarse fractional CFO from the CP autocorrelation.
        if self.cfo_cp_enable {
            let cfo_cp = {
                let w: &[Complex32] = match cur {
                    Buf::Input => input,
                    Buf::SlotA => &slot_a[..frame],
                    Buf::SlotB => &slot_b[..frame],
                };
                let offset = self.cp_synch.synchronize(
                    w,
                    self.max_offset,
                    self.cfo_cp_nsymbols,
                    cp_len(fft, CP_NORM_SCALE),
                );
                let corr = self.cp_synch.corr_output(offset);
                -corr.arg() / (2.0 * PI)
            };
            if self.cfo_cp_is_set {
                self.cfo_cp_mean = vector::ema(cfo_cp, self.cfo_cp_mean, self.cfo_ema_alpha);
            } else {
                self.cfo_cp_mean = cfo_cp;
                self.cfo_cp_is_set = true;
            }
            debug!("CP-CFO: estimated={:.4}, mean={:.4}", cfo_cp, self.cfo_cp_mean);

            let freq = -self.cfo_cp_mean / fft as f32;
            match cur {
                Buf::Input => {
                    self.cfo_corr_frame.correct(&input[..frame], &mut slot_a[..frame], freq);
                    cur = Buf::SlotA;
                }
                Buf::SlotA => {
                    self.cfo_corr_frame
                        .correct(&slot_a[..frame], &mut slot_b[..frame], freq);
                    cur = Buf::SlotB;
                }
                Buf::SlotB => {
                    self.cfo_corr_frame
                        .correct(&slot_b[..frame], &mut slot_a[..frame], freq);
                    cur = Buf::SlotA;
                }
            }
        }

        // PSS correlation, unless the integer stage already localized it.
        if !self.cfo_i_enable {
            self.pss.set_n_id_2(n_id_2)?;
            let w: &[Complex32] = match cur {
                Buf::Input => input,
                Buf::SlotA => &slot_a[..frame],
                Buf::SlotB => &slot_b[..frame],
            };
            let (pos, value) = self.pss.find(&w[find_offset..])?;
            peak_pos = pos;
            self.peak_value = value;
        }
        self.peak_pos = peak_pos;
        debug!(
            "PSS: id={}, peak_pos={}, peak_value={:.3}",
            n_id_2, peak_pos, self.peak_value
        );

        let result = if self.peak_value >= self.threshold || self.threshold == 0.0 {
            let w: &[Complex32] = match cur {
                Buf::Input => input,
                Buf::SlotA => &slot_a[..frame],
                Buf::SlotB => &slot_b[..frame],
            };
            let peak_total = find_offset + peak_pos;

            // PSS-based fractional CFO over the detected symbol.
            if self.cfo_pss_enable && peak_pos >= fft && peak_total <= w.len() {
                let pss_window = &w[peak_total - fft..peak_total];
                let pss_ptr: &[Complex32] = if self.pss_filtering_enabled {
                    self.pss.filter(pss_window, &mut scratch.pss_filt[..fft]);
                    &scratch.pss_filt[..fft]
                } else {
                    pss_window
                };
                self.cfo_pss = self.pss.cfo_compute(pss_ptr)?;
                if !self.cfo_pss_is_set {
                    self.cfo_pss_mean = self.cfo_pss;
                    self.cfo_pss_is_set = true;
                } else if SUBCARRIER_SPACING_HZ * self.cfo_pss.abs() < MAX_CFO_PSS_OFFSET_HZ {
                    self.cfo_pss_mean =
                        vector::ema(self.cfo_pss, self.cfo_pss_mean, self.cfo_ema_alpha);
                }
                debug!(
                    "PSS-CFO: filter={}, estimated={:.4}, mean={:.4}",
                    self.pss_filtering_enabled, self.cfo_pss, self.cfo_pss_mean
                );
            }

            // SSS and CP detection need two full symbols before the peak.
            let have_room =
                peak_total >= 2 * (fft + cp_len(fft, CP_EXT_SCALE)) && peak_total <= w.len();
            if have_room {
                if self.sss_en {
                    self.n_id_1 = None;

                    let sss_idx = peak_total - 2 * fft - self.cp_len;
                    let mut sss_ptr: &[Complex32] = &w[sss_idx..sss_idx + fft];

                    // Correct the symbol with the PSS-based CFO estimate.
                    if self.cfo_pss_enable {
                        self.cfo_corr_symbol.correct(
                            sss_ptr,
                            &mut scratch.sss_filt[..fft],
                            -self.cfo_pss_mean / fft as f32,
                        );
                        sss_ptr = &scratch.sss_filt[..fft];
                    }

                    self.sss.set_n_id_2(n_id_2)?;
                    let use_ce = self.sss_channel_equalize
                        && self.pss_filtering_enabled
                        && self.cfo_pss_enable;
                    let (m0, _, m1, _) = if use_ce {
                        self.sss.m0m1(
                            sss_ptr,
                            Some(self.pss.cached_channel_estimate()),
                            self.sss_alg,
                        )?
                    } else {
                        self.sss.m0m1(sss_ptr, None, self.sss_alg)?
                    };
                    self.sf_idx = SssDetector::subframe_index(m0, m1);
                    self.n_id_1 = self.sss.n_id_1(m0, m1);
                    if let Some(n_id_1) = self.n_id_1 {
                        debug!(
                            "SSS detected N_id_1={}, sf_idx={}, {:?} CP",
                            n_id_1, self.sf_idx, self.cp
                        );
                    }
                }

                if self.detect_cp {
                    let cp = self.cp_synch.detect(w, peak_total);
                    self.set_cp(cp);
                }

                SyncFindResult::Found
            } else {
                SyncFindResult::FoundNoSpace
            }
        } else {
            SyncFindResult::NotFound
        };

        debug!(
            "SYNC ret={:?} N_id_2={} find_offset={} frame_len={} pos={} peak={:.2} threshold={:.2} sf_idx={} CFO={:.3} kHz",
            result,
            n_id_2,
            find_offset,
            frame,
            peak_pos,
            self.peak_value,
            self.threshold,
            self.sf_idx,
            self.cfo_hz() / 1000.0
        );
        Ok(result)
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::pss::{PssDetector, PSS_LEN};
    use super::sss::SSS_LEN;
    use crate::dft::{DftPlan, Direction};
    use num_complex::Complex32;
    use num_traits::Zero;

    /// Inverse-transform a centered, DC-stripped 62-subcarrier spectrum into
    /// one time-domain OFDM symbol, the way the transmit side builds the
    /// synchronization symbols.
    pub fn centered_time_symbol(band: &[Complex32], fft_size: usize) -> Vec<Complex32> {
        assert_eq!(band.len(), PSS_LEN, "synchronization symbols occupy 62 subcarriers");
        let mut pad = vec![Complex32::zero(); fft_size];
        let base = (fft_size - band.len()) / 2;
        pad[base..base + band.len()].copy_from_slice(band);
        let mut plan = DftPlan::new(fft_size, Direction::Backward).unwrap();
        plan.set_mirror(true);
        plan.set_dc(true);
        plan.set_norm(true);
        let mut time = vec![Complex32::zero(); fft_size];
        plan.run(&pad, &mut time);
        time
    }

    /// Time-domain PSS symbol for a group id.
    pub fn pss_time_symbol(n_id_2: u8, fft_size: usize) -> Vec<Complex32> {
        let freq = PssDetector::generate(n_id_2).unwrap();
        centered_time_symbol(&freq, fft_size)
    }

    /// Time-domain SSS symbol from one of the generated 62-length sequences.
    pub fn sss_time_symbol(signal: &[f32; SSS_LEN], fft_size: usize) -> Vec<Complex32> {
        let band: Vec<Complex32> = signal.iter().map(|&v| Complex32::new(v, 0.0)).collect();
        centered_time_symbol(&band, fft_size)
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{centered_time_symbol, pss_time_symbol, sss_time_symbol};
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const FFT: usize = 128;
    const FRAME: usize = 1920;
    const MAX_OFFSET: usize = 1792;

    /// One 5 ms half frame's first slot plus filler: 14 contiguous
    /// normal-CP symbols, with the SSS in symbol 5 and the PSS in symbol 6
    /// so the PSS symbol data ends exactly at sample 960.
    fn half_frame(pci: Pci, subframe5: bool) -> Vec<Complex32> {
        let mut rng = StdRng::seed_from_u64(0x3640 + pci.value() as u64);
        let cp = cp_len(FFT, CP_NORM_SCALE);
        let (signal0, signal5) = SssDetector::generate(pci);
        let sss_signal = if subframe5 { signal5 } else { signal0 };

        let mut buffer = vec![Complex32::zero(); FRAME];
        let mut pos = 0;
        for sym in 0..14 {
            let cplen = if sym % 7 == 0 { cp + 1 } else { cp };
            let data = match sym {
                5 => sss_time_symbol(&sss_signal, FFT),
                6 => pss_time_symbol(pci.n_id_2(), FFT),
                _ => {
                    // filler data symbol: random occupied subcarriers
                    let band: Vec<Complex32> = (0..PSS_LEN)
                        .map(|_| {
                            Complex32::new(
                                if rng.gen::<bool>() { 0.7 } else { -0.7 },
                                if rng.gen::<bool>() { 0.7 } else { -0.7 },
                            )
                        })
                        .collect();
                    centered_time_symbol(&band, FFT)
                }
            };
            buffer[pos..pos + cplen].copy_from_slice(&data[FFT - cplen..]);
            buffer[pos + cplen..pos + cplen + FFT].copy_from_slice(&data);
            pos += cplen + FFT;
        }
        assert_eq!(pos, FRAME);
        buffer
    }

    fn rotate(buffer: &[Complex32], subcarriers: f32) -> Vec<Complex32> {
        buffer
            .iter()
            .enumerate()
            .map(|(i, v)| {
                v * Complex32::from_polar(1.0, 2.0 * PI * subcarriers * i as f32 / FFT as f32)
            })
            .collect()
    }

    #[test]
    fn test_find_requires_group_id() {
        let mut engine = SyncEngine::init(FRAME, MAX_OFFSET, FFT).unwrap();
        let buffer = vec![Complex32::zero(); FRAME];
        assert!(matches!(
            engine.find(&buffer, 0),
            Err(PhyError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_init_rejects_invalid_fft_size() {
        assert!(SyncEngine::init(FRAME, MAX_OFFSET, 100).is_err());
        assert!(SyncEngine::init(FRAME, MAX_OFFSET, 4096).is_err());
    }

    #[test]
    fn test_threshold_zero_always_accepts() {
        let mut rng = StdRng::seed_from_u64(0x41);
        let buffer: Vec<Complex32> = (0..FRAME)
            .map(|_| Complex32::new(rng.gen::<f32>() - 0.5, rng.gen::<f32>() - 0.5) * 0.1)
            .collect();
        let mut engine = SyncEngine::init(FRAME, MAX_OFFSET, FFT).unwrap();
        engine.set_n_id_2(0).unwrap();
        engine.set_threshold(0.0);
        let result = engine.find(&buffer, 0).unwrap();
        assert_ne!(result, SyncFindResult::NotFound);
    }

    #[test]
    fn test_end_to_end_cell_269() {
        let pci = Pci::new(269).unwrap();
        let buffer = half_frame(pci, false);

        for algorithm in [
            SssAlgorithm::Full,
            SssAlgorithm::Partial { segments: 3 },
            SssAlgorithm::Differential,
        ] {
            let mut engine = SyncEngine::init(FRAME, MAX_OFFSET, FFT).unwrap();
            engine.set_n_id_2(pci.n_id_2()).unwrap();
            engine.set_threshold(0.4);
            engine.set_ema_alpha(1.0);
            engine.set_sss_algorithm(algorithm);

            let result = engine.find(&buffer, 0).unwrap();
            assert_eq!(result, SyncFindResult::Found, "{:?}", algorithm);
            assert_eq!(engine.peak_position(), 960);
            assert!(engine.peak_value() > 0.4);
            assert!(engine.sss_detected());
            assert_eq!(engine.cell_id(), Some(pci));
            assert_eq!(engine.subframe_index(), 0);
            assert_eq!(engine.cp(), CyclicPrefix::Normal);
        }
    }

    #[test]
    fn test_subframe_5_half_frame() {
        let pci = Pci::new(269).unwrap();
        let buffer = half_frame(pci, true);
        let mut engine = SyncEngine::init(FRAME, MAX_OFFSET, FFT).unwrap();
        engine.set_n_id_2(pci.n_id_2()).unwrap();
        engine.set_threshold(0.4);
        engine.set_ema_alpha(1.0);
        let result = engine.find(&buffer, 0).unwrap();
        assert_eq!(result, SyncFindResult::Found);
        assert_eq!(engine.cell_id(), Some(pci));
        assert_eq!(engine.subframe_index(), 5);
    }

    #[test]
    fn test_full_cfo_pipeline_recovers_offset() {
        let pci = Pci::new(269).unwrap();
        let buffer = rotate(&half_frame(pci, false), 1.3);

        let mut engine = SyncEngine::init(FRAME, MAX_OFFSET, FFT).unwrap();
        engine.set_n_id_2(pci.n_id_2()).unwrap();
        engine.set_threshold(0.0);
        engine.set_ema_alpha(1.0);
        engine.set_cfo_i_enable(true).unwrap();
        engine.set_cfo_cp_enable(true, 3);
        engine.set_cfo_pss_enable(true);
        engine.set_sss_equalize_enable(true);

        let mut result = SyncFindResult::NotFound;
        for _ in 0..2 {
            result = engine.find(&buffer, 0).unwrap();
        }
        assert_eq!(result, SyncFindResult::Found);
        assert_eq!(engine.peak_position(), 960);
        assert_eq!(engine.cell_id(), Some(pci));
        assert!(
            (engine.cfo() - 1.3).abs() < 0.05,
            "CFO estimate {} for 1.3 subcarriers",
            engine.cfo()
        );
    }

    #[test]
    fn test_pss_cfo_only_pipeline() {
        let pci = Pci::new(137).unwrap();
        let buffer = rotate(&half_frame(pci, false), 0.25);

        let mut engine = SyncEngine::init(FRAME, MAX_OFFSET, FFT).unwrap();
        engine.set_n_id_2(pci.n_id_2()).unwrap();
        engine.set_threshold(0.0);
        engine.set_ema_alpha(1.0);
        engine.set_cfo_pss_enable(true);

        let result = engine.find(&buffer, 0).unwrap();
        assert_eq!(result, SyncFindResult::Found);
        assert_eq!(engine.cell_id(), Some(pci));
        assert!(
            (engine.cfo() - 0.25).abs() < 0.05,
            "CFO estimate {} for 0.25 subcarriers",
            engine.cfo()
        );
    }

    #[test]
    fn test_found_no_space_near_window_start() {
        // PSS ending at sample 200: found, but no room for SSS/CP analysis
        let mut buffer = vec![Complex32::zero(); FRAME];
        let time = pss_time_symbol(1, FFT);
        buffer[200 - FFT..200].copy_from_slice(&time);

        let mut engine = SyncEngine::init(FRAME, MAX_OFFSET, FFT).unwrap();
        engine.set_n_id_2(1).unwrap();
        engine.set_threshold(0.4);
        engine.set_ema_alpha(1.0);
        let result = engine.find(&buffer, 0).unwrap();
        assert_eq!(result, SyncFindResult::FoundNoSpace);
        assert_eq!(engine.peak_position(), 200);
    }

    #[test]
    fn test_resize_beyond_init_rejected() {
        let mut engine = SyncEngine::init(FRAME, MAX_OFFSET, FFT).unwrap();
        assert!(engine.resize(2 * FRAME, MAX_OFFSET, FFT).is_err());
        assert!(engine.resize(FRAME, MAX_OFFSET, 256).is_err());
        assert_eq!(engine.fft_size(), FFT);
        assert_eq!(engine.frame_size(), FRAME);

        assert!(engine.resize(FRAME / 2, FRAME / 2, 64).is_ok());
        assert_eq!(engine.fft_size(), 64);
        assert_eq!(engine.frame_size(), FRAME / 2);
    }

    #[test]
    fn test_copy_cfo_and_reset() {
        let pci = Pci::new(269).unwrap();
        let buffer = rotate(&half_frame(pci, false), 0.25);
        let mut searcher = SyncEngine::init(FRAME, MAX_OFFSET, FFT).unwrap();
        searcher.set_n_id_2(pci.n_id_2()).unwrap();
        searcher.set_threshold(0.0);
        searcher.set_cfo_pss_enable(true);
        searcher.find(&buffer, 0).unwrap();
        assert!(searcher.cfo().abs() > 0.0);

        let mut tracker = SyncEngine::init(FRAME, MAX_OFFSET, FFT).unwrap();
        tracker.copy_cfo_from(&searcher);
        assert!((tracker.cfo() - searcher.cfo()).abs() < 1e-6);

        tracker.reset_cfo();
        assert_eq!(tracker.cfo(), 0.0);
    }
}
