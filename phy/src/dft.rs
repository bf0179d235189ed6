//! Discrete Fourier Transform Engine
//!
//! Thin planning/execution layer over `rustfft` with the spectrum layout
//! options the LTE detectors rely on:
//!
//! - `mirror`: present the spectrum in carrier-centered order (negative
//!   frequencies first), so subcarrier `k` of a size-`N` symbol lives at
//!   index `N/2 + k`.
//! - `dc`: drop (forward) or null (backward) the DC bin, which LTE leaves
//!   unused.
//! - `norm`: scale the output by `1/sqrt(N)`.
//!
//! Plan construction mutates shared planner state and is serialized behind a
//! single process-wide mutex; executing an already-built plan only touches
//! instance-owned buffers and is safe to run concurrently from independent
//! plans.

use crate::PhyError;
use num_complex::Complex32;
use num_traits::Zero;
use rustfft::{Fft, FftPlanner};
use std::sync::{Arc, Mutex, OnceLock};

/// Transform direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

static PLANNER: OnceLock<Mutex<FftPlanner<f32>>> = OnceLock::new();

/// Shared transform planner. Planning is serialized; execution is not.
fn planner() -> &'static Mutex<FftPlanner<f32>> {
    PLANNER.get_or_init(|| Mutex::new(FftPlanner::new()))
}

fn build(size: usize, dir: Direction) -> Result<Arc<dyn Fft<f32>>, PhyError> {
    if size == 0 {
        return Err(PhyError::Plan("transform size must be non-zero".into()));
    }
    let mut planner = planner().lock().unwrap();
    Ok(match dir {
        Direction::Forward => planner.plan_fft_forward(size),
        Direction::Backward => planner.plan_fft_inverse(size),
    })
}

/// An owning transform plan with pre-allocated working buffers.
///
/// The plan is acquired at construction and the buffers never grow on the
/// execution path; `replan` rebuilds the plan atomically under the shared
/// planning lock.
pub struct DftPlan {
    fft: Arc<dyn Fft<f32>>,
    size: usize,
    dir: Direction,
    mirror: bool,
    dc: bool,
    norm: bool,
    in_buf: Vec<Complex32>,
    out_buf: Vec<Complex32>,
    scratch: Vec<Complex32>,
}

impl DftPlan {
    /// Create a plan for the given size and direction.
    pub fn new(size: usize, dir: Direction) -> Result<Self, PhyError> {
        let fft = build(size, dir)?;
        let mut in_buf = Vec::new();
        let mut out_buf = Vec::new();
        let mut scratch = Vec::new();
        let scratch_len = fft.get_outofplace_scratch_len();
        in_buf
            .try_reserve_exact(size)
            .and_then(|_| out_buf.try_reserve_exact(size))
            .and_then(|_| scratch.try_reserve_exact(scratch_len))
            .map_err(|e| PhyError::Allocation(format!("DFT buffers for size {}: {}", size, e)))?;
        in_buf.resize(size, Complex32::zero());
        out_buf.resize(size, Complex32::zero());
        scratch.resize(scratch_len, Complex32::zero());
        Ok(Self {
            fft,
            size,
            dir,
            mirror: false,
            dc: false,
            norm: false,
            in_buf,
            out_buf,
            scratch,
        })
    }

    /// Swap the spectrum halves so the output/input is carrier-centered.
    pub fn set_mirror(&mut self, enable: bool) {
        self.mirror = enable;
    }

    /// Drop (forward) or null (backward) the DC bin.
    pub fn set_dc(&mut self, enable: bool) {
        self.dc = enable;
    }

    /// Scale the output by `1/sqrt(N)`.
    pub fn set_norm(&mut self, enable: bool) {
        self.norm = enable;
    }

    /// Transform size currently planned.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Destroy the current plan and build one for `new_size`, keeping the
    /// layout options.
    pub fn replan(&mut self, new_size: usize) -> Result<(), PhyError> {
        let fft = build(new_size, self.dir)?;
        let scratch_len = fft.get_outofplace_scratch_len();
        self.fft = fft;
        self.size = new_size;
        self.in_buf.resize(new_size, Complex32::zero());
        self.out_buf.resize(new_size, Complex32::zero());
        self.scratch.resize(scratch_len, Complex32::zero());
        Ok(())
    }

    /// Execute the plan on `input`, writing `size` samples to `output`.
    ///
    /// Both slices must hold at least `size` samples; no allocation occurs.
    pub fn run(&mut self, input: &[Complex32], output: &mut [Complex32]) {
        let n = self.size;
        debug_assert!(input.len() >= n && output.len() >= n);

        // Reorder a carrier-centered input into standard bin order before a
        // backward transform.
        if self.mirror && self.dir == Direction::Backward {
            let off = self.dc as usize;
            let h = n / 2;
            for v in &mut self.in_buf[..off] {
                *v = Complex32::zero();
            }
            self.in_buf[off..n - h].copy_from_slice(&input[h..h + (n - h - off)]);
            self.in_buf[n - h..n].copy_from_slice(&input[..h]);
        } else {
            self.in_buf[..n].copy_from_slice(&input[..n]);
        }

        self.fft
            .process_outofplace_with_scratch(&mut self.in_buf, &mut self.out_buf, &mut self.scratch);

        if self.norm {
            let scale = 1.0 / (n as f32).sqrt();
            for v in &mut self.out_buf[..n] {
                *v *= scale;
            }
        }

        // Reorder the standard-order output into carrier-centered order after
        // a forward transform.
        if self.mirror && self.dir == Direction::Forward {
            let off = self.dc as usize;
            let h = (n + 1) / 2;
            output[..n - h].copy_from_slice(&self.out_buf[h..n]);
            output[n - h..n - off].copy_from_slice(&self.out_buf[off..h]);
            for v in &mut output[n - off..n] {
                *v = Complex32::zero();
            }
        } else {
            output[..n].copy_from_slice(&self.out_buf[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const N: usize = 64;

    #[test]
    fn test_forward_backward_round_trip() {
        let mut fwd = DftPlan::new(N, Direction::Forward).unwrap();
        let mut bwd = DftPlan::new(N, Direction::Backward).unwrap();
        fwd.set_norm(true);
        bwd.set_norm(true);

        let input: Vec<Complex32> = (0..N)
            .map(|i| Complex32::new(i as f32 * 0.1, -(i as f32) * 0.05))
            .collect();
        let mut freq = vec![Complex32::zero(); N];
        let mut back = vec![Complex32::zero(); N];
        fwd.run(&input, &mut freq);
        bwd.run(&freq, &mut back);

        for (a, b) in input.iter().zip(back.iter()) {
            assert!((a - b).norm() < 1e-4);
        }
    }

    #[test]
    fn test_mirror_dc_centered_subcarrier_mapping() {
        // A single subcarrier placed at centered index N/2 + k must come back
        // at the same index after backward + forward transforms.
        for k in [1usize, 5, 31] {
            let mut bwd = DftPlan::new(N, Direction::Backward).unwrap();
            bwd.set_mirror(true);
            bwd.set_dc(true);
            bwd.set_norm(true);
            let mut fwd = DftPlan::new(N, Direction::Forward).unwrap();
            fwd.set_mirror(true);
            fwd.set_dc(true);
            fwd.set_norm(true);

            let mut centered = vec![Complex32::zero(); N];
            centered[N / 2 + k - 1] = Complex32::new(1.0, 0.0);
            let mut time = vec![Complex32::zero(); N];
            let mut spectrum = vec![Complex32::zero(); N];
            bwd.run(&centered, &mut time);
            fwd.run(&time, &mut spectrum);

            for (i, v) in spectrum.iter().enumerate() {
                let expect = if i == N / 2 + k - 1 { 1.0 } else { 0.0 };
                assert!(
                    (v.norm() - expect).abs() < 1e-4,
                    "bin {} for subcarrier {}",
                    i,
                    k
                );
            }
        }
    }

    #[test]
    fn test_backward_mirror_nulls_dc() {
        // With dc enabled a constant (DC) component must not survive.
        let mut bwd = DftPlan::new(N, Direction::Backward).unwrap();
        bwd.set_mirror(true);
        bwd.set_dc(true);
        bwd.set_norm(true);

        let centered = vec![Complex32::new(1.0, 0.0); N];
        let mut time = vec![Complex32::zero(); N];
        bwd.run(&centered, &mut time);
        let mean: Complex32 = time.iter().sum::<Complex32>() / N as f32;
        assert!(mean.norm() < 1e-4);
    }

    #[test]
    fn test_replan_smaller() {
        let mut plan = DftPlan::new(N, Direction::Forward).unwrap();
        plan.replan(N / 2).unwrap();
        assert_eq!(plan.size(), N / 2);
        let input = vec![Complex32::new(1.0, 0.0); N / 2];
        let mut out = vec![Complex32::zero(); N / 2];
        plan.run(&input, &mut out);
        // impulse spectrum of a constant: all energy in bin 0
        assert!((out[0].re - N as f32 / 2.0).abs() < 1e-3);
    }
}
