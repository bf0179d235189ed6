//! FFT Convolution Engine
//!
//! Frequency-domain linear convolution used for the PSS sliding correlation.
//! The transform length is `input_len + filter_len`; both forward plans are
//! normalized and the backward plan is not, so the output equals the direct
//! linear convolution. Callers that reuse one filter across many runs
//! transform it once with [`ConvFft::transform_filter`] and pass the
//! frequency-domain form to [`ConvFft::run`].

use crate::dft::{DftPlan, Direction};
use crate::vector;
use crate::PhyError;
use num_complex::Complex32;
use num_traits::Zero;

/// FFT-based linear convolution with pre-planned transforms.
pub struct ConvFft {
    input_len: usize,
    filter_len: usize,
    output_len: usize,
    max_input_len: usize,
    max_filter_len: usize,
    input_plan: DftPlan,
    filter_plan: DftPlan,
    output_plan: DftPlan,
    input_fft: Vec<Complex32>,
    output_fft: Vec<Complex32>,
}

impl ConvFft {
    /// Plan a convolution of `input_len`-sample inputs with a
    /// `filter_len`-sample filter. These are the maximum lengths; `replan`
    /// accepts anything smaller.
    pub fn init(input_len: usize, filter_len: usize) -> Result<Self, PhyError> {
        let output_len = input_len + filter_len;
        let mut input_plan = DftPlan::new(output_len, Direction::Forward)?;
        let mut filter_plan = DftPlan::new(output_len, Direction::Forward)?;
        let output_plan = DftPlan::new(output_len, Direction::Backward)?;
        input_plan.set_norm(true);
        filter_plan.set_norm(true);

        let mut input_fft = Vec::new();
        let mut output_fft = Vec::new();
        input_fft
            .try_reserve_exact(output_len)
            .and_then(|_| output_fft.try_reserve_exact(output_len))
            .map_err(|e| PhyError::Allocation(format!("convolution buffers: {}", e)))?;
        input_fft.resize(output_len, Complex32::zero());
        output_fft.resize(output_len, Complex32::zero());

        Ok(Self {
            input_len,
            filter_len,
            output_len,
            max_input_len: input_len,
            max_filter_len: filter_len,
            input_plan,
            filter_plan,
            output_plan,
            input_fft,
            output_fft,
        })
    }

    /// Reconfigure for smaller lengths within the reserved maxima.
    pub fn replan(&mut self, input_len: usize, filter_len: usize) -> Result<(), PhyError> {
        if input_len > self.max_input_len || filter_len > self.max_filter_len {
            return Err(PhyError::InvalidInput(format!(
                "convolution replan {}x{} exceeds initialized {}x{}",
                input_len, filter_len, self.max_input_len, self.max_filter_len
            )));
        }
        self.input_len = input_len;
        self.filter_len = filter_len;
        self.output_len = input_len + filter_len;
        self.input_plan.replan(self.output_len)?;
        self.filter_plan.replan(self.output_len)?;
        self.output_plan.replan(self.output_len)?;
        Ok(())
    }

    /// Transform length currently planned (`input_len + filter_len`).
    pub fn output_len(&self) -> usize {
        self.output_len
    }

    /// Transform a time-domain filter into the frequency-domain form expected
    /// by [`ConvFft::run`]. Both slices must hold `output_len` samples; the
    /// filter tail beyond `filter_len` must be zero.
    pub fn transform_filter(&mut self, filter_time: &[Complex32], filter_freq: &mut [Complex32]) {
        self.filter_plan.run(filter_time, filter_freq);
    }

    /// Convolve `input` with a pre-transformed filter. `input` and `output`
    /// must hold `output_len` samples (input zero-padded past `input_len`).
    /// Returns the number of usable output samples.
    pub fn run(
        &mut self,
        input: &[Complex32],
        filter_freq: &[Complex32],
        output: &mut [Complex32],
    ) -> usize {
        self.input_plan.run(input, &mut self.input_fft);
        vector::prod(
            &self.input_fft[..self.output_len],
            &filter_freq[..self.output_len],
            &mut self.output_fft[..self.output_len],
        );
        self.output_plan.run(&self.output_fft, output);
        self.output_len - 1
    }
}
