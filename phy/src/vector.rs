//! Vector Math Primitives
//!
//! Scalar reference implementations of the elementwise and reduction
//! operations the synchronization detectors are built on. All functions are
//! deterministic and allocation-free; callers provide output slices.

use num_complex::Complex32;
use num_traits::Zero;

/// Exponential moving average: `alpha * data + (1 - alpha) * average`
#[inline]
pub fn ema(data: f32, average: f32, alpha: f32) -> f32 {
    alpha * data + (1.0 - alpha) * average
}

/// `sum x[i] * y[i]`
pub fn dot_prod(x: &[Complex32], y: &[Complex32]) -> Complex32 {
    x.iter().zip(y.iter()).map(|(a, b)| a * b).sum()
}

/// `sum x[i] * conj(y[i])`
pub fn dot_prod_conj(x: &[Complex32], y: &[Complex32]) -> Complex32 {
    x.iter().zip(y.iter()).map(|(a, b)| a * b.conj()).sum()
}

/// `sum x[i] * y[i]` with a real-valued second operand
pub fn dot_prod_real(x: &[Complex32], y: &[f32]) -> Complex32 {
    x.iter().zip(y.iter()).map(|(a, b)| a * *b).sum()
}

/// Elementwise product `z[i] = x[i] * y[i]`
pub fn prod(x: &[Complex32], y: &[Complex32], z: &mut [Complex32]) {
    for ((a, b), c) in x.iter().zip(y.iter()).zip(z.iter_mut()) {
        *c = a * b;
    }
}

/// Elementwise conjugate product `z[i] = x[i] * conj(y[i])`
pub fn prod_conj(x: &[Complex32], y: &[Complex32], z: &mut [Complex32]) {
    for ((a, b), c) in x.iter().zip(y.iter()).zip(z.iter_mut()) {
        *c = a * b.conj();
    }
}

/// Elementwise product with a real-valued second operand
pub fn prod_real(x: &[Complex32], y: &[f32], z: &mut [Complex32]) {
    for ((a, b), c) in x.iter().zip(y.iter()).zip(z.iter_mut()) {
        *c = a * *b;
    }
}

/// Elementwise division `z[i] = x[i] / y[i]`
pub fn div(x: &[Complex32], y: &[Complex32], z: &mut [Complex32]) {
    for ((a, b), c) in x.iter().zip(y.iter()).zip(z.iter_mut()) {
        *c = a / b;
    }
}

/// Scale by a real scalar, in place
pub fn sc_prod(x: &mut [Complex32], scale: f32) {
    for v in x.iter_mut() {
        *v *= scale;
    }
}

/// `y[i] = |x[i]|^2`
pub fn abs_square(x: &[Complex32], y: &mut [f32]) {
    for (a, b) in x.iter().zip(y.iter_mut()) {
        *b = a.norm_sqr();
    }
}

/// `y[i] = |x[i]|`
pub fn abs(x: &[Complex32], y: &mut [f32]) {
    for (a, b) in x.iter().zip(y.iter_mut()) {
        *b = a.norm();
    }
}

/// Index of the maximum element
pub fn max_index(x: &[f32]) -> usize {
    let mut best = 0;
    let mut best_val = f32::MIN;
    for (i, &v) in x.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best = i;
        }
    }
    best
}

/// Index of the element with the largest magnitude
pub fn max_abs_index(x: &[Complex32]) -> usize {
    let mut best = 0;
    let mut best_val = f32::MIN;
    for (i, v) in x.iter().enumerate() {
        let m = v.norm_sqr();
        if m > best_val {
            best_val = m;
            best = i;
        }
    }
    best
}

/// Average power `sum |x[i]|^2 / len`
pub fn avg_power(x: &[Complex32]) -> f32 {
    if x.is_empty() {
        return 0.0;
    }
    x.iter().map(|v| v.norm_sqr()).sum::<f32>() / x.len() as f32
}

/// Fill with zeros
pub fn clear(x: &mut [Complex32]) {
    for v in x.iter_mut() {
        *v = Complex32::zero();
    }
}
