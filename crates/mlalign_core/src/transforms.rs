//! Fourier transforms of square images.
//!
//! On top of the separable 2D transforms this module provides the operations
//! the alignment engine is built from: FFT cross-correlation of an image
//! spectrum against a conjugated reference spectrum, which yields the
//! correlation for every periodic translation at once, and conjugation of
//! whole spectra so reference spectra are conjugated once per iteration.

use ndarray::{Array2, ArrayView1, ArrayView2, Axis, Zip};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

use crate::float_trait::MlFloat;

/// Pre-computed FFT plans for one square image size.
///
/// Plans are built once per session and shared read-only by all workers.
pub struct FourierPlans<F: MlFloat> {
    dim: usize,
    fft_row: Arc<dyn Fft<F>>,
    fft_col: Arc<dyn Fft<F>>,
    ifft_row: Arc<dyn Fft<F>>,
    ifft_col: Arc<dyn Fft<F>>,
}

impl<F: MlFloat> FourierPlans<F> {
    /// Create forward and inverse plans for `dim x dim` images.
    pub fn new(dim: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft_row = planner.plan_fft_forward(dim);
        let fft_col = planner.plan_fft_forward(dim);
        let ifft_row = planner.plan_fft_inverse(dim);
        let ifft_col = planner.plan_fft_inverse(dim);
        Self {
            dim,
            fft_row,
            fft_col,
            ifft_row,
            ifft_col,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Unnormalized forward transform.
    pub fn forward(&self, input: ArrayView2<F>) -> Array2<Complex<F>> {
        fft2d(input, &self.fft_row, &self.fft_col)
    }

    /// Inverse transform, normalized by 1/(rows*cols).
    pub fn inverse(&self, input: &Array2<Complex<F>>) -> Array2<F> {
        ifft2d(input, &self.ifft_row, &self.ifft_col)
    }

    /// Circular cross-correlation `c(t) = sum_p x(p + t) * a(p)` for all shifts `t`,
    /// given `FFT(x)` and `conj(FFT(a))`.
    ///
    /// Shift `t` lives at index `t mod dim` of the returned array.
    pub fn correlate(
        &self,
        fx: &Array2<Complex<F>>,
        conj_fa: &Array2<Complex<F>>,
    ) -> Array2<F> {
        let mut product = Array2::<Complex<F>>::zeros(fx.dim());
        Zip::from(&mut product)
            .and(fx)
            .and(conj_fa)
            .for_each(|p, &x, &a| *p = x * a);
        self.inverse(&product)
    }
}

/// Complex conjugate of a whole spectrum.
pub fn conjugate<F: MlFloat>(input: &Array2<Complex<F>>) -> Array2<Complex<F>> {
    input.mapv(|c| c.conj())
}

/// Unnormalized 2D FFT of a real array: rows first, then columns.
pub fn fft2d<F: MlFloat>(
    input: ArrayView2<F>,
    fft_row_plan: &Arc<dyn Fft<F>>,
    fft_col_plan: &Arc<dyn Fft<F>>,
) -> Array2<Complex<F>> {
    let mut spectrum = input.mapv(|v| Complex::new(v, F::zero()));
    transform_lanes(&mut spectrum, Axis(1), fft_row_plan);
    transform_lanes(&mut spectrum, Axis(0), fft_col_plan);
    spectrum
}

/// Inverse 2D FFT keeping the real part, scaled by `1 / (rows * cols)`.
pub fn ifft2d<F: MlFloat>(
    input: &Array2<Complex<F>>,
    ifft_row_plan: &Arc<dyn Fft<F>>,
    ifft_col_plan: &Arc<dyn Fft<F>>,
) -> Array2<F> {
    let mut work = input.clone();
    transform_lanes(&mut work, Axis(0), ifft_col_plan);
    transform_lanes(&mut work, Axis(1), ifft_row_plan);
    let norm = F::one() / F::usize_as(work.len());
    work.mapv(|c| c.re * norm)
}

/// Apply `plan` in place to every lane of `data` along `axis`.
fn transform_lanes<F: MlFloat>(data: &mut Array2<Complex<F>>, axis: Axis, plan: &Arc<dyn Fft<F>>) {
    let mut buffer = vec![Complex::new(F::zero(), F::zero()); data.len_of(axis)];
    for mut lane in data.lanes_mut(axis) {
        for (slot, &v) in buffer.iter_mut().zip(lane.iter()) {
            *slot = v;
        }
        plan.process(&mut buffer);
        lane.assign(&ArrayView1::from(&buffer[..]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{random_matrix_f32, random_matrix_f64, shift_periodic};

    fn arrays_approx_equal_f32(a: &Array2<f32>, b: &Array2<f32>, epsilon: f32) -> bool {
        if a.dim() != b.dim() {
            return false;
        }
        a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() < epsilon)
    }

    fn arrays_approx_equal_f64(a: &Array2<f64>, b: &Array2<f64>, epsilon: f64) -> bool {
        if a.dim() != b.dim() {
            return false;
        }
        a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() < epsilon)
    }

    // ==================== FFT Round-Trip Tests ====================

    #[test]
    fn test_fft2d_roundtrip_various_sizes() {
        for size in [1usize, 4, 8, 15, 16, 32] {
            let input = random_matrix_f32(size, size, (size * 1000 + 7) as u64);
            let plans = FourierPlans::<f32>::new(size);

            let freq = plans.forward(input.view());
            let output = plans.inverse(&freq);

            let max_diff = input
                .iter()
                .zip(output.iter())
                .map(|(a, b)| (a - b).abs())
                .fold(0.0f32, f32::max);

            assert!(
                arrays_approx_equal_f32(&input, &output, 1e-5),
                "FFT roundtrip failed for {}x{}: max diff = {}",
                size,
                size,
                max_diff
            );
        }
    }

    #[test]
    fn test_fft2d_roundtrip_f64() {
        let input = random_matrix_f64(16, 16, 12345);
        let plans = FourierPlans::<f64>::new(16);

        let output = plans.inverse(&plans.forward(input.view()));

        assert!(
            arrays_approx_equal_f64(&input, &output, 1e-12),
            "FFT f64 roundtrip failed"
        );
    }

    #[test]
    fn test_fft2d_constant() {
        // All ones: DC component should be N*M, others should be ~0
        let input = Array2::<f32>::ones((8, 8));
        let plans = FourierPlans::<f32>::new(8);

        let output = plans.forward(input.view());

        let dc = output[[0, 0]];
        assert!(
            (dc.re - 64.0).abs() < 1e-5 && dc.im.abs() < 1e-5,
            "DC component should be 64+0i, got {:?}",
            dc
        );
        for r in 0..8 {
            for c in 0..8 {
                if r != 0 || c != 0 {
                    assert!(
                        output[[r, c]].norm() < 1e-5,
                        "Non-DC component [{},{}] should be ~0",
                        r,
                        c
                    );
                }
            }
        }
    }

    #[test]
    fn test_fft2d_parseval() {
        // For unnormalized FFT: sum of |x|^2 = (1/(N*M)) * sum of |X|^2
        let input = random_matrix_f64(8, 8, 42);
        let plans = FourierPlans::<f64>::new(8);

        let output = plans.forward(input.view());

        let energy_spatial: f64 = input.iter().map(|x| x * x).sum();
        let energy_freq: f64 = output.iter().map(|x| x.norm_sqr()).sum();

        assert!(
            (energy_freq - energy_spatial * 64.0).abs() / (energy_spatial * 64.0) < 1e-10,
            "Parseval's theorem violated: spatial={}, freq={}",
            energy_spatial,
            energy_freq
        );
    }

    // ==================== Cross-Correlation Tests ====================

    #[test]
    fn test_correlate_matches_direct_sum() {
        let dim = 8;
        let x = random_matrix_f64(dim, dim, 3);
        let a = random_matrix_f64(dim, dim, 4);
        let plans = FourierPlans::<f64>::new(dim);

        let corr = plans.correlate(&plans.forward(x.view()), &conjugate(&plans.forward(a.view())));

        for ty in 0..dim {
            for tx in 0..dim {
                let mut direct = 0.0;
                for r in 0..dim {
                    for c in 0..dim {
                        direct += x[[(r + ty) % dim, (c + tx) % dim]] * a[[r, c]];
                    }
                }
                assert!(
                    (corr[[ty, tx]] - direct).abs() < 1e-10,
                    "correlation mismatch at ({}, {}): fft={} direct={}",
                    ty,
                    tx,
                    corr[[ty, tx]],
                    direct
                );
            }
        }
    }

    #[test]
    fn test_correlate_peaks_at_applied_shift() {
        let dim = 16;
        let a = random_matrix_f64(dim, dim, 99);
        // x(q) = a(q - d), so x(p + d) = a(p)
        let x = shift_periodic(&a, 3, -2);
        let plans = FourierPlans::<f64>::new(dim);

        let corr = plans.correlate(&plans.forward(x.view()), &conjugate(&plans.forward(a.view())));

        let (mut best, mut best_val) = ((0, 0), f64::NEG_INFINITY);
        for ((r, c), &v) in corr.indexed_iter() {
            if v > best_val {
                best_val = v;
                best = (r, c);
            }
        }
        assert_eq!(best, (3, dim - 2));
    }
}
