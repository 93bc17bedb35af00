//! Deterministic synthetic data shared by the unit tests.

use ndarray::Array2;
use rand::prelude::*;
use rand_distr::{Distribution, Normal};

use crate::geometry::translate_periodic;

/// Simple Linear Congruential Generator for reproducible "random" matrices.
pub struct SimpleLcg {
    state: u64,
}

impl SimpleLcg {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    pub fn next_u64(&mut self) -> u64 {
        // LCG parameters from Numerical Recipes
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
        self.state
    }

    /// Value in [-1.0, 1.0)
    pub fn next_f32(&mut self) -> f32 {
        let u = self.next_u64();
        ((u >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
    }

    /// Value in [-1.0, 1.0)
    pub fn next_f64(&mut self) -> f64 {
        let u = self.next_u64();
        ((u >> 11) as f64 / (1u64 << 53) as f64) * 2.0 - 1.0
    }
}

pub fn random_matrix_f32(rows: usize, cols: usize, seed: u64) -> Array2<f32> {
    let mut rng = SimpleLcg::new(seed);
    Array2::from_shape_fn((rows, cols), |_| rng.next_f32())
}

pub fn random_matrix_f64(rows: usize, cols: usize, seed: u64) -> Array2<f64> {
    let mut rng = SimpleLcg::new(seed);
    Array2::from_shape_fn((rows, cols), |_| rng.next_f64())
}

/// Periodic shift: `out(q) = input(q - (dy, dx))`.
pub fn shift_periodic(input: &Array2<f64>, dy: isize, dx: isize) -> Array2<f64> {
    translate_periodic(input.view(), [dy, dx])
}

/// Asymmetric "particle": an off-centre blob plus a bar, amplitude `amplitude`.
///
/// Has no rotational or mirror symmetry, so every flip is distinguishable.
pub fn asymmetric_particle(dim: usize, amplitude: f64) -> Array2<f64> {
    let centre = (dim / 2) as f64;
    Array2::from_shape_fn((dim, dim), |(r, c)| {
        let y = r as f64 - centre;
        let x = c as f64 - centre;
        let blob = (-((y + 2.0).powi(2) + (x - 3.0).powi(2)) / 4.0).exp();
        let bar = if (-4.0..=3.0).contains(&y) && (-3.0..=-2.0).contains(&x) {
            0.8
        } else {
            0.0
        };
        let dot = if (y - 4.0).abs() < 1.0 && (x + 1.0).abs() < 1.5 {
            0.5
        } else {
            0.0
        };
        amplitude * (blob + bar + dot)
    })
}

/// A second class that differs clearly from [`asymmetric_particle`].
pub fn ring_particle(dim: usize, amplitude: f64) -> Array2<f64> {
    let centre = (dim / 2) as f64;
    Array2::from_shape_fn((dim, dim), |(r, c)| {
        let y = r as f64 - centre;
        let x = c as f64 - centre;
        let rad = (y * y + x * x).sqrt();
        let ring = (-(rad - 4.0).powi(2) / 1.5).exp();
        let notch = if y > 1.0 && x.abs() < 1.5 { 0.7 } else { 0.0 };
        amplitude * (ring + notch)
    })
}

/// Add white Gaussian noise with standard deviation `std`.
pub fn add_gaussian_noise(image: &Array2<f64>, std: f64, seed: u64) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, std).unwrap();
    image.mapv(|v| v + normal.sample(&mut rng))
}

/// Normalized cross-correlation coefficient between two arrays.
pub fn correlation_coefficient(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
    let n = a.len() as f64;
    let ma = a.sum() / n;
    let mb = b.sum() / n;
    let mut num = 0.0;
    let mut da = 0.0;
    let mut db = 0.0;
    for (&x, &y) in a.iter().zip(b.iter()) {
        num += (x - ma) * (y - mb);
        da += (x - ma).powi(2);
        db += (y - mb).powi(2);
    }
    num / (da.sqrt() * db.sqrt())
}
