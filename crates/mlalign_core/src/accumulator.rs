//! Weighted sums collected during the expectation step.
//!
//! Every image produces one [`ImageContribution`], already divided by its total
//! weight mass. Contributions are folded into a [`WeightedAccumulator`] owned
//! by a single task; task accumulators are combined with
//! [`WeightedAccumulator::merge`]. Summation happens in a fixed order, so the
//! totals do not depend on how work was scheduled.

use ndarray::{Array2, Zip};
use rustfft::num_complex::Complex;

use crate::float_trait::MlFloat;

/// Per-reference weight masses.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceSums {
    /// Weight mass, mirrored and plain.
    pub sumw: Vec<f64>,
    /// Robust (second-order) weight mass.
    pub sumw2: Vec<f64>,
    /// Weight mass of mirrored hypotheses.
    pub sumw_mirror: Vec<f64>,
    /// Scale-weighted mass.
    pub sumwsc: Vec<f64>,
    /// Squared-scale-weighted mass.
    pub sumwsc2: Vec<f64>,
}

impl ReferenceSums {
    pub fn zeros(n_references: usize) -> Self {
        Self {
            sumw: vec![0.0; n_references],
            sumw2: vec![0.0; n_references],
            sumw_mirror: vec![0.0; n_references],
            sumwsc: vec![0.0; n_references],
            sumwsc2: vec![0.0; n_references],
        }
    }

    fn add(&mut self, other: &ReferenceSums) {
        for (dst, src) in [
            (&mut self.sumw, &other.sumw),
            (&mut self.sumw2, &other.sumw2),
            (&mut self.sumw_mirror, &other.sumw_mirror),
            (&mut self.sumwsc, &other.sumwsc),
            (&mut self.sumwsc2, &other.sumwsc2),
        ] {
            for (d, s) in dst.iter_mut().zip(src.iter()) {
                *d += s;
            }
        }
    }
}

/// Normalized sums contributed by one image.
#[derive(Debug, Clone)]
pub struct ImageContribution<F: MlFloat> {
    /// Weighted image spectra per `(reference, psi)`, `None` when nothing was evaluated.
    pub images: Vec<Option<Array2<Complex<F>>>>,
    pub references: ReferenceSums,
    pub wsum_sigma_noise: f64,
    pub wsum_sigma_offset: f64,
    /// Top-weight fraction of the image.
    pub fracweight: f64,
    pub log_likelihood: f64,
}

/// Sums over many images, consumed once by the maximization step.
#[derive(Debug, Clone)]
pub struct WeightedAccumulator<F: MlFloat> {
    nr_psi: usize,
    dim: usize,
    /// Weighted image spectra, indexed `k * nr_psi + ipsi`.
    images: Vec<Option<Array2<Complex<F>>>>,
    pub references: ReferenceSums,
    pub wsum_sigma_noise: f64,
    pub wsum_sigma_offset: f64,
    pub sumfracweight: f64,
    pub log_likelihood: f64,
    pub n_images: usize,
}

impl<F: MlFloat> WeightedAccumulator<F> {
    pub fn new(n_references: usize, nr_psi: usize, dim: usize) -> Self {
        Self {
            nr_psi,
            dim,
            images: vec![None; n_references * nr_psi],
            references: ReferenceSums::zeros(n_references),
            wsum_sigma_noise: 0.0,
            wsum_sigma_offset: 0.0,
            sumfracweight: 0.0,
            log_likelihood: 0.0,
            n_images: 0,
        }
    }

    pub fn n_references(&self) -> usize {
        self.references.sumw.len()
    }

    pub fn nr_psi(&self) -> usize {
        self.nr_psi
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Weighted image sum of `(k, ipsi)`, if any weight reached it.
    pub fn image(&self, k: usize, ipsi: usize) -> Option<&Array2<Complex<F>>> {
        self.images[k * self.nr_psi + ipsi].as_ref()
    }

    /// Total weight mass over all references.
    pub fn total_weight(&self) -> f64 {
        self.references.sumw.iter().sum()
    }

    pub fn add_image(&mut self, contribution: &ImageContribution<F>) {
        for (slot, part) in self.images.iter_mut().zip(contribution.images.iter()) {
            if let Some(part) = part {
                add_spectrum(slot, part);
            }
        }
        self.references.add(&contribution.references);
        self.wsum_sigma_noise += contribution.wsum_sigma_noise;
        self.wsum_sigma_offset += contribution.wsum_sigma_offset;
        self.sumfracweight += contribution.fracweight;
        self.log_likelihood += contribution.log_likelihood;
        self.n_images += 1;
    }

    /// Combine two accumulators; `self`'s terms come first in every sum.
    pub fn merge(mut self, other: Self) -> Self {
        for (slot, part) in self.images.iter_mut().zip(other.images) {
            if let Some(part) = part {
                match slot {
                    Some(_) => add_spectrum(slot, &part),
                    None => *slot = Some(part),
                }
            }
        }
        self.references.add(&other.references);
        self.wsum_sigma_noise += other.wsum_sigma_noise;
        self.wsum_sigma_offset += other.wsum_sigma_offset;
        self.sumfracweight += other.sumfracweight;
        self.log_likelihood += other.log_likelihood;
        self.n_images += other.n_images;
        self
    }
}

fn add_spectrum<F: MlFloat>(slot: &mut Option<Array2<Complex<F>>>, part: &Array2<Complex<F>>) {
    match slot {
        Some(sum) => Zip::from(sum).and(part).for_each(|s, &p| *s = *s + p),
        None => *slot = Some(part.clone()),
    }
}
