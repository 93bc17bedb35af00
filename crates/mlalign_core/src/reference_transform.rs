//! Rotated, energy-matched references in the Fourier domain.

use ndarray::Array2;
use rayon::prelude::*;
use rustfft::num_complex::Complex;

use crate::float_trait::MlFloat;
use crate::geometry::{energy, rotate};
use crate::hypothesis::HypothesisGrid;
use crate::model::Reference;
use crate::transforms::{conjugate, FourierPlans};

/// All psi rotations of one reference.
pub struct TransformedReference<F: MlFloat> {
    /// `conj(FFT(R_psi))` per psi.
    spectra: Vec<Array2<Complex<F>>>,
    /// Real-space rotations, kept only when the significance filter needs them.
    rotated: Option<Vec<Array2<F>>>,
    /// Pixel mean of each rotated copy.
    means: Vec<f64>,
    /// Squared norm shared by every rotated copy.
    energy: f64,
}

impl<F: MlFloat> TransformedReference<F> {
    /// Rotate `reference` by every psi of the grid and rescale each copy to the
    /// energy of the unrotated reference.
    pub fn new(
        reference: &Reference<F>,
        grid: &HypothesisGrid,
        plans: &FourierPlans<F>,
        keep_real_space: bool,
    ) -> Self {
        let nr_psi = grid.nr_psi();
        let mut spectra = Vec::with_capacity(nr_psi);
        let mut rotated = Vec::with_capacity(if keep_real_space { nr_psi } else { 0 });
        let mut means = Vec::with_capacity(nr_psi);
        let mut target_energy = 0.0;

        for ipsi in 0..nr_psi {
            let mut copy = rotate(reference.data.view(), grid.psi_angle(ipsi));
            let copy_energy = energy(copy.view());
            if ipsi == 0 {
                target_energy = copy_energy;
            } else if copy_energy > 0.0 {
                let factor = F::from_f64_c((target_energy / copy_energy).sqrt());
                copy.mapv_inplace(|v| v * factor);
            }
            means.push(copy.iter().map(|v| v.as_f64()).sum::<f64>() / copy.len() as f64);
            spectra.push(conjugate(&plans.forward(copy.view())));
            if keep_real_space {
                rotated.push(copy);
            }
        }

        Self {
            spectra,
            rotated: keep_real_space.then_some(rotated),
            means,
            energy: target_energy,
        }
    }

    pub fn spectrum(&self, ipsi: usize) -> &Array2<Complex<F>> {
        &self.spectra[ipsi]
    }

    pub fn rotated(&self, ipsi: usize) -> Option<&Array2<F>> {
        self.rotated.as_ref().map(|r| &r[ipsi])
    }

    pub fn mean(&self, ipsi: usize) -> f64 {
        self.means[ipsi]
    }

    pub fn energy(&self) -> f64 {
        self.energy
    }
}

/// Transformed copies of every reference for one iteration.
///
/// Built once before the expectation step and shared read-only by all workers.
pub struct ReferenceBank<F: MlFloat> {
    references: Vec<TransformedReference<F>>,
}

impl<F: MlFloat> ReferenceBank<F> {
    pub fn build(
        references: &[Reference<F>],
        grid: &HypothesisGrid,
        plans: &FourierPlans<F>,
        keep_real_space: bool,
    ) -> Self {
        let references = references
            .par_iter()
            .map(|r| TransformedReference::new(r, grid, plans, keep_real_space))
            .collect();
        Self { references }
    }

    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    pub fn get(&self, k: usize) -> &TransformedReference<F> {
        &self.references[k]
    }
}
