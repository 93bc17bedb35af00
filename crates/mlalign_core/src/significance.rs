//! Fast-mode pruning of `(reference, rotation)` pairs.
//!
//! For every reference and mirror state the image is compared with each
//! rotated reference at the offset remembered from the previous iteration.
//! Rotations whose weight falls below `c_fast` times the best one are skipped
//! by the expectation step; all translations of a kept rotation are evaluated.

use ndarray::{Array2, ArrayView2};

use crate::error::{MlError, Result};
use crate::float_trait::MlFloat;
use crate::hypothesis::{offset_norm2, HypothesisGrid, OffsetPrior, NR_NOMIRROR_FLIPS};
use crate::model::Model;
use crate::reference_transform::ReferenceBank;

/// Remembered offsets beyond this many sigma_offset force a full search.
const TRUSTED_OFFSET_SIGMAS: f64 = 3.0;

/// Which `(reference, rotation)` pairs the expectation step evaluates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignificanceMask {
    flags: Array2<bool>,
}

impl SignificanceMask {
    /// Every pair significant (the non-fast search).
    pub fn all(n_references: usize, nr_rotations: usize) -> Self {
        Self {
            flags: Array2::from_elem((n_references, nr_rotations), true),
        }
    }

    pub fn none(n_references: usize, nr_rotations: usize) -> Self {
        Self {
            flags: Array2::from_elem((n_references, nr_rotations), false),
        }
    }

    #[inline]
    pub fn is_significant(&self, k: usize, rotation: usize) -> bool {
        self.flags[[k, rotation]]
    }

    pub fn set(&mut self, k: usize, rotation: usize, significant: bool) {
        self.flags[[k, rotation]] = significant;
    }

    pub fn count(&self) -> usize {
        self.flags.iter().filter(|&&f| f).count()
    }
}

/// Inputs of the significance filter for one image.
pub struct SignificanceInput<'a, F: MlFloat> {
    /// The image after every flip of the grid, in flip order.
    pub flipped: &'a [Array2<F>],
    /// Squared norm of the image.
    pub xi2: f64,
    pub opt_scale: f64,
    /// Remembered offsets in the image frame, indexed `k * nr_mirrors + mirror`.
    pub offsets: &'a [Option<[isize; 2]>],
    /// Reference whose unrotated hypothesis is always kept.
    pub keep_reference: usize,
}

/// Select the significant `(reference, rotation)` pairs of one image.
pub fn preselect_significant<F: MlFloat>(
    input: &SignificanceInput<'_, F>,
    image_id: &str,
    model: &Model,
    bank: &ReferenceBank<F>,
    grid: &HypothesisGrid,
    prior: &OffsetPrior,
    c_fast: f64,
) -> Result<SignificanceMask> {
    let n_ref = model.n_references();
    let nr_psi = grid.nr_psi();
    let nr_mirrors = grid.nr_mirrors();
    let sigma2 = model.sigma_noise2();
    let n_pixels = model.n_pixels();
    let mut mask = SignificanceMask::none(n_ref, grid.nr_rotations());
    let mut diffs = vec![0.0; NR_NOMIRROR_FLIPS * nr_psi];

    for k in 0..n_ref {
        let reference = bank.get(k);
        let ref_scale = model.ref_scale(k, input.opt_scale);
        let a2_plus_xi2 = 0.5 * (ref_scale * ref_scale * reference.energy() + input.xi2);

        for mirror in 0..nr_mirrors {
            let fracpdf = model.class_prior(k, mirror == 1);
            if fracpdf <= 0.0 {
                continue;
            }
            let flips = mirror * NR_NOMIRROR_FLIPS..(mirror + 1) * NR_NOMIRROR_FLIPS;
            let remembered = input.offsets.get(k * nr_mirrors + mirror).copied().flatten();
            let trusted = remembered.filter(|&o| {
                offset_norm2(o).sqrt() <= TRUSTED_OFFSET_SIGMAS * model.sigma_offset
            });
            let (offset, has_real_space) = match trusted {
                Some(o) => (o, reference.rotated(0).is_some()),
                None => ([0, 0], false),
            };
            if !has_real_space {
                for iflip in flips {
                    for ipsi in 0..nr_psi {
                        mask.set(k, grid.rotation_index(iflip, ipsi), true);
                    }
                }
                continue;
            }

            // A. differences at the remembered offset
            let mut local_mindiff = f64::INFINITY;
            for (slot, iflip) in flips.clone().enumerate() {
                let shift = grid.flip(iflip).to_flipped_frame(offset);
                for ipsi in 0..nr_psi {
                    let rotated = match reference.rotated(ipsi) {
                        Some(r) => r,
                        None => continue,
                    };
                    let corr = correlation_at(input.flipped[iflip].view(), rotated.view(), shift);
                    let diff = (a2_plus_xi2 - ref_scale * corr).max(0.0);
                    diffs[slot * nr_psi + ipsi] = diff;
                    local_mindiff = local_mindiff.min(diff);
                }
            }

            // B. weights relative to the local minimum
            let pdf = fracpdf * prior.pdf(offset);
            let weights: Vec<f64> = diffs
                .iter()
                .map(|&d| pdf * model.noise.kernel(d, local_mindiff, sigma2, n_pixels))
                .collect();
            let max_weight = weights.iter().copied().fold(0.0, f64::max);

            // C. keep rotations close enough to the best one
            for (slot, iflip) in flips.enumerate() {
                for ipsi in 0..nr_psi {
                    let w = weights[slot * nr_psi + ipsi];
                    mask.set(k, grid.rotation_index(iflip, ipsi), w >= c_fast * max_weight);
                }
            }
        }
    }

    if input.keep_reference < n_ref {
        mask.set(input.keep_reference, 0, true);
    }
    if mask.count() == 0 {
        return Err(MlError::EmptyHypothesisSet {
            image: image_id.to_string(),
        });
    }
    Ok(mask)
}

/// `sum_p image(p + shift) * reference(p)` with periodic wrap.
fn correlation_at<F: MlFloat>(
    image: ArrayView2<F>,
    reference: ArrayView2<F>,
    shift: [isize; 2],
) -> f64 {
    let (rows, cols) = image.dim();
    let mut sum = 0.0;
    for ((r, c), &a) in reference.indexed_iter() {
        let y = (r as isize + shift[0]).rem_euclid(rows as isize) as usize;
        let x = (c as isize + shift[1]).rem_euclid(cols as isize) as usize;
        sum += image[[y, x]].as_f64() * a.as_f64();
    }
    sum
}
