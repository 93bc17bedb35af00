//! Expectation step for a single image.
//!
//! Every significant `(reference, rotation)` pair is correlated with the image
//! in the Fourier domain, giving the difference for all translations of the
//! window from one inverse transform. Kernel weights are computed relative to
//! a trial minimum difference; if the true minimum turns out to be too far
//! from the trial one, or no weight survives, the whole evaluation is
//! repeated once with the true minimum. A second correction is a logic error.
//! Hypotheses with zero prior mass (dead references, offsets outside the
//! prior's support) are never evaluated.
//!
//! Weighted images are accumulated as spectra: the weight map over
//! translations, correlated back against the flipped image, gives the weighted
//! sum of aligned images for one psi.

use ndarray::{Array2, ArrayView2, Zip};
use rayon::prelude::*;
use rustfft::num_complex::Complex;
use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::accumulator::{ImageContribution, ReferenceSums};
use crate::error::{MlError, Result};
use crate::float_trait::MlFloat;
use crate::geometry::flip_image;
use crate::hypothesis::{
    offset_norm2, wrap_index, HypothesisGrid, OffsetPrior, TransformHypothesis,
    TranslationWindow,
};
use crate::model::Model;
use crate::reference_transform::ReferenceBank;
use crate::significance::{preselect_significant, SignificanceInput, SignificanceMask};
use crate::transforms::FourierPlans;

/// Largest tolerated distance between trial and true minimum, in units of sigma_noise^2.
const TRYMINDIFF_RANGE: f64 = 500.0;

/// Input image with its identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct ParticleImage<F: MlFloat> {
    pub id: String,
    pub data: Array2<F>,
    /// Noise / defocus group, carried into the output records.
    pub noise_group: Option<usize>,
    /// Warm-start state from an earlier run.
    pub hints: Option<ImageHints>,
}

impl<F: MlFloat> ParticleImage<F> {
    pub fn new(id: impl Into<String>, data: Array2<F>) -> Self {
        Self {
            id: id.into(),
            data,
            noise_group: None,
            hints: None,
        }
    }
}

/// Per-image state carried from one iteration to the next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageHints {
    /// Best reference of the last iteration; its unrotated hypothesis is never pruned.
    pub opt_reference: usize,
    /// Trial minimum difference; `None` before the first iteration.
    pub trymindiff: Option<f64>,
    /// Best offset per `k * nr_mirrors + mirror`, in the image frame.
    pub offsets: Vec<Option<[isize; 2]>>,
    /// Background mean subtracted before comparison (normalization only).
    pub bgmean: f64,
    /// Intensity scale of the image (normalization only).
    pub scale: f64,
}

impl ImageHints {
    pub fn initial(n_references: usize, nr_mirrors: usize, zero_offsets: bool) -> Self {
        let offset = if zero_offsets { Some([0, 0]) } else { None };
        Self {
            opt_reference: 0,
            trymindiff: None,
            offsets: vec![offset; n_references * nr_mirrors],
            bgmean: 0.0,
            scale: 1.0,
        }
    }
}

/// Optimal alignment and diagnostics of one image for one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,
    pub noise_group: Option<usize>,
    pub reference: usize,
    /// In-plane rotation in degrees, `[0, 360)`.
    pub rotation: f64,
    /// Translation in the image frame.
    pub offset: [isize; 2],
    pub mirrored: bool,
    /// Weight of the optimal hypothesis over the total weight.
    pub max_weight_fraction: f64,
    pub log_likelihood: f64,
    /// Robust kernel weight of the optimal hypothesis (1 for Gaussian noise).
    pub robustness_weight: f64,
    pub scale: f64,
    pub bgmean: f64,
}

/// Everything shared by the expectation of all images in one iteration.
pub struct ExpectationContext<'a, F: MlFloat> {
    pub model: &'a Model,
    pub bank: &'a ReferenceBank<F>,
    pub grid: &'a HypothesisGrid,
    pub window: TranslationWindow,
    pub prior: &'a OffsetPrior,
    pub plans: &'a FourierPlans<F>,
    pub fast_mode: bool,
    pub c_fast: f64,
    pub trymindiff_factor: f64,
}

/// Result of the expectation step for one image.
#[derive(Debug, Clone)]
pub struct ImageOutcome<F: MlFloat> {
    pub contribution: ImageContribution<F>,
    pub record: ImageRecord,
    pub hints: ImageHints,
    /// Number of trial-minimum corrections (0 or 1).
    pub redo_count: usize,
    /// Total unnormalized weight of the final pass.
    pub total_weight: f64,
}

/// The image in all flipped versions, real and Fourier.
struct PreparedImage<F: MlFloat> {
    flipped: Vec<Array2<F>>,
    spectra: Vec<Array2<Complex<F>>>,
    xi2: f64,
    raw_mean: f64,
}

impl<F: MlFloat> PreparedImage<F> {
    fn new(ctx: &ExpectationContext<'_, F>, data: ArrayView2<F>, bgmean: f64) -> Self {
        let raw_mean = data.iter().map(|v| v.as_f64()).sum::<f64>() / data.len() as f64;
        let image = if ctx.model.normalization.is_some() {
            let bg = F::from_f64_c(bgmean);
            data.mapv(|v| v - bg)
        } else {
            data.to_owned()
        };
        let xi2 = image.iter().map(|v| v.as_f64() * v.as_f64()).sum();
        let flipped: Vec<Array2<F>> = ctx
            .grid
            .flips()
            .iter()
            .map(|&f| flip_image(image.view(), f))
            .collect();
        let spectra = flipped.iter().map(|f| ctx.plans.forward(f.view())).collect();
        Self {
            flipped,
            spectra,
            xi2,
            raw_mean,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Optimum {
    weight: f64,
    robust: f64,
    hypothesis: TransformHypothesis,
}

#[derive(Debug, Clone, Copy)]
struct MirrorOptimum {
    weight: f64,
    iflip: usize,
    offset: [isize; 2],
}

/// Sums of one evaluation pass over a range of references.
struct PassPartial<F: MlFloat> {
    /// Weighted spectra per `(k - start) * nr_psi + ipsi`.
    images: Vec<Option<Array2<Complex<F>>>>,
    refw: Vec<f64>,
    refw_mirror: Vec<f64>,
    refw2: Vec<f64>,
    /// Stored weight per `(k - start) * nr_psi + ipsi`.
    sumw_refpsi: Vec<f64>,
    /// Best hypothesis per `(k - start) * nr_mirrors + mirror`.
    mirror_optima: Vec<Option<MirrorOptimum>>,
    wsum_corr: f64,
    wsum_offset: f64,
    wsum_sc: f64,
    wsum_sc2: f64,
    mindiff: f64,
    optimum: Option<Optimum>,
}

impl<F: MlFloat> PassPartial<F> {
    fn empty(n_refs: usize, nr_psi: usize, nr_mirrors: usize) -> Self {
        Self {
            images: vec![None; n_refs * nr_psi],
            refw: vec![0.0; n_refs],
            refw_mirror: vec![0.0; n_refs],
            refw2: vec![0.0; n_refs],
            sumw_refpsi: vec![0.0; n_refs * nr_psi],
            mirror_optima: vec![None; n_refs * nr_mirrors],
            wsum_corr: 0.0,
            wsum_offset: 0.0,
            wsum_sc: 0.0,
            wsum_sc2: 0.0,
            mindiff: f64::INFINITY,
            optimum: None,
        }
    }

    /// Append a later range; ties keep the earlier optimum.
    fn append(&mut self, other: PassPartial<F>) {
        self.images.extend(other.images);
        self.refw.extend(other.refw);
        self.refw_mirror.extend(other.refw_mirror);
        self.refw2.extend(other.refw2);
        self.sumw_refpsi.extend(other.sumw_refpsi);
        self.mirror_optima.extend(other.mirror_optima);
        self.wsum_corr += other.wsum_corr;
        self.wsum_offset += other.wsum_offset;
        self.wsum_sc += other.wsum_sc;
        self.wsum_sc2 += other.wsum_sc2;
        self.mindiff = self.mindiff.min(other.mindiff);
        if let Some(o) = other.optimum {
            if self.optimum.map_or(true, |best| o.weight > best.weight) {
                self.optimum = Some(o);
            }
        }
    }

    fn sum_refw(&self) -> f64 {
        self.refw.iter().sum::<f64>() + self.refw_mirror.iter().sum::<f64>()
    }
}

/// Evaluate all significant hypotheses of the references in `range`.
fn evaluate_range<F: MlFloat>(
    ctx: &ExpectationContext<'_, F>,
    image: &PreparedImage<F>,
    mask: &SignificanceMask,
    range: Range<usize>,
    trymindiff: f64,
    opt_scale: f64,
) -> PassPartial<F> {
    let grid = ctx.grid;
    let model = ctx.model;
    let nr_psi = grid.nr_psi();
    let nr_mirrors = grid.nr_mirrors();
    let dim = ctx.plans.dim();
    let sigma2 = model.sigma_noise2();
    let n_pixels = model.n_pixels();
    let normalize = model.normalization.is_some();
    let start = range.start;
    let mut partial = PassPartial::empty(range.len(), nr_psi, nr_mirrors);
    let mut weight_map = Array2::<F>::zeros((dim, dim));

    for k in range {
        let local = k - start;
        let reference = ctx.bank.get(k);
        let ref_scale = model.ref_scale(k, opt_scale);
        let a2 = reference.energy();
        let a2_plus_xi2 = 0.5 * (ref_scale * ref_scale * a2 + image.xi2);

        for iflip in 0..grid.nr_flips() {
            let flip = grid.flip(iflip);
            let irefmir = local * nr_mirrors + grid.mirror_of_flip(iflip);
            let fracpdf = model.class_prior(k, flip.mirrored);
            if fracpdf <= 0.0 {
                continue;
            }

            for ipsi in 0..nr_psi {
                let rotation = grid.rotation_index(iflip, ipsi);
                if !mask.is_significant(k, rotation) {
                    continue;
                }
                let corr = ctx
                    .plans
                    .correlate(&image.spectra[iflip], reference.spectrum(ipsi));
                weight_map.fill(F::zero());
                let mut my_sumweight = 0.0;
                let mut my_sumstored = 0.0;

                for offset in ctx.window.offsets() {
                    let pdf = fracpdf * ctx.prior.pdf(offset);
                    if pdf <= 0.0 {
                        continue;
                    }
                    let idx = [wrap_index(offset[0], dim), wrap_index(offset[1], dim)];
                    // Half squared residual; rounding must not make it negative.
                    let diff = (a2_plus_xi2 - ref_scale * corr[idx].as_f64()).max(0.0);
                    partial.mindiff = partial.mindiff.min(diff);
                    let weight = pdf * model.noise.kernel(diff, trymindiff, sigma2, n_pixels);
                    let robust = model.noise.robust_weight(diff, sigma2, n_pixels);
                    let stored = weight * robust;

                    weight_map[idx] = F::from_f64_c(stored);
                    partial.wsum_corr += stored * diff;
                    partial.refw2[local] += stored;
                    my_sumweight += weight;
                    my_sumstored += stored;
                    partial.wsum_offset += weight * offset_norm2(offset);
                    if normalize {
                        partial.wsum_sc += stored * (a2_plus_xi2 - diff) / ref_scale;
                        partial.wsum_sc2 += stored * a2;
                    }

                    if partial.optimum.map_or(true, |best| weight > best.weight) {
                        partial.optimum = Some(Optimum {
                            weight,
                            robust,
                            hypothesis: TransformHypothesis {
                                reference: k,
                                rotation,
                                offset,
                            },
                        });
                    }
                    if partial.mirror_optima[irefmir].map_or(true, |best| weight > best.weight) {
                        partial.mirror_optima[irefmir] = Some(MirrorOptimum {
                            weight,
                            iflip,
                            offset,
                        });
                    }
                }

                partial.sumw_refpsi[local * nr_psi + ipsi] += my_sumstored;
                if flip.mirrored {
                    partial.refw_mirror[local] += my_sumweight;
                } else {
                    partial.refw[local] += my_sumweight;
                }

                if my_sumstored != 0.0 {
                    let weight_spectrum = ctx.plans.forward(weight_map.view());
                    let slot = &mut partial.images[local * nr_psi + ipsi];
                    let sum = slot.get_or_insert_with(|| Array2::zeros((dim, dim)));
                    Zip::from(sum)
                        .and(&image.spectra[iflip])
                        .and(&weight_spectrum)
                        .for_each(|s, &x, &m| *s = *s + x * m.conj());
                }
            }
        }
    }
    partial
}

/// Run the expectation step for one image.
///
/// `ranges` partitions the references; with `parallel_ranges` the ranges are
/// evaluated concurrently and combined in order.
pub fn expectation_single_image<F: MlFloat>(
    ctx: &ExpectationContext<'_, F>,
    particle: &ParticleImage<F>,
    hints: &ImageHints,
    ranges: &[Range<usize>],
    parallel_ranges: bool,
) -> Result<ImageOutcome<F>> {
    let model = ctx.model;
    let grid = ctx.grid;
    let n_ref = model.n_references();
    let nr_psi = grid.nr_psi();
    let nr_mirrors = grid.nr_mirrors();
    let sigma2 = model.sigma_noise2();
    let dim = ctx.plans.dim();
    let normalization = model.normalization.as_ref();
    let opt_scale = if normalization.is_some() { hints.scale } else { 1.0 };

    let image = PreparedImage::new(ctx, particle.data.view(), hints.bgmean);

    let mask = if ctx.fast_mode {
        let input = SignificanceInput {
            flipped: &image.flipped,
            xi2: image.xi2,
            opt_scale,
            offsets: &hints.offsets,
            keep_reference: hints.opt_reference,
        };
        preselect_significant(&input, &particle.id, model, ctx.bank, grid, ctx.prior, ctx.c_fast)?
    } else {
        SignificanceMask::all(n_ref, grid.nr_rotations())
    };

    let mut trymindiff = hints
        .trymindiff
        .unwrap_or(ctx.trymindiff_factor * 0.5 * image.xi2);
    let mut redo_count = 0;

    let pass = loop {
        let evaluate = |range: &Range<usize>| {
            evaluate_range(ctx, &image, &mask, range.clone(), trymindiff, opt_scale)
        };
        let parts: Vec<PassPartial<F>> = if parallel_ranges {
            ranges.par_iter().map(evaluate).collect()
        } else {
            ranges.iter().map(evaluate).collect()
        };
        let mut pass = PassPartial::empty(0, nr_psi, nr_mirrors);
        for part in parts {
            pass.append(part);
        }

        if !pass.mindiff.is_finite() {
            return Err(MlError::EmptyHypothesisSet {
                image: particle.id.clone(),
            });
        }
        let sum_refw = pass.sum_refw();
        let out_of_range = ((pass.mindiff - trymindiff) / sigma2).abs() > TRYMINDIFF_RANGE;
        if out_of_range || !(sum_refw > 0.0 && sum_refw.is_finite()) {
            redo_count += 1;
            if redo_count > 1 {
                return Err(MlError::RepeatedTrialMinimum {
                    image: particle.id.clone(),
                });
            }
            log::debug!(
                "image {}: trial minimum {:.6e} corrected to {:.6e}",
                particle.id,
                trymindiff,
                pass.mindiff
            );
            trymindiff = pass.mindiff;
        } else {
            break pass;
        }
    };

    let sum_refw = pass.sum_refw();
    let optimum = match pass.optimum {
        Some(o) => o,
        None => {
            return Err(MlError::EmptyHypothesisSet {
                image: particle.id.clone(),
            })
        }
    };
    let best = optimum.hypothesis;
    let (iopt_flip, iopt_psi) = grid.split_rotation(best.rotation);
    let opt_flip = grid.flip(iopt_flip);
    let fracweight = optimum.weight / sum_refw;

    // Normalization: non-ML background update, ML scale update
    let mut new_hints = hints.clone();
    let mut new_scale = opt_scale;
    if normalization.is_some() {
        let ref_mean = ctx.bank.get(best.reference).mean(iopt_psi);
        new_hints.bgmean = image.raw_mean - opt_scale * ref_mean;
        let scale = pass.wsum_sc / pass.wsum_sc2;
        // A non-positive scale would flip the reference contrast.
        if scale.is_finite() && scale > 0.0 {
            new_scale = scale;
        }
        new_hints.scale = new_scale;
    }

    let log_likelihood = model
        .noise
        .log_likelihood(sum_refw, trymindiff, sigma2, model.n_pixels());

    // Contribution, divided by the total weight of the image
    let image_factor = F::from_f64_c(new_scale / sum_refw);
    let bg_shift = (new_hints.bgmean - hints.bgmean) * (dim * dim) as f64;
    let images = pass
        .images
        .into_iter()
        .zip(pass.sumw_refpsi.iter())
        .map(|(spectrum, &sumw_refpsi)| {
            spectrum.map(|mut s| {
                if normalization.is_some() {
                    s[[0, 0]] = s[[0, 0]] - Complex::new(F::from_f64_c(sumw_refpsi * bg_shift), F::zero());
                }
                s.mapv_inplace(|v| v * image_factor);
                s
            })
        })
        .collect();

    let mut references = ReferenceSums::zeros(n_ref);
    for k in 0..n_ref {
        let refw_total = pass.refw[k] + pass.refw_mirror[k];
        references.sumw[k] = refw_total / sum_refw;
        references.sumw2[k] = pass.refw2[k] / sum_refw;
        references.sumw_mirror[k] = pass.refw_mirror[k] / sum_refw;
        references.sumwsc[k] = pass.refw2[k] * new_scale / sum_refw;
        references.sumwsc2[k] = pass.refw2[k] * new_scale * new_scale / sum_refw;
    }

    let contribution = ImageContribution {
        images,
        references,
        wsum_sigma_noise: 2.0 * pass.wsum_corr / sum_refw,
        wsum_sigma_offset: pass.wsum_offset / sum_refw,
        fracweight,
        log_likelihood,
    };

    new_hints.opt_reference = best.reference;
    new_hints.trymindiff = Some(pass.mindiff);
    if ctx.fast_mode {
        for (slot, optimum) in new_hints.offsets.iter_mut().zip(pass.mirror_optima.iter()) {
            if let Some(o) = optimum {
                *slot = Some(grid.flip(o.iflip).to_image_frame(o.offset));
            }
        }
    }

    let record = ImageRecord {
        id: particle.id.clone(),
        noise_group: particle.noise_group,
        reference: best.reference,
        rotation: grid.rotation_angle(best.rotation),
        offset: opt_flip.to_image_frame(best.offset),
        mirrored: opt_flip.mirrored,
        max_weight_fraction: fracweight,
        log_likelihood,
        robustness_weight: optimum.robust,
        scale: new_hints.scale,
        bgmean: new_hints.bgmean,
    };

    Ok(ImageOutcome {
        contribution,
        record,
        hints: new_hints,
        redo_count,
        total_weight: sum_refw,
    })
}
