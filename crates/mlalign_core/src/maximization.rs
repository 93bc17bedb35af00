//! Maximization step: new references and model parameters from one
//! iteration's weighted sums.
//!
//! The weighted image sum of every `(reference, psi)` pair is brought back to
//! real space, rotated back by `-psi` into the frame of the unrotated
//! reference and summed. Dividing by the scale-squared weight mass gives the
//! new class average. References without any weight become dead components.

use ndarray::Array2;
use rayon::prelude::*;

use crate::accumulator::WeightedAccumulator;
use crate::config::MlConfig;
use crate::error::{MlError, Result};
use crate::float_trait::MlFloat;
use crate::geometry::rotate;
use crate::hypothesis::HypothesisGrid;
use crate::model::{Model, NormalizationState, Reference};
use crate::transforms::FourierPlans;

/// Model and references produced by one M-step.
#[derive(Debug, Clone)]
pub struct MaximizationOutput<F: MlFloat> {
    pub model: Model,
    pub references: Vec<Reference<F>>,
}

/// Sum the de-rotated weighted images of reference `k`.
fn reconstruct_reference<F: MlFloat>(
    accumulator: &WeightedAccumulator<F>,
    k: usize,
    grid: &HypothesisGrid,
    plans: &FourierPlans<F>,
) -> Array2<F> {
    let dim = plans.dim();
    let mut sum = Array2::<F>::zeros((dim, dim));
    for ipsi in 0..grid.nr_psi() {
        if let Some(spectrum) = accumulator.image(k, ipsi) {
            let aligned = plans.inverse(spectrum);
            let back = rotate(aligned.view(), -grid.psi_angle(ipsi));
            sum += &back;
        }
    }
    sum
}

/// Run the M-step.
///
/// `previous` supplies the parameters that stay fixed and the noise model.
/// On a degenerate result the error is returned and nothing of the new model
/// escapes, so the caller keeps `previous`.
pub fn maximize<F: MlFloat>(
    accumulator: &WeightedAccumulator<F>,
    previous: &Model,
    grid: &HypothesisGrid,
    plans: &FourierPlans<F>,
    config: &MlConfig,
) -> Result<MaximizationOutput<F>> {
    let n_ref = previous.n_references();
    if accumulator.n_references() != n_ref {
        return Err(MlError::DimensionMismatch {
            expected: (n_ref, grid.nr_psi()),
            found: (accumulator.n_references(), accumulator.nr_psi()),
        });
    }
    let dim = plans.dim();
    let sums = &accumulator.references;
    let mut model = previous.clone();

    // References
    let mut references: Vec<Reference<F>> = (0..n_ref)
        .into_par_iter()
        .map(|k| {
            if sums.sumw[k] > 0.0 && sums.sumwsc2[k] > 0.0 {
                let mut data = reconstruct_reference(accumulator, k, grid, plans);
                let inv = F::from_f64_c(1.0 / sums.sumwsc2[k]);
                data.mapv_inplace(|v| v * inv);
                let weight = if model.noise.is_robust() {
                    sums.sumw2[k]
                } else {
                    sums.sumw[k]
                };
                Reference { data, weight }
            } else {
                Reference::dead(dim)
            }
        })
        .collect();

    let live = |k: usize| sums.sumw[k] > 0.0 && sums.sumwsc2[k] > 0.0;
    model.sumw_allrefs = (0..n_ref).filter(|&k| live(k)).map(|k| sums.sumw[k]).sum();
    model.sumw_allrefs2 = if model.noise.is_robust() {
        (0..n_ref).filter(|&k| live(k)).map(|k| sums.sumw2[k]).sum()
    } else {
        0.0
    };
    let sumw_allrefs = model.sumw_allrefs;

    // Intensity scales
    if let Some(norm) = model.normalization.as_mut() {
        for k in 0..n_ref {
            norm.scales[k] = if sums.sumw[k] > 0.0 {
                sums.sumwsc[k] / sums.sumw[k]
            } else {
                1.0
            };
        }
        correct_scale_average(norm, &mut references, &sums.sumwsc, &sums.sumw, sumw_allrefs);
    }

    // Fractions
    if !config.fix_fractions {
        for k in 0..n_ref {
            let (alpha, mirror) = if sums.sumw[k] > 0.0 && sumw_allrefs > 0.0 {
                (sums.sumw[k] / sumw_allrefs, sums.sumw_mirror[k] / sums.sumw[k])
            } else {
                (0.0, 0.0)
            };
            model.alpha[k] = alpha;
            model.mirror_fraction[k] = mirror;
        }
    }

    model.ave_pmax = accumulator.sumfracweight / sumw_allrefs;

    if !config.fix_sigma_offset {
        model.sigma_offset = (accumulator.wsum_sigma_offset / (2.0 * sumw_allrefs)).sqrt();
    }

    if !config.fix_sigma_noise {
        let mass = if model.noise.uses_sigma_trick() {
            model.sumw_allrefs2
        } else {
            sumw_allrefs
        };
        model.sigma_noise = (accumulator.wsum_sigma_noise / (mass * model.n_pixels())).sqrt();
    }

    model.log_likelihood = accumulator.log_likelihood;

    model.validate()?;
    Ok(MaximizationOutput { model, references })
}

/// Share one scale per class of consecutive references and fold it into the
/// references; record the weighted average scale.
fn correct_scale_average<F: MlFloat>(
    norm: &mut NormalizationState,
    references: &mut [Reference<F>],
    sumwsc: &[f64],
    sumw: &[f64],
    sumw_allrefs: f64,
) {
    let nr_classes = norm.nr_classes();
    let mut wsum_scale = vec![0.0; nr_classes];
    let mut sumw_scale = vec![0.0; nr_classes];
    for k in 0..references.len() {
        let class = norm.class_of(k);
        wsum_scale[class] += sumwsc[k];
        sumw_scale[class] += sumw[k];
    }
    for (k, reference) in references.iter_mut().enumerate() {
        let class = norm.class_of(k);
        if sumw_scale[class] > 0.0 {
            let scale = wsum_scale[class] / sumw_scale[class];
            norm.scales[k] = scale;
            let factor = F::from_f64_c(scale);
            reference.data.mapv_inplace(|v| v * factor);
        } else {
            norm.scales[k] = 1.0;
        }
    }
    norm.average_scale = if sumw_allrefs > 0.0 {
        sumwsc.iter().sum::<f64>() / sumw_allrefs
    } else {
        1.0
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::{ImageContribution, ReferenceSums};
    use crate::config::{NoiseModelConfig, NormalizationConfig};
    use crate::test_support::{asymmetric_particle, correlation_coefficient};
    use rustfft::num_complex::Complex;

    const DIM: usize = 16;

    /// One image contribution placing `image` with unit weight on `(k, ipsi)`.
    fn contribution(
        plans: &FourierPlans<f64>,
        n_ref: usize,
        nr_psi: usize,
        k: usize,
        ipsi: usize,
        image: &Array2<f64>,
    ) -> ImageContribution<f64> {
        let mut images: Vec<Option<Array2<Complex<f64>>>> = vec![None; n_ref * nr_psi];
        images[k * nr_psi + ipsi] = Some(plans.forward(image.view()));
        let mut references = ReferenceSums::zeros(n_ref);
        references.sumw[k] = 1.0;
        references.sumw2[k] = 1.0;
        references.sumwsc[k] = 1.0;
        references.sumwsc2[k] = 1.0;
        ImageContribution {
            images,
            references,
            wsum_sigma_noise: (DIM * DIM) as f64 * 0.04,
            wsum_sigma_offset: 2.0,
            fracweight: 0.8,
            log_likelihood: -10.0,
        }
    }

    #[test]
    fn test_average_of_aligned_images_and_dead_component() {
        let plans = FourierPlans::<f64>::new(DIM);
        let grid = HypothesisGrid::new(90.0, false);
        let config = MlConfig::new();
        let model = Model::initial(&config, 2, DIM);
        let a = asymmetric_particle(DIM, 1.0);
        let b = a.mapv(|v| 3.0 * v);

        let mut acc = WeightedAccumulator::new(2, 1, DIM);
        acc.add_image(&contribution(&plans, 2, 1, 0, 0, &a));
        acc.add_image(&contribution(&plans, 2, 1, 0, 0, &b));

        let out = maximize(&acc, &model, &grid, &plans, &config).unwrap();
        let expected = a.mapv(|v| 2.0 * v);
        for (x, y) in out.references[0].data.iter().zip(expected.iter()) {
            assert!((x - y).abs() < 1e-12, "{} vs {}", x, y);
        }
        assert_eq!(out.references[0].weight, 2.0);
        assert!(!out.references[1].is_alive());
        assert!(out.references[1].data.iter().all(|&v| v == 0.0));

        let m = &out.model;
        assert_eq!(m.alpha, vec![1.0, 0.0]);
        assert_eq!(m.mirror_fraction, vec![0.0, 0.0]);
        assert!((m.sigma_noise - 0.2).abs() < 1e-12, "sigma_noise {}", m.sigma_noise);
        assert!((m.sigma_offset - 1.0).abs() < 1e-12, "sigma_offset {}", m.sigma_offset);
        assert!((m.ave_pmax - 0.8).abs() < 1e-12);
        assert_eq!(m.log_likelihood, -20.0);
        assert_eq!(m.sumw_allrefs, 2.0);
    }

    #[test]
    fn test_fixed_parameters_are_kept() {
        let plans = FourierPlans::<f64>::new(DIM);
        let grid = HypothesisGrid::new(90.0, false);
        let mut config = MlConfig::new();
        config.fix_fractions = true;
        config.fix_sigma_noise = true;
        config.fix_sigma_offset = true;
        let model = Model::initial(&config, 2, DIM);

        let mut acc = WeightedAccumulator::new(2, 1, DIM);
        acc.add_image(&contribution(&plans, 2, 1, 1, 0, &asymmetric_particle(DIM, 1.0)));
        let out = maximize(&acc, &model, &grid, &plans, &config).unwrap();

        assert_eq!(out.model.alpha, model.alpha);
        assert_eq!(out.model.sigma_noise, model.sigma_noise);
        assert_eq!(out.model.sigma_offset, model.sigma_offset);
        assert!(out.references[1].is_alive());
    }

    #[test]
    fn test_rotated_contributions_are_rotated_back() {
        let plans = FourierPlans::<f64>::new(32);
        let grid = HypothesisGrid::new(45.0, false);
        let config = MlConfig::new();
        let model = Model::initial(&config, 1, 32);
        let a = asymmetric_particle(32, 1.0);
        let turned = rotate(a.view(), grid.psi_angle(1));

        let mut images: Vec<Option<Array2<Complex<f64>>>> = vec![None; 2];
        images[1] = Some(plans.forward(turned.view()));
        let mut references = ReferenceSums::zeros(1);
        references.sumw[0] = 1.0;
        references.sumw2[0] = 1.0;
        references.sumwsc[0] = 1.0;
        references.sumwsc2[0] = 1.0;
        let mut acc = WeightedAccumulator::new(1, 2, 32);
        acc.add_image(&ImageContribution {
            images,
            references,
            wsum_sigma_noise: 1.0,
            wsum_sigma_offset: 1.0,
            fracweight: 1.0,
            log_likelihood: 0.0,
        });

        let out = maximize(&acc, &model, &grid, &plans, &config).unwrap();
        let cc = correlation_coefficient(&out.references[0].data, &a);
        assert!(cc > 0.9, "correlation after rotating back {}", cc);
    }

    #[test]
    fn test_student_weight_and_sigma_trick() {
        let plans = FourierPlans::<f64>::new(DIM);
        let grid = HypothesisGrid::new(90.0, false);
        let mut config = MlConfig::new();
        config.noise_model = NoiseModelConfig::student_t();
        let model = Model::initial(&config, 1, DIM);

        let mut c = contribution(&plans, 1, 1, 0, 0, &asymmetric_particle(DIM, 1.0));
        c.references.sumw2[0] = 0.5;
        c.references.sumwsc2[0] = 0.5;
        let mut acc = WeightedAccumulator::new(1, 1, DIM);
        acc.add_image(&c);

        let out = maximize(&acc, &model, &grid, &plans, &config).unwrap();
        assert_eq!(out.references[0].weight, 0.5);
        assert_eq!(out.model.sumw_allrefs2, 0.5);
        // Residual divided by the robust mass 0.5 instead of 1
        let expected = (0.04 / 0.5f64).sqrt();
        assert!((out.model.sigma_noise - expected).abs() < 1e-12);
    }

    #[test]
    fn test_class_scales_are_shared_and_folded_into_references() {
        let plans = FourierPlans::<f64>::new(DIM);
        let grid = HypothesisGrid::new(90.0, false);
        let mut config = MlConfig::new();
        config.normalization = Some(NormalizationConfig { refs_per_class: 2 });
        let model = Model::initial(&config, 2, DIM);
        let a = asymmetric_particle(DIM, 1.0);

        let mut first = contribution(&plans, 2, 1, 0, 0, &a);
        first.references.sumwsc[0] = 3.0;
        let second = contribution(&plans, 2, 1, 1, 0, &a);
        let mut acc = WeightedAccumulator::new(2, 1, DIM);
        acc.add_image(&first);
        acc.add_image(&second);

        let out = maximize(&acc, &model, &grid, &plans, &config).unwrap();
        let norm = out.model.normalization.as_ref().unwrap();
        assert_eq!(norm.scales, vec![2.0, 2.0]);
        assert_eq!(norm.average_scale, 2.0);
        for (x, y) in out.references[1].data.iter().zip(a.iter()) {
            assert!((x - 2.0 * y).abs() < 1e-12);
        }
    }

    #[test]
    fn test_exact_fit_gives_zero_noise() {
        let plans = FourierPlans::<f64>::new(DIM);
        let grid = HypothesisGrid::new(90.0, false);
        let config = MlConfig::new();
        let model = Model::initial(&config, 1, DIM);
        let mut c = contribution(&plans, 1, 1, 0, 0, &asymmetric_particle(DIM, 1.0));
        c.wsum_sigma_noise = 0.0;
        let mut acc = WeightedAccumulator::new(1, 1, DIM);
        acc.add_image(&c);

        let out = maximize(&acc, &model, &grid, &plans, &config).unwrap();
        assert_eq!(out.model.sigma_noise, 0.0);
        assert!(out.references[0].is_alive());
        assert!(out.model.ensure_expectation_ready().is_err());
    }

    #[test]
    fn test_negative_residual_is_degenerate() {
        let plans = FourierPlans::<f64>::new(DIM);
        let grid = HypothesisGrid::new(90.0, false);
        let config = MlConfig::new();
        let model = Model::initial(&config, 1, DIM);
        let mut c = contribution(&plans, 1, 1, 0, 0, &asymmetric_particle(DIM, 1.0));
        c.wsum_sigma_noise = -1e-12;
        let mut acc = WeightedAccumulator::new(1, 1, DIM);
        acc.add_image(&c);

        let err = maximize(&acc, &model, &grid, &plans, &config).unwrap_err();
        assert!(matches!(
            err,
            MlError::DegenerateModel {
                parameter: "sigma_noise",
                ..
            }
        ));
    }
}
