//! Global mixture model: references, fractions, variances and the noise kernel.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::config::{MlConfig, NoiseModelConfig};
use crate::error::{MlError, Result};
use crate::float_trait::MlFloat;

/// Exponent above which a Gaussian kernel weight is flushed to zero.
const MAX_KERNEL_EXPONENT: f64 = 1000.0;

/// Tolerance on the sum of the mixture fractions.
const ALPHA_SUM_TOLERANCE: f64 = 1e-9;

/// One mixture component: the current class average and its weight
/// (effective number of images assigned to it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Reference<F: MlFloat> {
    pub data: Array2<F>,
    pub weight: f64,
}

impl<F: MlFloat> Reference<F> {
    pub fn new(data: Array2<F>) -> Self {
        Self { data, weight: 0.0 }
    }

    /// A dead component: zero image, zero weight.
    pub fn dead(dim: usize) -> Self {
        Self {
            data: Array2::zeros((dim, dim)),
            weight: 0.0,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.weight > 0.0
    }
}

/// Pixel-noise kernel, selected once per session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoiseModel {
    Gaussian,
    StudentT { df: f64, sigma_trick: bool },
}

impl From<NoiseModelConfig> for NoiseModel {
    fn from(config: NoiseModelConfig) -> Self {
        match config {
            NoiseModelConfig::Gaussian => NoiseModel::Gaussian,
            NoiseModelConfig::StudentT { df, sigma_trick } => {
                NoiseModel::StudentT { df, sigma_trick }
            }
        }
    }
}

impl NoiseModel {
    /// Unnormalized kernel value for a half squared residual `diff`, relative
    /// to the trial minimum `trymindiff`.
    ///
    /// `n_pixels` is the number of observed samples per image.
    #[inline]
    pub fn kernel(&self, diff: f64, trymindiff: f64, sigma2: f64, n_pixels: f64) -> f64 {
        match *self {
            NoiseModel::Gaussian => {
                let exponent = (diff - trymindiff) / sigma2;
                if exponent > MAX_KERNEL_EXPONENT {
                    0.0
                } else {
                    (-exponent).exp()
                }
            }
            NoiseModel::StudentT { df, .. } => {
                let df_sigma2 = df * sigma2;
                let ratio = (df_sigma2 + 2.0 * diff) / (df_sigma2 + 2.0 * trymindiff);
                ratio.powf(student_exponent(df, n_pixels))
            }
        }
    }

    /// Extra per-hypothesis weight of the robust kernel; 1 for Gaussian noise.
    #[inline]
    pub fn robust_weight(&self, diff: f64, sigma2: f64, n_pixels: f64) -> f64 {
        match *self {
            NoiseModel::Gaussian => 1.0,
            NoiseModel::StudentT { df, .. } => (df + n_pixels) / (df + 2.0 * diff / sigma2),
        }
    }

    /// Log-likelihood of one image given its total kernel mass `sum_weight`
    /// evaluated relative to `mindiff`.
    pub fn log_likelihood(&self, sum_weight: f64, mindiff: f64, sigma2: f64, n_pixels: f64) -> f64 {
        match *self {
            NoiseModel::Gaussian => {
                sum_weight.ln()
                    - mindiff / sigma2
                    - n_pixels * (2.0 * std::f64::consts::PI * sigma2).sqrt().ln()
            }
            NoiseModel::StudentT { df, .. } => {
                let df2 = student_exponent(df, n_pixels);
                sum_weight.ln() + df2 * (1.0 + 2.0 * mindiff / (df * sigma2)).ln()
                    - n_pixels * (std::f64::consts::PI * df * sigma2).sqrt().ln()
                    + ln_gamma(-df2)
                    - ln_gamma(df / 2.0)
            }
        }
    }

    /// Whether the noise update divides by the second-order weight mass.
    pub fn uses_sigma_trick(&self) -> bool {
        matches!(
            self,
            NoiseModel::StudentT {
                sigma_trick: true,
                ..
            }
        )
    }

    pub fn is_robust(&self) -> bool {
        matches!(self, NoiseModel::StudentT { .. })
    }
}

#[inline]
fn student_exponent(df: f64, n_pixels: f64) -> f64 {
    -(df + n_pixels) / 2.0
}

/// Natural logarithm of the gamma function (Lanczos approximation, g = 7).
pub fn ln_gamma(x: f64) -> f64 {
    const G: f64 = 7.0;
    const COEFFS: [f64; 9] = [
        0.999_999_999_999_809_9,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];
    if x < 0.5 {
        // Reflection formula
        let pi = std::f64::consts::PI;
        return (pi / (pi * x).sin()).ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let mut a = COEFFS[0];
    let t = x + G + 0.5;
    for (i, &c) in COEFFS.iter().enumerate().skip(1) {
        a += c / (x + i as f64);
    }
    0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + a.ln()
}

/// Per-reference intensity scales, shared by classes of consecutive references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationState {
    pub scales: Vec<f64>,
    pub average_scale: f64,
    pub refs_per_class: usize,
}

impl NormalizationState {
    pub fn new(n_references: usize, refs_per_class: usize) -> Self {
        Self {
            scales: vec![1.0; n_references],
            average_scale: 1.0,
            refs_per_class,
        }
    }

    pub fn class_of(&self, reference: usize) -> usize {
        reference / self.refs_per_class
    }

    pub fn nr_classes(&self) -> usize {
        self.scales.len().div_ceil(self.refs_per_class)
    }
}

/// Global parameters shared by all images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub dim: usize,
    /// Mixture fractions, one per reference.
    pub alpha: Vec<f64>,
    /// Fraction of each reference's mass assigned to mirrored images.
    pub mirror_fraction: Vec<f64>,
    pub sigma_noise: f64,
    pub sigma_offset: f64,
    pub noise: NoiseModel,
    pub normalization: Option<NormalizationState>,
    /// Total weight mass of the last M-step.
    pub sumw_allrefs: f64,
    /// Total robust (second-order) weight mass of the last M-step.
    pub sumw_allrefs2: f64,
    /// Average top-weight fraction per image.
    pub ave_pmax: f64,
    pub log_likelihood: f64,
}

impl Model {
    /// Starting model: uniform fractions, configured variances.
    pub fn initial(config: &MlConfig, n_references: usize, dim: usize) -> Self {
        let mirror = if config.do_mirror { 0.5 } else { 0.0 };
        Self {
            dim,
            alpha: vec![1.0 / n_references as f64; n_references],
            mirror_fraction: vec![mirror; n_references],
            sigma_noise: config.initial_sigma_noise,
            sigma_offset: config.initial_sigma_offset,
            noise: config.noise_model.into(),
            normalization: config
                .normalization
                .map(|n| NormalizationState::new(n_references, n.refs_per_class)),
            sumw_allrefs: 0.0,
            sumw_allrefs2: 0.0,
            ave_pmax: 0.0,
            log_likelihood: 0.0,
        }
    }

    pub fn n_references(&self) -> usize {
        self.alpha.len()
    }

    pub fn sigma_noise2(&self) -> f64 {
        self.sigma_noise * self.sigma_noise
    }

    /// Number of observed samples per image.
    pub fn n_pixels(&self) -> f64 {
        (self.dim * self.dim) as f64
    }

    /// Prior mass of reference `k` in the given mirror state.
    pub fn class_prior(&self, k: usize, mirrored: bool) -> f64 {
        if mirrored {
            self.alpha[k] * self.mirror_fraction[k]
        } else {
            self.alpha[k] * (1.0 - self.mirror_fraction[k])
        }
    }

    /// Scale applied to reference `k` for an image of scale `opt_scale`.
    pub fn ref_scale(&self, k: usize, opt_scale: f64) -> f64 {
        match &self.normalization {
            Some(norm) => opt_scale / norm.scales[k],
            None => 1.0,
        }
    }

    /// Check that the model is internally consistent.
    ///
    /// A vanishing `sigma_noise` (every image matched exactly) passes here;
    /// [`Model::ensure_expectation_ready`] rejects it before the next E-step.
    pub fn validate(&self) -> Result<()> {
        if !(self.sigma_noise.is_finite() && self.sigma_noise >= 0.0) {
            return Err(degenerate("sigma_noise", self.sigma_noise));
        }
        if !(self.sigma_offset.is_finite() && self.sigma_offset >= 0.0) {
            return Err(degenerate("sigma_offset", self.sigma_offset));
        }
        for &a in &self.alpha {
            if !(a.is_finite() && a >= 0.0) {
                return Err(degenerate("alpha", a));
            }
        }
        for &m in &self.mirror_fraction {
            if !(m.is_finite() && (0.0..=1.0).contains(&m)) {
                return Err(degenerate("mirror_fraction", m));
            }
        }
        let total: f64 = self.alpha.iter().sum();
        if (total - 1.0).abs() > ALPHA_SUM_TOLERANCE {
            return Err(degenerate("sum of alpha", total));
        }
        if let Some(norm) = &self.normalization {
            for &s in &norm.scales {
                if !(s.is_finite() && s > 0.0) {
                    return Err(degenerate("scale", s));
                }
            }
        }
        Ok(())
    }

    /// Check that the model can drive another expectation step.
    pub fn ensure_expectation_ready(&self) -> Result<()> {
        self.validate()?;
        if self.sigma_noise <= 0.0 {
            return Err(degenerate("sigma_noise", self.sigma_noise));
        }
        Ok(())
    }
}

fn degenerate(parameter: &'static str, value: f64) -> MlError {
    MlError::DegenerateModel { parameter, value }
}
