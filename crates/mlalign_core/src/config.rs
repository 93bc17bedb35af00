//! Run configuration for maximum-likelihood alignment.
//!
//! Defaults follow the classic 2D ML refinement settings: 5° in-plane
//! sampling, initial sigma_noise 1 and sigma_offset 3, convergence at 5e-5.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{MlError, Result};

// =============================================================================
// Constants
// =============================================================================

/// Default number of references generated by the bootstrap.
const DEFAULT_N_REFERENCES: usize = 1;

/// Default in-plane rotation sampling in degrees.
const DEFAULT_PSI_STEP: f64 = 5.0;

/// Default iteration cap.
const DEFAULT_MAX_ITERATIONS: usize = 100;

/// Default signal-change threshold for convergence.
const DEFAULT_EPSILON: f64 = 5e-5;

/// Default initial standard deviation of the pixel noise.
const DEFAULT_SIGMA_NOISE: f64 = 1.0;

/// Default initial standard deviation of the origin offsets (pixels).
const DEFAULT_SIGMA_OFFSET: f64 = 3.0;

/// Default significance fraction for fast mode.
const DEFAULT_C_FAST: f64 = 1e-12;

/// Default degrees of freedom of the Student-t kernel.
const DEFAULT_STUDENT_DF: f64 = 6.0;

/// Fraction of half the image energy used as first trial minimum.
const DEFAULT_TRYMINDIFF_FACTOR: f64 = 0.9;

/// References handled by one distributor task.
const DEFAULT_REFERENCE_LOAD: usize = 1;

/// Images handled by one batch task.
const DEFAULT_IMAGE_CHUNK: usize = 8;

// =============================================================================
// Types
// =============================================================================

/// Noise kernel selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoiseModelConfig {
    /// White Gaussian pixel noise.
    #[default]
    Gaussian,
    /// Student-t kernel with `df` degrees of freedom.
    StudentT {
        df: f64,
        /// Divide the noise residual by the second-order weight mass.
        sigma_trick: bool,
    },
}

impl NoiseModelConfig {
    /// Student-t with the default 6 degrees of freedom and the sigma trick on.
    pub fn student_t() -> Self {
        NoiseModelConfig::StudentT {
            df: DEFAULT_STUDENT_DF,
            sigma_trick: true,
        }
    }
}

/// Per-image intensity normalization settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizationConfig {
    /// Consecutive references sharing one intensity scale.
    pub refs_per_class: usize,
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self { refs_per_class: 1 }
    }
}

/// Parallel decomposition of the expectation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DistributionStrategy {
    /// Images in parallel, references sequential inside each image.
    #[default]
    ImageBatch,
    /// Images sequential, reference ranges in parallel inside each image.
    ReferenceRanges,
}

/// Configuration for one alignment session.
///
/// All parameters have defaults; use `Default::default()` for standard settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MlConfig {
    /// Number of references the bootstrap generates. Default: 1
    pub n_references: usize,
    /// In-plane rotation sampling (degrees). Default: 5
    pub psi_step: f64,
    /// Iteration cap. Default: 100
    pub max_iterations: usize,
    /// Convergence threshold on the signal change. Default: 5e-5
    pub epsilon: f64,
    /// Starting sigma_noise. Default: 1
    pub initial_sigma_noise: f64,
    /// Starting sigma_offset. Default: 3
    pub initial_sigma_offset: f64,
    /// Also search mirrored images. Default: false
    pub do_mirror: bool,
    /// Prune hypotheses with the significance filter. Default: false
    pub fast_mode: bool,
    /// Significance fraction for fast mode. Default: 1e-12
    pub c_fast: f64,
    /// Search translations within 3 sigma_offset instead of 6. Default: false
    pub reduced_translation_search: bool,
    /// Fixed translation half-width, overriding the sigma-derived one.
    pub max_offset_radius: Option<usize>,
    /// Start fast mode from zero offsets instead of a full search. Default: false
    pub zero_offsets: bool,
    /// Keep mixture and mirror fractions fixed. Default: false
    pub fix_fractions: bool,
    /// Keep sigma_offset fixed. Default: false
    pub fix_sigma_offset: bool,
    /// Keep sigma_noise fixed. Default: false
    pub fix_sigma_noise: bool,
    /// Noise kernel. Default: Gaussian
    pub noise_model: NoiseModelConfig,
    /// Intensity normalization; `None` disables it.
    pub normalization: Option<NormalizationConfig>,
    /// First-iteration trial minimum as a fraction of half the image energy. Default: 0.9
    pub trymindiff_factor: f64,
    /// Random seed; drawn once and persisted when absent.
    pub seed: Option<u64>,
    /// Parallel decomposition of the E-step. Default: ImageBatch
    pub strategy: DistributionStrategy,
    /// References per task in `ReferenceRanges` mode. Default: 1
    pub reference_load: usize,
    /// Images per task in `ImageBatch` mode. Default: 8
    pub image_chunk: usize,
    /// Dedicated worker count; `None` uses the global rayon pool.
    pub num_threads: Option<usize>,
    /// Rotate bootstrap subset averages to random multiples of 90°. Default: false
    pub randomize_bootstrap_rotations: bool,
    /// Log per-phase timings at debug level. Default: false
    pub profile_timing: bool,
}

impl Default for MlConfig {
    fn default() -> Self {
        Self {
            n_references: DEFAULT_N_REFERENCES,
            psi_step: DEFAULT_PSI_STEP,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            epsilon: DEFAULT_EPSILON,
            initial_sigma_noise: DEFAULT_SIGMA_NOISE,
            initial_sigma_offset: DEFAULT_SIGMA_OFFSET,
            do_mirror: false,
            fast_mode: false,
            c_fast: DEFAULT_C_FAST,
            reduced_translation_search: false,
            max_offset_radius: None,
            zero_offsets: false,
            fix_fractions: false,
            fix_sigma_offset: false,
            fix_sigma_noise: false,
            noise_model: NoiseModelConfig::Gaussian,
            normalization: None,
            trymindiff_factor: DEFAULT_TRYMINDIFF_FACTOR,
            seed: None,
            strategy: DistributionStrategy::ImageBatch,
            reference_load: DEFAULT_REFERENCE_LOAD,
            image_chunk: DEFAULT_IMAGE_CHUNK,
            num_threads: None,
            randomize_bootstrap_rotations: false,
            profile_timing: false,
        }
    }
}

impl MlConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration parameters.
    pub fn validate(&self) -> Result<()> {
        if !(self.psi_step > 0.0 && self.psi_step.is_finite()) {
            return Err(invalid("psi_step must be > 0"));
        }
        if self.max_iterations == 0 {
            return Err(invalid("max_iterations must be > 0"));
        }
        if !(self.epsilon >= 0.0) {
            return Err(invalid("epsilon must be >= 0"));
        }
        if !(self.initial_sigma_noise > 0.0 && self.initial_sigma_noise.is_finite()) {
            return Err(invalid("initial_sigma_noise must be > 0"));
        }
        if !(self.initial_sigma_offset >= 0.0 && self.initial_sigma_offset.is_finite()) {
            return Err(invalid("initial_sigma_offset must be >= 0"));
        }
        if !(self.c_fast >= 0.0 && self.c_fast <= 1.0) {
            return Err(invalid("c_fast must be within [0, 1]"));
        }
        if !(self.trymindiff_factor > 0.0) {
            return Err(invalid("trymindiff_factor must be > 0"));
        }
        if let NoiseModelConfig::StudentT { df, .. } = self.noise_model {
            if !(df > 0.0 && df.is_finite()) {
                return Err(invalid("student df must be > 0"));
            }
        }
        if let Some(norm) = self.normalization {
            if norm.refs_per_class == 0 {
                return Err(invalid("refs_per_class must be > 0"));
            }
        }
        if self.reference_load == 0 {
            return Err(invalid("reference_load must be > 0"));
        }
        if self.image_chunk == 0 {
            return Err(invalid("image_chunk must be > 0"));
        }
        if self.num_threads == Some(0) {
            return Err(invalid("num_threads must be > 0"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> MlError {
    MlError::InvalidConfig(message.to_string())
}

/// Load a configuration from a JSON file; missing fields take their defaults.
pub fn load_config(path: &Path) -> Result<MlConfig> {
    let contents = fs::read_to_string(path)?;
    let config: MlConfig = serde_json::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}
