//! Maximum-likelihood multi-reference alignment core.
//!
//! Expectation-maximization over noisy, rotated, translated and optionally
//! mirrored copies of a few unknown 2D references. Each iteration estimates
//! the references, the per-image alignment and the global noise, offset and
//! mixture parameters. This crate holds the algorithm only; image I/O and
//! program front-ends live elsewhere.

pub mod accumulator;
pub mod bootstrap;
pub mod config;
pub mod convergence;
pub mod distributor;
pub mod error;
pub mod expectation;
pub mod float_trait;
pub mod geometry;
pub mod hypothesis;
pub mod maximization;
pub mod model;
pub mod reference_transform;
pub mod session;
pub mod significance;
pub mod transforms;

#[cfg(test)]
mod test_support;

// Re-export commonly used types at the crate root
pub use config::{
    load_config, DistributionStrategy, MlConfig, NoiseModelConfig, NormalizationConfig,
};
pub use convergence::{check_convergence, ConvergenceReport};
pub use error::{MlError, Result};
pub use expectation::{expectation_single_image, ImageHints, ImageRecord, ParticleImage};
pub use float_trait::MlFloat;
pub use model::{Model, NoiseModel, Reference};
pub use session::{
    Checkpoint, InitialReferences, IterationLog, IterationReport, MlSession, RunOutcome,
    RunReport,
};
pub use transforms::{fft2d, ifft2d, FourierPlans};
