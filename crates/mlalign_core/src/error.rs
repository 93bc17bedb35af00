//! Error taxonomy of the alignment engine.
//!
//! Numerical-range problems inside one image are recovered locally by the
//! trial-minimum redo and never reach this type, except when a second redo
//! would be needed, which is a logic defect and reported as
//! [`MlError::RepeatedTrialMinimum`].

use thiserror::Error;

/// Errors surfaced by session construction, iterations and checkpoint I/O.
#[derive(Debug, Error)]
pub enum MlError {
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An image or reference does not match the session geometry.
    #[error("dimension mismatch: expected {expected:?}, found {found:?}")]
    DimensionMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    /// No images (or no references) were supplied.
    #[error("no images supplied")]
    EmptyImageSet,

    /// A model parameter left its valid range during the M-step.
    #[error("degenerate model: {parameter} = {value}")]
    DegenerateModel { parameter: &'static str, value: f64 },

    /// The trial minimum needed more than one correction for one image.
    #[error("trial minimum diff was corrected twice for image {image}")]
    RepeatedTrialMinimum { image: String },

    /// The significance filter left no hypothesis for an image.
    #[error("no significant hypothesis left for image {image}")]
    EmptyHypothesisSet { image: String },

    /// A checkpoint does not fit the images it is resumed with.
    #[error("checkpoint mismatch: {0}")]
    CheckpointMismatch(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, MlError>;
