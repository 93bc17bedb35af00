//! Float trait abstraction for f32/f64 support.
//!
//! Image, reference and Fourier data are generic over [`MlFloat`]. Probabilities,
//! weight sums and variances are always carried in `f64`, so the trait only has
//! to cover pixel arithmetic and FFT compatibility.

use num_traits::{Float, FromPrimitive, NumAssign};
use rustfft::FftNum;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::iter::Sum;

/// Trait alias for floating point types accepted as pixel data.
///
/// Combines the bounds needed by the alignment engine:
/// - Basic float operations (Float, NumAssign)
/// - FFT compatibility (FftNum from rustfft)
/// - Conversion from primitive types (FromPrimitive)
/// - Iteration support (Sum)
/// - Sharing across rayon workers (Send + Sync)
/// - Checkpoint persistence (Serialize + DeserializeOwned)
pub trait MlFloat:
    Float
    + FftNum
    + FromPrimitive
    + NumAssign
    + Sum
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Create a value from an f64 constant.
    fn from_f64_c(val: f64) -> Self;

    /// Create a value from a usize constant.
    fn usize_as(val: usize) -> Self;

    /// Widen to f64 for likelihood arithmetic.
    fn as_f64(self) -> f64;
}

impl MlFloat for f32 {
    #[inline]
    fn from_f64_c(val: f64) -> Self {
        val as f32
    }

    #[inline]
    fn usize_as(val: usize) -> Self {
        val as f32
    }

    #[inline]
    fn as_f64(self) -> f64 {
        self as f64
    }
}

impl MlFloat for f64 {
    #[inline]
    fn from_f64_c(val: f64) -> Self {
        val
    }

    #[inline]
    fn usize_as(val: usize) -> Self {
        val as f64
    }

    #[inline]
    fn as_f64(self) -> f64 {
        self
    }
}
