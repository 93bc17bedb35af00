//! Convergence monitor: relative signal change of every reference.

use serde::{Deserialize, Serialize};

use crate::error::{MlError, Result};
use crate::float_trait::MlFloat;
use crate::model::Reference;

/// Metric reported for a reference without weight.
pub const DEAD_REFERENCE_METRIC: f64 = -1.0;

/// Per-reference change metrics of one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceReport {
    /// `sum((new - old)^2) / sum(old^2)`, or [`DEAD_REFERENCE_METRIC`].
    pub metrics: Vec<f64>,
    pub converged: bool,
}

/// Relative squared change from `old` to `new`.
///
/// An all-zero `old` gives 0 when `new` is also zero and infinity otherwise.
pub fn signal_change<F: MlFloat>(old: &Reference<F>, new: &Reference<F>) -> f64 {
    let mut old_energy = 0.0;
    let mut change = 0.0;
    for (&o, &n) in old.data.iter().zip(new.data.iter()) {
        let o = o.as_f64();
        let d = n.as_f64() - o;
        old_energy += o * o;
        change += d * d;
    }
    if old_energy > 0.0 {
        change / old_energy
    } else if change == 0.0 {
        0.0
    } else {
        f64::INFINITY
    }
}

/// Compare two reference snapshots.
///
/// Only references with weight in `new` take part in the test; the others
/// report [`DEAD_REFERENCE_METRIC`].
pub fn check_convergence<F: MlFloat>(
    old: &[Reference<F>],
    new: &[Reference<F>],
    epsilon: f64,
) -> Result<ConvergenceReport> {
    if old.len() != new.len() {
        return Err(MlError::DimensionMismatch {
            expected: (old.len(), 1),
            found: (new.len(), 1),
        });
    }
    let mut converged = true;
    let metrics = old
        .iter()
        .zip(new.iter())
        .map(|(o, n)| {
            if n.is_alive() {
                let metric = signal_change(o, n);
                if !(metric < epsilon) {
                    converged = false;
                }
                metric
            } else {
                DEAD_REFERENCE_METRIC
            }
        })
        .collect();
    Ok(ConvergenceReport { metrics, converged })
}
