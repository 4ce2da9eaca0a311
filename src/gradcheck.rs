//! Numerical Gradient Checking
//!
//! Estimates `∂f/∂x_i` by central differences and compares the estimate with
//! an analytic gradient:
//!
//! ```text
//! ∂f/∂x_i ≈ (f(x + ε·e_i) - f(x - ε·e_i)) / 2ε
//! ```
//!
//! Each coordinate needs two independent evaluations of `f`, so coordinates
//! are spread over the Rayon thread pool.
//!
//! ## Error Measure
//!
//! Per coordinate the checker reports
//!
//! ```text
//! |analytic - numeric| / max(1, |analytic|, |numeric|)
//! ```
//!
//! which is an absolute error for small gradients and a relative error for
//! large ones. With `f32` arithmetic, `ε ≈ 1e-2` keeps rounding noise well
//! below the truncation error of the difference quotient.

use crate::error::{AttentionError, Result};
use rayon::prelude::*;

/// Outcome of comparing an analytic gradient against central differences
#[derive(Clone, Debug, PartialEq)]
pub struct GradCheckReport {
    /// Number of coordinates compared
    pub checked: usize,
    /// Largest mixed absolute/relative error
    pub max_error: f32,
    /// Coordinate where `max_error` occurred
    pub worst_index: Option<usize>,
    pub numeric: Vec<f32>,
}

impl GradCheckReport {
    pub fn passed(&self, tolerance: f32) -> bool {
        self.max_error <= tolerance
    }
}

/// Central-difference gradient of `f` at `x`
pub fn numeric_gradient<F>(f: F, x: &[f32], epsilon: f32) -> Result<Vec<f32>>
where
    F: Fn(&[f32]) -> Result<f32> + Sync,
{
    if epsilon.is_nan() || epsilon <= 0.0 {
        return Err(AttentionError::InvalidConfig(format!(
            "gradient check epsilon must be positive, got {epsilon}"
        )));
    }

    (0..x.len())
        .into_par_iter()
        .map(|i| {
            let mut probe = x.to_vec();
            probe[i] = x[i] + epsilon;
            let plus = f(&probe)?;
            probe[i] = x[i] - epsilon;
            let minus = f(&probe)?;
            Ok((plus - minus) / (2.0 * epsilon))
        })
        .collect()
}

/// Compare `analytic` with the central-difference gradient of `f` at `x`
pub fn check_gradient<F>(f: F, x: &[f32], analytic: &[f32], epsilon: f32) -> Result<GradCheckReport>
where
    F: Fn(&[f32]) -> Result<f32> + Sync,
{
    if analytic.len() != x.len() {
        return Err(AttentionError::shape("analytic gradient", &[x.len()], &[analytic.len()]));
    }
    let numeric = numeric_gradient(f, x, epsilon)?;

    let mut max_error = 0.0f32;
    let mut worst_index = None;
    for (i, (&a, &n)) in analytic.iter().zip(&numeric).enumerate() {
        let error = (a - n).abs() / 1.0f32.max(a.abs()).max(n.abs());
        if worst_index.is_none() || error > max_error {
            max_error = error;
            worst_index = Some(i);
        }
    }

    Ok(GradCheckReport {
        checked: x.len(),
        max_error,
        worst_index,
        numeric,
    })
}
