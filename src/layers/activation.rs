//! Activation Functions
//!
//! Scalar non-linearities applied to attention scores and recurrent outputs,
//! each with its derivative for backpropagation. Activations are selected by
//! name in [`crate::LayerConfig`] (`"tanh"`, `"gelu"`, ...).
//!
//! ## Derivatives
//!
//! Every backward pass here takes the **pre-activation** value `x` cached
//! during the forward pass and returns `f'(x)`:
//!
//! ```text
//! identity  f'(x) = 1
//! tanh      f'(x) = 1 - tanh²(x)
//! sigmoid   f'(x) = σ(x)(1 - σ(x))
//! relu      f'(x) = 1 if x > 0 else 0
//! softsign  f'(x) = 1 / (1 + |x|)²
//! gelu      see `gelu_derivative`
//! ```
//!
//! ## GELU Approximation
//!
//! GELU uses the tanh approximation:
//!
//! ```text
//! GELU(x) ≈ 0.5 × x × (1 + tanh(√(2/π) × (x + 0.044715 × x³)))
//! ```

use crate::error::AttentionError;
use crate::tensor::Tensor;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Named element-wise activation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Identity,
    #[default]
    Tanh,
    Sigmoid,
    Relu,
    Softsign,
    Gelu,
}

impl Activation {
    /// f(x)
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Activation::Identity => x,
            Activation::Tanh => x.tanh(),
            Activation::Sigmoid => sigmoid(x),
            Activation::Relu => x.max(0.0),
            Activation::Softsign => x / (1.0 + x.abs()),
            Activation::Gelu => {
                0.5 * x * (1.0 + ((2.0 / std::f32::consts::PI).sqrt() * (x + 0.044715 * x.powi(3))).tanh())
            }
        }
    }

    /// f'(x), evaluated at the pre-activation value
    #[inline]
    pub fn derivative(self, x: f32) -> f32 {
        match self {
            Activation::Identity => 1.0,
            Activation::Tanh => {
                let t = x.tanh();
                1.0 - t * t
            }
            Activation::Sigmoid => {
                let s = sigmoid(x);
                s * (1.0 - s)
            }
            Activation::Relu => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::Softsign => {
                let d = 1.0 + x.abs();
                1.0 / (d * d)
            }
            Activation::Gelu => gelu_derivative(x),
        }
    }

    /// Apply the activation element-wise
    pub fn forward(self, x: &Tensor) -> Tensor {
        let result = x.data.par_iter().map(|&v| self.apply(v)).collect();
        Tensor::new(result, x.shape.clone())
    }

    /// grad_x = grad_out * f'(x), with `x` the cached pre-activation
    pub fn backward(self, grad_out: &Tensor, x: &Tensor) -> Tensor {
        assert_eq!(grad_out.shape, x.shape, "Gradient and input shapes must match");
        let result = x
            .data
            .par_iter()
            .zip(&grad_out.data)
            .map(|(&x_val, &grad_val)| grad_val * self.derivative(x_val))
            .collect();
        Tensor::new(result, x.shape.clone())
    }

    pub fn name(self) -> &'static str {
        match self {
            Activation::Identity => "identity",
            Activation::Tanh => "tanh",
            Activation::Sigmoid => "sigmoid",
            Activation::Relu => "relu",
            Activation::Softsign => "softsign",
            Activation::Gelu => "gelu",
        }
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Derivative of the tanh-approximated GELU
///
/// Product rule over `0.5 × x × (1 + tanh(u))` with
/// `u = √(2/π)(x + 0.044715x³)`, using `tanh' = sech² = 1 - tanh²`.
fn gelu_derivative(x: f32) -> f32 {
    let sqrt_2_pi = (2.0 / std::f32::consts::PI).sqrt();
    let inner = sqrt_2_pi * (x + 0.044715 * x.powi(3));
    let tanh_inner = inner.tanh();
    let sech_sq = 1.0 - tanh_inner * tanh_inner;

    0.5 * (1.0 + tanh_inner) + 0.5 * x * sech_sq * sqrt_2_pi * (1.0 + 3.0 * 0.044715 * x.powi(2))
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Activation {
    type Err = AttentionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "identity" | "linear" => Ok(Activation::Identity),
            "tanh" => Ok(Activation::Tanh),
            "sigmoid" => Ok(Activation::Sigmoid),
            "relu" => Ok(Activation::Relu),
            "softsign" => Ok(Activation::Softsign),
            "gelu" => Ok(Activation::Gelu),
            other => Err(AttentionError::InvalidConfig(format!(
                "unknown activation '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const ALL: [Activation; 6] = [
        Activation::Identity,
        Activation::Tanh,
        Activation::Sigmoid,
        Activation::Relu,
        Activation::Softsign,
        Activation::Gelu,
    ];

    #[test]
    fn test_derivative_matches_central_difference() {
        let h = 1e-3;
        for act in ALL {
            // Stay away from relu's kink at 0
            for &x in &[-1.7f32, -0.4, 0.3, 1.1, 2.5] {
                let numeric = (act.apply(x + h) - act.apply(x - h)) / (2.0 * h);
                assert_abs_diff_eq!(act.derivative(x), numeric, epsilon = 2e-3);
            }
        }
    }

    #[test]
    fn test_backward_scales_gradient() {
        let x = Tensor::new(vec![-1.0, 0.5, 2.0], vec![3]);
        let g = Tensor::new(vec![2.0, 2.0, 2.0], vec![3]);
        let dx = Activation::Relu.backward(&g, &x);
        assert_eq!(dx.data, vec![0.0, 2.0, 2.0]);
    }

    #[test]
    fn test_gelu_known_values() {
        assert_abs_diff_eq!(Activation::Gelu.apply(0.0), 0.0);
        assert_abs_diff_eq!(Activation::Gelu.apply(1.0), 0.8412, epsilon = 1e-3);
    }

    #[test]
    fn test_parse_by_name() {
        for act in ALL {
            assert_eq!(act.name().parse::<Activation>().unwrap(), act);
        }
        assert_eq!("TANH".parse::<Activation>().unwrap(), Activation::Tanh);
        assert!(matches!(
            "swish".parse::<Activation>(),
            Err(AttentionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_serde_uses_lowercase_names() {
        let json = serde_json::to_string(&Activation::Softsign).unwrap();
        assert_eq!(json, "\"softsign\"");
        let back: Activation = serde_json::from_str("\"sigmoid\"").unwrap();
        assert_eq!(back, Activation::Sigmoid);
    }
}
