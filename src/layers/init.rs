//! Weight Initialization
//!
//! Named distributions used to fill parameter views at construction time.
//! Each scheme is parameterized by the tensor's fan-in and fan-out:
//!
//! ```text
//! xavier          N(0, 2 / (fan_in + fan_out))
//! xavier_uniform  U(-a, a),  a = √(6 / (fan_in + fan_out))
//! relu            N(0, 2 / fan_in)              (He initialization)
//! uniform         U(-a, a),  a = 1 / √fan_in
//! zero            0
//! normal          N(mean, std²)                 (explicit distribution)
//! uniform_range   U(lower, upper)               (explicit distribution)
//! constant        value
//! ```
//!
//! Sampling goes through a caller-owned RNG, so a layer built from a seeded
//! [`StdRng`](rand::rngs::StdRng) is reproducible.

use crate::error::{AttentionError, Result};
use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::str::FromStr;

/// Weight initialization scheme
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WeightInit {
    #[default]
    Xavier,
    XavierUniform,
    Relu,
    Uniform,
    Zero,
    Normal { mean: f32, std: f32 },
    UniformRange { lower: f32, upper: f32 },
    Constant { value: f32 },
}

impl WeightInit {
    /// Reject parameters no distribution can be built from
    pub fn validate(&self) -> Result<()> {
        match *self {
            WeightInit::Normal { mean, std } if !(std >= 0.0 && std.is_finite() && mean.is_finite()) => Err(
                AttentionError::InvalidConfig(format!("normal init needs finite mean and std >= 0, got N({mean}, {std})")),
            ),
            WeightInit::UniformRange { lower, upper } if lower.partial_cmp(&upper) != Some(Ordering::Less) => {
                Err(AttentionError::InvalidConfig(format!(
                    "uniform_range init needs lower < upper, got [{lower}, {upper})"
                )))
            }
            WeightInit::Constant { value } if !value.is_finite() => Err(AttentionError::InvalidConfig(format!(
                "constant init must be finite, got {value}"
            ))),
            _ => Ok(()),
        }
    }

    /// Fill `dst` in place for a tensor with the given fans
    pub fn fill<R: Rng + ?Sized>(&self, fan_in: usize, fan_out: usize, dst: &mut [f32], rng: &mut R) -> Result<()> {
        self.validate()?;
        let fan_in = fan_in.max(1) as f32;
        let fan_out = fan_out.max(1) as f32;

        match *self {
            WeightInit::Xavier => sample_normal(0.0, (2.0 / (fan_in + fan_out)).sqrt(), dst, rng),
            WeightInit::XavierUniform => {
                let a = (6.0 / (fan_in + fan_out)).sqrt();
                sample_uniform(-a, a, dst, rng)
            }
            WeightInit::Relu => sample_normal(0.0, (2.0 / fan_in).sqrt(), dst, rng),
            WeightInit::Uniform => {
                let a = 1.0 / fan_in.sqrt();
                sample_uniform(-a, a, dst, rng)
            }
            WeightInit::Zero => {
                dst.fill(0.0);
                Ok(())
            }
            WeightInit::Normal { mean, std } => sample_normal(mean, std, dst, rng),
            WeightInit::UniformRange { lower, upper } => sample_uniform(lower, upper, dst, rng),
            WeightInit::Constant { value } => {
                dst.fill(value);
                Ok(())
            }
        }
    }
}

fn sample_normal<R: Rng + ?Sized>(mean: f32, std: f32, dst: &mut [f32], rng: &mut R) -> Result<()> {
    let normal = Normal::new(mean, std)
        .map_err(|e| AttentionError::InvalidConfig(format!("normal init N({mean}, {std}): {e}")))?;
    for v in dst.iter_mut() {
        *v = normal.sample(&mut *rng);
    }
    Ok(())
}

fn sample_uniform<R: Rng + ?Sized>(lower: f32, upper: f32, dst: &mut [f32], rng: &mut R) -> Result<()> {
    let uniform = Uniform::new(lower, upper)
        .map_err(|e| AttentionError::InvalidConfig(format!("uniform init [{lower}, {upper}): {e}")))?;
    for v in dst.iter_mut() {
        *v = uniform.sample(&mut *rng);
    }
    Ok(())
}

impl FromStr for WeightInit {
    type Err = AttentionError;

    /// Parses the parameter-free schemes by name
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "xavier" => Ok(WeightInit::Xavier),
            "xavier_uniform" => Ok(WeightInit::XavierUniform),
            "relu" | "he" => Ok(WeightInit::Relu),
            "uniform" => Ok(WeightInit::Uniform),
            "zero" | "zeros" => Ok(WeightInit::Zero),
            other => Err(AttentionError::InvalidConfig(format!(
                "unknown weight init '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_same_seed_same_weights() {
        let mut a = vec![0.0; 32];
        let mut b = vec![0.0; 32];
        WeightInit::Xavier.fill(4, 8, &mut a, &mut StdRng::seed_from_u64(7)).unwrap();
        WeightInit::Xavier.fill(4, 8, &mut b, &mut StdRng::seed_from_u64(7)).unwrap();
        assert_eq!(a, b);
        assert!(a.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_uniform_bounds() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut w = vec![0.0; 500];
        WeightInit::XavierUniform.fill(10, 20, &mut w, &mut rng).unwrap();
        let a = (6.0f32 / 30.0).sqrt();
        assert!(w.iter().all(|&v| v >= -a && v < a));

        WeightInit::Uniform.fill(16, 1, &mut w, &mut rng).unwrap();
        assert!(w.iter().all(|&v| v.abs() <= 0.25));
    }

    #[test]
    fn test_relu_init_spread() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut w = vec![0.0; 20_000];
        WeightInit::Relu.fill(8, 4, &mut w, &mut rng).unwrap();
        let var: f32 = w.iter().map(|v| v * v).sum::<f32>() / w.len() as f32;
        // Target variance 2/8
        assert!((var - 0.25).abs() < 0.02, "variance {var}");
    }

    #[test]
    fn test_constant_and_zero() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut w = vec![1.0; 4];
        WeightInit::Zero.fill(2, 2, &mut w, &mut rng).unwrap();
        assert_eq!(w, vec![0.0; 4]);
        WeightInit::Constant { value: 0.5 }.fill(2, 2, &mut w, &mut rng).unwrap();
        assert_eq!(w, vec![0.5; 4]);
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut w = vec![0.0; 4];
        let bad = WeightInit::UniformRange { lower: 1.0, upper: -1.0 };
        assert!(matches!(bad.fill(2, 2, &mut w, &mut rng), Err(AttentionError::InvalidConfig(_))));
        assert!(WeightInit::Normal { mean: 0.0, std: -1.0 }.validate().is_err());
        // NaN bounds are unordered
        assert!(WeightInit::UniformRange { lower: f32::NAN, upper: 1.0 }.validate().is_err());
        assert!(WeightInit::UniformRange { lower: 0.5, upper: 0.5 }.validate().is_err());
    }

    #[test]
    fn test_parse_and_serde() {
        assert_eq!("he".parse::<WeightInit>().unwrap(), WeightInit::Relu);
        assert!("orthogonal".parse::<WeightInit>().is_err());

        let json = serde_json::to_string(&WeightInit::Normal { mean: 0.0, std: 0.02 }).unwrap();
        assert_eq!(json, r#"{"kind":"normal","mean":0.0,"std":0.02}"#);
        let back: WeightInit = serde_json::from_str(r#"{"kind":"xavier_uniform"}"#).unwrap();
        assert_eq!(back, WeightInit::XavierUniform);
    }
}
