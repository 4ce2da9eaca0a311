//! Layer Configuration
//!
//! [`LayerConfig`] carries everything needed to build either attention layer:
//! the feature widths, the activation, the initialization schemes, the axis
//! order callers feed sequences in, and the RNG seed.
//!
//! Configs round-trip through JSON, which is also how they are embedded in
//! checkpoints:
//!
//! ```rust
//! use additive_attention::{Activation, LayerConfig, SequenceLayout};
//!
//! let config = LayerConfig::new(16, 4)
//!     .with_activation(Activation::Tanh)
//!     .with_input_layout(SequenceLayout::BatchTimeFeatures);
//! let json = config.to_json()?;
//! let back = LayerConfig::from_json(&json)?;
//! assert_eq!(back, config);
//! # Ok::<(), additive_attention::AttentionError>(())
//! ```

use crate::error::{AttentionError, Result};
use crate::layers::{Activation, WeightInit};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Axis order of a rank-3 sequence tensor as the caller supplies it
///
/// Layers work internally on `[features, time, batch]`; the declared layout
/// says how to get there and back. Declaring it removes any need to guess the
/// order from dimension sizes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceLayout {
    /// `[batch, features, time]`
    #[default]
    BatchFeaturesTime,
    /// `[batch, time, features]`
    BatchTimeFeatures,
    /// `[features, time, batch]`, the internal order
    FeaturesTimeBatch,
}

impl SequenceLayout {
    /// Axes passed to [`Tensor::permute`](crate::Tensor::permute) to reach
    /// `[features, time, batch]`
    pub fn to_internal(self) -> [usize; 3] {
        match self {
            SequenceLayout::BatchFeaturesTime => [1, 2, 0],
            SequenceLayout::BatchTimeFeatures => [2, 1, 0],
            SequenceLayout::FeaturesTimeBatch => [0, 1, 2],
        }
    }

    /// Inverse of [`SequenceLayout::to_internal`]
    pub fn from_internal(self) -> [usize; 3] {
        match self {
            SequenceLayout::BatchFeaturesTime => [2, 0, 1],
            SequenceLayout::BatchTimeFeatures => [2, 1, 0],
            SequenceLayout::FeaturesTimeBatch => [0, 1, 2],
        }
    }

    /// Shape of a `[features, time, batch]` tensor expressed in this layout
    pub fn external_shape(self, features: usize, time: usize, batch: usize) -> Vec<usize> {
        let internal = [features, time, batch];
        self.from_internal().iter().map(|&a| internal[a]).collect()
    }

    /// Convert a caller tensor to `[features, time, batch]`, checking rank
    /// and feature count
    pub fn internalize(self, input: &Tensor, features: usize) -> Result<Tensor> {
        if input.shape.len() != 3 {
            return Err(AttentionError::shape(
                "layer input",
                &self.external_shape(features, 0, 0),
                &input.shape,
            ));
        }
        let internal = input.permute(&self.to_internal());
        if internal.shape[0] != features {
            return Err(AttentionError::shape(
                "layer input",
                &self.external_shape(features, internal.shape[1], internal.shape[2]),
                &input.shape,
            ));
        }
        Ok(internal)
    }

    /// Convert a `[features, time, batch]` tensor back to this layout
    pub fn externalize(self, internal: &Tensor) -> Tensor {
        internal.permute(&self.from_internal())
    }
}

/// Configuration shared by both attention layers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    /// Width of each input timestep
    pub n_in: usize,
    /// Number of score units (self-attention) or output width (recurrent)
    pub n_out: usize,
    #[serde(default)]
    pub activation: Activation,
    /// Scheme for every weight key
    #[serde(default)]
    pub weight_init: WeightInit,
    /// Scheme for the recurrent weight keys; falls back to `weight_init`
    #[serde(default)]
    pub weight_init_recurrent: Option<WeightInit>,
    /// Scheme for bias keys; when absent biases keep their buffer value
    #[serde(default)]
    pub bias_init: Option<WeightInit>,
    #[serde(default)]
    pub input_layout: SequenceLayout,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_seed() -> u64 {
    12345
}

impl LayerConfig {
    pub fn new(n_in: usize, n_out: usize) -> Self {
        Self {
            n_in,
            n_out,
            activation: Activation::default(),
            weight_init: WeightInit::default(),
            weight_init_recurrent: None,
            bias_init: None,
            input_layout: SequenceLayout::default(),
            seed: default_seed(),
        }
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_weight_init(mut self, init: WeightInit) -> Self {
        self.weight_init = init;
        self
    }

    pub fn with_recurrent_weight_init(mut self, init: WeightInit) -> Self {
        self.weight_init_recurrent = Some(init);
        self
    }

    pub fn with_bias_init(mut self, init: WeightInit) -> Self {
        self.bias_init = Some(init);
        self
    }

    pub fn with_input_layout(mut self, layout: SequenceLayout) -> Self {
        self.input_layout = layout;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Check widths and initialization parameters
    pub fn validate(&self) -> Result<()> {
        if self.n_in == 0 || self.n_out == 0 {
            return Err(AttentionError::InvalidConfig(format!(
                "n_in and n_out must be at least 1, got n_in={} n_out={}",
                self.n_in, self.n_out
            )));
        }
        self.weight_init.validate()?;
        if let Some(init) = &self.weight_init_recurrent {
            init.validate()?;
        }
        if let Some(init) = &self.bias_init {
            init.validate()?;
        }
        Ok(())
    }

    /// The scheme used for recurrent keys
    pub fn recurrent_init(&self) -> WeightInit {
        self.weight_init_recurrent.unwrap_or(self.weight_init)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse and validate
    pub fn from_json(json: &str) -> Result<Self> {
        let config: LayerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
