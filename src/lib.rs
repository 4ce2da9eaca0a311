//! Additive Attention
//!
//! Trainable additive (Bahdanau-style) attention over sequences, with
//! hand-written backward passes. A query vector scores every timestep of a
//! sequence, the scores are normalized over time, and the sequence is pooled
//! into a weighted sum. Exact gradients flow back into the scoring weights,
//! the query, and the sequence itself.
//!
//! # Modules
//!
//! - [`tensor`] - Dense row-major tensors and borrowed views
//! - [`params`] - Flat parameter buffer layout shared by both layers
//! - [`layers`] - Activations, initialization, the attention mechanism and the layers
//! - [`config`] - Layer configuration and input axis order
//! - [`gradients`] - Gradient maps returned by backward passes
//! - [`checkpoint`] - Saving and restoring a layer
//! - [`gradcheck`] - Central-difference gradient checking
//!
//! # Example
//!
//! ```rust
//! use additive_attention::{LayerConfig, SelfAttentionLayer, Tensor};
//!
//! // 2 features per step, 3 steps, one example: [batch, n_in, time]
//! let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![1, 2, 3]);
//! let mut layer = SelfAttentionLayer::new(LayerConfig::new(2, 1))?;
//!
//! let pooled = layer.activate(&x, true)?;
//! assert_eq!(pooled.shape, vec![1, 2]);
//!
//! let (grad, dx) = layer.backprop_gradient(&Tensor::full(vec![1, 2], 1.0))?;
//! println!("gradient norm {:.4}, input grad {:?}", grad.norm(), dx.shape);
//! # Ok::<(), additive_attention::AttentionError>(())
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod gradcheck;
pub mod gradients;
pub mod layers;
pub mod params;
pub mod tensor;

// Re-export main types for convenience
pub use checkpoint::Checkpoint;
pub use config::{LayerConfig, SequenceLayout};
pub use error::{AttentionError, Result};
pub use gradients::Gradient;
pub use layers::{Activation, AdditiveAttention, RecurrentAttentionLayer, SelfAttentionLayer, WeightInit};
pub use params::{LayoutVariant, ParamKey, ParamLayout};
pub use tensor::{Tensor, TensorView, TensorViewMut};
