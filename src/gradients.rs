//! Gradient Maps
//!
//! A [`Gradient`] is what a layer's backward pass hands back: one flat buffer
//! laid out exactly like the layer's parameter buffer, plus a view per
//! parameter key. Because the layouts agree, an update is a single zip over
//! two slices:
//!
//! ```rust
//! # use additive_attention::{LayerConfig, SelfAttentionLayer, Tensor};
//! # let mut layer = SelfAttentionLayer::new(LayerConfig::new(2, 1))?;
//! # let y = layer.activate(&Tensor::full(vec![1, 2, 3], 0.5), true)?;
//! let (mut grad, _) = layer.backprop_gradient(&y)?;
//! let norm = grad.clip(1.0);
//! for (p, g) in layer.params_mut().iter_mut().zip(grad.as_slice()) {
//!     *p -= 0.1 * g;
//! }
//! # Ok::<(), additive_attention::AttentionError>(())
//! ```
//!
//! ## Clipping
//!
//! ```text
//! norm = √(Σ g²)
//! if norm > max_norm:
//!     g *= max_norm / norm
//! ```
//!
//! Every entry is scaled by the same factor, so the direction of the update
//! is preserved.

use crate::error::Result;
use crate::params::{ParamKey, ParamLayout, ParamViewsMut};
use crate::tensor::TensorView;
use rayon::prelude::*;

/// Flat gradient buffer with per-parameter views
#[derive(Clone, Debug, PartialEq)]
pub struct Gradient {
    layout: ParamLayout,
    data: Vec<f32>,
}

impl Gradient {
    /// All-zero gradient for `layout`
    pub fn zeros(layout: ParamLayout) -> Self {
        let data = vec![0.0; layout.num_params()];
        Self { layout, data }
    }

    pub fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    /// Flat buffer, same order as the parameter buffer
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Gradient of one parameter, shaped like the parameter
    pub fn get(&self, key: ParamKey) -> Option<TensorView<'_>> {
        let slot = self.layout.slot(key)?;
        Some(TensorView::new(&self.data[slot.range()], slot.shape.to_vec()))
    }

    /// `(key, view)` pairs in buffer order
    pub fn iter(&self) -> impl Iterator<Item = (ParamKey, TensorView<'_>)> + '_ {
        self.layout
            .slots()
            .iter()
            .map(|slot| (slot.key, TensorView::new(&self.data[slot.range()], slot.shape.to_vec())))
    }

    /// Mutable views for accumulating into
    pub fn views_mut(&mut self) -> Result<ParamViewsMut<'_>> {
        self.layout.reslice_mut(&mut self.data)
    }

    /// L2 norm over every entry
    pub fn norm(&self) -> f32 {
        self.data.par_iter().map(|&g| g * g).sum::<f32>().sqrt()
    }

    /// Scale down to `max_norm` if larger; returns the norm before clipping
    pub fn clip(&mut self, max_norm: f32) -> f32 {
        let norm = self.norm();
        if norm > max_norm {
            let scale = max_norm / norm;
            self.data.par_iter_mut().for_each(|g| *g *= scale);
        }
        norm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::LayoutVariant;
    use approx::assert_abs_diff_eq;

    fn filled(values: &[f32]) -> Gradient {
        let layout = ParamLayout::new(LayoutVariant::FixedQuery, 1, 1).unwrap();
        let mut grad = Gradient::zeros(layout);
        grad.data.copy_from_slice(values);
        grad
    }

    #[test]
    fn test_views_follow_layout() {
        let grad = filled(&[1.0, 2.0, 3.0, 4.0]);
        let keys: Vec<_> = grad.iter().map(|(k, v)| (k.name(), v.data[0])).collect();
        assert_eq!(keys, vec![("W", 1.0), ("WQ", 2.0), ("b", 3.0), ("q", 4.0)]);
        assert_eq!(grad.get(ParamKey::Bias).unwrap().shape, vec![1, 1]);
        assert!(grad.get(ParamKey::RecurrentWeight).is_none());
    }

    #[test]
    fn test_views_mut_write_through() {
        let mut grad = filled(&[0.0; 4]);
        {
            let mut views = grad.views_mut().unwrap();
            views.take(ParamKey::Query).unwrap().fill(5.0);
        }
        assert_eq!(grad.as_slice(), &[0.0, 0.0, 0.0, 5.0]);
    }

    #[test]
    fn test_norm_and_clip() {
        let mut grad = filled(&[3.0, 4.0, 0.0, 0.0]);
        assert_abs_diff_eq!(grad.norm(), 5.0);

        // Below the threshold nothing changes
        assert_abs_diff_eq!(grad.clip(10.0), 5.0);
        assert_eq!(grad.as_slice(), &[3.0, 4.0, 0.0, 0.0]);

        grad.clip(1.0);
        assert_abs_diff_eq!(grad.norm(), 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(grad.as_slice()[0], 0.6, epsilon = 1e-6);
    }
}
