//! Self-Attention Pooling Layer
//!
//! Pools a sequence into a fixed-size vector with one learned query. The
//! same query `q` is broadcast to every example, each of the `n_out` score
//! units attends over time, and the pooled vectors are concatenated:
//!
//! ```text
//! input  [batch, n_in, time]   (or another declared SequenceLayout)
//! output [batch, n_out · n_in] unit-major: out[e, h·n_in + i]
//! ```
//!
//! Parameters live in one flat buffer (see [`crate::params`]) as
//! `W [n_in, n_out]`, `WQ [n_in, n_out]`, `b [1, n_out]`, `q [1, n_in]`.
//!
//! ## Training Protocol
//!
//! ```rust
//! use additive_attention::{LayerConfig, SelfAttentionLayer, Tensor};
//!
//! let mut layer = SelfAttentionLayer::new(LayerConfig::new(2, 1))?;
//! let x = Tensor::new(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6], vec![1, 2, 3]);
//!
//! let y = layer.activate(&x, true)?;
//! let (grad, dx) = layer.backprop_gradient(&Tensor::full(y.shape.clone(), 1.0))?;
//! assert_eq!(dx.shape, x.shape);
//! assert_eq!(grad.as_slice().len(), layer.num_params());
//! # Ok::<(), additive_attention::AttentionError>(())
//! ```
//!
//! The forward pass keeps what backward needs only when `training` is true,
//! and backward consumes it.

use super::attention::{AdditiveAttention, AttentionForward, AttentionGrads, InputGrads};
use crate::config::LayerConfig;
use crate::error::{expect_shape, AttentionError, Result};
use crate::gradients::Gradient;
use crate::params::{LayoutVariant, ParamInits, ParamKey, ParamLayout, ParamViews};
use crate::tensor::{Tensor, TensorView};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

/// Per-call values retained between `activate` and `backprop_gradient`
#[derive(Debug)]
struct ForwardState {
    /// Input in `[n_in, time, batch]`
    input: Tensor,
    /// `q` broadcast to `[n_in, batch]`
    queries: Tensor,
    forward: AttentionForward,
}

/// Attention pooling with a fixed learned query
#[derive(Debug)]
pub struct SelfAttentionLayer {
    config: LayerConfig,
    layout: ParamLayout,
    params: Vec<f32>,
    mask: Option<Tensor>,
    state: Option<ForwardState>,
}

impl SelfAttentionLayer {
    /// Build with freshly initialized parameters
    pub fn new(config: LayerConfig) -> Result<Self> {
        config.validate()?;
        let layout = ParamLayout::new(LayoutVariant::FixedQuery, config.n_in, config.n_out)?;
        let mut params = vec![0.0; layout.num_params()];
        let mut rng = StdRng::seed_from_u64(config.seed);
        layout.initialize(&mut params, &ParamInits::from(&config), &mut rng)?;
        debug!(
            n_in = config.n_in,
            n_out = config.n_out,
            num_params = layout.num_params(),
            "built self-attention layer"
        );

        Ok(Self {
            config,
            layout,
            params,
            mask: None,
            state: None,
        })
    }

    /// Build around an existing parameter buffer
    pub fn from_params(config: LayerConfig, params: Vec<f32>) -> Result<Self> {
        config.validate()?;
        let layout = ParamLayout::new(LayoutVariant::FixedQuery, config.n_in, config.n_out)?;
        layout.reslice(&params)?;
        Ok(Self {
            config,
            layout,
            params,
            mask: None,
            state: None,
        })
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    pub fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    pub fn params(&self) -> &[f32] {
        &self.params
    }

    /// Parameter buffer for in-place updates; its length is fixed
    pub fn params_mut(&mut self) -> &mut [f32] {
        &mut self.params
    }

    pub fn param(&self, key: ParamKey) -> Option<TensorView<'_>> {
        let slot = self.layout.slot(key)?;
        Some(TensorView::new(&self.params[slot.range()], slot.shape.to_vec()))
    }

    /// Set the `[batch, time]` mask used by following calls
    ///
    /// Always returns `None`: the time axis is pooled away, so no mask
    /// applies to this layer's output.
    pub fn feed_forward_mask(&mut self, mask: Option<Tensor>) -> Option<Tensor> {
        self.mask = mask;
        None
    }

    /// Attention weights `[batch, n_out, time]` of the retained forward pass
    pub fn attention_weights(&self) -> Option<&Tensor> {
        self.state.as_ref().map(|s| s.forward.attention())
    }

    /// Drop any retained forward state
    pub fn clear_state(&mut self) {
        self.state = None;
    }

    fn mechanism<'p>(&self, views: &ParamViews<'p>) -> Result<AdditiveAttention<'p>> {
        AdditiveAttention::new(
            views.require(ParamKey::Weight)?.clone(),
            views.require(ParamKey::QueryWeight)?.clone(),
            views.require(ParamKey::Bias)?.clone(),
            self.config.activation,
        )
    }

    /// Pool `input` into `[batch, n_out · n_in]`
    pub fn activate(&mut self, input: &Tensor, training: bool) -> Result<Tensor> {
        self.state = None;
        let (n_in, n_out) = (self.config.n_in, self.config.n_out);
        let internal = self.config.input_layout.internalize(input, n_in)?;
        let (time, batch) = (internal.shape[1], internal.shape[2]);

        let views = self.layout.reslice(&self.params)?;
        let q = views.require(ParamKey::Query)?;
        // queries[j, e] = q[j]
        let queries = Tensor::new(
            q.data.iter().flat_map(|&v| std::iter::repeat(v).take(batch)).collect(),
            vec![n_in, batch],
        );

        let forward = self
            .mechanism(&views)?
            .forward(&queries, &internal, &internal, self.mask.as_ref())?;
        debug!(batch, time, n_out, training, "self-attention forward");

        let output = forward.output.reshape(&[batch, n_out * n_in]);
        self.state = training.then(|| ForwardState {
            input: internal,
            queries,
            forward,
        });
        Ok(output)
    }

    /// Gradients for every parameter and for the input of the last training
    /// forward pass
    ///
    /// `epsilon` is the loss gradient with respect to the output,
    /// `[batch, n_out · n_in]`. The input gradient comes back in the declared
    /// input layout.
    pub fn backprop_gradient(&mut self, epsilon: &Tensor) -> Result<(Gradient, Tensor)> {
        let state = self
            .state
            .as_ref()
            .ok_or(AttentionError::InvalidState("backprop_gradient needs a training forward pass"))?;
        let (n_in, n_out) = (self.config.n_in, self.config.n_out);
        let batch = state.input.shape[2];
        expect_shape("layer epsilon", &epsilon.shape, &[batch, n_out * n_in])?;

        let views = self.layout.reslice(&self.params)?;
        let attention = self.mechanism(&views)?;

        let mut grad = Gradient::zeros(self.layout.clone());
        let mut query_grad = Tensor::zeros(vec![n_in, batch]);
        let mut input_grad = Tensor::zeros(state.input.shape.clone());
        {
            let mut grad_views = grad.views_mut()?;
            attention.backward(
                &epsilon.reshape(&[batch, n_out, n_in]),
                &state.queries,
                &state.input,
                &state.input,
                &state.forward.cache,
                AttentionGrads {
                    weight: grad_views.take(ParamKey::Weight)?,
                    query_weight: grad_views.take(ParamKey::QueryWeight)?,
                    bias: grad_views.take(ParamKey::Bias)?,
                    queries: query_grad.view_mut(),
                    inputs: InputGrads::Shared(input_grad.view_mut()),
                },
            )?;

            // q is shared by every example
            let dq = grad_views.take(ParamKey::Query)?;
            for (dst, row) in dq.data.iter_mut().zip(query_grad.data.chunks(batch.max(1))) {
                *dst += row.iter().sum::<f32>();
            }
        }

        debug!(batch, norm = grad.norm(), "self-attention backward");
        let input_grad = self.config.input_layout.externalize(&input_grad);
        self.state = None;
        Ok((grad, input_grad))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SequenceLayout;
    use crate::gradcheck::check_gradient;
    use crate::layers::{Activation, WeightInit};
    use approx::assert_abs_diff_eq;
    use rand::Rng;

    fn random_tensor(shape: Vec<usize>, seed: u64) -> Tensor {
        let mut rng = StdRng::seed_from_u64(seed);
        let len: usize = shape.iter().product();
        Tensor::new((0..len).map(|_| rng.random_range(-1.0f32..1.0)).collect(), shape)
    }

    #[test]
    fn test_output_shape_and_weights() {
        let config = LayerConfig::new(4, 3).with_bias_init(WeightInit::Uniform);
        let mut layer = SelfAttentionLayer::new(config).unwrap();
        let x = random_tensor(vec![5, 4, 6], 1);
        let y = layer.activate(&x, true).unwrap();
        assert_eq!(y.shape, vec![5, 12]);

        let weights = layer.attention_weights().unwrap();
        assert_eq!(weights.shape, vec![5, 3, 6]);
        for row in weights.data.chunks(6) {
            assert_abs_diff_eq!(row.iter().sum::<f32>(), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_uniform_scores_average_sequence() {
        // Zero W and WQ give every step the same score
        let config = LayerConfig::new(2, 1);
        let layout = ParamLayout::new(LayoutVariant::FixedQuery, 2, 1).unwrap();
        let mut params = vec![0.0; layout.num_params()];
        let q = layout.slot(ParamKey::Query).unwrap().range();
        params[q].copy_from_slice(&[0.5, -0.5]);
        let mut layer = SelfAttentionLayer::from_params(config, params).unwrap();

        // [batch=1, n_in=2, time=3]
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 10.0, 20.0, 30.0], vec![1, 2, 3]);
        let y = layer.activate(&x, false).unwrap();
        assert_eq!(y.shape, vec![1, 2]);
        assert_abs_diff_eq!(y.data[0], 2.0, epsilon = 1e-5);
        assert_abs_diff_eq!(y.data[1], 20.0, epsilon = 1e-4);

        assert!(layer.feed_forward_mask(Some(Tensor::new(vec![1.0, 1.0, 0.0], vec![1, 3]))).is_none());
        let y = layer.activate(&x, false).unwrap();
        assert_abs_diff_eq!(y.data[0], 1.5, epsilon = 1e-5);
        assert_abs_diff_eq!(y.data[1], 15.0, epsilon = 1e-4);
    }

    #[test]
    fn test_backprop_without_forward_is_invalid_state() {
        let mut layer = SelfAttentionLayer::new(LayerConfig::new(2, 2)).unwrap();
        let eps = Tensor::zeros(vec![1, 4]);
        assert!(matches!(layer.backprop_gradient(&eps), Err(AttentionError::InvalidState(_))));

        // Inference passes keep nothing
        layer.activate(&random_tensor(vec![1, 2, 3], 2), false).unwrap();
        assert!(matches!(layer.backprop_gradient(&eps), Err(AttentionError::InvalidState(_))));

        // Backward consumes the state
        layer.activate(&random_tensor(vec![1, 2, 3], 2), true).unwrap();
        assert!(layer.backprop_gradient(&eps).is_ok());
        assert!(matches!(layer.backprop_gradient(&eps), Err(AttentionError::InvalidState(_))));
    }

    #[test]
    fn test_wrong_epsilon_keeps_state() {
        let mut layer = SelfAttentionLayer::new(LayerConfig::new(2, 2)).unwrap();
        layer.activate(&random_tensor(vec![3, 2, 4], 3), true).unwrap();
        assert!(matches!(
            layer.backprop_gradient(&Tensor::zeros(vec![3, 3])),
            Err(AttentionError::ShapeMismatch { .. })
        ));
        assert!(layer.backprop_gradient(&Tensor::zeros(vec![3, 4])).is_ok());
    }

    #[test]
    fn test_wrong_feature_count_rejected() {
        let mut layer = SelfAttentionLayer::new(LayerConfig::new(3, 1)).unwrap();
        assert!(matches!(
            layer.activate(&Tensor::zeros(vec![2, 4, 5]), false),
            Err(AttentionError::ShapeMismatch { context: "layer input", .. })
        ));
        assert!(layer.activate(&Tensor::zeros(vec![2, 3]), false).is_err());
    }

    /// Σ output·g for a layer built from `params` and fed `input`
    fn loss(config: &LayerConfig, params: &[f32], input: &Tensor, mask: Option<&Tensor>, g: &Tensor) -> Result<f32> {
        let mut layer = SelfAttentionLayer::from_params(config.clone(), params.to_vec())?;
        layer.feed_forward_mask(mask.cloned());
        Ok(layer.activate(input, false)?.dot(g))
    }

    #[test]
    fn test_gradients_match_central_differences() {
        for (activation, masked) in [(Activation::Tanh, false), (Activation::Softsign, true)] {
            let config = LayerConfig::new(3, 2)
                .with_activation(activation)
                .with_bias_init(WeightInit::Uniform)
                .with_seed(21);
            let (batch, time) = (2, 4);
            let x = random_tensor(vec![batch, 3, time], 4);
            let g = random_tensor(vec![batch, 6], 5);
            let mask = masked.then(|| Tensor::new(vec![1.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![batch, time]));

            let mut layer = SelfAttentionLayer::new(config.clone()).unwrap();
            layer.feed_forward_mask(mask.clone());
            layer.activate(&x, true).unwrap();
            let (grad, dx) = layer.backprop_gradient(&g).unwrap();

            let params = layer.params().to_vec();
            let report = check_gradient(
                |p| loss(&config, p, &x, mask.as_ref(), &g),
                &params,
                grad.as_slice(),
                1e-2,
            )
            .unwrap();
            assert!(report.passed(5e-3), "params ({activation}): {report:?}");

            let report = check_gradient(
                |data| loss(&config, &params, &Tensor::try_new(data.to_vec(), x.shape.clone())?, mask.as_ref(), &g),
                &x.data,
                &dx.data,
                1e-2,
            )
            .unwrap();
            assert!(report.passed(5e-3), "input ({activation}): {report:?}");
        }
    }

    #[test]
    fn test_layouts_agree() {
        let base = LayerConfig::new(3, 2).with_seed(8);
        let x = random_tensor(vec![2, 3, 5], 6); // [batch, n_in, time]
        let g = random_tensor(vec![2, 6], 7);

        let mut reference = None;
        for layout in [
            SequenceLayout::BatchFeaturesTime,
            SequenceLayout::BatchTimeFeatures,
            SequenceLayout::FeaturesTimeBatch,
        ] {
            let input = x
                .permute(&SequenceLayout::BatchFeaturesTime.to_internal())
                .permute(&layout.from_internal());
            let mut layer = SelfAttentionLayer::new(base.clone().with_input_layout(layout)).unwrap();
            let y = layer.activate(&input, true).unwrap();
            let (grad, dx) = layer.backprop_gradient(&g).unwrap();
            assert_eq!(dx.shape, input.shape);

            // Bring dx back to [batch, n_in, time] for comparison
            let dx = dx
                .permute(&layout.to_internal())
                .permute(&SequenceLayout::BatchFeaturesTime.from_internal());
            match &reference {
                None => reference = Some((y, grad, dx)),
                Some((y0, grad0, dx0)) => {
                    assert_eq!(&y, y0);
                    assert_eq!(&grad, grad0);
                    assert_eq!(&dx, dx0);
                }
            }
        }
    }

    #[test]
    fn test_same_seed_same_params() {
        let a = SelfAttentionLayer::new(LayerConfig::new(4, 2).with_seed(3)).unwrap();
        let b = SelfAttentionLayer::new(LayerConfig::new(4, 2).with_seed(3)).unwrap();
        let c = SelfAttentionLayer::new(LayerConfig::new(4, 2).with_seed(4)).unwrap();
        assert_eq!(a.params(), b.params());
        assert_ne!(a.params(), c.params());
        assert_eq!(a.param(ParamKey::Query).unwrap().shape, vec![1, 4]);
    }

    #[test]
    fn test_from_params_rejects_wrong_length() {
        assert!(matches!(
            SelfAttentionLayer::from_params(LayerConfig::new(2, 2), vec![0.0; 3]),
            Err(AttentionError::ShapeMismatch { .. })
        ));
    }
}
