//! Recurrent Attention Layer
//!
//! A recurrent layer whose extra input at every step is an attention-pooled
//! summary of the whole sequence. The attention query at step `t` is the
//! layer's own output from step `t - 1`, so what the layer looks at depends
//! on what it has produced so far.
//!
//! ## Step
//!
//! ```text
//! h₋₁ = 0
//! c_t = attend(query = h_{t-1}, keys = values = X)   weight WQ, query weight WQR, bias bQ
//! z_t = Wᵀ x_t + WRᵀ c_t + b
//! h_t = act(z_t) · mask[t]
//! ```
//!
//! The attention uses one score unit, so `c_t` has the input width `n_in`.
//! Output is a sequence with `n_out` features in the declared layout.
//!
//! ## Backward
//!
//! Full backpropagation through time: walking `t` from last to first, the
//! gradient that reaches `h_{t-1}` through the query of step `t` is added to
//! the output gradient of step `t - 1`. Every step's attention also
//! contributes to the gradient of the whole input sequence.

use super::attention::{AdditiveAttention, AttentionCache, AttentionGrads, InputGrads};
use crate::config::LayerConfig;
use crate::error::{expect_shape, AttentionError, Result};
use crate::gradients::Gradient;
use crate::params::{LayoutVariant, ParamInits, ParamKey, ParamLayout, ParamViews};
use crate::tensor::{Tensor, TensorView};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

/// Values of one timestep kept for backward
#[derive(Debug)]
struct StepCache {
    /// Query fed to the attention, `h_{t-1}` as `[n_out, batch]`
    query: Tensor,
    /// Attended context `[n_in, batch]`
    context: Tensor,
    /// Pre-activation `[n_out, batch]`
    z: Tensor,
    attention: AttentionCache,
}

#[derive(Debug)]
struct ForwardState {
    /// Input in `[n_in, time, batch]`
    input: Tensor,
    mask: Option<Tensor>,
    steps: Vec<StepCache>,
}

/// Recurrent layer with attention over its input sequence
#[derive(Debug)]
pub struct RecurrentAttentionLayer {
    config: LayerConfig,
    layout: ParamLayout,
    params: Vec<f32>,
    mask: Option<Tensor>,
    state: Option<ForwardState>,
}

/// Columns of timestep `t` of a `[features, time, batch]` tensor
fn step_slice(x: &Tensor, t: usize) -> Tensor {
    let (features, time, batch) = (x.shape[0], x.shape[1], x.shape[2]);
    let mut data = Vec::with_capacity(features * batch);
    for f in 0..features {
        let start = (f * time + t) * batch;
        data.extend_from_slice(&x.data[start..start + batch]);
    }
    Tensor::new(data, vec![features, batch])
}

/// Inverse of [`step_slice`], adding into `dst`
fn add_step(dst: &mut Tensor, t: usize, step: &Tensor) {
    let (time, batch) = (dst.shape[1], dst.shape[2]);
    for (f, row) in step.data.chunks(batch.max(1)).enumerate() {
        let start = (f * time + t) * batch;
        for (d, s) in dst.data[start..start + batch].iter_mut().zip(row) {
            *d += s;
        }
    }
}

/// `mask[e, t]`, or 1 without a mask
fn step_mask(mask: Option<&Tensor>, t: usize, batch: usize) -> Vec<f32> {
    match mask {
        Some(m) => {
            let time = m.shape[1];
            (0..batch).map(|e| if m.data[e * time + t] != 0.0 { 1.0 } else { 0.0 }).collect()
        }
        None => vec![1.0; batch],
    }
}

impl RecurrentAttentionLayer {
    pub fn new(config: LayerConfig) -> Result<Self> {
        config.validate()?;
        let layout = ParamLayout::new(LayoutVariant::RecurrentQuery, config.n_in, config.n_out)?;
        let mut params = vec![0.0; layout.num_params()];
        let mut rng = StdRng::seed_from_u64(config.seed);
        layout.initialize(&mut params, &ParamInits::from(&config), &mut rng)?;
        debug!(
            n_in = config.n_in,
            n_out = config.n_out,
            num_params = layout.num_params(),
            "built recurrent attention layer"
        );

        Ok(Self {
            config,
            layout,
            params,
            mask: None,
            state: None,
        })
    }

    pub fn from_params(config: LayerConfig, params: Vec<f32>) -> Result<Self> {
        config.validate()?;
        let layout = ParamLayout::new(LayoutVariant::RecurrentQuery, config.n_in, config.n_out)?;
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

    pub fn params_mut(&mut self) -> &mut [f32] {
        &mut self.params
    }

    pub fn param(&self, key: ParamKey) -> Option<TensorView<'_>> {
        let slot = self.layout.slot(key)?;
        Some(TensorView::new(&self.params[slot.range()], slot.shape.to_vec()))
    }

    /// Set the `[batch, time]` mask; the output keeps the same time axis, so
    /// the mask is passed on unchanged
    pub fn feed_forward_mask(&mut self, mask: Option<Tensor>) -> Option<Tensor> {
        self.mask = mask.clone();
        mask
    }

    pub fn clear_state(&mut self) {
        self.state = None;
    }

    /// Attention weights `[batch, time]` used at step `t` of the retained pass
    pub fn attention_weights(&self, t: usize) -> Option<&Tensor> {
        self.state.as_ref().and_then(|s| s.steps.get(t)).map(|s| &s.attention.attention)
    }

    fn mechanism<'p>(&self, views: &ParamViews<'p>) -> Result<AdditiveAttention<'p>> {
        AdditiveAttention::new(
            views.require(ParamKey::QueryWeight)?.clone(),
            views.require(ParamKey::RecurrentQueryWeight)?.clone(),
            views.require(ParamKey::QueryBias)?.clone(),
            self.config.activation,
        )
    }

    /// Run the sequence; output has `n_out` features in the declared layout
    pub fn activate(&mut self, input: &Tensor, training: bool) -> Result<Tensor> {
        self.state = None;
        let (n_in, n_out) = (self.config.n_in, self.config.n_out);
        let activation = self.config.activation;
        let x = self.config.input_layout.internalize(input, n_in)?;
        let (time, batch) = (x.shape[1], x.shape[2]);

        let views = self.layout.reslice(&self.params)?;
        let attention = self.mechanism(&views)?;
        let w_t = views.require(ParamKey::Weight)?.transpose();
        let wr_t = views.require(ParamKey::RecurrentWeight)?.transpose();
        let bias = views.require(ParamKey::Bias)?;
        let mask = self.mask.as_ref();

        let mut output = Tensor::zeros(vec![n_out, time, batch]);
        let mut steps = Vec::with_capacity(if training { time } else { 0 });
        let mut prev = Tensor::zeros(vec![n_out, batch]);

        for t in 0..time {
            let fwd = attention.forward(&prev, &x, &x, mask)?;
            // [batch, 1, n_in] -> [n_in, batch]
            let context = fwd.output.reshape(&[batch, n_in]).transpose();

            let mut z = w_t.matmul(&step_slice(&x, t)).add(&wr_t.matmul(&context));
            for (row, &b) in z.data.chunks_mut(batch.max(1)).zip(bias.data) {
                row.iter_mut().for_each(|v| *v += b);
            }

            let keep = step_mask(mask, t, batch);
            let mut h = activation.forward(&z);
            for row in h.data.chunks_mut(batch.max(1)) {
                for (v, m) in row.iter_mut().zip(&keep) {
                    *v *= m;
                }
            }
            add_step(&mut output, t, &h);

            let query = std::mem::replace(&mut prev, h);
            if training {
                steps.push(StepCache {
                    query,
                    context,
                    z,
                    attention: fwd.cache,
                });
            }
        }
        debug!(batch, time, n_out, training, "recurrent attention forward");

        let result = self.config.input_layout.externalize(&output);
        if training {
            self.state = Some(ForwardState {
                input: x,
                mask: self.mask.clone(),
                steps,
            });
        }
        Ok(result)
    }

    /// Gradients of the last training forward pass
    ///
    /// `epsilon` has the output's shape, in the declared layout.
    pub fn backprop_gradient(&mut self, epsilon: &Tensor) -> Result<(Gradient, Tensor)> {
        let state = self
            .state
            .as_ref()
            .ok_or(AttentionError::InvalidState("backprop_gradient needs a training forward pass"))?;
        let (n_in, n_out) = (self.config.n_in, self.config.n_out);
        let activation = self.config.activation;
        let (time, batch) = (state.input.shape[1], state.input.shape[2]);
        let layout = self.config.input_layout;
        expect_shape("layer epsilon", &epsilon.shape, &layout.external_shape(n_out, time, batch))?;
        let d_out = epsilon.permute(&layout.to_internal());

        let views = self.layout.reslice(&self.params)?;
        let attention = self.mechanism(&views)?;
        let w = views.require(ParamKey::Weight)?;
        let wr = views.require(ParamKey::RecurrentWeight)?;

        let mut grad = Gradient::zeros(self.layout.clone());
        let mut input_grad = Tensor::zeros(state.input.shape.clone());
        {
            let mut grad_views = grad.views_mut()?;
            let mut dw = grad_views.take(ParamKey::Weight)?;
            let mut dwq = grad_views.take(ParamKey::QueryWeight)?;
            let mut dwr = grad_views.take(ParamKey::RecurrentWeight)?;
            let mut dwqr = grad_views.take(ParamKey::RecurrentQueryWeight)?;
            let mut db = grad_views.take(ParamKey::Bias)?;
            let mut dbq = grad_views.take(ParamKey::QueryBias)?;

            // Gradient reaching h_t through the query of step t + 1
            let mut carry = Tensor::zeros(vec![n_out, batch]);

            for (t, step) in state.steps.iter().enumerate().rev() {
                let keep = step_mask(state.mask.as_ref(), t, batch);
                let mut dz = step_slice(&d_out, t).add(&carry);
                for row in dz.data.chunks_mut(batch.max(1)) {
                    for (v, m) in row.iter_mut().zip(&keep) {
                        *v *= m;
                    }
                }
                let dz = activation.backward(&dz, &step.z);

                let x_t = step_slice(&state.input, t);
                let dz_t = dz.transpose();
                dw.add_assign(&x_t.matmul(&dz_t));
                dwr.add_assign(&step.context.matmul(&dz_t));
                let db_step: Vec<f32> = dz.data.chunks(batch.max(1)).map(|row| row.iter().sum::<f32>()).collect();
                db.add_assign(&Tensor::new(db_step, vec![1, n_out]));
                add_step(&mut input_grad, t, &w.matmul(&dz.view()));

                // dc [n_in, batch] -> attention output gradient [batch, 1, n_in]
                let d_context = wr.matmul(&dz.view()).transpose().into_shape(&[batch, 1, n_in]);
                let mut d_query = Tensor::zeros(vec![n_out, batch]);
                attention.backward(
                    &d_context,
                    &step.query,
                    &state.input,
                    &state.input,
                    &step.attention,
                    AttentionGrads {
                        weight: dwq.reborrow(),
                        query_weight: dwqr.reborrow(),
                        bias: dbq.reborrow(),
                        queries: d_query.view_mut(),
                        inputs: InputGrads::Shared(input_grad.view_mut()),
                    },
                )?;
                carry = d_query;
            }
        }

        debug!(batch, time, norm = grad.norm(), "recurrent attention backward");
        let input_grad = layout.externalize(&input_grad);
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

    fn config() -> LayerConfig {
        LayerConfig::new(3, 2)
            .with_bias_init(WeightInit::Uniform)
            .with_recurrent_weight_init(WeightInit::XavierUniform)
            .with_seed(17)
    }

    #[test]
    fn test_output_is_a_sequence() {
        let mut layer = RecurrentAttentionLayer::new(config()).unwrap();
        assert_eq!(layer.num_params(), 3 * 2 + 3 + 3 * 2 + 2 + 2 + 1);
        let x = random_tensor(vec![4, 3, 5], 1);
        let y = layer.activate(&x, true).unwrap();
        assert_eq!(y.shape, vec![4, 2, 5]);

        for t in 0..5 {
            let weights = layer.attention_weights(t).unwrap();
            assert_eq!(weights.shape, vec![4, 1, 5]);
            for row in weights.data.chunks(5) {
                assert_abs_diff_eq!(row.iter().sum::<f32>(), 1.0, epsilon = 1e-5);
            }
        }
        assert!(layer.attention_weights(5).is_none());
    }

    #[test]
    fn test_first_step_matches_hand_computation() {
        // With h₋₁ = 0 the first query contributes nothing; zero WQ makes the
        // attention uniform, so c_0 is the sequence mean.
        let config = LayerConfig::new(1, 1).with_activation(Activation::Identity);
        let layout = ParamLayout::new(LayoutVariant::RecurrentQuery, 1, 1).unwrap();
        let mut params = vec![0.0; layout.num_params()];
        for (key, value) in [
            (ParamKey::Weight, 2.0),
            (ParamKey::RecurrentWeight, 3.0),
            (ParamKey::Bias, 0.5),
        ] {
            params[layout.slot(key).unwrap().range()].fill(value);
        }
        let mut layer = RecurrentAttentionLayer::from_params(config, params).unwrap();

        // [batch=1, n_in=1, time=3]
        let x = Tensor::new(vec![1.0, 2.0, 6.0], vec![1, 1, 3]);
        let y = layer.activate(&x, false).unwrap();
        // z_0 = 2·1 + 3·mean(1, 2, 6) + 0.5
        assert_abs_diff_eq!(y.data[0], 2.0 + 9.0 + 0.5, epsilon = 1e-5);
    }

    #[test]
    fn test_masked_steps_output_zero() {
        let mut layer = RecurrentAttentionLayer::new(config()).unwrap();
        let mask = Tensor::new(vec![1.0, 1.0, 0.0, 1.0, 1.0, 1.0], vec![2, 3]);
        assert_eq!(layer.feed_forward_mask(Some(mask.clone())), Some(mask));

        let y = layer.activate(&random_tensor(vec![2, 3, 3], 2), false).unwrap();
        // Example 0, step 2 for both output features
        assert_eq!(y.data[2], 0.0);
        assert_eq!(y.data[5], 0.0);
        assert!(y.data[6..].iter().all(|&v| v != 0.0));
    }

    fn loss(config: &LayerConfig, params: &[f32], input: &Tensor, mask: Option<&Tensor>, g: &Tensor) -> Result<f32> {
        let mut layer = RecurrentAttentionLayer::from_params(config.clone(), params.to_vec())?;
        layer.feed_forward_mask(mask.cloned());
        Ok(layer.activate(input, false)?.dot(g))
    }

    #[test]
    fn test_gradients_match_central_differences() {
        for (activation, masked, layout) in [
            (Activation::Tanh, false, SequenceLayout::BatchFeaturesTime),
            (Activation::Tanh, true, SequenceLayout::BatchTimeFeatures),
            (Activation::Sigmoid, true, SequenceLayout::FeaturesTimeBatch),
        ] {
            let config = config().with_activation(activation).with_input_layout(layout);
            let (batch, time) = (2, 4);
            let x = random_tensor(layout.external_shape(3, time, batch), 3);
            let g = random_tensor(layout.external_shape(2, time, batch), 4);
            let mask = masked.then(|| Tensor::new(vec![1.0, 1.0, 0.0, 1.0, 1.0, 1.0, 1.0, 0.0], vec![batch, time]));

            let mut layer = RecurrentAttentionLayer::new(config.clone()).unwrap();
            layer.feed_forward_mask(mask.clone());
            layer.activate(&x, true).unwrap();
            let (grad, dx) = layer.backprop_gradient(&g).unwrap();
            assert_eq!(dx.shape, x.shape);

            let params = layer.params().to_vec();
            let report = check_gradient(
                |p| loss(&config, p, &x, mask.as_ref(), &g),
                &params,
                grad.as_slice(),
                1e-2,
            )
            .unwrap();
            assert!(report.passed(5e-3), "params ({activation}, {layout:?}): {report:?}");

            let report = check_gradient(
                |data| loss(&config, &params, &Tensor::try_new(data.to_vec(), x.shape.clone())?, mask.as_ref(), &g),
                &x.data,
                &dx.data,
                1e-2,
            )
            .unwrap();
            assert!(report.passed(5e-3), "input ({activation}, {layout:?}): {report:?}");
        }
    }

    #[test]
    fn test_backprop_requires_training_forward() {
        let mut layer = RecurrentAttentionLayer::new(config()).unwrap();
        let x = random_tensor(vec![1, 3, 2], 5);
        let eps = Tensor::zeros(vec![1, 2, 2]);
        assert!(matches!(layer.backprop_gradient(&eps), Err(AttentionError::InvalidState(_))));

        layer.activate(&x, true).unwrap();
        assert!(matches!(
            layer.backprop_gradient(&Tensor::zeros(vec![1, 3, 2])),
            Err(AttentionError::ShapeMismatch { .. })
        ));
        assert!(layer.backprop_gradient(&eps).is_ok());
        assert!(layer.backprop_gradient(&eps).is_err());
    }
}
