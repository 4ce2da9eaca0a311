//! Additive Attention Mechanism
//!
//! Additive (Bahdanau-style) attention scores every timestep by adding a
//! projection of the key to a projection of the query and passing the sum
//! through a non-linearity. The scores are normalized over time and used to
//! pool the values into one vector per score unit.
//!
//! ## Forward
//!
//! For example `e`, score unit `h` and timestep `t`:
//!
//! ```text
//! pre[h,t]   = Σ_i W[i,h]·key[i,t] + b[h] + Σ_j WQ[j,h]·query[j]
//! score[h,t] = act(pre[h,t])
//! a[h,:]     = softmax_t(score[h,:])          (masked steps get exactly 0)
//! out[h,:]   = Σ_t a[h,t]·value[:,t]
//! ```
//!
//! The key projection for every `(t, e)` pair is a single matmul,
//! `Wᵀ @ keys` with keys viewed as `[n_k, T·E]`.
//!
//! ## Backward
//!
//! ```text
//! dvalue[:,t] += Σ_h a[h,t]·g[h,:]
//! da[h,t]      = g[h,:]·value[:,t]
//! dscore[h,t]  = a[h,t]·(da[h,t] - Σ_s a[h,s]·da[h,s])
//! dpre         = dscore·act'(pre)
//! dW          += keys @ dpreᵀ          dkeys += W @ dpre
//! db[h]       += Σ_{e,t} dpre[h,t]
//! dWQ         += queries @ s           dqueries += WQ @ sᵀ,  s[e,h] = Σ_t dpre
//! ```
//!
//! Like the softmax backward in any attention layer, the `Σ_s a·da` term
//! accounts for softmax coupling every timestep of a row.
//!
//! ## Layout
//!
//! Keys and values are `[features, time, batch]`, queries `[n_q, batch]`,
//! the mask `[batch, time]` (non-zero = valid). Output and attention weights
//! are example-major: `[batch, units, n_v]` and `[batch, units, time]`.

use super::Activation;
use crate::error::{expect_shape, AttentionError, Result};
use crate::tensor::{Tensor, TensorView, TensorViewMut};

/// Sizes of one forward call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttentionDims {
    pub n_q: usize,
    pub n_k: usize,
    pub n_v: usize,
    pub time: usize,
    pub batch: usize,
    /// Number of score units (`H`)
    pub units: usize,
}

impl AttentionDims {
    fn to_vec(self) -> Vec<usize> {
        vec![self.n_q, self.n_k, self.n_v, self.time, self.batch, self.units]
    }
}

/// Additive attention over borrowed parameter views
///
/// Parameters:
/// - `weight` `[n_k, H]` projects keys
/// - `query_weight` `[n_q, H]` projects queries
/// - `bias` `[1, H]`
#[derive(Clone, Debug)]
pub struct AdditiveAttention<'a> {
    weight: TensorView<'a>,
    query_weight: TensorView<'a>,
    bias: TensorView<'a>,
    activation: Activation,
}

/// Values kept from forward for the backward pass
#[derive(Clone, Debug)]
pub struct AttentionCache {
    pub(crate) dims: AttentionDims,
    /// Pre-activation scores `[batch, units, time]`
    pub(crate) pre: Tensor,
    /// Attention weights `[batch, units, time]`
    pub(crate) attention: Tensor,
    /// Validity per `(example, timestep)`
    pub(crate) valid: Vec<bool>,
}

impl AttentionCache {
    pub fn dims(&self) -> AttentionDims {
        self.dims
    }

    pub fn attention(&self) -> &Tensor {
        &self.attention
    }

    /// Reject a cache whose buffers disagree with its recorded sizes
    fn check(&self) -> Result<()> {
        let AttentionDims {
            time, batch, units, ..
        } = self.dims;
        let scores = batch * units * time;
        expect_shape("cached pre-activations", &[self.pre.data.len()], &[scores])?;
        expect_shape("cached attention", &[self.attention.data.len()], &[scores])?;
        expect_shape("cached mask", &[self.valid.len()], &[batch * time])
    }
}

/// Result of a forward call
#[derive(Clone, Debug)]
pub struct AttentionForward {
    /// Pooled vectors `[batch, units, n_v]`
    pub output: Tensor,
    pub cache: AttentionCache,
}

impl AttentionForward {
    /// Attention weights `[batch, units, time]`
    pub fn attention(&self) -> &Tensor {
        &self.cache.attention
    }
}

/// Where input gradients go
#[derive(Debug)]
pub enum InputGrads<'g> {
    /// Keys and values are the same tensor; both contributions land here
    Shared(TensorViewMut<'g>),
    Separate {
        keys: TensorViewMut<'g>,
        values: TensorViewMut<'g>,
    },
}

/// Caller-owned accumulators for [`AdditiveAttention::backward`]
///
/// Every destination is added to, never overwritten.
#[derive(Debug)]
pub struct AttentionGrads<'g> {
    pub weight: TensorViewMut<'g>,
    pub query_weight: TensorViewMut<'g>,
    pub bias: TensorViewMut<'g>,
    /// `[n_q, batch]`
    pub queries: TensorViewMut<'g>,
    pub inputs: InputGrads<'g>,
}

fn matrix_dims(context: &str, view: &TensorView<'_>) -> Result<(usize, usize)> {
    match view.shape[..] {
        [rows, cols] => Ok((rows, cols)),
        _ => Err(AttentionError::InvalidConfig(format!(
            "{context} must be 2-D, got shape {:?}",
            view.shape
        ))),
    }
}

impl<'a> AdditiveAttention<'a> {
    pub fn new(
        weight: TensorView<'a>,
        query_weight: TensorView<'a>,
        bias: TensorView<'a>,
        activation: Activation,
    ) -> Result<Self> {
        let (_, units) = matrix_dims("attention weight", &weight)?;
        let (n_q, _) = matrix_dims("attention query weight", &query_weight)?;
        expect_shape("attention query weight", &query_weight.shape, &[n_q, units])?;
        expect_shape("attention bias", &bias.shape, &[1, units])?;
        Ok(Self {
            weight,
            query_weight,
            bias,
            activation,
        })
    }

    pub fn units(&self) -> usize {
        self.weight.shape[1]
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    fn check_inputs(&self, queries: &Tensor, keys: &Tensor, values: &Tensor) -> Result<AttentionDims> {
        let n_k = self.weight.shape[0];
        let n_q = self.query_weight.shape[0];
        let units = self.units();

        let batch = queries.shape.get(1).copied().unwrap_or(0);
        expect_shape("queries", &queries.shape, &[n_q, batch])?;
        let time = keys.shape.get(1).copied().unwrap_or(0);
        expect_shape("keys", &keys.shape, &[n_k, time, batch])?;
        let n_v = values.shape.first().copied().unwrap_or(0);
        expect_shape("values", &values.shape, &[n_v, time, batch])?;

        Ok(AttentionDims {
            n_q,
            n_k,
            n_v,
            time,
            batch,
            units,
        })
    }

    /// Score, normalize and pool
    ///
    /// Fails with [`AttentionError::AllMaskedExample`] if the mask leaves an
    /// example without a valid timestep. Inputs are never modified.
    pub fn forward(
        &self,
        queries: &Tensor,
        keys: &Tensor,
        values: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<AttentionForward> {
        let dims = self.check_inputs(queries, keys, values)?;
        let valid = valid_steps(mask, dims.batch, dims.time)?;
        let AttentionDims {
            n_k,
            n_v,
            time,
            batch,
            units,
            ..
        } = dims;
        let cols = time * batch;

        // [H, n_k] @ [n_k, T·E]: column t·E + e holds the projection of key (t, e)
        let key_proj = self
            .weight
            .transpose()
            .view()
            .matmul(&TensorView::new(&keys.data, vec![n_k, cols]));
        // [E, n_q] @ [n_q, H]
        let query_proj = queries.transpose().view().matmul(&self.query_weight);

        let mut pre = vec![0.0; batch * units * time];
        let mut attention = vec![0.0; batch * units * time];
        let mut output = vec![0.0; batch * units * n_v];

        for e in 0..batch {
            let valid_e = &valid[e * time..(e + 1) * time];
            for h in 0..units {
                let row = (e * units + h) * time;
                let shift = query_proj.data[e * units + h] + self.bias.data[h];
                for t in 0..time {
                    pre[row + t] = key_proj.data[h * cols + t * batch + e] + shift;
                }

                let weights = &mut attention[row..row + time];
                masked_softmax(self.activation, &pre[row..row + time], valid_e, weights);

                let out_row = &mut output[(e * units + h) * n_v..(e * units + h + 1) * n_v];
                for (t, &a) in weights.iter().enumerate() {
                    if a == 0.0 {
                        continue;
                    }
                    for (v, out) in out_row.iter_mut().enumerate() {
                        *out += a * values.data[(v * time + t) * batch + e];
                    }
                }
            }
        }

        Ok(AttentionForward {
            output: Tensor::new(output, vec![batch, units, n_v]),
            cache: AttentionCache {
                dims,
                pre: Tensor::new(pre, vec![batch, units, time]),
                attention: Tensor::new(attention, vec![batch, units, time]),
                valid,
            },
        })
    }

    /// Accumulate gradients of a forward call into `grads`
    ///
    /// `queries`, `keys` and `values` must be the tensors the cache was built
    /// from. All shapes are checked before anything is written.
    pub fn backward(
        &self,
        grad_output: &Tensor,
        queries: &Tensor,
        keys: &Tensor,
        values: &Tensor,
        cache: &AttentionCache,
        grads: AttentionGrads<'_>,
    ) -> Result<()> {
        let dims = self.check_inputs(queries, keys, values)?;
        if dims != cache.dims {
            return Err(AttentionError::shape("attention cache", &cache.dims.to_vec(), &dims.to_vec()));
        }
        cache.check()?;
        let AttentionDims {
            n_q,
            n_k,
            n_v,
            time,
            batch,
            units,
        } = dims;
        let cols = time * batch;

        expect_shape("output gradient", &grad_output.shape, &[batch, units, n_v])?;
        expect_shape("weight gradient", &grads.weight.shape, &self.weight.shape)?;
        expect_shape("query weight gradient", &grads.query_weight.shape, &self.query_weight.shape)?;
        expect_shape("bias gradient", &grads.bias.shape, &self.bias.shape)?;
        expect_shape("query gradient", &grads.queries.shape, &[n_q, batch])?;
        match &grads.inputs {
            InputGrads::Shared(dst) => {
                expect_shape("shared keys/values", &values.shape, &keys.shape)?;
                expect_shape("input gradient", &dst.shape, &keys.shape)?;
            }
            InputGrads::Separate { keys: dk, values: dv } => {
                expect_shape("key gradient", &dk.shape, &keys.shape)?;
                expect_shape("value gradient", &dv.shape, &values.shape)?;
            }
        }

        // dpre laid out like the key projection: [H, T·E]
        let mut dpre = vec![0.0; units * cols];
        // Σ_t dpre per example and unit: [E, H]
        let mut dsum = vec![0.0; batch * units];
        let mut dvalues = vec![0.0; n_v * cols];
        let mut da = vec![0.0; time];

        for e in 0..batch {
            let valid_e = &cache.valid[e * time..(e + 1) * time];
            for h in 0..units {
                let row = (e * units + h) * time;
                let a = &cache.attention.data[row..row + time];
                let g = &grad_output.data[(e * units + h) * n_v..(e * units + h + 1) * n_v];

                for t in 0..time {
                    da[t] = 0.0;
                    if !valid_e[t] {
                        continue;
                    }
                    for (v, &g_v) in g.iter().enumerate() {
                        let idx = (v * time + t) * batch + e;
                        da[t] += g_v * values.data[idx];
                        dvalues[idx] += a[t] * g_v;
                    }
                }

                let weighted: f32 = a.iter().zip(&da).map(|(a, d)| a * d).sum();
                for t in 0..time {
                    if !valid_e[t] {
                        continue;
                    }
                    let dscore = a[t] * (da[t] - weighted);
                    let d = dscore * self.activation.derivative(cache.pre.data[row + t]);
                    dpre[h * cols + t * batch + e] = d;
                    dsum[e * units + h] += d;
                }
            }
        }

        let dpre = Tensor::new(dpre, vec![units, cols]);
        let dsum = Tensor::new(dsum, vec![batch, units]);
        let keys_flat = TensorView::new(&keys.data, vec![n_k, cols]);

        let AttentionGrads {
            mut weight,
            mut query_weight,
            mut bias,
            queries: mut dqueries,
            inputs,
        } = grads;

        // [n_k, T·E] @ [T·E, H]
        weight.add_assign(&keys_flat.matmul(&dpre.transpose().view()));
        // [n_q, E] @ [E, H]
        query_weight.add_assign(&queries.matmul(&dsum));
        // [n_q, H] @ [H, E]
        dqueries.add_assign(&self.query_weight.matmul(&dsum.transpose().view()));

        let mut db = vec![0.0; units];
        for row in dsum.data.chunks(units) {
            for (acc, &d) in db.iter_mut().zip(row) {
                *acc += d;
            }
        }
        bias.add_assign(&Tensor::new(db, vec![1, units]));

        // [n_k, H] @ [H, T·E] is already in key layout
        let dkeys = self.weight.matmul(&dpre.view()).into_shape(&keys.shape);
        let dvalues = Tensor::new(dvalues, values.shape.clone());
        match inputs {
            InputGrads::Shared(mut dst) => {
                dst.add_assign(&dkeys);
                dst.add_assign(&dvalues);
            }
            InputGrads::Separate { keys: mut dk, values: mut dv } => {
                dk.add_assign(&dkeys);
                dv.add_assign(&dvalues);
            }
        }

        Ok(())
    }
}

/// Validity per `(example, timestep)`, rejecting examples with no valid step
fn valid_steps(mask: Option<&Tensor>, batch: usize, time: usize) -> Result<Vec<bool>> {
    let valid = match mask {
        Some(mask) => {
            expect_shape("mask", &mask.shape, &[batch, time])?;
            mask.data.iter().map(|&m| m != 0.0).collect()
        }
        None => vec![true; batch * time],
    };
    for e in 0..batch {
        if !valid[e * time..(e + 1) * time].iter().any(|&v| v) {
            return Err(AttentionError::AllMaskedExample { example: e });
        }
    }
    Ok(valid)
}

/// Softmax of `act(pre)` over valid steps; invalid steps get exactly 0
///
/// Caller guarantees at least one valid step.
fn masked_softmax(activation: Activation, pre: &[f32], valid: &[bool], out: &mut [f32]) {
    let max = pre
        .iter()
        .zip(valid)
        .filter(|&(_, &v)| v)
        .map(|(&p, _)| activation.apply(p))
        .fold(f32::NEG_INFINITY, f32::max);

    let mut sum = 0.0;
    for ((o, &p), &v) in out.iter_mut().zip(pre).zip(valid) {
        *o = if v { (activation.apply(p) - max).exp() } else { 0.0 };
        sum += *o;
    }
    for o in out.iter_mut() {
        *o /= sum;
    }
}
