//! Parameter Layout
//!
//! Every learnable tensor of a layer lives in one flat `Vec<f32>`. A
//! [`ParamLayout`] is the table saying which contiguous range of that buffer
//! belongs to which named parameter, and with what shape. The table depends
//! only on the layer variant and `(n_in, n_out)`, so the same buffer can be
//! re-sliced later (after loading a checkpoint, or for a gradient buffer of
//! the same length) and land on identical views.
//!
//! ## Buffer Order
//!
//! ```text
//! FixedQuery       W [n_in, n_out] | WQ [n_in, n_out] | b [1, n_out] | q [1, n_in]
//! RecurrentQuery   W [n_in, n_out] | WQ [n_in, 1] | WR [n_in, n_out]
//!                  | WQR [n_out, 1] | b [1, n_out] | bQ [1, 1]
//! ```
//!
//! ## Views
//!
//! Views are carved from the buffer with `split_at_mut` in slot order, so all
//! of them can be held at once without copying:
//!
//! ```rust
//! use additive_attention::params::{LayoutVariant, ParamKey, ParamLayout};
//!
//! let layout = ParamLayout::new(LayoutVariant::FixedQuery, 3, 2)?;
//! let mut buffer = vec![0.0; layout.num_params()];
//! let mut views = layout.reslice_mut(&mut buffer)?;
//! views.take(ParamKey::Bias)?.fill(1.0);
//! assert_eq!(&buffer[12..14], &[1.0, 1.0]);
//! # Ok::<(), additive_attention::AttentionError>(())
//! ```

use crate::config::LayerConfig;
use crate::error::{AttentionError, Result};
use crate::layers::WeightInit;
use crate::tensor::{TensorView, TensorViewMut};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Which slot table a layer uses
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutVariant {
    /// One learned query vector shared by every example
    FixedQuery,
    /// Query at step `t` is the layer's own output at step `t - 1`
    RecurrentQuery,
}

/// Name of a learnable tensor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamKey {
    Weight,
    QueryWeight,
    Bias,
    Query,
    RecurrentWeight,
    RecurrentQueryWeight,
    QueryBias,
}

impl ParamKey {
    /// Short name used in gradient maps and checkpoints
    pub fn name(self) -> &'static str {
        match self {
            ParamKey::Weight => "W",
            ParamKey::QueryWeight => "WQ",
            ParamKey::Bias => "b",
            ParamKey::Query => "q",
            ParamKey::RecurrentWeight => "WR",
            ParamKey::RecurrentQueryWeight => "WQR",
            ParamKey::QueryBias => "bQ",
        }
    }

    pub fn is_bias(self) -> bool {
        matches!(self, ParamKey::Bias | ParamKey::QueryBias)
    }

    /// Keys initialized with the recurrent scheme when one is configured
    pub fn is_recurrent(self) -> bool {
        matches!(self, ParamKey::RecurrentWeight | ParamKey::RecurrentQueryWeight)
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

impl FromStr for ParamKey {
    type Err = AttentionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "W" => Ok(ParamKey::Weight),
            "WQ" => Ok(ParamKey::QueryWeight),
            "b" => Ok(ParamKey::Bias),
            "q" => Ok(ParamKey::Query),
            "WR" => Ok(ParamKey::RecurrentWeight),
            "WQR" => Ok(ParamKey::RecurrentQueryWeight),
            "bQ" => Ok(ParamKey::QueryBias),
            other => Err(AttentionError::InvalidConfig(format!("unknown parameter key '{other}'"))),
        }
    }
}

/// One named range of the flat buffer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParamSlot {
    pub key: ParamKey,
    pub offset: usize,
    pub shape: [usize; 2],
    /// Fans handed to the initializer
    pub fan_in: usize,
    pub fan_out: usize,
}

impl ParamSlot {
    pub fn len(&self) -> usize {
        self.shape[0] * self.shape[1]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.len()
    }
}

/// Initialization schemes for one layout
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ParamInits {
    pub weight: WeightInit,
    /// Used for `WR` and `WQR`; falls back to `weight`
    pub recurrent: Option<WeightInit>,
    /// Biases keep their buffer contents when absent
    pub bias: Option<WeightInit>,
}

impl From<&LayerConfig> for ParamInits {
    fn from(config: &LayerConfig) -> Self {
        Self {
            weight: config.weight_init,
            recurrent: config.weight_init_recurrent,
            bias: config.bias_init,
        }
    }
}

/// Deterministic `(key, offset, shape)` table over a flat parameter buffer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParamLayout {
    variant: LayoutVariant,
    n_in: usize,
    n_out: usize,
    slots: Vec<ParamSlot>,
    num_params: usize,
}

impl ParamLayout {
    pub fn new(variant: LayoutVariant, n_in: usize, n_out: usize) -> Result<Self> {
        if n_in == 0 || n_out == 0 {
            return Err(AttentionError::InvalidConfig(format!(
                "parameter layout needs n_in, n_out >= 1, got ({n_in}, {n_out})"
            )));
        }

        // (key, shape, fan_in, fan_out) in buffer order
        let table: Vec<(ParamKey, [usize; 2], usize, usize)> = match variant {
            LayoutVariant::FixedQuery => vec![
                (ParamKey::Weight, [n_in, n_out], n_in, n_out),
                (ParamKey::QueryWeight, [n_in, n_out], n_in, n_out),
                (ParamKey::Bias, [1, n_out], 1, n_out),
                (ParamKey::Query, [1, n_in], n_in, 1),
            ],
            LayoutVariant::RecurrentQuery => vec![
                (ParamKey::Weight, [n_in, n_out], n_in, n_out),
                (ParamKey::QueryWeight, [n_in, 1], n_in, 1),
                (ParamKey::RecurrentWeight, [n_in, n_out], n_in, n_out),
                (ParamKey::RecurrentQueryWeight, [n_out, 1], n_out, 1),
                (ParamKey::Bias, [1, n_out], 1, n_out),
                (ParamKey::QueryBias, [1, 1], 1, 1),
            ],
        };

        let mut offset = 0;
        let slots = table
            .into_iter()
            .map(|(key, shape, fan_in, fan_out)| {
                let slot = ParamSlot {
                    key,
                    offset,
                    shape,
                    fan_in,
                    fan_out,
                };
                offset += slot.len();
                slot
            })
            .collect();

        Ok(Self {
            variant,
            n_in,
            n_out,
            slots,
            num_params: offset,
        })
    }

    pub fn variant(&self) -> LayoutVariant {
        self.variant
    }

    pub fn n_in(&self) -> usize {
        self.n_in
    }

    pub fn n_out(&self) -> usize {
        self.n_out
    }

    /// Total buffer length
    pub fn num_params(&self) -> usize {
        self.num_params
    }

    /// Slots in buffer order
    pub fn slots(&self) -> &[ParamSlot] {
        &self.slots
    }

    pub fn slot(&self, key: ParamKey) -> Option<&ParamSlot> {
        self.slots.iter().find(|s| s.key == key)
    }

    pub fn param_keys(&self) -> Vec<ParamKey> {
        self.slots.iter().map(|s| s.key).collect()
    }

    pub fn weight_keys(&self) -> Vec<ParamKey> {
        self.slots.iter().map(|s| s.key).filter(|k| !k.is_bias()).collect()
    }

    pub fn bias_keys(&self) -> Vec<ParamKey> {
        self.slots.iter().map(|s| s.key).filter(|k| k.is_bias()).collect()
    }

    pub fn is_weight_param(&self, key: ParamKey) -> bool {
        !key.is_bias() && self.slot(key).is_some()
    }

    pub fn is_bias_param(&self, key: ParamKey) -> bool {
        key.is_bias() && self.slot(key).is_some()
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len != self.num_params {
            return Err(AttentionError::shape("parameter buffer", &[self.num_params], &[len]));
        }
        Ok(())
    }

    /// Fill the buffer from the given schemes and return its views
    ///
    /// Weight keys are always filled. Bias keys are filled only when
    /// `inits.bias` is set.
    pub fn initialize<'a, R: Rng + ?Sized>(
        &self,
        buffer: &'a mut [f32],
        inits: &ParamInits,
        rng: &mut R,
    ) -> Result<ParamViewsMut<'a>> {
        self.check_len(buffer.len())?;
        inits.weight.validate()?;

        let mut views = self.reslice_mut(buffer)?;
        for (slot, (_, view)) in self.slots.iter().zip(views.views.iter_mut()) {
            let init = if slot.key.is_bias() {
                match inits.bias {
                    Some(init) => init,
                    None => continue,
                }
            } else if slot.key.is_recurrent() {
                inits.recurrent.unwrap_or(inits.weight)
            } else {
                inits.weight
            };
            init.fill(slot.fan_in, slot.fan_out, view.data, rng)?;
            debug!(key = %slot.key, shape = ?slot.shape, ?init, "initialized parameter");
        }
        Ok(views)
    }

    /// Named read-only views over an existing buffer
    pub fn reslice<'a>(&self, buffer: &'a [f32]) -> Result<ParamViews<'a>> {
        self.check_len(buffer.len())?;
        let views = self
            .slots
            .iter()
            .map(|slot| (slot.key, TensorView::new(&buffer[slot.range()], slot.shape.to_vec())))
            .collect();
        Ok(ParamViews { views })
    }

    /// Named mutable views over an existing buffer, values untouched
    pub fn reslice_mut<'a>(&self, buffer: &'a mut [f32]) -> Result<ParamViewsMut<'a>> {
        self.check_len(buffer.len())?;
        let mut rest = buffer;
        let mut views = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(slot.len());
            views.push((slot.key, TensorViewMut::new(head, slot.shape.to_vec())));
            rest = tail;
        }
        Ok(ParamViewsMut { views })
    }
}

/// Read-only parameter views by key
#[derive(Clone, Debug)]
pub struct ParamViews<'a> {
    views: Vec<(ParamKey, TensorView<'a>)>,
}

impl<'a> ParamViews<'a> {
    pub fn get(&self, key: ParamKey) -> Option<&TensorView<'a>> {
        self.views.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    /// Like [`ParamViews::get`], failing for a key the layout doesn't have
    pub fn require(&self, key: ParamKey) -> Result<&TensorView<'a>> {
        self.get(key).ok_or_else(|| missing(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &(ParamKey, TensorView<'a>)> {
        self.views.iter()
    }
}

/// Mutable parameter views by key
///
/// Views are moved out with [`ParamViewsMut::take`] so several can be held
/// mutably at once.
#[derive(Debug)]
pub struct ParamViewsMut<'a> {
    views: Vec<(ParamKey, TensorViewMut<'a>)>,
}

impl<'a> ParamViewsMut<'a> {
    pub fn get_mut(&mut self, key: ParamKey) -> Option<&mut TensorViewMut<'a>> {
        self.views.iter_mut().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    pub fn take(&mut self, key: ParamKey) -> Result<TensorViewMut<'a>> {
        let idx = self.views.iter().position(|(k, _)| *k == key).ok_or_else(|| missing(key))?;
        Ok(self.views.remove(idx).1)
    }

    pub fn keys(&self) -> Vec<ParamKey> {
        self.views.iter().map(|(k, _)| *k).collect()
    }
}

fn missing(key: ParamKey) -> AttentionError {
    AttentionError::InvalidConfig(format!("layout has no parameter '{key}'"))
}
