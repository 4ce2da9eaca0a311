//! Attention Layers
//!
//! Building blocks and the two layers built from them.
//!
//! ## Modules
//!
//! - **activation**: named non-linearities with derivatives
//! - **init**: named weight-initialization distributions
//! - **attention**: the additive attention mechanism, forward and backward
//! - **self_attention**: pooling with one learned query
//! - **recurrent_attention**: recurrent layer whose query is its previous output
//!
//! ## Design Pattern
//!
//! Both layers follow the same protocol:
//!
//! ```rust,ignore
//! impl Layer {
//!     pub fn new(config: LayerConfig) -> Result<Self>;
//!     pub fn from_params(config: LayerConfig, params: Vec<f32>) -> Result<Self>;
//!     pub fn feed_forward_mask(&mut self, mask: Option<Tensor>) -> Option<Tensor>;
//!     pub fn activate(&mut self, input: &Tensor, training: bool) -> Result<Tensor>;
//!     pub fn backprop_gradient(&mut self, epsilon: &Tensor) -> Result<(Gradient, Tensor)>;
//! }
//! ```
//!
//! `activate` with `training = true` keeps a forward state that the next
//! `backprop_gradient` consumes.

pub mod activation;
pub mod attention;
pub mod init;
pub mod recurrent_attention;
pub mod self_attention;

pub use activation::Activation;
pub use attention::{AdditiveAttention, AttentionCache, AttentionDims, AttentionForward, AttentionGrads, InputGrads};
pub use init::WeightInit;
pub use recurrent_attention::RecurrentAttentionLayer;
pub use self_attention::SelfAttentionLayer;
