//! Error Types
//!
//! Every fallible operation in the crate returns [`Result`]. Errors are
//! local: the caller fixes its inputs, nothing here retries.

use thiserror::Error;

/// Errors raised by layouts, the attention mechanism and the layers.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// Two tensors (or a tensor and a buffer) that must align do not.
    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// An operation was called out of order, e.g. backward before forward.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The mask leaves an example without a single valid timestep.
    #[error("example {example} has every timestep masked out")]
    AllMaskedExample { example: usize },

    /// Layer configuration is unusable (zero widths, unknown names, ...).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl AttentionError {
    pub(crate) fn shape(context: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        AttentionError::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, AttentionError>;

/// Fails with [`AttentionError::ShapeMismatch`] unless `actual == expected`.
pub(crate) fn expect_shape(context: &'static str, actual: &[usize], expected: &[usize]) -> Result<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(AttentionError::shape(context, expected, actual))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_message() {
        let err = AttentionError::shape("keys", &[2, 3], &[3, 2]);
        assert_eq!(
            err.to_string(),
            "shape mismatch in keys: expected [2, 3], got [3, 2]"
        );
    }

    #[test]
    fn test_expect_shape() {
        assert!(expect_shape("mask", &[4, 5], &[4, 5]).is_ok());
        assert!(matches!(
            expect_shape("mask", &[4, 6], &[4, 5]),
            Err(AttentionError::ShapeMismatch { context: "mask", .. })
        ));
    }
}
