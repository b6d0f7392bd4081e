//! Error types for stformer-core

use thiserror::Error;

/// Errors raised while building, running, training or persisting the model
#[derive(Debug, Error)]
pub enum StError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Missing required parameter `{0}` (config must define features_size, seq_size, neigh_size and batch)")]
    MissingParameter(&'static str),

    #[error("Shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: &'static str,
        expected: String,
        actual: String,
    },

    /// A mask row with no valid position. Neighbor rows are only checked at
    /// observed timesteps; padded timesteps (sequence mask 1) are skipped.
    #[error("Every {0} row must contain at least one valid position")]
    FullyMaskedRow(&'static str),

    #[error("Invalid checkpoint artifact: {0}")]
    InvalidCheckpoint(String),

    #[error("Learning-rate schedule error: {0}")]
    Schedule(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, StError>;

impl StError {
    /// Build a shape mismatch from a context label and two printable shapes
    pub fn shape(
        context: &'static str,
        expected: impl std::fmt::Debug,
        actual: impl std::fmt::Debug,
    ) -> Self {
        StError::ShapeMismatch {
            context,
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        }
    }
}
