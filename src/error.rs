//! Error type for the model surface.
//!
//! Tensor-level layers return `candle_core::Result`; anything that can also reject a
//! configuration or an input combination returns [`ModelError`].

use thiserror::Error;

/// Errors raised while building or running the value-head model.
#[derive(Debug, Error)]
pub enum ModelError {
    /// The configuration asks for a feature this crate does not provide.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// The inputs to a forward or generate call are inconsistent.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The configuration is internally inconsistent.
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),

    /// Error bubbled up from candle.
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// Result alias used across the model and inference modules.
pub type Result<T> = std::result::Result<T, ModelError>;
