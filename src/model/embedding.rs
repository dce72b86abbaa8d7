//! Embedding layers for the transformer.
//!
//! Token embedding and learned absolute position embedding (`wte` / `wpe`).

use candle_core::{Device, Result, Tensor};
use candle_nn::{Embedding, Module, VarBuilder};

use super::config::Gpt2Config;

/// Token embedding layer.
pub struct TokenEmbedding {
    embedding: Embedding,
}

impl TokenEmbedding {
    /// Create a new token embedding layer.
    ///
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        let embedding = candle_nn::embedding(config.vocab_size, config.n_embd, vb)?;
        Ok(Self { embedding })
    }

    /// Look up token ids of shape (batch, seq_len) -> (batch, seq_len, n_embd).
    ///
    /// # Errors
    /// Returns an error if embedding lookup fails.
    pub fn forward(&self, token_ids: &Tensor) -> Result<Tensor> {
        self.embedding.forward(token_ids)
    }

    /// Get the embedding weights for weight tying with lm_head.
    #[must_use]
    pub fn weights(&self) -> &Tensor {
        self.embedding.embeddings()
    }
}

/// Learned absolute position embedding.
pub struct PositionEmbedding {
    embedding: Embedding,
    n_positions: usize,
}

impl PositionEmbedding {
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        let embedding = candle_nn::embedding(config.n_positions, config.n_embd, vb)?;
        Ok(Self {
            embedding,
            n_positions: config.n_positions,
        })
    }

    /// Maximum number of positions this table covers.
    #[must_use]
    pub fn n_positions(&self) -> usize {
        self.n_positions
    }

    /// Embed explicit position ids of shape (batch, seq_len).
    ///
    /// # Errors
    /// Returns an error if embedding lookup fails.
    pub fn forward(&self, position_ids: &Tensor) -> Result<Tensor> {
        self.embedding.forward(position_ids)
    }
}

/// Default position ids `past_len..past_len + seq_len`, shape (1, seq_len).
///
/// # Errors
/// Returns an error if tensor creation fails.
pub fn default_position_ids(past_len: usize, seq_len: usize, device: &Device) -> Result<Tensor> {
    #[allow(clippy::cast_possible_truncation)]
    let (start, end) = (past_len as u32, (past_len + seq_len) as u32);
    Tensor::arange(start, end, device)?.unsqueeze(0)
}
