//! Causal self-attention implementation.
//!
//! Multi-head causal self-attention in the GPT-2 layout, with an incremental key/value cache.

use candle_core::{D, Device, Result, Tensor};
use candle_nn::{Dropout, Linear, Module, VarBuilder};

use super::config::Gpt2Config;
use super::layers::conv1d;

/// Cached `(key, value)` for one layer, each of shape (batch, n_head, past_len, head_dim).
pub type KvCache = (Tensor, Tensor);

/// Multi-head causal self-attention.
///
/// Uses combined QKV projection for efficiency.
pub struct CausalSelfAttention {
    /// Combined query, key, value projection (n_embd -> 3 * n_embd)
    c_attn: Linear,
    /// Output projection (n_embd -> n_embd)
    c_proj: Linear,
    attn_dropout: Dropout,
    resid_dropout: Dropout,
    /// Number of attention heads
    n_head: usize,
    /// Embedding dimension
    n_embd: usize,
    /// Dimension per head
    head_dim: usize,
}

impl CausalSelfAttention {
    /// Create a new causal self-attention layer.
    ///
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        let n_embd = config.n_embd;

        let c_attn = conv1d(n_embd, 3 * n_embd, vb.pp("c_attn"))?;
        let c_proj = conv1d(n_embd, n_embd, vb.pp("c_proj"))?;

        Ok(Self {
            c_attn,
            c_proj,
            attn_dropout: Dropout::new(config.attn_pdrop),
            resid_dropout: Dropout::new(config.resid_pdrop),
            n_head: config.n_head,
            n_embd,
            head_dim: config.head_dim(),
        })
    }

    fn split_heads(&self, x: &Tensor, b: usize, t: usize) -> Result<Tensor> {
        x.reshape((b, t, self.n_head, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Forward pass for causal self-attention.
    ///
    /// # Arguments
    /// * `x` - Input tensor of shape (batch, seq_len, n_embd)
    /// * `mask` - Additive mask broadcastable to (batch, n_head, seq_len, past_len + seq_len)
    /// * `layer_past` - Cached keys/values from earlier steps
    /// * `head_mask` - Multiplicative mask broadcastable to the attention probabilities
    /// * `train` - Enables dropout
    ///
    /// # Returns
    /// Output of shape (batch, seq_len, n_embd) and the updated cache for this layer.
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    #[allow(clippy::many_single_char_names)]
    pub fn forward(
        &self,
        x: &Tensor,
        mask: &Tensor,
        layer_past: Option<&KvCache>,
        head_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, KvCache)> {
        let (b, t, _c) = x.dims3()?;

        // Combined QKV projection: (B, T, C) -> (B, T, 3*C)
        let qkv = self.c_attn.forward(x)?;

        let q = qkv.narrow(D::Minus1, 0, self.n_embd)?;
        let k = qkv.narrow(D::Minus1, self.n_embd, self.n_embd)?;
        let v = qkv.narrow(D::Minus1, 2 * self.n_embd, self.n_embd)?;

        // (B, T, C) -> (B, n_head, T, head_dim)
        let q = self.split_heads(&q, b, t)?;
        let mut k = self.split_heads(&k, b, t)?;
        let mut v = self.split_heads(&v, b, t)?;

        if let Some((past_k, past_v)) = layer_past {
            k = Tensor::cat(&[past_k, &k], 2)?.contiguous()?;
            v = Tensor::cat(&[past_v, &v], 2)?.contiguous()?;
        }

        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let k_t = k.transpose(D::Minus2, D::Minus1)?.contiguous()?;
        let att = (q.matmul(&k_t)? * scale)?;
        let att = att.broadcast_add(mask)?;
        let att = candle_nn::ops::softmax(&att, D::Minus1)?;
        let att = self.attn_dropout.forward(&att, train)?;
        let att = match head_mask {
            Some(hm) => att.broadcast_mul(hm)?,
            None => att,
        };

        // (B, n_head, T, S) @ (B, n_head, S, head_dim)
        let y = att.matmul(&v)?;

        let y = y
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, t, self.n_embd))?;

        let y = self.c_proj.forward(&y)?;
        let y = self.resid_dropout.forward(&y, train)?;
        Ok((y, (k, v)))
    }
}

/// Create a causal attention mask for `seq_len` new positions after `past_len` cached ones.
///
/// Position (i, j) is -inf if j > past_len + i, else 0.
///
/// # Errors
/// Returns an error if tensor creation fails.
pub fn create_causal_mask(seq_len: usize, past_len: usize, device: &Device) -> Result<Tensor> {
    let total = past_len + seq_len;
    let mask_data: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..total).map(move |j| if j > past_len + i { f32::NEG_INFINITY } else { 0.0 })
        })
        .collect();

    let mask = Tensor::from_vec(mask_data, (seq_len, total), device)?;

    // (T, S) -> (1, 1, T, S)
    mask.unsqueeze(0)?.unsqueeze(0)
}

/// Turn a (batch, total_len) keep-mask of 1s and 0s into an additive (batch, 1, 1, total_len) mask.
///
/// # Errors
/// Returns an error if tensor operations fail.
pub fn padding_mask(attention_mask: &Tensor) -> Result<Tensor> {
    let (b, s) = attention_mask.dims2()?;
    let keep = attention_mask.to_dtype(candle_core::DType::F32)?;
    let blocked = keep.affine(-1.0, 1.0)?;
    (blocked * f64::from(f32::MIN))?.reshape((b, 1, 1, s))
}
