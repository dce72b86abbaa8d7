//! Common neural network layers.
//!
//! GPT-2 MLP, layer norm and transformer block, plus the Conv1D weight adapter.

use candle_core::{D, DType, Result, Tensor};
use candle_nn::init::Init;
use candle_nn::{Dropout, Linear, Module, VarBuilder};

use super::attention::{CausalSelfAttention, KvCache};
use super::config::Gpt2Config;

/// Build a `Linear` from a GPT-2 `Conv1D` parameter pair.
///
/// Conv1D stores its weight as (in, out); `Linear` wants (out, in).
///
/// # Errors
/// Returns an error if weight loading fails.
#[allow(clippy::needless_pass_by_value)]
pub fn conv1d(nx: usize, nf: usize, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints((nx, nf), "weight", candle_nn::init::DEFAULT_KAIMING_NORMAL)?;
    let bias = vb.get_with_hints(nf, "bias", Init::Const(0.))?;
    Ok(Linear::new(weight.t()?.contiguous()?, Some(bias)))
}

/// Layer normalization over the last dimension, built from differentiable tensor ops.
///
/// candle's `LayerNorm` runs a fused kernel on contiguous input, and that kernel has no backward
/// pass.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    /// Create a layer norm with `weight` initialised to ones and `bias` to zeros.
    ///
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", Init::Const(1.))?;
        let bias = vb.get_with_hints(size, "bias", Init::Const(0.))?;
        Ok(Self { weight, bias, eps })
    }
}

impl Module for LayerNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        normed
            .to_dtype(dtype)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

/// Feed-forward network with GELU activation.
///
/// Matches GPT-2: c_fc -> gelu_new -> c_proj -> dropout
pub struct Mlp {
    /// Up projection (n_embd -> n_inner)
    c_fc: Linear,
    /// Down projection (n_inner -> n_embd)
    c_proj: Linear,
    dropout: Dropout,
}

impl Mlp {
    /// Create a new MLP layer.
    ///
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        let n_embd = config.n_embd;
        let hidden_dim = config.inner_dim();

        let c_fc = conv1d(n_embd, hidden_dim, vb.pp("c_fc"))?;
        let c_proj = conv1d(hidden_dim, n_embd, vb.pp("c_proj"))?;

        Ok(Self {
            c_fc,
            c_proj,
            dropout: Dropout::new(config.resid_pdrop),
        })
    }

    /// Forward pass through MLP.
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        // candle's `gelu` is the tanh approximation GPT-2 calls gelu_new
        let h = self.c_fc.forward(x)?.gelu()?;
        let h = self.c_proj.forward(&h)?;
        self.dropout.forward(&h, train)
    }
}

/// Transformer block with pre-norm architecture.
///
/// Structure: LayerNorm -> Attention -> Residual -> LayerNorm -> MLP -> Residual
pub struct Block {
    ln_1: LayerNorm,
    attn: CausalSelfAttention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    /// Create a new transformer block.
    ///
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        let n_embd = config.n_embd;
        let eps = config.layer_norm_epsilon;

        let ln_1 = LayerNorm::new(n_embd, eps, vb.pp("ln_1"))?;
        let attn = CausalSelfAttention::new(config, vb.pp("attn"))?;
        let ln_2 = LayerNorm::new(n_embd, eps, vb.pp("ln_2"))?;
        let mlp = Mlp::new(config, vb.pp("mlp"))?;

        Ok(Self {
            ln_1,
            attn,
            ln_2,
            mlp,
        })
    }

    /// Forward pass through the transformer block.
    ///
    /// Returns the block output and the layer's key/value cache.
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: &Tensor,
        layer_past: Option<&KvCache>,
        head_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, KvCache)> {
        let h = self.ln_1.forward(x)?;
        let (h, present) = self.attn.forward(&h, mask, layer_past, head_mask, train)?;
        let x = (x + h)?;

        let h = self.ln_2.forward(&x)?;
        let h = self.mlp.forward(&h, train)?;
        Ok(((x + h)?, present))
    }
}
