//! GPT-2 transformer body.
//!
//! A decoder-only transformer in the HuggingFace GPT-2 parameter layout
//! (`wte`, `wpe`, `h.{i}`, `ln_f`), returning hidden states and the key/value cache.

use candle_core::{DType, Device, Tensor};
use candle_nn::{Dropout, Module, VarBuilder};

use super::attention::{KvCache, create_causal_mask, padding_mask};
use super::config::Gpt2Config;
use super::embedding::{PositionEmbedding, TokenEmbedding, default_position_ids};
use super::layers::{Block, LayerNorm};
use crate::error::{ModelError, Result};

/// Inputs accepted by [`Gpt2Model::forward`] and the value-head model.
///
/// Exactly one of `input_ids` and `inputs_embeds` must be set. `mc_token_ids`, `lm_labels` and
/// `mc_labels` are accepted for interface compatibility and never read.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelInputs<'a> {
    /// Token ids, (batch, seq_len) u32
    pub input_ids: Option<&'a Tensor>,
    /// One cache entry per layer from a previous call
    pub past_key_values: Option<&'a [KvCache]>,
    /// (batch, past_len + seq_len) with 1 = attend, 0 = padding
    pub attention_mask: Option<&'a Tensor>,
    /// (batch, seq_len) ids embedded through `wte`
    pub token_type_ids: Option<&'a Tensor>,
    /// (batch, seq_len) or (1, seq_len); defaults to `past_len..past_len + seq_len`
    pub position_ids: Option<&'a Tensor>,
    /// (n_head) or (n_layer, n_head), multiplied into the attention probabilities
    pub head_mask: Option<&'a Tensor>,
    /// (batch, seq_len, n_embd) used instead of `input_ids`
    pub inputs_embeds: Option<&'a Tensor>,
    pub mc_token_ids: Option<&'a Tensor>,
    pub lm_labels: Option<&'a Tensor>,
    pub mc_labels: Option<&'a Tensor>,
    /// Enables dropout
    pub train: bool,
}

impl<'a> ModelInputs<'a> {
    /// Inputs for a plain token-id forward pass.
    #[must_use]
    pub fn ids(input_ids: &'a Tensor) -> Self {
        Self {
            input_ids: Some(input_ids),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_past(mut self, past: &'a [KvCache]) -> Self {
        self.past_key_values = Some(past);
        self
    }

    #[must_use]
    pub fn with_attention_mask(mut self, mask: &'a Tensor) -> Self {
        self.attention_mask = Some(mask);
        self
    }

    #[must_use]
    pub fn with_head_mask(mut self, mask: &'a Tensor) -> Self {
        self.head_mask = Some(mask);
        self
    }

    #[must_use]
    pub fn training(mut self, train: bool) -> Self {
        self.train = train;
        self
    }
}

/// Output of the transformer body.
pub struct BodyOutput {
    /// Final-layer-norm hidden states, (batch, seq_len, n_embd)
    pub hidden_states: Tensor,
    /// Updated key/value cache, one entry per layer
    pub presents: Vec<KvCache>,
}

/// GPT-2 transformer body without any output head.
pub struct Gpt2Model {
    wte: TokenEmbedding,
    wpe: PositionEmbedding,
    drop: Dropout,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    config: Gpt2Config,
    device: Device,
}

impl Gpt2Model {
    /// Create the body by loading (or initialising) weights from `vb`.
    ///
    /// # Errors
    /// Returns an error if the config is invalid or weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        config.validate().map_err(ModelError::InvalidConfig)?;

        let device = vb.device().clone();
        let wte = TokenEmbedding::new(config, vb.pp("wte"))?;
        let wpe = PositionEmbedding::new(config, vb.pp("wpe"))?;

        let mut blocks = Vec::with_capacity(config.n_layer);
        for i in 0..config.n_layer {
            blocks.push(Block::new(config, vb.pp(format!("h.{i}")))?);
        }

        let ln_f = LayerNorm::new(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_f"))?;

        Ok(Self {
            wte,
            wpe,
            drop: Dropout::new(config.embd_pdrop),
            blocks,
            ln_f,
            config: config.clone(),
            device,
        })
    }

    /// Token embedding table, shared with a tied LM head.
    #[must_use]
    pub fn token_embedding(&self) -> &TokenEmbedding {
        &self.wte
    }

    #[must_use]
    pub fn config(&self) -> &Gpt2Config {
        &self.config
    }

    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Forward pass through the body.
    ///
    /// # Errors
    /// Returns [`ModelError::InvalidInput`] for inconsistent inputs and propagates tensor errors.
    pub fn forward(&self, inputs: &ModelInputs<'_>) -> Result<BodyOutput> {
        let embeds = match (inputs.input_ids, inputs.inputs_embeds) {
            (Some(ids), None) => self.wte.forward(ids)?,
            (None, Some(embeds)) => embeds.clone(),
            (Some(_), Some(_)) => {
                return Err(ModelError::InvalidInput(
                    "specify either input_ids or inputs_embeds, not both".into(),
                ));
            }
            (None, None) => {
                return Err(ModelError::InvalidInput(
                    "one of input_ids or inputs_embeds is required".into(),
                ));
            }
        };
        let (_, t, _) = embeds.dims3()?;

        let past = inputs.past_key_values.unwrap_or(&[]);
        if !past.is_empty() && past.len() != self.blocks.len() {
            return Err(ModelError::InvalidInput(format!(
                "past_key_values has {} layers, model has {}",
                past.len(),
                self.blocks.len()
            )));
        }
        let past_len = match past.first() {
            Some((k, _)) => k.dim(2)?,
            None => 0,
        };

        if past_len + t > self.wpe.n_positions() {
            return Err(ModelError::InvalidInput(format!(
                "sequence length {} exceeds n_positions {}",
                past_len + t,
                self.wpe.n_positions()
            )));
        }

        let pos_emb = match inputs.position_ids {
            Some(ids) => self.wpe.forward(ids)?,
            None => self
                .wpe
                .forward(&default_position_ids(past_len, t, &self.device)?)?,
        };
        let mut x = embeds.broadcast_add(&pos_emb)?;
        if let Some(token_types) = inputs.token_type_ids {
            x = (x + self.wte.forward(token_types)?)?;
        }
        let mut x = self.drop.forward(&x, inputs.train)?;

        let mut mask = create_causal_mask(t, past_len, &self.device)?;
        if let Some(attention_mask) = inputs.attention_mask {
            mask = mask.broadcast_add(&padding_mask(attention_mask)?)?;
        }

        let head_masks = self.per_layer_head_mask(inputs.head_mask)?;

        let mut presents = Vec::with_capacity(self.blocks.len());
        for (i, block) in self.blocks.iter().enumerate() {
            let (h, present) = block.forward(
                &x,
                &mask,
                past.get(i),
                head_masks.get(i).and_then(Option::as_ref),
                inputs.train,
            )?;
            x = h;
            presents.push(present);
        }

        let hidden_states = self.ln_f.forward(&x)?;
        Ok(BodyOutput {
            hidden_states,
            presents,
        })
    }

    /// Expand a (n_head) or (n_layer, n_head) head mask into one (1, n_head, 1, 1) tensor per
    /// layer.
    fn per_layer_head_mask(&self, head_mask: Option<&Tensor>) -> Result<Vec<Option<Tensor>>> {
        let n_layer = self.blocks.len();
        let n_head = self.config.n_head;
        let Some(head_mask) = head_mask else {
            return Ok(vec![None; n_layer]);
        };
        let head_mask = head_mask.to_dtype(DType::F32)?;
        match *head_mask.dims() {
            [h] if h == n_head => {
                let m = head_mask.reshape((1, n_head, 1, 1))?;
                Ok(vec![Some(m); n_layer])
            }
            [l, h] if l == n_layer && h == n_head => (0..n_layer)
                .map(|i| Ok(Some(head_mask.get(i)?.reshape((1, n_head, 1, 1))?)))
                .collect(),
            _ => Err(ModelError::InvalidInput(format!(
                "head_mask must be ({n_head}) or ({n_layer}, {n_head}), got {:?}",
                head_mask.dims()
            ))),
        }
    }
}
