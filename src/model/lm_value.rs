//! GPT-2 language model with an extra per-token value head.
//!
//! Used as the policy (logits) and critic (values) of a PPO fine-tuning loop. The body and
//! vocabulary head are plain GPT-2; the value head sits on the same final hidden states.

use candle_core::{D, Device, Tensor};
use candle_nn::{Linear, Module, VarBuilder};
use tracing::debug;

use super::attention::KvCache;
use super::config::Gpt2Config;
use super::transformer::{Gpt2Model, ModelInputs};
use super::value_head::{HeadMode, ValueHead};
use crate::error::{ModelError, Result};

/// Everything one forward pass produces.
pub struct ValueModelOutput {
    /// Vocabulary logits, (batch, seq_len, vocab_size)
    pub logits: Tensor,
    /// Key/value cache to feed back as `past_key_values`
    pub presents: Vec<KvCache>,
    /// Final hidden states, (batch, seq_len, n_embd)
    pub hidden_states: Tensor,
    /// Per-token value, (batch, seq_len)
    pub value: Tensor,
}

/// GPT-2 with a language-model head and a scalar value head.
pub struct Gpt2HeadsWithValueModel {
    transformer: Gpt2Model,
    lm_head: Linear,
    v_head: ValueHead,
    value_mode: HeadMode,
    config: Gpt2Config,
}

impl Gpt2HeadsWithValueModel {
    /// Build the model with every weight coming from `vb`.
    ///
    /// The body is read from `transformer.*`, or from the root when `vb` holds a bare GPT-2
    /// checkpoint (`wte.weight` at top level). The value head is read from `v_head.*`.
    ///
    /// # Errors
    /// Returns an error for an unsupported summary config, an invalid config, or missing weights.
    pub fn new(config: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        let head_vb = vb.pp("v_head");
        Self::with_value_head(config, vb, head_vb)
    }

    /// Build the model with the value head taken from a separate `head_vb`.
    ///
    /// This is how a fresh head goes on top of a pretrained body that has no `v_head.*` tensors.
    ///
    /// # Errors
    /// Returns an error for an unsupported summary config, an invalid config, or missing weights.
    #[allow(clippy::needless_pass_by_value)]
    pub fn with_value_head(
        config: &Gpt2Config,
        vb: VarBuilder,
        head_vb: VarBuilder,
    ) -> Result<Self> {
        // A scalar per token, whatever the checkpoint's label count was.
        let config = config.with_num_labels(1);

        // Head first: an unsupported summary type must fail before any body weight is read.
        let v_head = ValueHead::new(&config, head_vb)?;

        let body_vb = if vb.contains_tensor("wte.weight") {
            vb.clone()
        } else {
            vb.pp("transformer")
        };
        let transformer = Gpt2Model::new(&config, body_vb)?;

        // GPT-2 ties lm_head to wte; checkpoints that store lm_head separately are honoured.
        let lm_head = if vb.pp("lm_head").contains_tensor("weight") {
            candle_nn::linear_no_bias(config.n_embd, config.vocab_size, vb.pp("lm_head"))?
        } else {
            Linear::new(transformer.token_embedding().weights().clone(), None)
        };

        debug!(
            n_layer = config.n_layer,
            n_embd = config.n_embd,
            vocab_size = config.vocab_size,
            "built GPT-2 with value head"
        );

        Ok(Self {
            transformer,
            lm_head,
            v_head,
            value_mode: HeadMode::Attached,
            config,
        })
    }

    /// Forward pass producing logits, cache, hidden states and per-token values.
    ///
    /// # Errors
    /// Returns an error for inconsistent inputs or failing tensor operations.
    pub fn forward(&self, inputs: &ModelInputs<'_>) -> Result<ValueModelOutput> {
        let body = self.transformer.forward(inputs)?;
        let hidden_states = body.hidden_states;

        let logits = self.lm_head.forward(&hidden_states)?;
        let value = self
            .v_head
            .forward(&hidden_states, self.value_mode, inputs.train)?
            .squeeze(D::Minus1)?;

        Ok(ValueModelOutput {
            logits,
            presents: body.presents,
            hidden_states,
            value,
        })
    }

    /// Logits for the last position only, (batch, vocab_size), plus the updated cache.
    ///
    /// # Errors
    /// Returns an error for inconsistent inputs or failing tensor operations.
    pub fn next_token_logits(
        &self,
        input_ids: &Tensor,
        past: Option<&[KvCache]>,
    ) -> Result<(Tensor, Vec<KvCache>)> {
        let inputs = ModelInputs {
            past_key_values: past,
            ..ModelInputs::ids(input_ids)
        };
        let body = self.transformer.forward(&inputs)?;
        let (_, t, _) = body.hidden_states.dims3()?;
        if t == 0 {
            return Err(ModelError::InvalidInput("input_ids is empty".into()));
        }
        let last = body.hidden_states.narrow(1, t - 1, 1)?.squeeze(1)?;
        Ok((self.lm_head.forward(&last)?, body.presents))
    }

    /// Stop value-loss gradients from reaching the body on subsequent forward calls.
    pub fn detach_value_head(&mut self) {
        self.value_mode = HeadMode::Detached;
    }

    /// Let value-loss gradients reach the body again.
    pub fn attach_value_head(&mut self) {
        self.value_mode = HeadMode::Attached;
    }

    #[must_use]
    pub fn value_head_mode(&self) -> HeadMode {
        self.value_mode
    }

    #[must_use]
    pub fn value_head(&self) -> &ValueHead {
        &self.v_head
    }

    /// Configuration with `num_labels` forced to 1.
    #[must_use]
    pub fn config(&self) -> &Gpt2Config {
        &self.config
    }

    #[must_use]
    pub fn device(&self) -> &Device {
        self.transformer.device()
    }
}
