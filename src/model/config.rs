use serde::{Deserialize, Serialize};

/// Pooling strategy named by the `summary_type` field of a GPT-2 `config.json`.
///
/// Only the name is read: every supported variant applies the value head to every
/// position of the sequence. `Attn` is rejected when the head is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryType {
    Last,
    First,
    Mean,
    ClsIndex,
    Attn,
}

/// GPT-2 hyperparameters plus the optional sequence-summary fields read by the value head.
///
/// Field names follow the HuggingFace `config.json`, so exported checkpoints deserialize as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Gpt2Config {
    /// Vocabulary size
    pub vocab_size: usize,
    /// Maximum sequence length (prompt + generated + cached)
    pub n_positions: usize,
    /// Hidden size
    pub n_embd: usize,
    /// Number of transformer blocks
    pub n_layer: usize,
    /// Number of attention heads
    pub n_head: usize,
    /// Inner MLP size; `None` means `4 * n_embd`
    pub n_inner: Option<usize>,
    pub layer_norm_epsilon: f64,
    pub embd_pdrop: f32,
    pub attn_pdrop: f32,
    pub resid_pdrop: f32,
    pub bos_token_id: u32,
    pub eos_token_id: u32,
    /// Output width of the summary projection when `summary_proj_to_labels` is set
    pub num_labels: usize,
    pub summary_type: Option<SummaryType>,
    pub summary_use_proj: Option<bool>,
    pub summary_proj_to_labels: Option<bool>,
    /// Only `"tanh"` is recognised; anything else is identity
    pub summary_activation: Option<String>,
    pub summary_first_dropout: Option<f32>,
    pub summary_last_dropout: Option<f32>,
}

impl Gpt2Config {
    /// Dimension per attention head.
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    /// MLP hidden dimension.
    #[must_use]
    pub fn inner_dim(&self) -> usize {
        self.n_inner.unwrap_or(4 * self.n_embd)
    }

    /// Copy of this config with `num_labels` replaced.
    #[must_use]
    pub fn with_num_labels(&self, num_labels: usize) -> Self {
        Self {
            num_labels,
            ..self.clone()
        }
    }

    /// Validate that configuration is consistent.
    ///
    /// # Errors
    /// Returns an error if the configuration is internally inconsistent.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.n_head == 0 || !self.n_embd.is_multiple_of(self.n_head) {
            return Err("n_embd must be divisible by n_head");
        }
        if self.vocab_size == 0 {
            return Err("vocab_size must be positive");
        }
        if self.n_positions == 0 {
            return Err("n_positions must be positive");
        }
        let probs = [
            Some(self.embd_pdrop),
            Some(self.attn_pdrop),
            Some(self.resid_pdrop),
            self.summary_first_dropout,
            self.summary_last_dropout,
        ];
        if probs.into_iter().flatten().any(|p| !(0.0..1.0).contains(&p)) {
            return Err("dropout probabilities must be in [0, 1)");
        }
        Ok(())
    }

    /// The 124M-parameter GPT-2 checkpoint, with HuggingFace's summary defaults.
    #[must_use]
    pub fn gpt2() -> Self {
        Self {
            vocab_size: 50257,
            n_positions: 1024,
            n_embd: 768,
            n_layer: 12,
            n_head: 12,
            n_inner: None,
            layer_norm_epsilon: 1e-5,
            embd_pdrop: 0.1,
            attn_pdrop: 0.1,
            resid_pdrop: 0.1,
            bos_token_id: 50256,
            eos_token_id: 50256,
            num_labels: 1,
            summary_type: Some(SummaryType::ClsIndex),
            summary_use_proj: Some(true),
            summary_proj_to_labels: Some(true),
            summary_activation: None,
            summary_first_dropout: Some(0.1),
            summary_last_dropout: None,
        }
    }

    /// A few-thousand-parameter model for tests and smoke runs.
    #[must_use]
    pub fn tiny() -> Self {
        Self {
            vocab_size: 64,
            n_positions: 32,
            n_embd: 16,
            n_layer: 2,
            n_head: 2,
            bos_token_id: 0,
            eos_token_id: 0,
            ..Self::gpt2()
        }
    }
}

impl Default for Gpt2Config {
    fn default() -> Self {
        Self::gpt2()
    }
}
