//! Autoregressive generation and the PPO rollout helpers.
//!
//! [`generate`] runs a key/value-cached loop over `model.next_token_logits`, applying the
//! repetition penalty, the minimum-length EOS ban and the sampler every step.
//! [`respond_to_prompt`] and [`respond_to_batch`] pin the total length and return only the
//! continuation.

use candle_core::{DType, IndexOp, Tensor};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::debug;

use crate::error::{ModelError, Result};
use crate::inference::sampling::{
    apply_repetition_penalty, argmax, sample_from_logits, suppress_token,
};
use crate::model::Gpt2HeadsWithValueModel;

/// GPT-2's `<|endoftext|>`, conventionally reused as the padding id.
pub const GPT2_EOS_TOKEN_ID: u32 = 50256;

/// Generation settings.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Total sequence length (prompt included) at which generation stops
    pub max_length: usize,
    /// EOS is banned until the sequence is at least this long
    pub min_length: usize,
    pub temperature: f32,
    /// 0 disables top-k filtering
    pub top_k: usize,
    /// Values outside `[0, 1)` disable nucleus filtering
    pub top_p: f32,
    /// 1.0 disables the penalty
    pub repetition_penalty: f32,
    /// Greedy decoding when false
    pub do_sample: bool,
    /// Written after a row has emitted EOS
    pub pad_token_id: u32,
    /// `None` means rows never finish early
    pub eos_token_id: Option<u32>,
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_length: 20,
            min_length: 0,
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            repetition_penalty: 1.0,
            do_sample: true,
            pad_token_id: GPT2_EOS_TOKEN_ID,
            eos_token_id: Some(GPT2_EOS_TOKEN_ID),
            seed: None,
        }
    }
}

/// Decoding options for the rollout helpers.
#[derive(Debug, Clone)]
pub struct SamplingOptions {
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
    pub repetition_penalty: f32,
    pub pad_token_id: u32,
    pub seed: Option<u64>,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            repetition_penalty: 1.0,
            pad_token_id: GPT2_EOS_TOKEN_ID,
            seed: None,
        }
    }
}

impl SamplingOptions {
    /// Sampling config that produces exactly `txt_len` tokens in total.
    #[must_use]
    pub fn to_generation_config(&self, txt_len: usize, eos_token_id: u32) -> GenerationConfig {
        GenerationConfig {
            max_length: txt_len,
            min_length: txt_len,
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            repetition_penalty: self.repetition_penalty,
            do_sample: true,
            pad_token_id: self.pad_token_id,
            eos_token_id: Some(eos_token_id),
            seed: self.seed,
        }
    }
}

/// Extend every row of `input_ids` (batch, prompt_len) up to `cfg.max_length` tokens.
///
/// Returns the full sequences (prompt + generated), shape (batch, len) with
/// `prompt_len <= len <= max(prompt_len, max_length)`, in the dtype of `input_ids`.
///
/// # Errors
/// Returns an error if the prompt is empty, the target length exceeds the model's context, or
/// model inference fails.
pub fn generate(
    model: &Gpt2HeadsWithValueModel,
    input_ids: &Tensor,
    cfg: &GenerationConfig,
) -> Result<Tensor> {
    let (batch, prompt_len) = input_ids.dims2()?;
    if prompt_len == 0 {
        return Err(ModelError::InvalidInput("prompt must not be empty".into()));
    }
    if cfg.max_length > model.config().n_positions {
        return Err(ModelError::InvalidInput(format!(
            "max_length {} exceeds n_positions {}",
            cfg.max_length,
            model.config().n_positions
        )));
    }

    if prompt_len >= cfg.max_length {
        return Ok(input_ids.clone());
    }
    let id_dtype = input_ids.dtype();
    let input_ids = input_ids.to_dtype(DType::U32)?;
    let mut rows: Vec<Vec<u32>> = input_ids.to_vec2()?;

    let mut rng = match cfg.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    debug!(
        batch,
        prompt_len,
        max_length = cfg.max_length,
        min_length = cfg.min_length,
        "generating"
    );

    let mut finished = vec![false; batch];
    let (mut logits, mut cache) = model.next_token_logits(&input_ids, None)?;
    let mut cur_len = prompt_len;

    while cur_len < cfg.max_length {
        let mut step_logits: Vec<Vec<f32>> = logits.to_dtype(DType::F32)?.to_vec2()?;
        let mut next_tokens = Vec::with_capacity(batch);

        for (b, row_logits) in step_logits.iter_mut().enumerate() {
            if finished[b] {
                next_tokens.push(cfg.pad_token_id);
                continue;
            }
            apply_repetition_penalty(row_logits, &rows[b], cfg.repetition_penalty);
            if let Some(eos) = cfg.eos_token_id
                && cur_len < cfg.min_length
            {
                suppress_token(row_logits, eos);
            }
            let next = if cfg.do_sample {
                sample_from_logits(row_logits, cfg.temperature, cfg.top_k, cfg.top_p, &mut rng)
            } else {
                argmax(row_logits)
            };
            if cfg.eos_token_id == Some(next) {
                finished[b] = true;
            }
            next_tokens.push(next);
        }

        for (row, &token) in rows.iter_mut().zip(&next_tokens) {
            row.push(token);
        }
        cur_len += 1;

        if finished.iter().all(|f| *f) || cur_len >= cfg.max_length {
            break;
        }

        let step = Tensor::from_vec(next_tokens, (batch, 1), model.device())?;
        (logits, cache) = model.next_token_logits(&step, Some(&cache))?;
    }

    Ok(Tensor::new(rows, model.device())?.to_dtype(id_dtype)?)
}

/// Sample a continuation of one prompt so the whole sequence is `txt_len` tokens long.
///
/// Returns the `txt_len - prompt.len()` new tokens (empty if the prompt is already that long).
///
/// # Errors
/// Returns an error if generation fails.
pub fn respond_to_prompt(
    model: &Gpt2HeadsWithValueModel,
    prompt: &[u32],
    txt_len: usize,
    opts: &SamplingOptions,
) -> Result<Vec<u32>> {
    let input = Tensor::new(prompt, model.device())?.unsqueeze(0)?;
    let response = respond_to_batch(model, &input, txt_len, opts)?;
    Ok(response.i(0)?.to_vec1()?)
}

/// Sample continuations for a batch of equal-length prompts, shape (batch, prompt_len).
///
/// Returns (batch, `txt_len - prompt_len`).
///
/// # Errors
/// Returns an error if generation fails.
pub fn respond_to_batch(
    model: &Gpt2HeadsWithValueModel,
    prompts: &Tensor,
    txt_len: usize,
    opts: &SamplingOptions,
) -> Result<Tensor> {
    let (_, prompt_len) = prompts.dims2()?;
    let cfg = opts.to_generation_config(txt_len, model.config().eos_token_id);
    let full = generate(model, prompts, &cfg)?;
    let total = full.dim(1)?;
    Ok(full.narrow(1, prompt_len, total - prompt_len)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Gpt2Config;
    use candle_core::Device;
    use candle_nn::{VarBuilder, VarMap};

    fn tiny_model() -> Gpt2HeadsWithValueModel {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        Gpt2HeadsWithValueModel::new(&Gpt2Config::tiny(), vb).unwrap()
    }

    fn seeded(seed: u64) -> SamplingOptions {
        SamplingOptions {
            pad_token_id: 0,
            seed: Some(seed),
            ..SamplingOptions::default()
        }
    }

    #[test]
    fn test_single_prompt_returns_exact_length() {
        let model = tiny_model();
        let prompt = [5u32, 6, 7];
        let out = respond_to_prompt(&model, &prompt, 12, &seeded(0)).unwrap();
        assert_eq!(out.len(), 12 - prompt.len());
        assert!(out.iter().all(|t| (*t as usize) < model.config().vocab_size));
    }

    #[test]
    fn test_batch_returns_exact_shape() {
        let model = tiny_model();
        let prompts = Tensor::new(&[[1u32, 2, 3, 4], [4, 3, 2, 1]], model.device()).unwrap();
        let out = respond_to_batch(&model, &prompts, 10, &seeded(1)).unwrap();
        assert_eq!(out.dims(), &[2, 6]);
    }

    #[test]
    fn test_min_length_bans_eos() {
        // tiny() uses id 0 as EOS; pinning min = max means it can never be chosen.
        let model = tiny_model();
        for seed in 0..5 {
            let out = respond_to_prompt(&model, &[3, 4], 16, &seeded(seed)).unwrap();
            assert!(!out.contains(&model.config().eos_token_id), "{out:?}");
        }
    }

    #[test]
    fn test_prompt_at_target_length_yields_nothing() {
        let model = tiny_model();
        let out = respond_to_prompt(&model, &[1, 2, 3], 3, &seeded(0)).unwrap();
        assert!(out.is_empty());
        let out = respond_to_prompt(&model, &[1, 2, 3], 2, &seeded(0)).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_same_seed_is_reproducible() {
        let model = tiny_model();
        let a = respond_to_prompt(&model, &[9, 8], 10, &seeded(42)).unwrap();
        let b = respond_to_prompt(&model, &[9, 8], 10, &seeded(42)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_greedy_matches_uncached_argmax() {
        let model = tiny_model();
        let prompt = Tensor::new(&[[2u32, 7, 1]], model.device()).unwrap();
        let cfg = GenerationConfig {
            max_length: 6,
            do_sample: false,
            eos_token_id: None,
            ..GenerationConfig::default()
        };
        let out = generate(&model, &prompt, &cfg).unwrap();
        assert_eq!(out.dims(), &[1, 6]);

        let tokens = out.i(0).unwrap().to_vec1::<u32>().unwrap();
        for end in 3..6 {
            let ctx = Tensor::new(&tokens[..end], model.device())
                .unwrap()
                .unsqueeze(0)
                .unwrap();
            let (logits, _) = model.next_token_logits(&ctx, None).unwrap();
            let row = logits.i(0).unwrap().to_vec1::<f32>().unwrap();
            assert_eq!(argmax(&row), tokens[end]);
        }
    }

    #[test]
    fn test_finished_rows_are_padded() {
        let model = tiny_model();
        let prompt = Tensor::new(&[[2u32, 7]], model.device()).unwrap();
        let (logits, _) = model.next_token_logits(&prompt, None).unwrap();
        let first = argmax(&logits.i(0).unwrap().to_vec1::<f32>().unwrap());

        // Treat whatever greedy picks first as EOS.
        let cfg = GenerationConfig {
            max_length: 8,
            do_sample: false,
            eos_token_id: Some(first),
            pad_token_id: 63,
            ..GenerationConfig::default()
        };
        let out = generate(&model, &prompt, &cfg).unwrap();
        assert_eq!(out.i(0).unwrap().to_vec1::<u32>().unwrap(), vec![2, 7, first]);
    }

    #[test]
    fn test_response_keeps_prompt_dtype() {
        let model = tiny_model();
        let prompts = Tensor::new(&[[1i64, 2, 3], [3, 2, 1]], model.device()).unwrap();
        let out = respond_to_batch(&model, &prompts, 7, &seeded(5)).unwrap();
        assert_eq!(out.dtype(), DType::I64);
        assert_eq!(out.dims(), &[2, 4]);

        let full = Tensor::cat(&[&prompts, &out], 1).unwrap();
        assert_eq!(full.dims(), &[2, 7]);

        let empty = respond_to_batch(&model, &prompts, 3, &seeded(5)).unwrap();
        assert_eq!(empty.dtype(), DType::I64);
    }

    #[test]
    fn test_rejects_length_beyond_context() {
        let model = tiny_model();
        let n = model.config().n_positions + 1;
        let err = respond_to_prompt(&model, &[1], n, &seeded(0));
        assert!(matches!(err, Err(ModelError::InvalidInput(_))));
    }
}
