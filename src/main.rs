//! PPO rollout CLI
//!
//! Samples a continuation from a GPT-2 value-head model and reports the per-token values the
//! critic assigns to the full sequence.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use candle_core::Tensor;
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokenizers::Tokenizer;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use ppo_gpt::inference::generate::{SamplingOptions, respond_to_prompt};
use ppo_gpt::model::{Gpt2Config, Gpt2HeadsWithValueModel, ModelInputs};
use ppo_gpt::weights::loader as weights_loader;

/// Output format for the rollout.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Continuation text, then values
    #[default]
    Plain,
    /// JSON with ids, values and timing
    Json,
}

/// Sample a PPO rollout from a GPT-2 model with a value head.
#[derive(Debug, Parser)]
#[command(
    name = "ppo-gpt",
    version,
    about = "Sample from a GPT-2 value-head model and print per-token values"
)]
struct Cli {
    /// Prompt text to continue
    #[arg(index = 1)]
    prompt: Option<String>,

    /// Path to model.safetensors (config.json is read from the same directory)
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Path to tokenizer.json (defaults to the model's directory)
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// Total sequence length, prompt included
    #[arg(short, long, default_value = "20")]
    length: usize,

    /// Sampling temperature
    #[arg(short, long, default_value = "1.0")]
    temperature: f32,

    /// Top-k sampling (0 = disabled)
    #[arg(long, default_value = "0")]
    top_k: usize,

    /// Top-p (nucleus) sampling (1 = disabled)
    #[arg(long, default_value = "1.0")]
    top_p: f32,

    /// Repetition penalty (1 = disabled)
    #[arg(long, default_value = "1.0")]
    repetition_penalty: f32,

    /// Random seed for reproducible sampling
    #[arg(long)]
    seed: Option<u64>,

    /// Print model info and exit
    #[arg(long)]
    info: bool,

    /// Output format
    #[arg(long, value_enum, default_value = "plain")]
    format: OutputFormat,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Serialize)]
struct JsonOutput {
    prompt: String,
    response: String,
    prompt_ids: Vec<u32>,
    response_ids: Vec<u32>,
    values: Vec<f32>,
    generation_time_ms: u64,
    seed: Option<u64>,
    temperature: f32,
    top_k: usize,
    top_p: f32,
    repetition_penalty: f32,
    length: usize,
}

struct Rollout {
    prompt_ids: Vec<u32>,
    response_ids: Vec<u32>,
    response: String,
    values: Vec<f32>,
    generation_time_ms: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if cli.info {
        return print_model_info(&cli);
    }

    let prompt = cli.prompt.as_deref().context(
        "No prompt provided. Usage: ppo-gpt --model path/to/model.safetensors \"Once upon a time\"",
    )?;
    let model_path = cli
        .model
        .as_deref()
        .context("--model path/to/model.safetensors is required")?;

    let device = candle_core::Device::Cpu;
    let loaded =
        weights_loader::load_model(model_path, &device).context("Failed to load model")?;
    if loaded.fresh_value_head {
        info!("checkpoint has no value head; values come from an untrained head");
    }
    let tokenizer = load_tokenizer(&cli, model_path)?;

    let rollout = run_rollout(&loaded.model, &tokenizer, &cli, prompt)?;
    output_rollout(&cli, prompt, &rollout)
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Print information about the model.
fn print_model_info(cli: &Cli) -> Result<()> {
    let config = match &cli.model {
        Some(path) => weights_loader::load_config_for_model(path)?,
        None => Gpt2Config::default(),
    };

    println!("GPT-2 Value Head Model Info");
    println!("===========================");
    println!();
    println!("  Vocabulary size: {} tokens", config.vocab_size);
    println!("  Context length:  {} tokens", config.n_positions);
    println!("  Layers:          {}", config.n_layer);
    println!("  Attention heads: {}", config.n_head);
    println!("  Embedding dim:   {}", config.n_embd);
    println!("  Summary type:    {:?}", config.summary_type);
    println!("  Summary proj:    {:?}", config.summary_use_proj);
    println!("  Activation:      {:?}", config.summary_activation);
    println!(
        "  Dropout:         first={:?} last={:?}",
        config.summary_first_dropout, config.summary_last_dropout
    );

    if let Some(model_path) = &cli.model {
        println!();
        println!("Model path: {}", model_path.display());
        if model_path.exists() {
            let metadata = std::fs::metadata(model_path)?;
            println!("Model size: {} MB", metadata.len() / (1024 * 1024));
        } else {
            println!("Model file not found at specified path");
        }
    }

    Ok(())
}

fn load_tokenizer(cli: &Cli, model_path: &Path) -> Result<Tokenizer> {
    let path = cli.tokenizer.clone().unwrap_or_else(|| {
        model_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("tokenizer.json")
    });
    Tokenizer::from_file(&path)
        .map_err(|e| anyhow::anyhow!("Cannot load tokenizer from '{}': {}", path.display(), e))
}

fn run_rollout(
    model: &Gpt2HeadsWithValueModel,
    tokenizer: &Tokenizer,
    cli: &Cli,
    prompt: &str,
) -> Result<Rollout> {
    let encoding = tokenizer
        .encode(prompt, false)
        .map_err(|e| anyhow::anyhow!("tokenize prompt: {e}"))?;
    let prompt_ids = encoding.get_ids().to_vec();
    anyhow::ensure!(!prompt_ids.is_empty(), "prompt tokenized to zero tokens");

    let opts = SamplingOptions {
        temperature: cli.temperature,
        top_k: cli.top_k,
        top_p: cli.top_p,
        repetition_penalty: cli.repetition_penalty,
        pad_token_id: model.config().eos_token_id,
        seed: cli.seed,
    };
    debug!(prompt_tokens = prompt_ids.len(), length = cli.length, ?opts, "sampling");

    let start = Instant::now();
    let response_ids = respond_to_prompt(model, &prompt_ids, cli.length, &opts)?;
    let generation_time_ms = start.elapsed().as_millis().try_into().unwrap_or(u64::MAX);

    let full: Vec<u32> = prompt_ids.iter().chain(&response_ids).copied().collect();
    let input = Tensor::new(full.as_slice(), model.device())?.unsqueeze(0)?;
    let out = model.forward(&ModelInputs::ids(&input))?;
    let values = out.value.squeeze(0)?.to_vec1::<f32>()?;

    let response = tokenizer
        .decode(&response_ids, true)
        .map_err(|e| anyhow::anyhow!("decode response: {e}"))?;

    Ok(Rollout {
        prompt_ids,
        response_ids,
        response,
        values,
        generation_time_ms,
    })
}

fn output_rollout(cli: &Cli, prompt: &str, rollout: &Rollout) -> Result<()> {
    match cli.format {
        OutputFormat::Plain => {
            println!("{prompt}{}", rollout.response);
            println!();
            let formatted: Vec<String> = rollout.values.iter().map(|v| format!("{v:.4}")).collect();
            println!("values: [{}]", formatted.join(", "));
            println!(
                "generated {} tokens in {} ms",
                rollout.response_ids.len(),
                rollout.generation_time_ms
            );
        }
        OutputFormat::Json => {
            let payload = JsonOutput {
                prompt: prompt.to_string(),
                response: rollout.response.clone(),
                prompt_ids: rollout.prompt_ids.clone(),
                response_ids: rollout.response_ids.clone(),
                values: rollout.values.clone(),
                generation_time_ms: rollout.generation_time_ms,
                seed: cli.seed,
                temperature: cli.temperature,
                top_k: cli.top_k,
                top_p: cli.top_p,
                repetition_penalty: cli.repetition_penalty,
                length: cli.length,
            };
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
    }

    Ok(())
}
