use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use safetensors::SafeTensors;
use tracing::{info, warn};

use crate::model::{Gpt2Config, Gpt2HeadsWithValueModel};

/// A loaded model together with the variables of a freshly initialised value head.
pub struct LoadedModel {
    pub model: Gpt2HeadsWithValueModel,
    /// Trainable value-head weights when the checkpoint had none; empty otherwise.
    pub value_head_vars: VarMap,
    /// True when the value head was initialised here rather than read from the checkpoint.
    pub fresh_value_head: bool,
}

/// Load a model from a safetensors file on disk, reading `config.json` from the same directory
/// when available.
///
/// # Errors
/// Returns an error if the weights or config cannot be loaded.
pub fn load_model(model_path: &Path, device: &Device) -> Result<LoadedModel> {
    let config = load_config_for_model(model_path)?;
    let data = std::fs::read(model_path)
        .with_context(|| format!("read weights {}", model_path.display()))?;
    load_model_from_buffer(data, &config, device)
        .with_context(|| format!("load {}", model_path.display()))
}

/// Load a model from in-memory safetensors bytes.
///
/// A bare GPT-2 checkpoint (no `v_head.*` tensors) gets a new value head backed by
/// [`LoadedModel::value_head_vars`].
///
/// # Errors
/// Returns an error if the buffer is not safetensors or model construction fails.
pub fn load_model_from_bytes(
    data: &[u8],
    config: &Gpt2Config,
    device: &Device,
) -> Result<LoadedModel> {
    load_model_from_buffer(data.to_vec(), config, device)
}

/// Like [`load_model_from_bytes`], taking ownership of the buffer so it is not copied.
///
/// # Errors
/// Returns an error if the buffer is not safetensors or model construction fails.
pub fn load_model_from_buffer(
    data: Vec<u8>,
    config: &Gpt2Config,
    device: &Device,
) -> Result<LoadedModel> {
    let (tensors, has_value_head) = {
        let safetensors = SafeTensors::deserialize(&data).context("parse safetensors header")?;
        let names = safetensors.names();
        let has_value_head = names.iter().any(|name| name.starts_with("v_head."));
        (names.len(), has_value_head)
    };

    let vb = VarBuilder::from_buffered_safetensors(data, DType::F32, device)?;
    let value_head_vars = VarMap::new();

    let model = if has_value_head {
        Gpt2HeadsWithValueModel::new(config, vb)?
    } else {
        let head_vb = VarBuilder::from_varmap(&value_head_vars, DType::F32, device).pp("v_head");
        Gpt2HeadsWithValueModel::with_value_head(config, vb, head_vb)?
    };

    info!(
        tensors,
        fresh_value_head = !has_value_head,
        n_layer = config.n_layer,
        "loaded model weights"
    );

    Ok(LoadedModel {
        model,
        value_head_vars,
        fresh_value_head: !has_value_head,
    })
}

/// Read `config.json` next to `model_path`, falling back to the GPT-2 preset when absent.
///
/// # Errors
/// Returns an error if the file exists but cannot be read, parsed or validated.
pub fn load_config_for_model(model_path: &Path) -> Result<Gpt2Config> {
    let config_path = model_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("config.json");
    if !config_path.exists() {
        warn!(
            path = %config_path.display(),
            "no config.json next to weights, assuming gpt2 defaults"
        );
        return Ok(Gpt2Config::default());
    }

    let raw = std::fs::read_to_string(&config_path)
        .with_context(|| format!("read config {}", config_path.display()))?;
    let cfg: Gpt2Config =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", config_path.display()))?;
    cfg.validate()
        .map_err(anyhow::Error::msg)
        .context("invalid Gpt2Config")?;
    Ok(cfg)
}
