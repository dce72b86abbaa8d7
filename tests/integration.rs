use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use ppo_gpt::inference::generate::{SamplingOptions, respond_to_batch, respond_to_prompt};
use ppo_gpt::model::{Gpt2Config, Gpt2HeadsWithValueModel, Gpt2Model, ModelInputs};
use ppo_gpt::weights::loader;

fn write_config(dir: &std::path::Path, config: &Gpt2Config) -> Result<()> {
    std::fs::write(dir.join("config.json"), serde_json::to_string_pretty(config)?)?;
    Ok(())
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok((a - b)?.abs()?.max_all()?.to_scalar::<f32>()?)
}

#[test]
fn crate_boots() {
    let cfg = ppo_gpt::model::Gpt2Config::default();
    assert!(cfg.validate().is_ok());
    let _opts = SamplingOptions::default();
}

#[test]
fn saved_value_model_round_trips_through_loader() -> Result<()> {
    let device = Device::Cpu;
    let config = Gpt2Config::tiny();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = Gpt2HeadsWithValueModel::new(&config, vb)?;

    let dir = tempfile::tempdir()?;
    let weights = dir.path().join("model.safetensors");
    varmap.save(&weights)?;
    write_config(dir.path(), &config)?;

    let loaded = loader::load_model(&weights, &device)?;
    assert!(!loaded.fresh_value_head);
    assert!(loaded.value_head_vars.all_vars().is_empty());
    assert_eq!(loaded.model.config(), model.config());

    let ids = Tensor::new(&[[4u32, 8, 15, 16, 23, 42]], &device)?;
    let expected = model.forward(&ModelInputs::ids(&ids))?;
    let got = loaded.model.forward(&ModelInputs::ids(&ids))?;
    assert!(max_abs_diff(&expected.logits, &got.logits)? < 1e-5);
    assert!(max_abs_diff(&expected.value, &got.value)? < 1e-5);
    Ok(())
}

#[test]
fn owned_and_borrowed_buffers_load_the_same_model() -> Result<()> {
    let device = Device::Cpu;
    let config = Gpt2Config::tiny();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let _model = Gpt2HeadsWithValueModel::new(&config, vb)?;

    let dir = tempfile::tempdir()?;
    let weights = dir.path().join("model.safetensors");
    varmap.save(&weights)?;
    let data = std::fs::read(&weights)?;

    let borrowed = loader::load_model_from_bytes(&data, &config, &device)?;
    let owned = loader::load_model_from_buffer(data, &config, &device)?;
    assert!(!owned.fresh_value_head);

    let ids = Tensor::new(&[[2u32, 9, 4]], &device)?;
    let a = borrowed.model.forward(&ModelInputs::ids(&ids))?;
    let b = owned.model.forward(&ModelInputs::ids(&ids))?;
    assert_eq!(max_abs_diff(&a.value, &b.value)?, 0.0);
    Ok(())
}

#[test]
fn bare_gpt2_checkpoint_gets_fresh_value_head() -> Result<()> {
    let device = Device::Cpu;
    let config = Gpt2Config::tiny();

    // Same layout as a HuggingFace `gpt2` export: body tensors at the root, no lm_head, no v_head.
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let _body = Gpt2Model::new(&config, vb)?;

    let dir = tempfile::tempdir()?;
    let weights = dir.path().join("model.safetensors");
    varmap.save(&weights)?;
    write_config(dir.path(), &config)?;

    let loaded = loader::load_model(&weights, &device)?;
    assert!(loaded.fresh_value_head);
    let head_names: Vec<String> = loaded
        .value_head_vars
        .data()
        .lock()
        .unwrap()
        .keys()
        .cloned()
        .collect();
    assert!(head_names.contains(&"v_head.summary.weight".to_string()));

    let ids = Tensor::new(&[[1u32, 2, 3, 4, 5, 6, 7]], &device)?;
    let out = loaded.model.forward(&ModelInputs::ids(&ids))?;
    assert_eq!(out.logits.dims(), &[1, 7, config.vocab_size]);
    assert_eq!(out.value.dims(), &[1, 7]);
    Ok(())
}

#[test]
fn missing_config_falls_back_to_gpt2_preset() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = loader::load_config_for_model(&dir.path().join("model.safetensors"))?;
    assert_eq!(cfg, Gpt2Config::gpt2());
    Ok(())
}

#[test]
fn invalid_config_is_reported() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let bad = Gpt2Config {
        n_embd: 10,
        n_head: 3,
        ..Gpt2Config::tiny()
    };
    write_config(dir.path(), &bad)?;
    let err = loader::load_config_for_model(&dir.path().join("model.safetensors"))
        .expect_err("n_embd not divisible by n_head");
    assert!(
        err.chain().any(|e| e.to_string().contains("divisible")),
        "unexpected error chain: {err:?}"
    );
    Ok(())
}

#[test]
fn rollout_then_score_matches_ppo_shapes() -> Result<()> {
    let device = Device::Cpu;
    let config = Gpt2Config::tiny();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = Gpt2HeadsWithValueModel::new(&config, vb)?;

    let opts = SamplingOptions {
        top_k: 10,
        top_p: 0.9,
        repetition_penalty: 1.2,
        pad_token_id: 0,
        seed: Some(3),
        ..SamplingOptions::default()
    };

    let queries = Tensor::new(&[[3u32, 1, 4, 1, 5], [9, 2, 6, 5, 3]], &device)?;
    let responses = respond_to_batch(&model, &queries, 12, &opts)?;
    assert_eq!(responses.dims(), &[2, 7]);

    let full = Tensor::cat(&[&queries, &responses], 1)?;
    let out = model.forward(&ModelInputs::ids(&full))?;
    assert_eq!(out.logits.dims(), &[2, 12, config.vocab_size]);
    assert_eq!(out.value.dims(), &[2, 12]);

    let single = respond_to_prompt(&model, &[3, 1, 4, 1, 5], 12, &opts)?;
    assert_eq!(single.len(), 7);
    Ok(())
}
