//! Scalar value head for PPO.
//!
//! Projects every position's hidden state to a value estimate. The stages are picked once from
//! the `summary_*` config fields and run in a fixed order:
//! first dropout -> projection -> activation -> last dropout.

use candle_core::Tensor;
use candle_nn::init::Init;
use candle_nn::{Dropout, Linear, Module, VarBuilder};
use tracing::debug;

use super::config::{Gpt2Config, SummaryType};
use crate::error::{ModelError, Result};

/// Whether gradients from the value output reach the transformer body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HeadMode {
    /// Value loss backpropagates into the shared body.
    #[default]
    Attached,
    /// Hidden states are detached before the head, so only the head's own weights train.
    Detached,
}

/// One stage of the value head, chosen at build time.
#[derive(Debug, Clone)]
pub enum SummaryLayer {
    Identity,
    Linear(Linear),
    Tanh,
    Dropout(Dropout),
}

impl SummaryLayer {
    fn dropout(p: Option<f32>) -> Self {
        match p {
            Some(p) if p > 0.0 => Self::Dropout(Dropout::new(p)),
            _ => Self::Identity,
        }
    }

    fn forward(&self, x: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        match self {
            Self::Identity => Ok(x.clone()),
            Self::Linear(linear) => linear.forward(x),
            Self::Tanh => x.tanh(),
            Self::Dropout(dropout) => dropout.forward(x, train),
        }
    }

    #[must_use]
    pub fn is_identity(&self) -> bool {
        matches!(self, Self::Identity)
    }
}

/// GPT-2 initialisation: weight ~ N(0, 0.02), zero bias.
#[allow(clippy::needless_pass_by_value)]
fn projection(in_dim: usize, out_dim: usize, vb: VarBuilder) -> candle_core::Result<Linear> {
    let weight = vb.get_with_hints(
        (out_dim, in_dim),
        "weight",
        Init::Randn {
            mean: 0.,
            stdev: 0.02,
        },
    )?;
    let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.))?;
    Ok(Linear::new(weight, Some(bias)))
}

/// Per-token value head.
#[derive(Debug, Clone)]
pub struct ValueHead {
    first_dropout: SummaryLayer,
    summary: SummaryLayer,
    activation: SummaryLayer,
    last_dropout: SummaryLayer,
}

impl ValueHead {
    /// Build the head from the optional `summary_*` fields of `config`.
    ///
    /// The projection weights live under `summary.{weight,bias}` in `vb`.
    ///
    /// # Errors
    /// Returns [`ModelError::NotImplemented`] for `summary_type = "attn"`, before any weight is
    /// requested, and propagates weight loading errors.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        if config.summary_type == Some(SummaryType::Attn) {
            return Err(ModelError::NotImplemented(
                "attention-based summary_type \"attn\"".into(),
            ));
        }

        let summary = if config.summary_use_proj == Some(true) {
            let num_classes =
                if config.summary_proj_to_labels == Some(true) && config.num_labels > 0 {
                    config.num_labels
                } else {
                    config.n_embd
                };
            SummaryLayer::Linear(projection(config.n_embd, num_classes, vb.pp("summary"))?)
        } else {
            SummaryLayer::Identity
        };

        let activation = match config.summary_activation.as_deref() {
            Some("tanh") => SummaryLayer::Tanh,
            _ => SummaryLayer::Identity,
        };

        let head = Self {
            first_dropout: SummaryLayer::dropout(config.summary_first_dropout),
            summary,
            activation,
            last_dropout: SummaryLayer::dropout(config.summary_last_dropout),
        };
        debug!(
            projection = !head.summary.is_identity(),
            tanh = !head.activation.is_identity(),
            first_dropout = !head.first_dropout.is_identity(),
            last_dropout = !head.last_dropout.is_identity(),
            "built value head"
        );
        Ok(head)
    }

    /// Apply the head to hidden states of shape (batch, seq_len, n_embd).
    ///
    /// Returns (batch, seq_len, out) where `out` is the projection width, or `n_embd` when no
    /// projection is configured.
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn forward(&self, hidden_states: &Tensor, mode: HeadMode, train: bool) -> Result<Tensor> {
        let x = match mode {
            HeadMode::Attached => hidden_states.clone(),
            HeadMode::Detached => hidden_states.detach(),
        };
        let x = self.first_dropout.forward(&x, train)?;
        let x = self.summary.forward(&x, train)?;
        let x = self.activation.forward(&x, train)?;
        Ok(self.last_dropout.forward(&x, train)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn bare_config() -> Gpt2Config {
        Gpt2Config {
            summary_type: None,
            summary_use_proj: None,
            summary_proj_to_labels: None,
            summary_activation: None,
            summary_first_dropout: None,
            summary_last_dropout: None,
            ..Gpt2Config::tiny()
        }
    }

    fn build(config: &Gpt2Config) -> (Result<ValueHead>, VarMap) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        (ValueHead::new(config, vb), varmap)
    }

    #[test]
    fn test_no_optional_fields_is_identity() {
        let (head, varmap) = build(&bare_config());
        let head = head.unwrap();
        assert!(varmap.all_vars().is_empty());

        let x = Tensor::randn(0f32, 1.0, (2, 3, 16), &Device::Cpu).unwrap();
        let y = head.forward(&x, HeadMode::Attached, true).unwrap();
        assert_eq!(y.dims(), x.dims());
        let diff = (y - &x).unwrap().abs().unwrap().sum_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_projection_to_single_label() {
        for n_embd in [8, 16, 32] {
            let config = Gpt2Config {
                n_embd,
                summary_use_proj: Some(true),
                summary_proj_to_labels: Some(true),
                num_labels: 1,
                ..bare_config()
            };
            let (head, _varmap) = build(&config);
            let x = Tensor::zeros((1, 7, n_embd), DType::F32, &Device::Cpu).unwrap();
            let y = head.unwrap().forward(&x, HeadMode::Attached, false).unwrap();
            assert_eq!(y.dims(), &[1, 7, 1]);
        }
    }

    #[test]
    fn test_projection_without_labels_keeps_hidden_size() {
        let config = Gpt2Config {
            summary_use_proj: Some(true),
            summary_proj_to_labels: Some(false),
            ..bare_config()
        };
        let (head, varmap) = build(&config);
        let x = Tensor::zeros((1, 2, 16), DType::F32, &Device::Cpu).unwrap();
        let y = head.unwrap().forward(&x, HeadMode::Attached, false).unwrap();
        assert_eq!(y.dims(), &[1, 2, 16]);
        assert!(varmap.data().lock().unwrap().contains_key("summary.weight"));
    }

    #[test]
    fn test_fresh_projection_uses_gpt2_init() {
        let config = Gpt2Config {
            n_embd: 512,
            summary_use_proj: Some(true),
            summary_proj_to_labels: Some(true),
            num_labels: 1,
            ..bare_config()
        };
        let (head, varmap) = build(&config);
        head.unwrap();
        let data = varmap.data().lock().unwrap();

        let bias = data["summary.bias"].as_tensor().to_vec1::<f32>().unwrap();
        assert_eq!(bias, vec![0.0]);

        let weight = data["summary.weight"].as_tensor();
        assert_eq!(weight.dims(), &[1, 512]);
        let max = weight.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(max > 0.0 && max < 0.2, "max |w| = {max}");
    }

    #[test]
    fn test_tanh_bounds_output() {
        let config = Gpt2Config {
            summary_activation: Some("tanh".into()),
            ..bare_config()
        };
        let (head, _varmap) = build(&config);
        let x = (Tensor::ones((1, 2, 16), DType::F32, &Device::Cpu).unwrap() * 10.0).unwrap();
        let y = head.unwrap().forward(&x, HeadMode::Attached, false).unwrap();
        let values = y.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| *v <= 1.0 && *v > 0.99));
    }

    #[test]
    fn test_unknown_activation_is_identity() {
        let config = Gpt2Config {
            summary_activation: Some("relu".into()),
            ..bare_config()
        };
        let (head, _varmap) = build(&config);
        assert!(head.unwrap().activation.is_identity());
    }

    #[test]
    fn test_dropout_only_active_in_train_mode() {
        let config = Gpt2Config {
            summary_first_dropout: Some(0.5),
            summary_last_dropout: Some(0.0),
            ..bare_config()
        };
        let (head, _varmap) = build(&config);
        let head = head.unwrap();
        assert!(matches!(head.first_dropout, SummaryLayer::Dropout(_)));
        assert!(head.last_dropout.is_identity());

        let x = Tensor::ones((4, 8, 16), DType::F32, &Device::Cpu).unwrap();
        let eval = head.forward(&x, HeadMode::Attached, false).unwrap();
        assert_eq!(eval.sum_all().unwrap().to_scalar::<f32>().unwrap(), 512.0);

        let train = head.forward(&x, HeadMode::Attached, true).unwrap();
        let values = train.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| *v == 0.0 || (*v - 2.0).abs() < 1e-6));
        assert!(values.contains(&0.0));
    }

    #[test]
    fn test_attn_summary_is_not_implemented() {
        let config = Gpt2Config {
            summary_type: Some(SummaryType::Attn),
            summary_use_proj: Some(true),
            summary_proj_to_labels: Some(true),
            ..bare_config()
        };
        let (head, varmap) = build(&config);
        assert!(matches!(head, Err(ModelError::NotImplemented(_))));
        assert!(varmap.all_vars().is_empty());
    }

    #[test]
    fn test_other_summary_types_apply_to_every_position() {
        for summary_type in [
            SummaryType::Last,
            SummaryType::First,
            SummaryType::Mean,
            SummaryType::ClsIndex,
        ] {
            let config = Gpt2Config {
                summary_type: Some(summary_type),
                summary_use_proj: Some(true),
                summary_proj_to_labels: Some(true),
                ..bare_config()
            };
            let (head, _varmap) = build(&config);
            let x = Tensor::zeros((2, 5, 16), DType::F32, &Device::Cpu).unwrap();
            let y = head.unwrap().forward(&x, HeadMode::Attached, false).unwrap();
            assert_eq!(y.dims(), &[2, 5, 1]);
        }
    }
}
