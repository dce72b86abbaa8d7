#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod inference;
pub mod model;
pub mod weights;

pub use error::{ModelError, Result};
pub use inference::generate::{
    GenerationConfig, SamplingOptions, generate, respond_to_batch, respond_to_prompt,
};
pub use model::{Gpt2Config, Gpt2HeadsWithValueModel, HeadMode, ModelInputs, ValueHead};
