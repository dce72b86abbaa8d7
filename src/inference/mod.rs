pub mod generate;
pub mod sampling;

pub use generate::{
    GenerationConfig, SamplingOptions, generate, respond_to_batch, respond_to_prompt,
};
pub use sampling::sample_from_logits;
