pub mod attention;
pub mod config;
pub mod embedding;
pub mod layers;
pub mod lm_value;
pub mod transformer;
pub mod value_head;

// Re-exports for convenience
pub use attention::{CausalSelfAttention, KvCache, create_causal_mask, padding_mask};
pub use config::{Gpt2Config, SummaryType};
pub use embedding::{PositionEmbedding, TokenEmbedding};
pub use layers::{Block, LayerNorm, Mlp, conv1d};
pub use lm_value::{Gpt2HeadsWithValueModel, ValueModelOutput};
pub use transformer::{BodyOutput, Gpt2Model, ModelInputs};
pub use value_head::{HeadMode, SummaryLayer, ValueHead};
