pub mod loader;

pub use loader::{
    LoadedModel, load_config_for_model, load_model, load_model_from_buffer, load_model_from_bytes,
};
