//! stformer-core: spatio-temporal trajectory forecasting
//!
//! This crate provides:
//! - Masked multi-head attention and transformer encoder/decoder stacks
//! - A convolutional semantic-map feature extractor
//! - GRU temporal encoding and an attention-coupled recurrent decoder
//! - The full `STTransformer` model, loss, Adam optimizer and trainer
//! - safetensors checkpoints carrying parameters and optimizer state

pub mod attention;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod eval;
pub mod loss;
pub mod model;
pub mod optim;
pub mod params;
pub mod positional;
pub mod recurrent;
pub mod schedule;
pub mod semantic_map;
pub mod synthetic;
pub mod trainer;
pub mod transformer;

// Re-exports
pub use attention::{AttentionInput, MultiHeadAttention};
pub use config::{load_config, parse_config, Config, ModelConfig, TemporalEncoderKind, TrainConfig};
pub use error::{Result, StError};
pub use eval::{
    average_displacement_error, final_displacement_error, positions_from_states, reconstruct_positions,
};
pub use loss::{mask_output, trajectory_loss, LossRegime};
pub use model::{build_model, SceneBatch, STTransformer};
pub use optim::{clip_gradients, Adam, AdamParams};
pub use schedule::{LrSchedule, ScheduleSpec};
pub use synthetic::{constant_velocity_scene, SyntheticScenes};
pub use trainer::Trainer;
