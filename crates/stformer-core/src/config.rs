//! Configuration loading and validation.
//!
//! A config file is TOML with a `[model]` and a `[training]` table. Raw tables
//! deserialize into option-filled `*Params` structs; `ModelConfig::from_params`
//! and `TrainConfig::from_params` apply defaults and validate once, producing
//! immutable configs for model construction.

use crate::error::{Result, StError};
use crate::schedule::{ScheduleSpec, DEFAULT_WARMUP_STEPS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default attention width of the spatial transformer
pub const DEFAULT_SP_DK: usize = 256;
/// Default head count for spatial encoder/decoder attention
pub const DEFAULT_HEADS: usize = 4;
/// Default spatial encoder/decoder layer count
pub const DEFAULT_LAYERS: usize = 4;
/// Default fixed learning rate when `lr` is absent
pub const DEFAULT_LR: f64 = 1e-5;
/// Training step after which the timestep-weighted loss is used
pub const DEFAULT_LOSS_SWITCH_STEP: u64 = 6000;
/// Growth factor ε of the `(1 + ε)^t` timestep weights
pub const DEFAULT_LOSS_GROWTH: f64 = 0.001;
/// Per-tensor gradient clip norm
pub const CLIP_NORM: f64 = 2.0;

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    pub model: Option<ModelParams>,
    pub training: Option<TrainingParams>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ModelParams {
    pub features_size: Option<usize>,
    pub seq_size: Option<usize>,
    pub neigh_size: Option<usize>,
    pub batch: Option<usize>,
    pub sp_dk: Option<usize>,
    pub sp_enc_heads: Option<usize>,
    pub sp_dec_heads: Option<usize>,
    pub sp_num_encoders: Option<usize>,
    pub sp_num_decoders: Option<usize>,
    pub out_features: Option<usize>,
    pub feat_embedding: Option<usize>,
    pub map_embedding: Option<usize>,
    pub map_size: Option<usize>,
    pub map_channels: Option<usize>,
    pub map_stages: Option<Vec<ConvStage>>,
    pub spatial_mlp_hidden: Option<usize>,
    pub spatial_mlp_out: Option<usize>,
    pub rnn_hidden: Option<usize>,
    pub decoder_embedding: Option<usize>,
    pub dropout: Option<f32>,
    pub feed_forward: Option<bool>,
    pub ff_hidden: Option<usize>,
    pub temporal_encoder: Option<TemporalEncoderKind>,
    pub tm_heads: Option<usize>,
    pub tm_num_encoders: Option<usize>,
    pub max_positions: Option<usize>,
    pub seed: Option<u64>,
}

/// Learning rate as written in the config: an integer selects a warm-up
/// schedule with that many steps, a float selects a fixed rate.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(untagged)]
pub enum LrSetting {
    WarmupSteps(u64),
    Rate(f64),
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct TrainingParams {
    pub lr: Option<LrSetting>,
    pub lr_curve: Option<PathBuf>,
    pub beta_1: Option<f64>,
    pub beta_2: Option<f64>,
    pub epsilon: Option<f64>,
    pub loss_switch_step: Option<u64>,
    pub loss_growth: Option<f64>,
}

/// One strided convolution of the semantic map pyramid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvStage {
    pub out_channels: usize,
    pub kernel: usize,
    pub stride: usize,
}

impl ConvStage {
    pub const fn new(out_channels: usize, kernel: usize, stride: usize) -> Self {
        Self {
            out_channels,
            kernel,
            stride,
        }
    }
}

/// Default pyramid: 256 → 126 → 61 → 29 → 12, one output channel
pub const DEFAULT_MAP_STAGES: [ConvStage; 4] = [
    ConvStage::new(16, 5, 2),
    ConvStage::new(16, 5, 2),
    ConvStage::new(16, 5, 2),
    ConvStage::new(1, 7, 2),
];

/// Which network compresses the fused per-timestep embeddings across time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemporalEncoderKind {
    /// Single GRU cell stepped across time
    #[default]
    Recurrent,
    /// Transformer encoder stack with positional encoding over time
    Transformer,
}

/// Validated model hyper-parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub features_size: usize,
    /// Forecast horizon
    pub seq_size: usize,
    /// Maximum neighbors per sample
    pub neigh_size: usize,
    pub batch: usize,
    pub sp_dk: usize,
    pub sp_enc_heads: usize,
    pub sp_dec_heads: usize,
    pub sp_num_encoders: usize,
    pub sp_num_decoders: usize,
    /// Width of each predicted per-neighbor state
    pub out_features: usize,
    pub feat_embedding: usize,
    pub map_embedding: usize,
    pub map_size: usize,
    pub map_channels: usize,
    pub map_stages: Vec<ConvStage>,
    pub spatial_mlp_hidden: usize,
    pub spatial_mlp_out: usize,
    pub rnn_hidden: usize,
    pub decoder_embedding: usize,
    pub dropout: f32,
    pub feed_forward: bool,
    pub ff_hidden: usize,
    pub temporal_encoder: TemporalEncoderKind,
    pub tm_heads: usize,
    pub tm_num_encoders: usize,
    pub max_positions: usize,
    pub seed: Option<u64>,
}

impl ModelConfig {
    /// Config with the required sizes and every other option at its default
    pub fn new(features_size: usize, seq_size: usize, neigh_size: usize, batch: usize) -> Self {
        Self {
            features_size,
            seq_size,
            neigh_size,
            batch,
            sp_dk: DEFAULT_SP_DK,
            sp_enc_heads: DEFAULT_HEADS,
            sp_dec_heads: DEFAULT_HEADS,
            sp_num_encoders: DEFAULT_LAYERS,
            sp_num_decoders: DEFAULT_LAYERS,
            out_features: 3,
            feat_embedding: 144,
            map_embedding: 32,
            map_size: 256,
            map_channels: 3,
            map_stages: DEFAULT_MAP_STAGES.to_vec(),
            spatial_mlp_hidden: 512,
            spatial_mlp_out: 256,
            rnn_hidden: 512,
            decoder_embedding: 256,
            dropout: 0.1,
            feed_forward: false,
            ff_hidden: 256,
            temporal_encoder: TemporalEncoderKind::Recurrent,
            tm_heads: DEFAULT_HEADS,
            tm_num_encoders: 2,
            max_positions: 64,
            seed: None,
        }
    }

    /// Resolve raw `[model]` params, failing fast on missing required keys
    pub fn from_params(params: &ModelParams) -> Result<Self> {
        let features_size = params
            .features_size
            .ok_or(StError::MissingParameter("features_size"))?;
        let seq_size = params
            .seq_size
            .ok_or(StError::MissingParameter("seq_size"))?;
        let neigh_size = params
            .neigh_size
            .ok_or(StError::MissingParameter("neigh_size"))?;
        let batch = params.batch.ok_or(StError::MissingParameter("batch"))?;

        let d = Self::new(features_size, seq_size, neigh_size, batch);
        let config = Self {
            sp_dk: params.sp_dk.unwrap_or(d.sp_dk),
            sp_enc_heads: params.sp_enc_heads.unwrap_or(d.sp_enc_heads),
            sp_dec_heads: params.sp_dec_heads.unwrap_or(d.sp_dec_heads),
            sp_num_encoders: params.sp_num_encoders.unwrap_or(d.sp_num_encoders),
            sp_num_decoders: params.sp_num_decoders.unwrap_or(d.sp_num_decoders),
            out_features: params.out_features.unwrap_or(d.out_features),
            feat_embedding: params.feat_embedding.unwrap_or(d.feat_embedding),
            map_embedding: params.map_embedding.unwrap_or(d.map_embedding),
            map_size: params.map_size.unwrap_or(d.map_size),
            map_channels: params.map_channels.unwrap_or(d.map_channels),
            map_stages: params.map_stages.clone().unwrap_or(d.map_stages.clone()),
            spatial_mlp_hidden: params.spatial_mlp_hidden.unwrap_or(d.spatial_mlp_hidden),
            spatial_mlp_out: params.spatial_mlp_out.unwrap_or(d.spatial_mlp_out),
            rnn_hidden: params.rnn_hidden.unwrap_or(d.rnn_hidden),
            decoder_embedding: params.decoder_embedding.unwrap_or(d.decoder_embedding),
            dropout: params.dropout.unwrap_or(d.dropout),
            feed_forward: params.feed_forward.unwrap_or(d.feed_forward),
            ff_hidden: params.ff_hidden.unwrap_or(d.ff_hidden),
            temporal_encoder: params.temporal_encoder.unwrap_or(d.temporal_encoder),
            tm_heads: params.tm_heads.unwrap_or(d.tm_heads),
            tm_num_encoders: params.tm_num_encoders.unwrap_or(d.tm_num_encoders),
            max_positions: params.max_positions.unwrap_or(d.max_positions),
            seed: params.seed,
            ..d
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency. Called by every constructor that
    /// consumes a `ModelConfig`.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("features_size", self.features_size),
            ("seq_size", self.seq_size),
            ("neigh_size", self.neigh_size),
            ("batch", self.batch),
            ("sp_dk", self.sp_dk),
            ("sp_enc_heads", self.sp_enc_heads),
            ("sp_dec_heads", self.sp_dec_heads),
            ("out_features", self.out_features),
            ("feat_embedding", self.feat_embedding),
            ("map_embedding", self.map_embedding),
            ("map_size", self.map_size),
            ("map_channels", self.map_channels),
            ("spatial_mlp_hidden", self.spatial_mlp_hidden),
            ("spatial_mlp_out", self.spatial_mlp_out),
            ("rnn_hidden", self.rnn_hidden),
            ("decoder_embedding", self.decoder_embedding),
            ("ff_hidden", self.ff_hidden),
            ("tm_heads", self.tm_heads),
            ("max_positions", self.max_positions),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(StError::InvalidConfig(format!("{name} must be > 0")));
            }
        }

        check_divisible("sp_dk", self.sp_dk, "sp_enc_heads", self.sp_enc_heads)?;
        check_divisible("sp_dk", self.sp_dk, "sp_dec_heads", self.sp_dec_heads)?;
        if self.temporal_encoder == TemporalEncoderKind::Transformer {
            check_divisible("rnn_hidden", self.rnn_hidden, "tm_heads", self.tm_heads)?;
        }

        if self.out_features > self.features_size {
            return Err(StError::InvalidConfig(format!(
                "out_features ({}) cannot exceed features_size ({})",
                self.out_features, self.features_size
            )));
        }

        if !(0.0..1.0).contains(&self.dropout) {
            return Err(StError::InvalidConfig(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }

        if self.map_stages.is_empty() {
            return Err(StError::InvalidConfig(
                "map_stages must contain at least one convolution".to_string(),
            ));
        }
        // Walks the pyramid and fails if a kernel no longer fits
        self.map_output_side()?;
        Ok(())
    }

    /// Spatial side length after the convolution pyramid (valid padding)
    pub fn map_output_side(&self) -> Result<usize> {
        let mut side = self.map_size;
        for (i, stage) in self.map_stages.iter().enumerate() {
            if stage.kernel == 0 || stage.stride == 0 || stage.out_channels == 0 {
                return Err(StError::InvalidConfig(format!(
                    "map stage {i} has a zero kernel, stride or channel count"
                )));
            }
            if side < stage.kernel {
                return Err(StError::InvalidConfig(format!(
                    "map stage {i}: kernel {} does not fit a {side}x{side} input (map_size {})",
                    stage.kernel, self.map_size
                )));
            }
            side = (side - stage.kernel) / stage.stride + 1;
        }
        Ok(side)
    }

    /// Flattened width of the last pyramid stage
    pub fn map_flat_dim(&self) -> Result<usize> {
        let side = self.map_output_side()?;
        let channels = self.map_stages.last().map_or(0, |s| s.out_channels);
        Ok(side * side * channels)
    }

    /// Width of one decoder output: all neighbors' states concatenated
    pub fn decoder_width(&self) -> usize {
        self.neigh_size * self.out_features
    }
}

fn check_divisible(width_name: &str, width: usize, heads_name: &str, heads: usize) -> Result<()> {
    if width % heads != 0 {
        return Err(StError::InvalidConfig(format!(
            "{width_name} ({width}) must be divisible by {heads_name} ({heads})"
        )));
    }
    Ok(())
}

/// Validated optimizer and loss settings
#[derive(Debug, Clone, PartialEq)]
pub struct TrainConfig {
    pub schedule: ScheduleSpec,
    pub beta_1: f64,
    pub beta_2: f64,
    pub epsilon: f64,
    pub loss_switch_step: u64,
    pub loss_growth: f64,
    pub clip_norm: f64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            schedule: ScheduleSpec::Fixed(DEFAULT_LR),
            beta_1: 0.99,
            beta_2: 0.9,
            epsilon: 1e-9,
            loss_switch_step: DEFAULT_LOSS_SWITCH_STEP,
            loss_growth: DEFAULT_LOSS_GROWTH,
            clip_norm: CLIP_NORM,
        }
    }
}

impl TrainConfig {
    /// Resolve raw `[training]` params. A `lr_curve` file takes precedence
    /// over `lr`.
    pub fn from_params(params: &TrainingParams) -> Result<Self> {
        let d = Self::default();
        let schedule = match (&params.lr_curve, params.lr) {
            (Some(path), lr) => {
                if lr.is_some() {
                    tracing::warn!(curve = %path.display(), "lr_curve is set, ignoring lr");
                }
                ScheduleSpec::load_curve(path)?
            }
            (None, Some(LrSetting::WarmupSteps(0))) => {
                tracing::warn!(
                    warmup_steps = DEFAULT_WARMUP_STEPS,
                    "lr = 0 selects the default warm-up schedule"
                );
                ScheduleSpec::Warmup {
                    warmup_steps: DEFAULT_WARMUP_STEPS,
                }
            }
            (None, Some(LrSetting::WarmupSteps(steps))) => ScheduleSpec::Warmup {
                warmup_steps: steps,
            },
            (None, Some(LrSetting::Rate(rate))) => ScheduleSpec::Fixed(rate),
            (None, None) => d.schedule.clone(),
        };
        let config = Self {
            schedule,
            beta_1: params.beta_1.unwrap_or(d.beta_1),
            beta_2: params.beta_2.unwrap_or(d.beta_2),
            epsilon: params.epsilon.unwrap_or(d.epsilon),
            loss_switch_step: params.loss_switch_step.unwrap_or(d.loss_switch_step),
            loss_growth: params.loss_growth.unwrap_or(d.loss_growth),
            clip_norm: CLIP_NORM,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.schedule.validate()?;
        for (name, beta) in [("beta_1", self.beta_1), ("beta_2", self.beta_2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(StError::InvalidConfig(format!(
                    "{name} must be in [0, 1), got {beta}"
                )));
            }
        }
        if self.epsilon <= 0.0 {
            return Err(StError::InvalidConfig("epsilon must be > 0".to_string()));
        }
        if self.loss_growth < 0.0 {
            return Err(StError::InvalidConfig(
                "loss_growth must be >= 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Config {
    pub fn model_config(&self) -> Result<ModelConfig> {
        let params = self.model.as_ref().ok_or_else(|| {
            StError::InvalidConfig("config file has no [model] table".to_string())
        })?;
        ModelConfig::from_params(params)
    }

    pub fn train_config(&self) -> Result<TrainConfig> {
        match &self.training {
            Some(params) => TrainConfig::from_params(params),
            None => Ok(TrainConfig::default()),
        }
    }
}

pub fn parse_config(contents: &str) -> Result<Config> {
    toml::from_str(contents)
        .map_err(|e| StError::InvalidConfig(format!("failed to parse config as TOML: {e}")))
}

pub fn load_config(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}
