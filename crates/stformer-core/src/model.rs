//! The spatio-temporal trajectory model.
//!
//! Per forward pass:
//! 1. motion features are embedded and joined with per-neighbor map features
//! 2. a spatial transformer attends across neighbors at every timestep
//! 3. invalid neighbors are zeroed and the joint embedding is flattened
//!    through a small MLP
//! 4. a temporal compressor (GRU or transformer) encodes the time axis
//! 5. the recurrent decoder emits `seq_size` future joint states

use crate::attention::{ensure_rows_have_valid, AttentionInput};
use crate::config::{ModelConfig, TemporalEncoderKind};
use crate::error::{Result, StError};
use crate::params::{count_parameters, seeded_init};
use crate::recurrent::{RnnDecoder, RnnEncoder};
use crate::semantic_map::{broadcast_over_time, SemanticMapFeatures};
use crate::transformer::{Encoder, StackConfig, Transformer, TransformerInput};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{linear, Linear, Module, VarBuilder, VarMap};

/// One batch of scenes. Masks hold `1.0` for invalid cells.
#[derive(Debug, Clone)]
pub struct SceneBatch {
    /// `[batch, past_len, neighbors, features]`
    pub past: Tensor,
    /// `[batch, past_len]`
    pub past_seq_mask: Tensor,
    /// `[batch, past_len, neighbors]`
    pub past_neigh_mask: Tensor,
    /// `[batch, horizon, neighbors, features]`; step 0 seeds the decoder
    pub future: Tensor,
    /// `[batch, horizon, neighbors]`
    pub future_neigh_mask: Tensor,
    /// `[batch·neighbors, map_size, map_size, map_channels]`
    pub maps: Tensor,
    /// Optional per-axis standard deviations `[out_features]` used to
    /// de-standardize positions for evaluation
    pub stds: Option<Tensor>,
}

impl SceneBatch {
    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.past.dim(0)?)
    }

    pub fn device(&self) -> &Device {
        self.past.device()
    }
}

#[derive(Debug, Clone)]
enum TemporalEncoder {
    Recurrent(RnnEncoder),
    Transformer(Encoder),
}

impl TemporalEncoder {
    /// `[b, t, f]` → `[b, t, hidden]`
    fn forward(&self, x: &Tensor, seq_mask: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            TemporalEncoder::Recurrent(rnn) => rnn.forward(x),
            TemporalEncoder::Transformer(encoder) => {
                let x = x.unsqueeze(1)?;
                let mask = seq_mask.unsqueeze(1)?;
                let out = encoder.forward(AttentionInput::new(&x), Some(&mask), train)?;
                Ok(out.squeeze(1)?)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct STTransformer {
    config: ModelConfig,
    feat_embedding: Linear,
    semantic_map: SemanticMapFeatures,
    spatial: Transformer,
    spatial_mlp: (Linear, Linear),
    temporal: TemporalEncoder,
    decoder: RnnDecoder,
}

impl STTransformer {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let ff_hidden = config.feed_forward.then_some(config.ff_hidden);

        let spatial = StackConfig {
            input_dim: config.feat_embedding + config.map_embedding,
            d_model: config.sp_dk,
            num_heads: config.sp_enc_heads,
            num_layers: config.sp_num_encoders,
            max_positions: config.max_positions,
            use_positional: false,
            dropout: config.dropout,
            ff_hidden,
        };

        let temporal = match config.temporal_encoder {
            TemporalEncoderKind::Recurrent => TemporalEncoder::Recurrent(RnnEncoder::new(
                config.spatial_mlp_out,
                config.rnn_hidden,
                vb.pp("rnn_encoder"),
            )?),
            TemporalEncoderKind::Transformer => {
                let stack = StackConfig {
                    input_dim: config.spatial_mlp_out,
                    d_model: config.rnn_hidden,
                    num_heads: config.tm_heads,
                    num_layers: config.tm_num_encoders,
                    max_positions: config.max_positions,
                    use_positional: true,
                    dropout: config.dropout,
                    ff_hidden,
                };
                TemporalEncoder::Transformer(Encoder::new(&stack, vb.pp("temporal_encoder"))?)
            }
        };

        let sp_flat = config.neigh_size * config.sp_dk;
        Ok(Self {
            config: config.clone(),
            feat_embedding: linear(config.features_size, config.feat_embedding, vb.pp("feat_embedding"))?,
            semantic_map: SemanticMapFeatures::new(config, vb.pp("semantic_map"))?,
            spatial: Transformer::new(&spatial, None, vb.pp("spatial_transformer"))?,
            spatial_mlp: (
                linear(sp_flat, config.spatial_mlp_hidden, vb.pp("spatial_mlp.0"))?,
                linear(config.spatial_mlp_hidden, config.spatial_mlp_out, vb.pp("spatial_mlp.1"))?,
            ),
            temporal,
            decoder: RnnDecoder::new(
                config.decoder_width(),
                config.decoder_embedding,
                config.rnn_hidden,
                vb.pp("rnn_decoder"),
            )?,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Predict `[batch, seq_size, neighbors, out_features]`.
    ///
    /// Step 0 of the prediction is the first future state copied through.
    pub fn forward(&self, batch: &SceneBatch, train: bool) -> Result<Tensor> {
        let masks = self.check_batch(batch)?;
        let (b, t, n, _) = batch.past.dims4()?;
        let cfg = &self.config;

        let motion = self.feat_embedding.forward(&batch.past)?;
        let maps = broadcast_over_time(&self.semantic_map.forward(&batch.maps, n)?, t)?;
        let joint = Tensor::cat(&[&motion, &maps], D::Minus1)?;

        let spatial = self.spatial.forward(
            TransformerInput {
                input: AttentionInput::new(&joint),
                input_mask: Some(&masks.neigh),
                targets: None,
                target_mask: None,
            },
            false,
            train,
        )?;
        let keep = masks.neigh.affine(-1.0, 1.0)?.unsqueeze(D::Minus1)?;
        let spatial = spatial.broadcast_mul(&keep)?;

        let flat = spatial.reshape((b, t, n * cfg.sp_dk))?;
        let embeddings = self
            .spatial_mlp
            .1
            .forward(&self.spatial_mlp.0.forward(&flat)?.relu()?)?;

        let encoded = self.temporal.forward(&embeddings, &masks.seq, train)?;

        let init_point = batch
            .future
            .narrow(1, 0, 1)?
            .narrow(3, 0, cfg.out_features)?
            .reshape((b, n * cfg.out_features))?;
        let decoded = self
            .decoder
            .forward(&encoded, &masks.seq, &init_point, cfg.seq_size)?;
        Ok(decoded
            .sequence
            .reshape((b, cfg.seq_size, n, cfg.out_features))?)
    }

    fn check_batch(&self, batch: &SceneBatch) -> Result<BatchMasks> {
        let cfg = &self.config;
        let (b, t, n, f) = batch.past.dims4()?;
        if n != cfg.neigh_size || f != cfg.features_size || t == 0 {
            return Err(StError::shape(
                "past motion",
                format!("[b, >0, {}, {}]", cfg.neigh_size, cfg.features_size),
                batch.past.dims(),
            ));
        }
        let future_shape = [b, cfg.seq_size, n, f];
        if batch.future.dims() != future_shape {
            return Err(StError::shape("future motion", future_shape, batch.future.dims()));
        }
        if batch.past_seq_mask.dims() != [b, t] {
            return Err(StError::shape("past sequence mask", [b, t], batch.past_seq_mask.dims()));
        }
        if batch.past_neigh_mask.dims() != [b, t, n] {
            return Err(StError::shape("past neighbor mask", [b, t, n], batch.past_neigh_mask.dims()));
        }
        if batch.future_neigh_mask.dims() != [b, cfg.seq_size, n] {
            return Err(StError::shape(
                "future neighbor mask",
                [b, cfg.seq_size, n],
                batch.future_neigh_mask.dims(),
            ));
        }

        let seq = batch.past_seq_mask.to_dtype(DType::F32)?;
        let neigh = batch.past_neigh_mask.to_dtype(DType::F32)?;
        ensure_rows_have_valid(&seq, "past sequence")?;
        // Neighbor rows only need a valid entry at observed timesteps
        let gated = neigh.min(D::Minus1)?.mul(&seq.affine(-1.0, 1.0)?)?;
        ensure_rows_have_valid(&gated.unsqueeze(D::Minus1)?, "neighbor")?;
        Ok(BatchMasks { seq, neigh })
    }
}

struct BatchMasks {
    seq: Tensor,
    neigh: Tensor,
}

/// Build the model on `device` with fresh parameters, reseeded when the
/// config carries a seed.
pub fn build_model(config: &ModelConfig, device: &Device) -> Result<(STTransformer, VarMap)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = STTransformer::new(config, vb)?;
    if let Some(seed) = config.seed {
        seeded_init(&varmap, seed)?;
    }
    tracing::info!(
        parameters = count_parameters(&varmap)?,
        temporal = ?config.temporal_encoder,
        horizon = config.seq_size,
        neighbors = config.neigh_size,
        "built trajectory model"
    );
    Ok((model, varmap))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::ConvStage;

    /// Small model that builds in milliseconds on CPU
    pub(crate) fn tiny_config(horizon: usize) -> ModelConfig {
        let mut config = ModelConfig::new(2, horizon, 2, 1);
        config.out_features = 2;
        config.sp_dk = 8;
        config.sp_enc_heads = 2;
        config.sp_num_encoders = 1;
        config.feat_embedding = 6;
        config.map_embedding = 2;
        config.map_size = 32;
        config.map_stages = vec![ConvStage::new(4, 5, 2), ConvStage::new(1, 5, 2)];
        config.spatial_mlp_hidden = 16;
        config.spatial_mlp_out = 8;
        config.rnn_hidden = 8;
        config.decoder_embedding = 8;
        config.dropout = 0.0;
        config.seed = Some(3);
        config
    }

    pub(crate) fn scene(batch: usize, past_len: usize, horizon: usize, device: &Device) -> SceneBatch {
        SceneBatch {
            past: Tensor::randn(0f32, 1.0, (batch, past_len, 2, 2), device).unwrap(),
            past_seq_mask: Tensor::zeros((batch, past_len), DType::F32, device).unwrap(),
            past_neigh_mask: Tensor::zeros((batch, past_len, 2), DType::F32, device).unwrap(),
            future: Tensor::randn(0f32, 1.0, (batch, horizon, 2, 2), device).unwrap(),
            future_neigh_mask: Tensor::zeros((batch, horizon, 2), DType::F32, device).unwrap(),
            maps: Tensor::zeros((batch * 2, 32, 32, 3), DType::F32, device).unwrap(),
            stds: None,
        }
    }

    #[test]
    fn test_forward_shape_and_step_zero() {
        let device = Device::Cpu;
        let (model, _) = build_model(&tiny_config(5), &device).unwrap();
        let batch = scene(2, 3, 5, &device);
        let out = model.forward(&batch, false).unwrap();
        assert_eq!(out.dims(), &[2, 5, 2, 2]);

        let first: Vec<f32> = out.narrow(1, 0, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let expected: Vec<f32> = batch.future.narrow(1, 0, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(first, expected);
    }

    #[test]
    fn test_transformer_temporal_encoder() {
        let device = Device::Cpu;
        let mut config = tiny_config(3);
        config.temporal_encoder = TemporalEncoderKind::Transformer;
        config.tm_heads = 2;
        config.tm_num_encoders = 1;
        config.feed_forward = true;
        config.ff_hidden = 12;
        let (model, _) = build_model(&config, &device).unwrap();
        let out = model.forward(&scene(1, 4, 3, &device), false).unwrap();
        assert_eq!(out.dims(), &[1, 3, 2, 2]);
    }

    #[test]
    fn test_mask_shape_mismatch_rejected() {
        let device = Device::Cpu;
        let (model, _) = build_model(&tiny_config(3), &device).unwrap();
        let mut batch = scene(1, 2, 3, &device);
        batch.past_neigh_mask = Tensor::zeros((1, 3, 2), DType::F32, &device).unwrap();
        assert!(matches!(
            model.forward(&batch, false),
            Err(StError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_fully_masked_rows_rejected() {
        let device = Device::Cpu;
        let (model, _) = build_model(&tiny_config(3), &device).unwrap();

        let mut batch = scene(1, 2, 3, &device);
        batch.past_seq_mask = Tensor::ones((1, 2), DType::F32, &device).unwrap();
        assert!(matches!(
            model.forward(&batch, false),
            Err(StError::FullyMaskedRow("past sequence"))
        ));

        let mut batch = scene(1, 2, 3, &device);
        batch.past_neigh_mask = Tensor::new(&[[[0.0f32, 1.0], [1.0, 1.0]]], &device).unwrap();
        assert!(matches!(
            model.forward(&batch, false),
            Err(StError::FullyMaskedRow("neighbor"))
        ));

        // The same empty row is fine at a padded timestep
        batch.past_seq_mask = Tensor::new(&[[0.0f32, 1.0]], &device).unwrap();
        assert!(model.forward(&batch, false).is_ok());
    }

    #[test]
    fn test_config_errors_surface_at_build() {
        let device = Device::Cpu;
        let mut config = tiny_config(3);
        config.sp_enc_heads = 3;
        assert!(matches!(
            build_model(&config, &device),
            Err(StError::InvalidConfig(_))
        ));
    }
}
