//! Semantic map feature extractor.
//!
//! Each neighbor's raster goes through a pyramid of strided valid-padding
//! convolutions, a `tanh`, a flatten and a dense ReLU projection. The
//! resulting per-neighbor embedding is then replicated over the time axis.

use crate::config::{ConvStage, ModelConfig};
use crate::error::{Result, StError};
use candle_core::{DType, Tensor};
use candle_nn::{conv2d, linear, Conv2d, Conv2dConfig, Linear, Module, VarBuilder};

#[derive(Debug, Clone)]
pub struct SemanticMapFeatures {
    stages: Vec<Conv2d>,
    dense: Linear,
    map_size: usize,
    map_channels: usize,
    flat_dim: usize,
    embedding: usize,
}

impl SemanticMapFeatures {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let flat_dim = config.map_flat_dim()?;
        let mut stages = Vec::with_capacity(config.map_stages.len());
        let mut in_channels = config.map_channels;
        for (i, ConvStage { out_channels, kernel, stride }) in config.map_stages.iter().enumerate() {
            let cfg = Conv2dConfig {
                stride: *stride,
                ..Default::default()
            };
            stages.push(conv2d(
                in_channels,
                *out_channels,
                *kernel,
                cfg,
                vb.pp(format!("conv.{i}")),
            )?);
            in_channels = *out_channels;
        }
        Ok(Self {
            stages,
            dense: linear(flat_dim, config.map_embedding, vb.pp("dense"))?,
            map_size: config.map_size,
            map_channels: config.map_channels,
            flat_dim,
            embedding: config.map_embedding,
        })
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding
    }

    /// `[batch·neighbors, S, S, C]` rasters → `[batch, neighbors, embedding]`
    pub fn forward(&self, maps: &Tensor, neighbors: usize) -> Result<Tensor> {
        let (rows, h, w, c) = maps.dims4()?;
        let expected = (self.map_size, self.map_size, self.map_channels);
        if (h, w, c) != expected || neighbors == 0 || rows % neighbors != 0 {
            return Err(StError::shape(
                "map rasters",
                format!("[batch*{neighbors}, {}, {}, {}]", expected.0, expected.1, expected.2),
                maps.dims(),
            ));
        }

        // NHWC → NCHW for the convolution kernels
        let mut x = maps.to_dtype(DType::F32)?.permute((0, 3, 1, 2))?.contiguous()?;
        for stage in &self.stages {
            x = stage.forward(&x)?;
        }
        let x = x.tanh()?.reshape((rows / neighbors, neighbors, self.flat_dim))?;
        Ok(self.dense.forward(&x)?.relu()?)
    }
}

/// Replicate a `[batch, neighbors, e]` embedding over `time` steps by
/// multiplying with a ones tensor of the target shape.
pub fn broadcast_over_time(embedding: &Tensor, time: usize) -> Result<Tensor> {
    let (b, n, e) = embedding.dims3()?;
    let ones = Tensor::ones((b, time, n, e), embedding.dtype(), embedding.device())?;
    Ok(embedding.unsqueeze(1)?.broadcast_mul(&ones)?)
}
