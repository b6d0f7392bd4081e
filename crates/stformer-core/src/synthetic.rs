//! Synthetic constant-velocity scenes for smoke runs and tests.
//!
//! Every neighbor starts at the origin and moves with a fixed velocity:
//! the past is all zeros, `future[t] = t · velocity`, rasters are blank and
//! every mask marks every cell valid.

use crate::config::ModelConfig;
use crate::error::{Result, StError};
use crate::model::SceneBatch;
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Scene where every sample and neighbor shares one velocity
pub fn constant_velocity_scene(
    config: &ModelConfig,
    batch: usize,
    past_len: usize,
    velocity: &[f32],
    device: &Device,
) -> Result<SceneBatch> {
    if velocity.len() != config.features_size {
        return Err(StError::shape(
            "synthetic velocity",
            config.features_size,
            velocity.len(),
        ));
    }
    let per_sample = vec![velocity.to_vec(); batch * config.neigh_size];
    scene_from_velocities(config, batch, past_len, &per_sample, device)
}

/// `velocities` holds one vector per `(sample, neighbor)`, sample-major
fn scene_from_velocities(
    config: &ModelConfig,
    batch: usize,
    past_len: usize,
    velocities: &[Vec<f32>],
    device: &Device,
) -> Result<SceneBatch> {
    let (h, n, f) = (config.seq_size, config.neigh_size, config.features_size);
    let mut future = Vec::with_capacity(batch * h * n * f);
    for b in 0..batch {
        for t in 0..h {
            for k in 0..n {
                future.extend(velocities[b * n + k].iter().map(|v| v * t as f32));
            }
        }
    }
    let side = config.map_size;
    Ok(SceneBatch {
        past: Tensor::zeros((batch, past_len, n, f), DType::F32, device)?,
        past_seq_mask: Tensor::zeros((batch, past_len), DType::F32, device)?,
        past_neigh_mask: Tensor::zeros((batch, past_len, n), DType::F32, device)?,
        future: Tensor::from_vec(future, (batch, h, n, f), device)?,
        future_neigh_mask: Tensor::zeros((batch, h, n), DType::F32, device)?,
        maps: Tensor::zeros((batch * n, side, side, config.map_channels), DType::F32, device)?,
        stds: None,
    })
}

/// Seeded stream of scenes with velocities drawn from `[-max_speed, max_speed)`
pub struct SyntheticScenes {
    config: ModelConfig,
    past_len: usize,
    max_speed: f32,
    rng: StdRng,
    device: Device,
}

impl SyntheticScenes {
    pub fn new(config: &ModelConfig, past_len: usize, max_speed: f32, seed: u64, device: &Device) -> Result<Self> {
        if past_len == 0 || max_speed.is_nan() || max_speed <= 0.0 {
            return Err(StError::InvalidConfig(format!(
                "synthetic scenes need past_len > 0 and max_speed > 0, got {past_len} and {max_speed}"
            )));
        }
        Ok(Self {
            config: config.clone(),
            past_len,
            max_speed,
            rng: StdRng::seed_from_u64(seed),
            device: device.clone(),
        })
    }

    pub fn next_batch(&mut self) -> Result<SceneBatch> {
        let count = self.config.batch * self.config.neigh_size;
        let velocities: Vec<Vec<f32>> = (0..count)
            .map(|_| {
                (0..self.config.features_size)
                    .map(|_| self.rng.random_range(-self.max_speed..self.max_speed))
                    .collect()
            })
            .collect();
        scene_from_velocities(
            &self.config,
            self.config.batch,
            self.past_len,
            &velocities,
            &self.device,
        )
    }
}
