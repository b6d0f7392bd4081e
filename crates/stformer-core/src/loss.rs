//! Mask-aware trajectory loss

use crate::config::TrainConfig;
use crate::error::{Result, StError};
use candle_core::{DType, Tensor, D};

/// Which loss formula applies at a given training step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossRegime {
    /// Plain summed squared error
    Uniform,
    /// Squared error weighted by `(1 + growth)^t` along the horizon
    Weighted,
}

impl LossRegime {
    pub fn for_step(current_step: u64, switch_step: u64) -> Self {
        if current_step > switch_step {
            LossRegime::Weighted
        } else {
            LossRegime::Uniform
        }
    }
}

/// Zero every `[b, t, n, :]` cell whose neighbor mask `[b, t, n]` is set
pub fn mask_output(output: &Tensor, neigh_mask: &Tensor) -> Result<Tensor> {
    let dims = output.dims();
    if dims.len() != 4 || neigh_mask.dims() != &dims[..3] {
        return Err(StError::shape("neighbor output mask", dims.get(..3), neigh_mask.dims()));
    }
    let keep = neigh_mask
        .to_dtype(output.dtype())?
        .affine(-1.0, 1.0)?
        .unsqueeze(D::Minus1)?;
    Ok(output.broadcast_mul(&keep)?)
}

/// Per-timestep weights `(1 + growth)^t`, shaped `[1, horizon, 1, 1]`
pub fn horizon_weights(horizon: usize, growth: f64, device: &candle_core::Device) -> Result<Tensor> {
    let weights: Vec<f32> = (0..horizon)
        .map(|t| (1.0 + growth).powi(t as i32) as f32)
        .collect();
    Ok(Tensor::from_vec(weights, (1, horizon, 1, 1), device)?)
}

/// Loss between ground truth `real [b, h, n, F]` and `pred [b, h, n, out]`.
///
/// `real` is cut to the predicted feature width and both sides are masked
/// by `neigh_mask [b, h, n]`. The summed squared error is divided by the
/// feature width and by `horizon · neighbors · batch`.
pub fn trajectory_loss(
    real: &Tensor,
    pred: &Tensor,
    neigh_mask: &Tensor,
    current_step: u64,
    config: &TrainConfig,
) -> Result<Tensor> {
    let (b, h, n, out) = pred.dims4()?;
    let (rb, rh, rn, rf) = real.dims4()?;
    if (rb, rh, rn) != (b, h, n) || rf < out {
        return Err(StError::shape("loss targets", pred.dims(), real.dims()));
    }

    let real = mask_output(&real.narrow(3, 0, out)?.to_dtype(DType::F32)?, neigh_mask)?;
    let pred = mask_output(pred, neigh_mask)?;
    let sq = (real - pred)?.sqr()?;

    let sq = match LossRegime::for_step(current_step, config.loss_switch_step) {
        LossRegime::Uniform => sq,
        LossRegime::Weighted => {
            sq.broadcast_mul(&horizon_weights(h, config.loss_growth, sq.device())?)?
        }
    };
    let norm = (out * h * n * b) as f64;
    Ok((sq.sum_all()? / norm)?)
}
