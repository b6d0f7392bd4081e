//! Position reconstruction and displacement metrics

use crate::error::{Result, StError};
use candle_core::{DType, Tensor, D};

/// Turn per-step displacements into absolute positions.
///
/// `displacements [b, h, n, d]` are de-standardized by `stds [d]` when
/// given, `initial [b, n, d]` is prepended as step 0 and the result is
/// summed cumulatively over time, giving `[b, h + 1, n, d]`.
pub fn reconstruct_positions(
    displacements: &Tensor,
    initial: &Tensor,
    stds: Option<&Tensor>,
) -> Result<Tensor> {
    let (b, _, n, d) = displacements.dims4()?;
    if initial.dims() != [b, n, d] {
        return Err(StError::shape("initial positions", [b, n, d], initial.dims()));
    }
    let scaled = match stds {
        Some(stds) => {
            if stds.dims() != [d] {
                return Err(StError::shape("per-axis stds", [d], stds.dims()));
            }
            displacements.broadcast_mul(&stds.to_dtype(displacements.dtype())?)?
        }
        None => displacements.clone(),
    };
    let steps = Tensor::cat(&[&initial.unsqueeze(1)?, &scaled], 1)?;
    Ok(steps.cumsum(1)?)
}

/// De-standardize a `[b, h, n, d]` sequence of standardized states into
/// positions of the same shape.
///
/// Step 0 is scaled by `stds` and every later step is rebuilt from the
/// de-standardized step-to-step displacements.
pub fn positions_from_states(states: &Tensor, stds: Option<&Tensor>) -> Result<Tensor> {
    let (_, h, _, d) = states.dims4()?;
    let first = states.narrow(1, 0, 1)?;
    let initial = match stds {
        Some(stds) => {
            if stds.dims() != [d] {
                return Err(StError::shape("per-axis stds", [d], stds.dims()));
            }
            first.broadcast_mul(&stds.to_dtype(states.dtype())?)?
        }
        None => first,
    };
    if h == 1 {
        return Ok(initial);
    }
    let displacements = (states.narrow(1, 1, h - 1)? - states.narrow(1, 0, h - 1)?)?;
    reconstruct_positions(&displacements, &initial.squeeze(1)?, stds)
}

fn check_pair(real: &Tensor, pred: &Tensor) -> Result<()> {
    if real.rank() != 3 || real.dims() != pred.dims() || real.dim(1)? == 0 {
        return Err(StError::shape("trajectories", real.dims(), pred.dims()));
    }
    Ok(())
}

/// Per-step Euclidean distance `[n, h]` between two `[n, h, d]` trajectories
fn step_distances(real: &Tensor, pred: &Tensor) -> Result<Tensor> {
    let diff = (real.to_dtype(DType::F32)? - pred.to_dtype(DType::F32)?)?;
    Ok(diff.sqr()?.sum(D::Minus1)?.sqrt()?)
}

/// Mean L2 distance over every trajectory and timestep
pub fn average_displacement_error(real: &Tensor, pred: &Tensor) -> Result<f32> {
    check_pair(real, pred)?;
    Ok(step_distances(real, pred)?.mean_all()?.to_scalar::<f32>()?)
}

/// Mean L2 distance at the last timestep
pub fn final_displacement_error(real: &Tensor, pred: &Tensor) -> Result<f32> {
    check_pair(real, pred)?;
    let h = real.dim(1)?;
    let last = step_distances(&real.narrow(1, h - 1, 1)?, &pred.narrow(1, h - 1, 1)?)?;
    Ok(last.mean_all()?.to_scalar::<f32>()?)
}
