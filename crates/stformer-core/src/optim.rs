//! Gradient clipping and the Adam optimizer

use crate::error::Result;
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::Optimizer;

/// Rescale every gradient whose L2 norm exceeds `max_norm` down to
/// exactly `max_norm`. Each tensor is clipped on its own.
pub fn clip_gradients(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<()> {
    for var in vars {
        let Some(grad) = grads.get(var.as_tensor()) else {
            continue;
        };
        let norm = grad.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()? as f64;
        if norm > max_norm {
            let clipped = (grad * (max_norm / norm))?;
            grads.insert(var.as_tensor(), clipped);
        }
    }
    Ok(())
}

/// Global L2 norm of a single gradient tensor
pub fn grad_norm(grad: &Tensor) -> Result<f64> {
    Ok(grad.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()? as f64)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamParams {
    pub lr: f64,
    pub beta_1: f64,
    pub beta_2: f64,
    pub epsilon: f64,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta_1: 0.9,
            beta_2: 0.999,
            epsilon: 1e-7,
        }
    }
}

#[derive(Debug)]
struct Slot {
    name: String,
    var: Var,
    m: Var,
    v: Var,
}

/// Adam with bias correction folded into the step size:
/// `lr_t = lr · sqrt(1 - β2^t) / (1 - β1^t)`,
/// `θ -= lr_t · m / (sqrt(v) + ε)`.
///
/// Moments are kept per named parameter so they can be checkpointed.
#[derive(Debug)]
pub struct Adam {
    slots: Vec<Slot>,
    params: AdamParams,
    step: u64,
}

impl Adam {
    pub fn with_names(vars: Vec<(String, Var)>, params: AdamParams) -> Result<Self> {
        let slots = vars
            .into_iter()
            .map(|(name, var)| {
                let m = Var::zeros(var.shape(), var.dtype(), var.device())?;
                let v = Var::zeros(var.shape(), var.dtype(), var.device())?;
                Ok(Slot { name, var, m, v })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            slots,
            params,
            step: 0,
        })
    }

    pub fn params(&self) -> &AdamParams {
        &self.params
    }

    /// Number of updates applied so far
    pub fn step_count(&self) -> u64 {
        self.step
    }

    pub fn set_step_count(&mut self, step: u64) {
        self.step = step;
    }

    pub fn vars(&self) -> Vec<Var> {
        self.slots.iter().map(|s| s.var.clone()).collect()
    }

    /// `(name, parameter, first moment, second moment)` per slot
    pub fn slots(&self) -> impl Iterator<Item = (&str, &Var, &Var, &Var)> {
        self.slots
            .iter()
            .map(|s| (s.name.as_str(), &s.var, &s.m, &s.v))
    }

    fn apply(&mut self, grads: &GradStore) -> Result<()> {
        let t = (self.step + 1) as f64;
        let AdamParams {
            lr,
            beta_1,
            beta_2,
            epsilon,
        } = self.params;
        let lr_t = lr * (1.0 - beta_2.powf(t)).sqrt() / (1.0 - beta_1.powf(t));

        // Every new value is computed before any slot is written
        let mut updates = Vec::with_capacity(self.slots.len());
        for (i, slot) in self.slots.iter().enumerate() {
            let Some(g) = grads.get(slot.var.as_tensor()) else {
                continue;
            };
            let m = ((slot.m.as_tensor() * beta_1)? + (g * (1.0 - beta_1))?)?;
            let v = ((slot.v.as_tensor() * beta_2)? + (g.sqr()? * (1.0 - beta_2))?)?;
            let delta = (m.broadcast_div(&(v.sqrt()? + epsilon)?)? * lr_t)?;
            let theta = slot.var.as_tensor().sub(&delta)?;
            updates.push((i, theta, m, v));
        }
        for (i, theta, m, v) in updates {
            let slot = &self.slots[i];
            slot.m.set(&m)?;
            slot.v.set(&v)?;
            slot.var.set(&theta)?;
        }
        self.step += 1;
        Ok(())
    }
}

impl Optimizer for Adam {
    type Config = AdamParams;

    fn new(vars: Vec<Var>, config: AdamParams) -> candle_core::Result<Self> {
        let named = vars
            .into_iter()
            .enumerate()
            .map(|(i, v)| (format!("param.{i}"), v))
            .collect();
        Adam::with_names(named, config).map_err(|e| candle_core::Error::Msg(e.to_string()))
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        self.apply(grads)
            .map_err(|e| candle_core::Error::Msg(e.to_string()))
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}
