//! Training loop state: model, parameters, optimizer, schedule and step

use crate::checkpoint::{restore_checkpoint, save_checkpoint};
use crate::config::{ModelConfig, TrainConfig};
use crate::error::Result;
use crate::eval::positions_from_states;
use crate::loss::{mask_output, trajectory_loss, LossRegime};
use crate::model::{build_model, SceneBatch, STTransformer};
use crate::optim::{clip_gradients, Adam, AdamParams};
use crate::params::named_vars;
use crate::schedule::LrSchedule;
use candle_core::{Device, Tensor, Var};
use candle_nn::{Optimizer, VarMap};
use std::path::Path;

pub struct Trainer {
    model: STTransformer,
    varmap: VarMap,
    vars: Vec<Var>,
    optimizer: Adam,
    schedule: LrSchedule,
    config: TrainConfig,
    device: Device,
    /// Number of completed training steps; drives the schedule and loss regime
    step: u64,
}

impl Trainer {
    pub fn new(model_config: &ModelConfig, config: &TrainConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let (model, varmap) = build_model(model_config, device)?;
        let schedule = config.schedule.resolve(model_config.sp_dk);
        let named = named_vars(&varmap)?;
        let vars = named.iter().map(|(_, v)| v.clone()).collect();
        let optimizer = Adam::with_names(
            named,
            AdamParams {
                lr: schedule.rate(0),
                beta_1: config.beta_1,
                beta_2: config.beta_2,
                epsilon: config.epsilon,
            },
        )?;
        tracing::info!(schedule = ?config.schedule, "trainer ready");
        Ok(Self {
            model,
            varmap,
            vars,
            optimizer,
            schedule,
            config: config.clone(),
            device: device.clone(),
            step: 0,
        })
    }

    pub fn model(&self) -> &STTransformer {
        &self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// One forward/backward/update pass. Returns the scalar loss.
    pub fn train_step(&mut self, batch: &SceneBatch) -> Result<f32> {
        let lr = self.schedule.rate(self.step);
        self.optimizer.set_learning_rate(lr);

        let preds = self.model.forward(batch, true)?;
        let preds = mask_output(&preds, &batch.future_neigh_mask)?;
        let loss = trajectory_loss(
            &batch.future,
            &preds,
            &batch.future_neigh_mask,
            self.step,
            &self.config,
        )?;

        let mut grads = loss.backward()?;
        clip_gradients(&mut grads, &self.vars, self.config.clip_norm)?;
        self.optimizer.step(&grads)?;

        let loss = loss.to_scalar::<f32>()?;
        let before = LossRegime::for_step(self.step, self.config.loss_switch_step);
        self.step += 1;
        let after = LossRegime::for_step(self.step, self.config.loss_switch_step);
        if before != after {
            tracing::info!(step = self.step, regime = ?after, "switching loss regime");
        }
        tracing::debug!(step = self.step, lr, loss, "train step");
        Ok(loss)
    }

    /// Predictions without dropout or parameter updates
    pub fn inference(&self, batch: &SceneBatch) -> Result<Tensor> {
        self.model.forward(batch, false)
    }

    /// Inference with invalid future neighbors zeroed
    pub fn eval_step(&self, batch: &SceneBatch) -> Result<Tensor> {
        mask_output(&self.inference(batch)?, &batch.future_neigh_mask)
    }

    /// `(real, predicted)` future positions de-standardized by the batch's
    /// per-axis stds, with invalid future neighbors zeroed in both.
    pub fn eval_positions(&self, batch: &SceneBatch) -> Result<(Tensor, Tensor)> {
        let pred = self.inference(batch)?;
        let real = batch.future.narrow(3, 0, pred.dim(3)?)?;
        let stds = batch.stds.as_ref();
        let real = mask_output(&positions_from_states(&real, stds)?, &batch.future_neigh_mask)?;
        let pred = mask_output(&positions_from_states(&pred, stds)?, &batch.future_neigh_mask)?;
        Ok((real, pred))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save_checkpoint(path, &self.optimizer, self.step)
    }

    /// Load parameters, optimizer state and step from `path`. On error the
    /// trainer is left exactly as it was.
    pub fn restore(&mut self, path: &Path) -> Result<()> {
        self.step = restore_checkpoint(path, &mut self.optimizer, &self.device)?;
        self.optimizer.set_learning_rate(self.schedule.rate(self.step));
        Ok(())
    }
}
