//! Checkpoint save/restore.
//!
//! A checkpoint is one safetensors file holding every model parameter
//! (`model.<name>`), both Adam moments (`adam.m.<name>`, `adam.v.<name>`),
//! the optimizer step (`adam.step`) and the trainer step (`trainer.step`).
//! String metadata tags the format and version.
//!
//! Restore validates the whole file before writing anything, so a bad
//! artifact never leaves parameters half old and half new.

use crate::error::{Result, StError};
use crate::optim::Adam;
use candle_core::{DType, Device, Tensor};
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const FORMAT_KEY: &str = "format";
pub const FORMAT_NAME: &str = "stformer-checkpoint";
pub const VERSION_KEY: &str = "version";
pub const FORMAT_VERSION: &str = "1";

const ADAM_STEP: &str = "adam.step";
const TRAINER_STEP: &str = "trainer.step";

fn invalid(msg: impl Into<String>) -> StError {
    StError::InvalidCheckpoint(msg.into())
}

fn step_tensor(step: u64) -> Result<Tensor> {
    Ok(Tensor::new(&[step as i64], &Device::Cpu)?)
}

/// Write parameters and optimizer state to `path`.
///
/// Data goes to a sibling temporary file first and is renamed into place.
pub fn save_checkpoint(path: &Path, adam: &Adam, trainer_step: u64) -> Result<()> {
    let mut tensors: Vec<(String, Tensor)> = Vec::new();
    for (name, var, m, v) in adam.slots() {
        tensors.push((format!("model.{name}"), var.as_tensor().to_device(&Device::Cpu)?));
        tensors.push((format!("adam.m.{name}"), m.as_tensor().to_device(&Device::Cpu)?));
        tensors.push((format!("adam.v.{name}"), v.as_tensor().to_device(&Device::Cpu)?));
    }
    tensors.push((ADAM_STEP.to_string(), step_tensor(adam.step_count())?));
    tensors.push((TRAINER_STEP.to_string(), step_tensor(trainer_step)?));

    let metadata: HashMap<String, String> = [
        (FORMAT_KEY.to_string(), FORMAT_NAME.to_string()),
        (VERSION_KEY.to_string(), FORMAT_VERSION.to_string()),
    ]
    .into_iter()
    .collect();

    let tmp = temp_path(path);
    safetensors::serialize_to_file(tensors, &Some(metadata), &tmp)
        .map_err(|e| invalid(format!("failed to serialize {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path)?;

    tracing::info!(
        path = %path.display(),
        parameters = adam.slots().count(),
        trainer_step,
        "saved checkpoint"
    );
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Validated checkpoint contents, not yet applied
struct Loaded {
    tensors: HashMap<String, Tensor>,
    adam_step: u64,
    trainer_step: u64,
}

fn read_step(tensors: &HashMap<String, Tensor>, key: &str) -> Result<u64> {
    let tensor = tensors
        .get(key)
        .ok_or_else(|| invalid(format!("missing `{key}`")))?;
    let values: Vec<i64> = tensor
        .flatten_all()?
        .to_dtype(DType::I64)?
        .to_vec1()?;
    match values.as_slice() {
        [step] if *step >= 0 => Ok(*step as u64),
        _ => Err(invalid(format!("`{key}` must hold one non-negative step"))),
    }
}

fn load_and_validate(path: &Path, adam: &Adam, device: &Device) -> Result<Loaded> {
    let bytes = std::fs::read(path)
        .map_err(|e| invalid(format!("cannot read {}: {e}", path.display())))?;

    let (_, header) = SafeTensors::read_metadata(&bytes)
        .map_err(|e| invalid(format!("{} is not a safetensors file: {e}", path.display())))?;
    let meta = header.metadata().as_ref();
    let format = meta.and_then(|m| m.get(FORMAT_KEY)).map(String::as_str);
    let version = meta.and_then(|m| m.get(VERSION_KEY)).map(String::as_str);
    if format != Some(FORMAT_NAME) {
        return Err(invalid(format!("unexpected format tag {format:?}")));
    }
    if version != Some(FORMAT_VERSION) {
        return Err(invalid(format!("unsupported version {version:?}")));
    }

    let tensors = candle_core::safetensors::load_buffer(&bytes, device)
        .map_err(|e| invalid(format!("corrupt tensor data: {e}")))?;

    let mut expected = 2;
    for (name, var, _, _) in adam.slots() {
        for key in [
            format!("model.{name}"),
            format!("adam.m.{name}"),
            format!("adam.v.{name}"),
        ] {
            let tensor = tensors
                .get(&key)
                .ok_or_else(|| invalid(format!("missing `{key}`")))?;
            if tensor.dims() != var.dims() {
                return Err(invalid(format!(
                    "`{key}` has shape {:?}, model expects {:?}",
                    tensor.dims(),
                    var.dims()
                )));
            }
            expected += 1;
        }
    }
    if tensors.len() != expected {
        return Err(invalid(format!(
            "checkpoint holds {} tensors, model expects {expected}",
            tensors.len()
        )));
    }

    let adam_step = read_step(&tensors, ADAM_STEP)?;
    let trainer_step = read_step(&tensors, TRAINER_STEP)?;
    Ok(Loaded {
        tensors,
        adam_step,
        trainer_step,
    })
}

/// Restore parameters and optimizer state; returns the trainer step.
pub fn restore_checkpoint(path: &Path, adam: &mut Adam, device: &Device) -> Result<u64> {
    let loaded = load_and_validate(path, adam, device)?;

    for (name, var, m, v) in adam.slots() {
        for (prefix, target) in [("model", var), ("adam.m", m), ("adam.v", v)] {
            let key = format!("{prefix}.{name}");
            let tensor = loaded
                .tensors
                .get(&key)
                .ok_or_else(|| invalid(format!("missing `{key}`")))?;
            target.set(&tensor.to_dtype(target.dtype())?)?;
        }
    }
    adam.set_step_count(loaded.adam_step);

    tracing::info!(
        path = %path.display(),
        trainer_step = loaded.trainer_step,
        "restored checkpoint"
    );
    Ok(loaded.trainer_step)
}
