//! Named parameter access and seeded initialization

use crate::error::{Result, StError};
use candle_core::{Tensor, Var};
use candle_nn::VarMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

/// All trainable variables, sorted by name
pub fn named_vars(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| StError::Tensor(candle_core::Error::Msg("parameter store lock poisoned".into())))?;
    let mut vars: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

pub fn count_parameters(varmap: &VarMap) -> Result<usize> {
    Ok(named_vars(varmap)?.iter().map(|(_, v)| v.elem_count()).sum())
}

/// Redraw every dense/conv weight and its bias uniformly in
/// `±1/sqrt(fan_in)` from a seeded generator.
///
/// Variables are visited in name order so the same seed always yields the
/// same parameters. Rank-1 weights (layer norms) keep their constant init.
pub fn seeded_init(varmap: &VarMap, seed: u64) -> Result<()> {
    let vars = named_vars(varmap)?;
    let mut rng = StdRng::seed_from_u64(seed);

    let mut bounds: HashMap<String, f32> = HashMap::new();
    for (name, var) in &vars {
        let Some(prefix) = name.strip_suffix(".weight") else {
            continue;
        };
        let dims = var.dims();
        if dims.len() < 2 {
            continue;
        }
        let fan_in: usize = dims[1..].iter().product();
        let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
        fill_uniform(var, bound, &mut rng)?;
        bounds.insert(prefix.to_string(), bound);
    }

    for (name, var) in &vars {
        let bound = name
            .strip_suffix(".bias")
            .and_then(|prefix| bounds.get(prefix));
        if let Some(bound) = bound {
            fill_uniform(var, *bound, &mut rng)?;
        }
    }
    tracing::debug!(seed, tensors = bounds.len(), "seeded parameter init");
    Ok(())
}

fn fill_uniform(var: &Var, bound: f32, rng: &mut StdRng) -> Result<()> {
    let values: Vec<f32> = (0..var.elem_count())
        .map(|_| rng.random_range(-bound..bound))
        .collect();
    let tensor = Tensor::from_vec(values, var.shape(), var.device())?.to_dtype(var.dtype())?;
    var.set(&tensor)?;
    Ok(())
}
