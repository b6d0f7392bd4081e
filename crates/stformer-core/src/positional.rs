//! Sinusoidal positional encoding
//!
//! angle(p, i) = p / 10000^(2·(i div 2) / d_model); even channels take the
//! sine, odd channels the cosine. Angles are computed in f64 and stored as f32.

use crate::error::Result;
use candle_core::{Device, Tensor};

/// Build the `[1, max_position, d_model]` encoding table
pub fn positional_encoding(max_position: usize, d_model: usize, device: &Device) -> Result<Tensor> {
    let table = encoding_values(max_position, d_model);
    Ok(Tensor::from_vec(table, (1, max_position, d_model), device)?)
}

fn encoding_values(max_position: usize, d_model: usize) -> Vec<f32> {
    let mut table = Vec::with_capacity(max_position * d_model);
    for pos in 0..max_position {
        for i in 0..d_model {
            let exponent = (2 * (i / 2)) as f64 / d_model as f64;
            let angle = pos as f64 / 10000f64.powf(exponent);
            let value = if i % 2 == 0 { angle.sin() } else { angle.cos() };
            table.push(value as f32);
        }
    }
    table
}
