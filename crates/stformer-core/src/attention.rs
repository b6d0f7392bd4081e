//! Masked scaled-dot-product attention and the multi-head wrapper.
//!
//! Activations are laid out `[batch, outer, positions, features]`: attention
//! runs across `positions` (neighbors for the spatial stack, timesteps for the
//! temporal one) independently for every `outer` index. After the head split
//! the logits are rank 5: `[batch, head, outer, query_pos, key_pos]`.
//!
//! Masks hold `1.0` for invalid positions. They are added to the logits as
//! `mask * MASK_PENALTY` so masked keys get ~0 weight while shapes stay static.

use crate::error::{Result, StError};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{linear, Linear, Module, VarBuilder};

/// Additive penalty for masked logits
pub const MASK_PENALTY: f64 = -1e9;

/// Attention input with an optional explicit key source.
///
/// Queries and values always come from `primary`; keys come from `secondary`
/// when present.
#[derive(Debug, Clone, Copy)]
pub struct AttentionInput<'a> {
    pub primary: &'a Tensor,
    pub secondary: Option<&'a Tensor>,
}

impl<'a> AttentionInput<'a> {
    pub fn new(primary: &'a Tensor) -> Self {
        Self {
            primary,
            secondary: None,
        }
    }

    pub fn with_keys(primary: &'a Tensor, keys: &'a Tensor) -> Self {
        Self {
            primary,
            secondary: Some(keys),
        }
    }

    /// Tensor that supplies the attention keys
    pub fn keys(&self) -> &'a Tensor {
        self.secondary.unwrap_or(self.primary)
    }
}

/// softmax(Q·Kᵗ / sqrt(d_k) + mask·(-1e9)) · V
///
/// Inputs share their leading (batch-like) dimensions, which may be of any
/// rank. `d_k` is the trailing dimension of `k`. Returns `(output, weights)`
/// with the leading dimensions preserved.
pub fn scaled_dot_product(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
) -> Result<(Tensor, Tensor)> {
    let d_k = k.dim(D::Minus1)?;
    if q.dim(D::Minus1)? != d_k {
        return Err(StError::shape("attention query/key width", d_k, q.dims()));
    }
    let rank = q.rank();
    if rank < 2 || k.rank() != rank || v.rank() != rank {
        return Err(StError::shape("attention inputs", q.dims(), k.dims()));
    }
    let lead = &q.dims()[..rank - 2];
    let (q_pos, k_pos, d_v) = (q.dim(rank - 2)?, k.dim(rank - 2)?, v.dim(D::Minus1)?);
    if k.dims()[..rank - 2] != *lead || v.dims()[..rank - 1] != k.dims()[..rank - 1] {
        return Err(StError::shape("attention inputs", q.dims(), k.dims()));
    }

    // candle matmul takes at most two batch dims, so fold them into one
    let batch: usize = lead.iter().product();
    let q3 = q.contiguous()?.reshape((batch, q_pos, d_k))?;
    let kt3 = k
        .contiguous()?
        .reshape((batch, k_pos, d_k))?
        .transpose(1, 2)?
        .contiguous()?;
    let v3 = v.contiguous()?.reshape((batch, k_pos, d_v))?;

    let logits_shape: Vec<usize> = lead.iter().copied().chain([q_pos, k_pos]).collect();
    let mut logits = (q3.matmul(&kt3)? / (d_k as f64).sqrt())?.reshape(logits_shape)?;

    if let Some(mask) = mask {
        let penalty = (mask.to_dtype(logits.dtype())? * MASK_PENALTY)?;
        logits = logits
            .broadcast_add(&penalty)
            .map_err(|_| StError::shape("attention mask", logits.dims(), mask.dims()))?;
    }

    let weights = candle_nn::ops::softmax(&logits, D::Minus1)?;
    let out_shape: Vec<usize> = lead.iter().copied().chain([q_pos, d_v]).collect();
    let output = weights
        .reshape((batch, q_pos, k_pos))?
        .matmul(&v3)?
        .reshape(out_shape)?;
    Ok((output, weights))
}

/// Expand a `[batch, outer, positions]` validity mask to the rank-5 logits
/// layout, masking keys: `[batch, 1, outer, 1, positions]`.
pub fn padding_mask(mask: &Tensor) -> Result<Tensor> {
    let (_b, _o, _p) = mask.dims3()?;
    Ok(mask.unsqueeze(1)?.unsqueeze(3)?)
}

/// Strict upper-triangular causal mask `[1, 1, 1, len, len]`: position `i`
/// may not attend to any `j > i`.
pub fn look_ahead_mask(len: usize, device: &Device) -> Result<Tensor> {
    let data: Vec<f32> = (0..len)
        .flat_map(|i| (0..len).map(move |j| if j > i { 1.0 } else { 0.0 }))
        .collect();
    Ok(Tensor::from_vec(data, (1, 1, 1, len, len), device)?)
}

/// Causal mask merged with a `[batch, outer, positions]` target validity mask
/// by elementwise maximum, so padded targets are hidden from every query.
pub fn combined_look_ahead_mask(target_mask: &Tensor) -> Result<Tensor> {
    let len = target_mask.dim(D::Minus1)?;
    let causal = look_ahead_mask(len, target_mask.device())?;
    let padding = padding_mask(&target_mask.to_dtype(DType::F32)?)?;
    Ok(causal.broadcast_maximum(&padding)?)
}

/// Fail if any row of `mask` (last axis) is entirely invalid.
///
/// Softmax over a row of only `-1e9` logits is defined but meaningless, so
/// callers check masks before they reach the attention layers.
pub fn ensure_rows_have_valid(mask: &Tensor, what: &'static str) -> Result<()> {
    if mask.elem_count() == 0 {
        return Ok(());
    }
    let worst = mask
        .to_dtype(DType::F32)?
        .min(D::Minus1)?
        .flatten_all()?
        .max(0)?
        .to_scalar::<f32>()?;
    if worst >= 0.5 {
        return Err(StError::FullyMaskedRow(what));
    }
    Ok(())
}

/// Multi-head attention over the positions axis of rank-4 activations
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    wq: Linear,
    wk: Linear,
    wv: Linear,
    dense: Linear,
    num_heads: usize,
    d_model: usize,
}

impl MultiHeadAttention {
    /// `q_dim`/`kv_dim` are input widths; every projection maps to `d_model`.
    pub fn new(
        q_dim: usize,
        kv_dim: usize,
        d_model: usize,
        num_heads: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if num_heads == 0 || d_model % num_heads != 0 {
            return Err(StError::InvalidConfig(format!(
                "attention width {d_model} must be divisible by head count {num_heads}"
            )));
        }
        Ok(Self {
            wq: linear(q_dim, d_model, vb.pp("wq"))?,
            wk: linear(kv_dim, d_model, vb.pp("wk"))?,
            wv: linear(kv_dim, d_model, vb.pp("wv"))?,
            dense: linear(d_model, d_model, vb.pp("dense"))?,
            num_heads,
            d_model,
        })
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// `[b, o, p, d_model]` → `[b, heads, o, p, d_model / heads]`
    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (b, o, p, _) = x.dims4()?;
        let x = x.reshape((b, o, p, self.num_heads, self.d_model / self.num_heads))?;
        Ok(x.permute((0, 3, 1, 2, 4))?.contiguous()?)
    }

    /// Returns `(output [b, o, q_pos, d_model], weights [b, h, o, q_pos, k_pos])`
    pub fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        let (b, o, q_pos, _) = q.dims4()?;
        let (kb, ko, k_pos, _) = k.dims4()?;
        if (kb, ko) != (b, o) || v.dims4()?.2 != k_pos {
            return Err(StError::shape("multi-head attention inputs", q.dims(), k.dims()));
        }

        let q = self.split_heads(&self.wq.forward(q)?)?;
        let k = self.split_heads(&self.wk.forward(k)?)?;
        let v = self.split_heads(&self.wv.forward(v)?)?;

        let (attn, weights) = scaled_dot_product(&q, &k, &v, mask)?;
        // [b, h, o, q_pos, dh] → [b, o, q_pos, h, dh] → [b, o, q_pos, d_model]
        let attn = attn
            .permute((0, 2, 3, 1, 4))?
            .contiguous()?
            .reshape((b, o, q_pos, self.d_model))?;
        Ok((self.dense.forward(&attn)?, weights))
    }
}
