//! GRU-based temporal encoder and the attention-coupled recurrent decoder.

use crate::attention::MASK_PENALTY;
use crate::error::{Result, StError};
use candle_core::{Tensor, D};
use candle_nn::{linear, Linear, Module, VarBuilder};

/// Logistic function built from `tanh`
fn sigmoid(x: &Tensor) -> Result<Tensor> {
    Ok((((x * 0.5)?.tanh()? + 1.0)? * 0.5)?)
}

/// Gated recurrent unit with the reset gate applied after the recurrent
/// projection.
///
/// ```text
/// z  = σ(x·Wz + h·Uz)     r = σ(x·Wr + h·Ur)
/// h~ = tanh(x·Wh + r ⊙ (h·Uh))
/// h' = z ⊙ h + (1 - z) ⊙ h~
/// ```
#[derive(Debug, Clone)]
pub struct GruCell {
    input: Linear,
    recurrent: Linear,
    hidden: usize,
}

impl GruCell {
    pub fn new(input_dim: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            input: linear(input_dim, 3 * hidden, vb.pp("input"))?,
            recurrent: linear(hidden, 3 * hidden, vb.pp("recurrent"))?,
            hidden,
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden
    }

    /// One step: `x [b, in]`, `h [b, hidden]` → new `h [b, hidden]`
    pub fn step(&self, x: &Tensor, h: &Tensor) -> Result<Tensor> {
        let n = self.hidden;
        let xs = self.input.forward(x)?;
        let hs = self.recurrent.forward(h)?;
        let z = sigmoid(&(xs.narrow(D::Minus1, 0, n)? + hs.narrow(D::Minus1, 0, n)?)?)?;
        let r = sigmoid(&(xs.narrow(D::Minus1, n, n)? + hs.narrow(D::Minus1, n, n)?)?)?;
        let candidate =
            (xs.narrow(D::Minus1, 2 * n, n)? + (r * hs.narrow(D::Minus1, 2 * n, n)?)?)?.tanh()?;
        let keep = (&z * h)?;
        let update = (z.affine(-1.0, 1.0)? * candidate)?;
        Ok((keep + update)?)
    }
}

/// Dense embedding followed by a GRU run over the time axis from a zero state
#[derive(Debug, Clone)]
pub struct RnnEncoder {
    embedding: Linear,
    cell: GruCell,
}

impl RnnEncoder {
    pub fn new(input_dim: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            embedding: linear(input_dim, hidden, vb.pp("embedding"))?,
            cell: GruCell::new(hidden, hidden, vb.pp("cell"))?,
        })
    }

    /// `[b, t, in]` → `[b, t, hidden]`, one state per input step
    pub fn forward(&self, inputs: &Tensor) -> Result<Tensor> {
        let (b, t, _) = inputs.dims3()?;
        if t == 0 {
            return Err(StError::shape("recurrent encoder input", "at least one step", inputs.dims()));
        }
        let c = self.embedding.forward(inputs)?;
        let mut state = Tensor::zeros((b, self.cell.hidden_size()), c.dtype(), c.device())?;
        let mut states = Vec::with_capacity(t);
        for i in 0..t {
            state = self.cell.step(&c.narrow(1, i, 1)?.squeeze(1)?, &state)?;
            states.push(state.clone());
        }
        Ok(Tensor::stack(&states, 1)?)
    }
}

/// Scalar-score attention over a history of hidden vectors
#[derive(Debug, Clone)]
pub struct AttentionModule {
    query: Linear,
}

impl AttentionModule {
    pub fn new(hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            query: linear(hidden, 1, vb.pp("query"))?,
        })
    }

    /// `history [b, l, h]`, `mask [b, l]` (1 = invalid) → `(summary [b, h], weights [b, l])`
    pub fn forward(&self, history: &Tensor, mask: &Tensor) -> Result<(Tensor, Tensor)> {
        let (b, l, _) = history.dims3()?;
        if mask.dims() != [b, l] {
            return Err(StError::shape("history mask", [b, l], mask.dims()));
        }
        let scores = self.query.forward(history)?.squeeze(D::Minus1)?;
        let scores = (scores + (mask * MASK_PENALTY)?)?;
        let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let summary = weights.unsqueeze(1)?.matmul(&history.contiguous()?)?.squeeze(1)?;
        Ok((summary, weights))
    }
}

/// Growing record of decoder-visible hidden states and their masks
#[derive(Debug, Clone)]
struct History {
    states: Vec<Tensor>,
    masks: Vec<Tensor>,
}

impl History {
    /// Seed from encoder states `[b, t, h]` and their mask `[b, t]`
    fn seeded(states: &Tensor, mask: &Tensor) -> Result<Self> {
        let t = states.dim(1)?;
        let mask = mask.to_dtype(states.dtype())?;
        let mut history = Self {
            states: Vec::with_capacity(t),
            masks: Vec::with_capacity(t),
        };
        for i in 0..t {
            history.states.push(states.narrow(1, i, 1)?);
            history.masks.push(mask.narrow(1, i, 1)?);
        }
        Ok(history)
    }

    fn push(&mut self, state: &Tensor) -> Result<()> {
        let valid = Tensor::zeros((state.dim(0)?, 1), state.dtype(), state.device())?;
        self.states.push(state.unsqueeze(1)?);
        self.masks.push(valid);
        Ok(())
    }

    fn len(&self) -> usize {
        self.states.len()
    }

    fn tensors(&self) -> Result<(Tensor, Tensor)> {
        Ok((Tensor::cat(&self.states, 1)?, Tensor::cat(&self.masks, 1)?))
    }
}

/// Autoregressive decoder emitting the joint state of all neighbors per step
#[derive(Debug, Clone)]
pub struct RnnDecoder {
    embedding: Linear,
    cell: GruCell,
    attention: AttentionModule,
    linear: Linear,
    out_width: usize,
}

/// Decoder output plus the full hidden-state history it attended over
#[derive(Debug, Clone)]
pub struct DecoderOutput {
    /// `[b, horizon, out_width]`
    pub sequence: Tensor,
    /// `[b, t + horizon - 1, hidden]`
    pub history: Tensor,
}

impl RnnDecoder {
    pub fn new(out_width: usize, embedding: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            embedding: linear(out_width, embedding, vb.pp("embedding"))?,
            cell: GruCell::new(embedding, hidden, vb.pp("cell"))?,
            attention: AttentionModule::new(hidden, vb.pp("attention"))?,
            linear: linear(2 * hidden, out_width, vb.pp("linear"))?,
            out_width,
        })
    }

    /// `hidden_states [b, t, h]`, `mask [b, t]`, `init_point [b, out_width]`.
    ///
    /// Step 0 of the sequence is `init_point` itself; the remaining
    /// `horizon - 1` steps are predicted.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        mask: &Tensor,
        init_point: &Tensor,
        horizon: usize,
    ) -> Result<DecoderOutput> {
        let (b, t, h) = hidden_states.dims3()?;
        if horizon == 0 {
            return Err(StError::InvalidConfig("forecast horizon must be at least 1".to_string()));
        }
        if h != self.cell.hidden_size() || t == 0 {
            return Err(StError::shape(
                "decoder hidden states",
                format!("[{b}, >0, {}]", self.cell.hidden_size()),
                hidden_states.dims(),
            ));
        }
        if init_point.dims() != [b, self.out_width] {
            return Err(StError::shape("decoder initial point", [b, self.out_width], init_point.dims()));
        }

        let mut history = History::seeded(hidden_states, mask)?;
        let mut state = hidden_states.narrow(1, t - 1, 1)?.squeeze(1)?;
        let mut out = init_point.clone();
        let mut sequence = Vec::with_capacity(horizon);
        sequence.push(out.clone());

        for _ in 1..horizon {
            let inp = self.embedding.forward(&out)?;
            state = self.cell.step(&inp, &state)?;
            let (states, masks) = history.tensors()?;
            let (summary, _) = self.attention.forward(&states, &masks)?;
            out = self.linear.forward(&Tensor::cat(&[&state, &summary], D::Minus1)?)?;
            history.push(&state)?;
            sequence.push(out.clone());
        }
        debug_assert_eq!(history.len(), t + horizon - 1);

        let (history, _) = history.tensors()?;
        Ok(DecoderOutput {
            sequence: Tensor::stack(&sequence, 1)?,
            history,
        })
    }
}
