//! Transformer encoder/decoder stacks.
//!
//! Layers follow the post-norm layout: attention → dropout → residual add →
//! layer norm, with an optional position-wise feed-forward block appended
//! under its own residual and norm. Inputs are rank 4,
//! `[batch, outer, positions, features]`, and attention runs across
//! `positions`. Stacks hold independent layers; the mask is shared.

use crate::attention::{combined_look_ahead_mask, padding_mask, AttentionInput, MultiHeadAttention};
use crate::error::{Result, StError};
use crate::positional::positional_encoding;
use candle_core::{Tensor, D};
use candle_nn::{linear, Dropout, Init, Linear, Module, VarBuilder};

/// Layer normalization epsilon
pub const LAYER_NORM_EPS: f64 = 1e-6;

/// Layer normalization over the trailing axis
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(dim, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(dim, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }

    // candle's fused layer_norm has no backward pass, so compose it from primitives
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        Ok(normed
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)?)
    }
}

/// Two dense maps with a ReLU in between
#[derive(Debug, Clone)]
pub struct FeedForward {
    hidden: Linear,
    out: Linear,
}

impl FeedForward {
    pub fn new(d_model: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            hidden: linear(d_model, hidden, vb.pp("hidden"))?,
            out: linear(hidden, d_model, vb.pp("out"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.out.forward(&self.hidden.forward(x)?.relu()?)?)
    }
}

/// Optional feed-forward block with its own dropout and norm
#[derive(Debug, Clone)]
struct FeedForwardBlock {
    ffn: FeedForward,
    dropout: Dropout,
    norm: LayerNorm,
}

impl FeedForwardBlock {
    fn new(d_model: usize, hidden: usize, drop_rate: f32, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            ffn: FeedForward::new(d_model, hidden, vb.pp("ffn"))?,
            dropout: Dropout::new(drop_rate),
            norm: LayerNorm::new(d_model, LAYER_NORM_EPS, vb.pp("norm_ffn"))?,
        })
    }

    fn forward(&self, z: &Tensor, train: bool) -> Result<Tensor> {
        let out = self.dropout.forward(&self.ffn.forward(z)?, train)?;
        self.norm.forward(&(z + out)?)
    }
}

/// Shape and width settings shared by an encoder or decoder stack
#[derive(Debug, Clone, PartialEq)]
pub struct StackConfig {
    /// Width of the raw inputs fed to the embedding
    pub input_dim: usize,
    pub d_model: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub max_positions: usize,
    /// Add the sinusoidal table along the positions axis
    pub use_positional: bool,
    pub dropout: f32,
    /// Hidden width of the feed-forward block; `None` disables it
    pub ff_hidden: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct EncoderLayer {
    mha: MultiHeadAttention,
    dropout: Dropout,
    norm: LayerNorm,
    ffn: Option<FeedForwardBlock>,
}

impl EncoderLayer {
    pub fn new(config: &StackConfig, vb: VarBuilder) -> Result<Self> {
        let d = config.d_model;
        let ffn = match config.ff_hidden {
            Some(hidden) => Some(FeedForwardBlock::new(d, hidden, config.dropout, vb.clone())?),
            None => None,
        };
        Ok(Self {
            mha: MultiHeadAttention::new(d, d, d, config.num_heads, vb.pp("mha"))?,
            dropout: Dropout::new(config.dropout),
            norm: LayerNorm::new(d, LAYER_NORM_EPS, vb.pp("norm"))?,
            ffn,
        })
    }

    /// Self-attention, or attention with keys taken from `input.secondary`
    pub fn forward(
        &self,
        input: AttentionInput<'_>,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let x = input.primary;
        let (attn, _) = self.mha.forward(x, input.keys(), x, mask)?;
        let attn = self.dropout.forward(&attn, train)?;
        let z = self.norm.forward(&(x + attn)?)?;
        match &self.ffn {
            Some(block) => block.forward(&z, train),
            None => Ok(z),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecoderLayer {
    self_attn: MultiHeadAttention,
    cross_attn: MultiHeadAttention,
    dropout1: Dropout,
    dropout2: Dropout,
    norm1: LayerNorm,
    norm2: LayerNorm,
    ffn: Option<FeedForwardBlock>,
}

/// Decoder layer output with both attention maps
#[derive(Debug, Clone)]
pub struct DecoderLayerOutput {
    pub hidden: Tensor,
    pub self_weights: Tensor,
    pub cross_weights: Tensor,
}

impl DecoderLayer {
    pub fn new(config: &StackConfig, vb: VarBuilder) -> Result<Self> {
        let d = config.d_model;
        let ffn = match config.ff_hidden {
            Some(hidden) => Some(FeedForwardBlock::new(d, hidden, config.dropout, vb.clone())?),
            None => None,
        };
        Ok(Self {
            self_attn: MultiHeadAttention::new(d, d, d, config.num_heads, vb.pp("self_attn"))?,
            cross_attn: MultiHeadAttention::new(d, d, d, config.num_heads, vb.pp("cross_attn"))?,
            dropout1: Dropout::new(config.dropout),
            dropout2: Dropout::new(config.dropout),
            norm1: LayerNorm::new(d, LAYER_NORM_EPS, vb.pp("norm1"))?,
            norm2: LayerNorm::new(d, LAYER_NORM_EPS, vb.pp("norm2"))?,
            ffn,
        })
    }

    pub fn forward(
        &self,
        x: &Tensor,
        enc_output: &Tensor,
        look_ahead_mask: Option<&Tensor>,
        padding_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<DecoderLayerOutput> {
        let (self_out, self_weights) = self.self_attn.forward(x, x, x, look_ahead_mask)?;
        let self_out = self.dropout1.forward(&self_out, train)?;
        let z = self.norm1.forward(&(x + self_out)?)?;

        let (cross_out, cross_weights) =
            self.cross_attn
                .forward(&z, enc_output, enc_output, padding_mask)?;
        let cross_out = self.dropout2.forward(&cross_out, train)?;
        let z = self.norm2.forward(&(z + cross_out)?)?;

        let hidden = match &self.ffn {
            Some(block) => block.forward(&z, train)?,
            None => z,
        };
        Ok(DecoderLayerOutput {
            hidden,
            self_weights,
            cross_weights,
        })
    }
}

/// Input embedding shared by both stacks: dense → ×sqrt(d_model) → +PE → dropout
#[derive(Debug, Clone)]
struct StackEmbedding {
    embedding: Linear,
    positional: Option<Tensor>,
    dropout: Dropout,
    d_model: usize,
    max_positions: usize,
}

impl StackEmbedding {
    fn new(config: &StackConfig, vb: VarBuilder) -> Result<Self> {
        let positional = if config.use_positional {
            Some(positional_encoding(
                config.max_positions,
                config.d_model,
                vb.device(),
            )?)
        } else {
            None
        };
        Ok(Self {
            embedding: linear(config.input_dim, config.d_model, vb.pp("embedding"))?,
            positional,
            dropout: Dropout::new(config.dropout),
            d_model: config.d_model,
            max_positions: config.max_positions,
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = (self.embedding.forward(x)? * (self.d_model as f64).sqrt())?;
        if let Some(table) = &self.positional {
            let positions = x.dim(D::Minus2)?;
            if positions > self.max_positions {
                return Err(StError::InvalidConfig(format!(
                    "sequence of {positions} positions exceeds max_positions {}",
                    self.max_positions
                )));
            }
            x = x.broadcast_add(&table.narrow(1, 0, positions)?)?;
        }
        Ok(self.dropout.forward(&x, train)?)
    }
}

fn check_rank4(x: &Tensor, width: usize, context: &'static str) -> Result<()> {
    match x.dims() {
        [_, _, _, w] if *w == width => Ok(()),
        dims => Err(StError::shape(context, format!("[b, o, p, {width}]"), dims)),
    }
}

/// Raw `[b, o, p]` mask → rank-5 key padding mask, checked against `x`
fn key_padding(mask: Option<&Tensor>, x: &Tensor, context: &'static str) -> Result<Option<Tensor>> {
    match mask {
        None => Ok(None),
        Some(mask) => {
            let dims = x.dims();
            if mask.dims() != &dims[..3] {
                return Err(StError::shape(context, &dims[..3], mask.dims()));
            }
            Ok(Some(padding_mask(mask)?))
        }
    }
}

#[derive(Debug, Clone)]
pub struct Encoder {
    embedding: StackEmbedding,
    layers: Vec<EncoderLayer>,
    config: StackConfig,
}

impl Encoder {
    pub fn new(config: &StackConfig, vb: VarBuilder) -> Result<Self> {
        let layers = (0..config.num_layers)
            .map(|i| EncoderLayer::new(config, vb.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            embedding: StackEmbedding::new(config, vb.clone())?,
            layers,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    /// Embedded and scaled input, before any attention layer
    pub fn embed(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        check_rank4(x, self.config.input_dim, "encoder input")?;
        self.embedding.forward(x, train)
    }

    /// `mask` is the raw `[b, o, p]` validity mask of the primary input
    pub fn forward(
        &self,
        input: AttentionInput<'_>,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let mut x = self.embed(input.primary, train)?;
        if let Some(keys) = input.secondary {
            let expected = [x.dims()[0], x.dims()[1], x.dims()[2], self.config.d_model];
            if keys.dims() != expected {
                return Err(StError::shape("encoder key source", expected, keys.dims()));
            }
        }
        let mask = key_padding(mask, input.primary, "encoder padding mask")?;
        for layer in &self.layers {
            let step_input = AttentionInput {
                primary: &x,
                secondary: input.secondary,
            };
            x = layer.forward(step_input, mask.as_ref(), train)?;
        }
        Ok(x)
    }
}

#[derive(Debug, Clone)]
pub struct Decoder {
    embedding: StackEmbedding,
    layers: Vec<DecoderLayer>,
    config: StackConfig,
}

impl Decoder {
    pub fn new(config: &StackConfig, vb: VarBuilder) -> Result<Self> {
        let layers = (0..config.num_layers)
            .map(|i| DecoderLayer::new(config, vb.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            embedding: StackEmbedding::new(config, vb.clone())?,
            layers,
            config: config.clone(),
        })
    }

    /// `look_ahead_mask` and `padding_mask` are already in rank-5 logits layout
    pub fn forward(
        &self,
        targets: &Tensor,
        enc_output: &Tensor,
        look_ahead_mask: Option<&Tensor>,
        padding_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        check_rank4(targets, self.config.input_dim, "decoder targets")?;
        let mut x = self.embedding.forward(targets, train)?;
        for layer in &self.layers {
            x = layer
                .forward(&x, enc_output, look_ahead_mask, padding_mask, train)?
                .hidden;
        }
        Ok(x)
    }
}

/// Encoder stack with an optional decoder stack and output head
#[derive(Debug, Clone)]
pub struct Transformer {
    encoder: Encoder,
    decoder: Option<(Decoder, Linear)>,
}

/// Inputs for one transformer pass. Masks are raw `[b, o, p]`, `1` = invalid.
#[derive(Debug, Clone, Copy)]
pub struct TransformerInput<'a> {
    pub input: AttentionInput<'a>,
    pub input_mask: Option<&'a Tensor>,
    pub targets: Option<&'a Tensor>,
    pub target_mask: Option<&'a Tensor>,
}

impl Transformer {
    /// `decoder` carries the decoder stack settings and head width when the
    /// transformer decodes; `None` builds an encoder-only transformer.
    pub fn new(
        encoder: &StackConfig,
        decoder: Option<(&StackConfig, usize)>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let decoder = match decoder {
            Some((config, out_dim)) => {
                if config.d_model != encoder.d_model {
                    return Err(StError::InvalidConfig(format!(
                        "decoder width {} must match encoder width {}",
                        config.d_model, encoder.d_model
                    )));
                }
                Some((
                    Decoder::new(config, vb.pp("decoder"))?,
                    linear(config.d_model, out_dim, vb.pp("linear"))?,
                ))
            }
            None => None,
        };
        Ok(Self {
            encoder: Encoder::new(encoder, vb.pp("encoder"))?,
            decoder,
        })
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub fn has_decoder(&self) -> bool {
        self.decoder.is_some()
    }

    pub fn forward(
        &self,
        inputs: TransformerInput<'_>,
        use_look_mask: bool,
        train: bool,
    ) -> Result<Tensor> {
        let enc_out = self.encoder.forward(inputs.input, inputs.input_mask, train)?;
        let Some((decoder, head)) = &self.decoder else {
            return Ok(enc_out);
        };

        let targets = inputs.targets.ok_or_else(|| {
            StError::InvalidConfig("decoding transformer needs target inputs".to_string())
        })?;
        let look_mask = match (use_look_mask, inputs.target_mask) {
            (true, Some(mask)) => {
                if mask.dims() != &targets.dims()[..3] {
                    return Err(StError::shape(
                        "decoder target mask",
                        &targets.dims()[..3],
                        mask.dims(),
                    ));
                }
                Some(combined_look_ahead_mask(mask)?)
            }
            (true, None) => Some(crate::attention::look_ahead_mask(
                targets.dim(2)?,
                targets.device(),
            )?),
            (false, Some(mask)) => key_padding(Some(mask), targets, "decoder target mask")?,
            (false, None) => None,
        };
        let enc_mask = key_padding(inputs.input_mask, inputs.input.primary, "encoder padding mask")?;

        let out = decoder.forward(targets, &enc_out, look_mask.as_ref(), enc_mask.as_ref(), train)?;
        Ok(head.forward(&out)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn stack(input_dim: usize, use_positional: bool) -> StackConfig {
        StackConfig {
            input_dim,
            d_model: 8,
            num_heads: 2,
            num_layers: 2,
            max_positions: 16,
            use_positional,
            dropout: 0.0,
            ff_hidden: None,
        }
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_layer_norm_normalizes_last_axis() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = LayerNorm::new(4, LAYER_NORM_EPS, vb).unwrap();
        let x = Tensor::new(&[[1.0f32, 2.0, 3.0, 4.0], [10.0, 10.0, 10.0, 14.0]], &device).unwrap();
        let y = norm.forward(&x).unwrap();
        let means: Vec<f32> = y.mean(D::Minus1).unwrap().to_vec1().unwrap();
        let vars: Vec<f32> = y.sqr().unwrap().mean(D::Minus1).unwrap().to_vec1().unwrap();
        for (m, v) in means.iter().zip(vars.iter()) {
            assert!(m.abs() < 1e-5);
            assert!((v - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_layer_norm_backpropagates() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = LayerNorm::new(3, LAYER_NORM_EPS, vb).unwrap();
        let x = candle_core::Var::new(&[[1.0f32, -2.0, 4.0]], &device).unwrap();
        let y = norm.forward(x.as_tensor()).unwrap();
        let loss = (y * Tensor::new(&[[1.0f32, 2.0, 3.0]], &device).unwrap())
            .unwrap()
            .sum_all()
            .unwrap();
        let grads = loss.backward().unwrap();

        let input_grad = grads.get(x.as_tensor()).unwrap();
        let total: f32 = input_grad.abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!(total > 0.0);
        for var in varmap.all_vars() {
            assert!(grads.get(var.as_tensor()).is_some());
        }
    }

    #[test]
    fn test_embedding_scaled_by_sqrt_d_model_once() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = Encoder::new(&stack(3, false), vb.clone()).unwrap();
        let dense = linear(3, 8, vb.pp("embedding")).unwrap();

        let x = Tensor::randn(0f32, 1.0, (1, 2, 5, 3), &device).unwrap();
        let embedded = encoder.embed(&x, false).unwrap();
        let expected = (dense.forward(&x).unwrap() * 8f64.sqrt()).unwrap();
        assert!(max_abs_diff(&embedded, &expected) < 1e-5);
    }

    #[test]
    fn test_positional_table_added_along_positions() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let with_pe = Encoder::new(&stack(3, true), vb.clone()).unwrap();
        let without = Encoder::new(&stack(3, false), vb).unwrap();

        let x = Tensor::zeros((1, 1, 4, 3), DType::F32, &device).unwrap();
        let diff = (with_pe.embed(&x, false).unwrap() - without.embed(&x, false).unwrap()).unwrap();
        let table = positional_encoding(4, 8, &device).unwrap().unsqueeze(0).unwrap();
        assert!(max_abs_diff(&diff, &table) < 1e-5);
    }

    #[test]
    fn test_encoder_output_shape_and_mask() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut config = stack(3, false);
        config.ff_hidden = Some(16);
        let encoder = Encoder::new(&config, vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (2, 3, 4, 3), &device).unwrap();
        let mask = Tensor::zeros((2, 3, 4), DType::F32, &device).unwrap();
        let out = encoder
            .forward(AttentionInput::new(&x), Some(&mask), false)
            .unwrap();
        assert_eq!(out.dims(), &[2, 3, 4, 8]);

        let bad_mask = Tensor::zeros((2, 4, 3), DType::F32, &device).unwrap();
        let err = encoder
            .forward(AttentionInput::new(&x), Some(&bad_mask), false)
            .unwrap_err();
        assert!(matches!(err, StError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_masked_neighbor_does_not_affect_valid_ones() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = Encoder::new(&stack(3, false), vb).unwrap();

        let a = Tensor::randn(0f32, 1.0, (1, 1, 3, 3), &device).unwrap();
        // Replace only the masked (last) position with very different data
        let valid = a.narrow(2, 0, 2).unwrap();
        let noise = (Tensor::randn(0f32, 1.0, (1, 1, 1, 3), &device).unwrap() * 100.0).unwrap();
        let b = Tensor::cat(&[&valid, &noise], 2).unwrap();
        let mask = Tensor::new(&[[[0.0f32, 0.0, 1.0]]], &device).unwrap();

        let out_a = encoder.forward(AttentionInput::new(&a), Some(&mask), false).unwrap();
        let out_b = encoder.forward(AttentionInput::new(&b), Some(&mask), false).unwrap();
        let diff = max_abs_diff(
            &out_a.narrow(2, 0, 2).unwrap(),
            &out_b.narrow(2, 0, 2).unwrap(),
        );
        assert!(diff < 1e-4, "valid positions changed by {diff}");
    }

    #[test]
    fn test_key_source_override_shape_checked() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = Encoder::new(&stack(3, false), vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (1, 2, 4, 3), &device).unwrap();
        let keys = Tensor::randn(0f32, 1.0, (1, 2, 4, 8), &device).unwrap();
        let out = encoder
            .forward(AttentionInput::with_keys(&x, &keys), None, false)
            .unwrap();
        assert_eq!(out.dims(), &[1, 2, 4, 8]);

        let narrow_keys = Tensor::randn(0f32, 1.0, (1, 2, 4, 3), &device).unwrap();
        assert!(encoder
            .forward(AttentionInput::with_keys(&x, &narrow_keys), None, false)
            .is_err());
    }

    #[test]
    fn test_decoder_is_causal() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let transformer =
            Transformer::new(&stack(3, true), Some((&stack(2, true), 2)), vb).unwrap();
        assert!(transformer.has_decoder());

        let inp = Tensor::randn(0f32, 1.0, (1, 1, 4, 3), &device).unwrap();
        let t1 = Tensor::randn(0f32, 1.0, (1, 1, 5, 2), &device).unwrap();
        // Same prefix, different last target
        let prefix = t1.narrow(2, 0, 4).unwrap();
        let tail = Tensor::randn(0f32, 5.0, (1, 1, 1, 2), &device).unwrap();
        let t2 = Tensor::cat(&[&prefix, &tail], 2).unwrap();
        let tar_mask = Tensor::zeros((1, 1, 5), DType::F32, &device).unwrap();

        let run = |targets: &Tensor| {
            transformer
                .forward(
                    TransformerInput {
                        input: AttentionInput::new(&inp),
                        input_mask: None,
                        targets: Some(targets),
                        target_mask: Some(&tar_mask),
                    },
                    true,
                    false,
                )
                .unwrap()
        };
        let out1 = run(&t1);
        let out2 = run(&t2);
        assert_eq!(out1.dims(), &[1, 1, 5, 2]);
        let diff = max_abs_diff(
            &out1.narrow(2, 0, 4).unwrap(),
            &out2.narrow(2, 0, 4).unwrap(),
        );
        assert!(diff < 1e-4, "earlier positions saw a later target: {diff}");
    }

    #[test]
    fn test_encoder_only_transformer_returns_encodings() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let transformer = Transformer::new(&stack(3, false), None, vb).unwrap();
        let inp = Tensor::randn(0f32, 1.0, (2, 3, 4, 3), &device).unwrap();
        let out = transformer
            .forward(
                TransformerInput {
                    input: AttentionInput::new(&inp),
                    input_mask: None,
                    targets: None,
                    target_mask: None,
                },
                false,
                false,
            )
            .unwrap();
        assert_eq!(out.dims(), &[2, 3, 4, 8]);
    }

    #[test]
    fn test_positions_beyond_table_rejected() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = Encoder::new(&stack(3, true), vb).unwrap();
        let x = Tensor::zeros((1, 1, 17, 3), DType::F32, &device).unwrap();
        assert!(matches!(
            encoder.embed(&x, false),
            Err(StError::InvalidConfig(_))
        ));
    }
}
