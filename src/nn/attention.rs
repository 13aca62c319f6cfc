//! Multi-Head Attention module.

use crate::config::ViTConfig;
use crate::error::{ConfigError, Result, ShapeError};
use crate::nn::dropout::Dropout;
use crate::nn::linear::Linear;
use crate::nn::{ForwardCtx, Module};
use crate::tensor::Tensor;
use rand::Rng;

/// Value written into masked-out scores before softmax.
const MASK_FILL: f32 = f32::MIN;

/// Multi-head self-attention over a `[batch, seq, embed]` token sequence.
///
/// Scores are softmax-normalized first and then divided by `sqrt(embed_dim)`,
/// the full embedding width. This differs from the usual
/// `softmax(QK^T / sqrt(d_k))`: the softmax sees unscaled scores and each row of
/// weights sums to `1 / sqrt(embed_dim)` instead of 1.
pub struct MultiHeadAttention {
    num_heads: usize,
    head_dim: usize,
    embed_dim: usize,
    scaling: f32,
    query: Linear,
    key: Linear,
    value: Linear,
    attention_dropout: Dropout,
    projection: Linear,
}

impl MultiHeadAttention {
    pub fn new<R: Rng + ?Sized>(config: &ViTConfig, rng: &mut R) -> std::result::Result<Self, ConfigError> {
        let embed_dim = config.embedding_width;
        let num_heads = config.num_heads;
        if num_heads == 0 {
            return Err(ConfigError::ZeroDimension { name: "num_heads" });
        }
        if embed_dim % num_heads != 0 {
            return Err(ConfigError::HeadCountMismatch {
                embedding_width: embed_dim,
                num_heads,
            });
        }
        log::debug!(
            "Initializing MultiHeadAttention with {} heads of width {}",
            num_heads,
            embed_dim / num_heads
        );

        Ok(Self {
            num_heads,
            head_dim: embed_dim / num_heads,
            embed_dim,
            scaling: (embed_dim as f32).sqrt(),
            query: Linear::new_with(embed_dim, embed_dim, rng)?,
            key: Linear::new_with(embed_dim, embed_dim, rng)?,
            value: Linear::new_with(embed_dim, embed_dim, rng)?,
            attention_dropout: Dropout::new(config.attention_dropout_rate)?,
            projection: Linear::new_with(embed_dim, embed_dim, rng)?,
        })
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Post-softmax attention weights `[batch, heads, seq, seq]`, before scaling and dropout.
    /// Each row sums to 1 over the key axis.
    pub fn attention_weights(&self, input: &Tensor, ctx: &mut ForwardCtx<'_>) -> Result<Tensor> {
        let (_, _, weights) = self.weights_and_values(input, ctx)?;
        Ok(weights)
    }

    fn check_input(&self, input: &Tensor) -> Result<(usize, usize)> {
        match *input.shape() {
            [batch, seq, width] if width == self.embed_dim => Ok((batch, seq)),
            [batch, seq, _] => Err(ShapeError::Mismatch {
                op: "attention",
                expected: vec![batch, seq, self.embed_dim],
                actual: input.shape().to_vec(),
            }
            .into()),
            _ => Err(ShapeError::RankMismatch {
                op: "attention",
                expected: 3,
                actual: input.shape().to_vec(),
            }
            .into()),
        }
    }

    /// `[batch, seq, embed] -> [batch, heads, seq, head_dim]`
    fn split_heads(&self, x: &Tensor, batch: usize, seq: usize) -> Result<Tensor> {
        x.reshape(vec![batch, seq, self.num_heads, self.head_dim])?
            .transpose(1, 2)
    }

    /// Projects the input and normalizes the scores. Returns the value heads and the
    /// softmax weights alongside the batch and sequence sizes.
    fn weights_and_values(
        &self,
        input: &Tensor,
        ctx: &mut ForwardCtx<'_>,
    ) -> Result<(Tensor, (usize, usize), Tensor)> {
        let (batch, seq) = self.check_input(input)?;

        let q = self.split_heads(&self.query.forward(input, ctx)?, batch, seq)?;
        let k = self.split_heads(&self.key.forward(input, ctx)?, batch, seq)?;
        let v = self.split_heads(&self.value.forward(input, ctx)?, batch, seq)?;

        // [b, h, q, d] @ [b, h, d, k] -> [b, h, q, k]
        let energy = q.matmul(&k.transpose(2, 3)?)?;

        let energy = match ctx.mask() {
            Some(mask) => {
                let scores_shape = [batch, self.num_heads, seq, seq];
                mask.check(&scores_shape)?;
                if mask.has_empty_rows(&scores_shape) {
                    log::warn!("attention mask hides every key for some query; its weights fall back to uniform");
                }
                energy.masked_fill(mask.masked(), MASK_FILL)?
            }
            None => energy,
        };

        let weights = energy.softmax(3)?;
        Ok((v, (batch, seq), weights))
    }
}

impl Module for MultiHeadAttention {
    fn forward(&self, input: &Tensor, ctx: &mut ForwardCtx<'_>) -> Result<Tensor> {
        let (v, (batch, seq), weights) = self.weights_and_values(input, ctx)?;
        log::trace!("attention scores {:?}", weights.shape());

        let weights = &weights / self.scaling;
        let weights = self.attention_dropout.forward(&weights, ctx)?;

        // [b, h, q, k] @ [b, h, k, d] -> [b, h, q, d]
        let context = weights.matmul(&v)?;

        // Concatenate heads in order: [b, h, seq, d] -> [b, seq, h, d] -> [b, seq, embed]
        let context = context
            .transpose(1, 2)?
            .reshape(vec![batch, seq, self.embed_dim])?;

        self.projection.forward(&context, ctx)
    }

    /// Query, key, value and output projections, each `[weights, bias]`.
    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = self.query.parameters();
        params.extend(self.key.parameters());
        params.extend(self.value.parameters());
        params.extend(self.projection.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.query.parameters_mut();
        params.extend(self.key.parameters_mut());
        params.extend(self.value.parameters_mut());
        params.extend(self.projection.parameters_mut());
        params
    }
}
