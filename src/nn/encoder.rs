//! Transformer encoder blocks and the stack that chains them.

use crate::config::ViTConfig;
use crate::error::{ConfigError, Result};
use crate::nn::attention::MultiHeadAttention;
use crate::nn::dropout::Dropout;
use crate::nn::feed_forward::FeedForward;
use crate::nn::layer_norm::LayerNorm;
use crate::nn::residual::Residual;
use crate::nn::{ForwardCtx, Module};
use crate::tensor::Tensor;
use rand::Rng;

/// `LayerNorm -> MultiHeadAttention -> Dropout`
pub struct AttentionSublayer {
    norm: LayerNorm,
    attention: MultiHeadAttention,
    dropout: Dropout,
}

impl AttentionSublayer {
    pub fn attention(&self) -> &MultiHeadAttention {
        &self.attention
    }
}

impl Module for AttentionSublayer {
    fn forward(&self, input: &Tensor, ctx: &mut ForwardCtx<'_>) -> Result<Tensor> {
        let x = self.norm.forward(input, ctx)?;
        let x = self.attention.forward(&x, ctx)?;
        self.dropout.forward(&x, ctx)
    }

    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = self.norm.parameters();
        params.extend(self.attention.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.norm.parameters_mut();
        params.extend(self.attention.parameters_mut());
        params
    }
}

/// `LayerNorm -> FeedForward -> Dropout`
pub struct FeedForwardSublayer {
    norm: LayerNorm,
    feed_forward: FeedForward,
    dropout: Dropout,
}

impl Module for FeedForwardSublayer {
    fn forward(&self, input: &Tensor, ctx: &mut ForwardCtx<'_>) -> Result<Tensor> {
        let x = self.norm.forward(input, ctx)?;
        let x = self.feed_forward.forward(&x, ctx)?;
        self.dropout.forward(&x, ctx)
    }

    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = self.norm.parameters();
        params.extend(self.feed_forward.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.norm.parameters_mut();
        params.extend(self.feed_forward.parameters_mut());
        params
    }
}

/// Pre-norm encoder block: `x + attn(norm(x))`, then `x + ff(norm(x))`.
pub struct TransformerEncoderBlock {
    attention: Residual<AttentionSublayer>,
    feed_forward: Residual<FeedForwardSublayer>,
}

impl TransformerEncoderBlock {
    pub fn new<R: Rng + ?Sized>(config: &ViTConfig, rng: &mut R) -> std::result::Result<Self, ConfigError> {
        let width = config.embedding_width;
        let attention = AttentionSublayer {
            norm: LayerNorm::new(width, config.layer_norm_eps)?,
            attention: MultiHeadAttention::new(config, rng)?,
            dropout: Dropout::new(config.block_dropout_rate)?,
        };
        let feed_forward = FeedForwardSublayer {
            norm: LayerNorm::new(width, config.layer_norm_eps)?,
            feed_forward: FeedForward::new(config, rng)?,
            dropout: Dropout::new(config.block_dropout_rate)?,
        };
        Ok(Self {
            attention: Residual::new(attention),
            feed_forward: Residual::new(feed_forward),
        })
    }

    pub fn attention(&self) -> &MultiHeadAttention {
        self.attention.inner().attention()
    }
}

impl Module for TransformerEncoderBlock {
    fn forward(&self, input: &Tensor, ctx: &mut ForwardCtx<'_>) -> Result<Tensor> {
        let x = self.attention.forward(input, ctx)?;
        self.feed_forward.forward(&x, ctx)
    }

    /// Attention sublayer (norm, q, k, v, out) then feed-forward sublayer (norm, expand, project).
    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = self.attention.parameters();
        params.extend(self.feed_forward.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.attention.parameters_mut();
        params.extend(self.feed_forward.parameters_mut());
        params
    }
}

/// `depth` independently initialized encoder blocks applied in order.
pub struct TransformerEncoder {
    blocks: Vec<TransformerEncoderBlock>,
}

impl TransformerEncoder {
    pub fn new<R: Rng + ?Sized>(config: &ViTConfig, rng: &mut R) -> std::result::Result<Self, ConfigError> {
        if config.depth == 0 {
            return Err(ConfigError::ZeroDimension { name: "depth" });
        }
        log::debug!("Initializing TransformerEncoder with {} blocks", config.depth);
        let blocks = (0..config.depth)
            .map(|_| TransformerEncoderBlock::new(config, &mut *rng))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { blocks })
    }

    pub fn depth(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks(&self) -> &[TransformerEncoderBlock] {
        &self.blocks
    }
}

impl Module for TransformerEncoder {
    fn forward(&self, input: &Tensor, ctx: &mut ForwardCtx<'_>) -> Result<Tensor> {
        let mut x = input.clone();
        for (i, block) in self.blocks.iter().enumerate() {
            x = block.forward(&x, ctx)?;
            log::trace!("encoder block {} done", i);
        }
        Ok(x)
    }

    fn parameters(&self) -> Vec<&Tensor> {
        self.blocks.iter().flat_map(|b| b.parameters()).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        self.blocks.iter_mut().flat_map(|b| b.parameters_mut()).collect()
    }
}
