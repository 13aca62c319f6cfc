//! The Vision Transformer classifier.

use crate::config::ViTConfig;
use crate::error::{ConfigError, Result};
use crate::nn::encoder::TransformerEncoder;
use crate::nn::head::ClassificationHead;
use crate::nn::mask::AttentionMask;
use crate::nn::patch_embedding::PatchEmbedding;
use crate::nn::{ForwardCtx, Module};
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// `PatchEmbedding -> TransformerEncoder -> ClassificationHead`.
///
/// All hyperparameters are fixed at construction. `forward` is pure apart from
/// dropout, which only runs when the caller passes a training context.
pub struct ViT {
    config: ViTConfig,
    patch_embedding: PatchEmbedding,
    encoder: TransformerEncoder,
    head: ClassificationHead,
}

impl ViT {
    /// Builds a randomly initialized model. Fails if the config is inconsistent.
    pub fn new(config: ViTConfig) -> std::result::Result<Self, ConfigError> {
        Self::with_rng(config, &mut rand::thread_rng())
    }

    /// Same weights for the same seed and config.
    pub fn from_seed(config: ViTConfig, seed: u64) -> std::result::Result<Self, ConfigError> {
        Self::with_rng(config, &mut StdRng::seed_from_u64(seed))
    }

    pub fn with_rng<R: Rng + ?Sized>(config: ViTConfig, rng: &mut R) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        log::info!(
            "Initializing ViT: {}x{} image, {} patches of {}px, width {}, depth {}, {} heads, {} classes",
            config.image_size,
            config.image_size,
            config.num_patches(),
            config.patch_size,
            config.embedding_width,
            config.depth,
            config.num_heads,
            config.num_classes
        );

        let patch_embedding = PatchEmbedding::new(&config, rng)?;
        let encoder = TransformerEncoder::new(&config, rng)?;
        let head = ClassificationHead::new(&config, rng)?;
        Ok(Self {
            config,
            patch_embedding,
            encoder,
            head,
        })
    }

    pub fn config(&self) -> &ViTConfig {
        &self.config
    }

    pub fn patch_embedding(&self) -> &PatchEmbedding {
        &self.patch_embedding
    }

    pub fn encoder(&self) -> &TransformerEncoder {
        &self.encoder
    }

    pub fn head(&self) -> &ClassificationHead {
        &self.head
    }

    /// Inference forward pass: `[B, C, H, W]` images to `[B, num_classes]` logits.
    pub fn forward(&self, images: &Tensor, mask: Option<&AttentionMask>) -> Result<Tensor> {
        let mut ctx = ForwardCtx::eval();
        if let Some(mask) = mask {
            ctx = ctx.with_mask(mask);
        }
        self.forward_with(images, &mut ctx)
    }

    /// Forward pass under an explicit context, e.g. training mode with seeded dropout.
    pub fn forward_with(&self, images: &Tensor, ctx: &mut ForwardCtx<'_>) -> Result<Tensor> {
        Module::forward(self, images, ctx)
    }

    /// Index of the highest logit for each image.
    pub fn predict(&self, images: &Tensor) -> Result<Vec<usize>> {
        let logits = self.forward(images, None)?;
        Ok(logits
            .data()
            .outer_iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
                    .0
            })
            .collect())
    }
}

impl Module for ViT {
    fn forward(&self, images: &Tensor, ctx: &mut ForwardCtx<'_>) -> Result<Tensor> {
        let tokens = self.patch_embedding.forward(images, ctx)?;

        // Reject a bad mask before running any block.
        if let Some(mask) = ctx.mask() {
            let seq = self.config.seq_len();
            mask.check(&[tokens.shape()[0], self.config.num_heads, seq, seq])?;
        }

        let encoded = self.encoder.forward(&tokens, ctx)?;
        let logits = self.head.forward(&encoded, ctx)?;
        log::debug!("ViT forward {:?} -> {:?}", images.shape(), logits.shape());
        Ok(logits)
    }

    /// Patch embedding, then every encoder block in order, then the head.
    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = self.patch_embedding.parameters();
        params.extend(self.encoder.parameters());
        params.extend(self.head.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.patch_embedding.parameters_mut();
        params.extend(self.encoder.parameters_mut());
        params.extend(self.head.parameters_mut());
        params
    }
}
