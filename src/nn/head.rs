//! Classification head.

use crate::config::ViTConfig;
use crate::error::{ConfigError, Result, ShapeError};
use crate::nn::layer_norm::LayerNorm;
use crate::nn::linear::Linear;
use crate::nn::{ForwardCtx, Module};
use crate::tensor::Tensor;
use rand::Rng;

/// Mean over every token (class token included), LayerNorm, then a linear map to raw logits.
pub struct ClassificationHead {
    norm: LayerNorm,
    classifier: Linear,
}

impl ClassificationHead {
    pub fn new<R: Rng + ?Sized>(config: &ViTConfig, rng: &mut R) -> std::result::Result<Self, ConfigError> {
        log::debug!("Initializing ClassificationHead with {} classes", config.num_classes);
        Ok(Self {
            norm: LayerNorm::new(config.embedding_width, config.layer_norm_eps)?,
            classifier: Linear::new_with(config.embedding_width, config.num_classes, rng)?,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.classifier.out_features()
    }
}

impl Module for ClassificationHead {
    fn forward(&self, input: &Tensor, ctx: &mut ForwardCtx<'_>) -> Result<Tensor> {
        if input.ndim() != 3 {
            return Err(ShapeError::RankMismatch {
                op: "classification_head",
                expected: 3,
                actual: input.shape().to_vec(),
            }
            .into());
        }
        // [B, N, D] -> [B, D]
        let pooled = input.mean_axis(1, false)?;
        let pooled = self.norm.forward(&pooled, ctx)?;
        self.classifier.forward(&pooled, ctx)
    }

    /// `[norm gamma, norm beta, classifier weights, classifier bias]`
    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = self.norm.parameters();
        params.extend(self.classifier.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.norm.parameters_mut();
        params.extend(self.classifier.parameters_mut());
        params
    }
}
