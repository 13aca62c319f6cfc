//! A position-wise feed-forward network.

use crate::config::ViTConfig;
use crate::error::{ConfigError, Result};
use crate::nn::dropout::Dropout;
use crate::nn::linear::Linear;
use crate::nn::{ForwardCtx, Module};
use crate::tensor::Tensor;
use rand::Rng;

/// `Linear(D, expansion * D) -> GELU -> Dropout -> Linear(expansion * D, D)`,
/// applied to every token independently.
pub struct FeedForward {
    expand: Linear,
    dropout: Dropout,
    project: Linear,
}

impl FeedForward {
    pub fn new<R: Rng + ?Sized>(config: &ViTConfig, rng: &mut R) -> std::result::Result<Self, ConfigError> {
        log::debug!(
            "Initializing FeedForward network {} -> {} -> {}",
            config.embedding_width,
            config.hidden_width(),
            config.embedding_width
        );
        Ok(Self {
            expand: Linear::new_with(config.embedding_width, config.hidden_width(), rng)?,
            dropout: Dropout::new(config.feed_forward_dropout_rate)?,
            project: Linear::new_with(config.hidden_width(), config.embedding_width, rng)?,
        })
    }
}

impl Module for FeedForward {
    fn forward(&self, input: &Tensor, ctx: &mut ForwardCtx<'_>) -> Result<Tensor> {
        let x = self.expand.forward(input, ctx)?;
        let x = x.gelu();
        let x = self.dropout.forward(&x, ctx)?;
        self.project.forward(&x, ctx)
    }

    /// Expansion layer then projection layer, each `[weights, bias]`.
    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = self.expand.parameters();
        params.extend(self.project.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.expand.parameters_mut();
        params.extend(self.project.parameters_mut());
        params
    }
}
