//! Layer Normalization module.

use crate::error::{ConfigError, Result, ShapeError};
use crate::nn::{ForwardCtx, Module};
use crate::tensor::Tensor;

pub struct LayerNorm {
    dim: usize,
    gamma: Tensor, // Learnable gain
    beta: Tensor,  // Learnable bias
    epsilon: f32,
}

impl LayerNorm {
    /// Creates a new LayerNorm module.
    /// `dim` is the size of the last dimension (the feature dimension).
    pub fn new(dim: usize, epsilon: f32) -> std::result::Result<Self, ConfigError> {
        if dim == 0 {
            return Err(ConfigError::ZeroDimension { name: "layer norm dim" });
        }
        if !(epsilon.is_finite() && epsilon > 0.0) {
            return Err(ConfigError::InvalidEpsilon(epsilon));
        }
        log::debug!("Initializing LayerNorm with dim={}", dim);
        Ok(Self {
            dim,
            gamma: Tensor::full(vec![dim], 1.0),
            beta: Tensor::zeros(vec![dim]),
            epsilon,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }
}

impl Module for LayerNorm {
    fn forward(&self, input: &Tensor, _ctx: &mut ForwardCtx<'_>) -> Result<Tensor> {
        // Normalize over the last dimension (the feature dimension, e.g., embed_dim).
        let axis = match input.shape().last() {
            Some(&d) if d == self.dim() => input.ndim() - 1,
            _ => {
                return Err(ShapeError::Mismatch {
                    op: "layer_norm",
                    expected: vec![self.dim()],
                    actual: input.shape().to_vec(),
                }
                .into())
            }
        };

        self.gamma.check_shape("layer_norm gamma", &[self.dim])?;
        self.beta.check_shape("layer_norm beta", &[self.dim])?;

        let mean = input.mean_axis(axis, true)?;
        let variance = input.var_axis(axis, true)?;

        // (x - mean) / sqrt(variance + epsilon)
        let normalized = (input - &mean) / &(&variance + self.epsilon).mapv(f32::sqrt);

        Ok(&(&self.gamma * &normalized) + &self.beta)
    }

    /// `[gamma, beta]`
    fn parameters(&self) -> Vec<&Tensor> {
        vec![&self.gamma, &self.beta]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.gamma, &mut self.beta]
    }
}
