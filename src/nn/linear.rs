//! A basic linear layer.

use crate::error::{ConfigError, Result, ShapeError};
use crate::nn::{ForwardCtx, Module};
use crate::tensor::Tensor;
use rand::Rng;

/// `y = x W + b` over the last axis. `W` is `[in_features, out_features]`.
pub struct Linear {
    in_features: usize,
    out_features: usize,
    weights: Tensor,
    bias: Tensor,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize) -> std::result::Result<Self, ConfigError> {
        Self::new_with(in_features, out_features, &mut rand::thread_rng())
    }

    pub fn new_with<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        rng: &mut R,
    ) -> std::result::Result<Self, ConfigError> {
        if in_features == 0 {
            return Err(ConfigError::ZeroDimension { name: "in_features" });
        }
        if out_features == 0 {
            return Err(ConfigError::ZeroDimension { name: "out_features" });
        }
        log::debug!(
            "Initializing Linear layer with in_features={}, out_features={}",
            in_features,
            out_features
        );
        Ok(Self {
            in_features,
            out_features,
            weights: Tensor::rand_with(vec![in_features, out_features], rng),
            bias: Tensor::zeros(vec![out_features]),
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn weights(&self) -> &Tensor {
        &self.weights
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }
}

impl Module for Linear {
    fn forward(&self, input: &Tensor, _ctx: &mut ForwardCtx<'_>) -> Result<Tensor> {
        let last = input.shape().last().copied();
        if last != Some(self.in_features()) {
            let mut expected = input.shape().to_vec();
            match expected.last_mut() {
                Some(d) => *d = self.in_features(),
                None => expected.push(self.in_features()),
            }
            return Err(ShapeError::Mismatch {
                op: "linear",
                expected,
                actual: input.shape().to_vec(),
            }
            .into());
        }
        // Weights may have been replaced through `parameters_mut`.
        self.weights
            .check_shape("linear weights", &[self.in_features, self.out_features])?;
        self.bias.check_shape("linear bias", &[self.out_features])?;

        let x = input.matmul(&self.weights)?;
        Ok(&x + &self.bias)
    }

    /// `[weights, bias]`
    fn parameters(&self) -> Vec<&Tensor> {
        vec![&self.weights, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.weights, &mut self.bias]
    }
}
