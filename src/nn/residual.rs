//! Residual (identity shortcut) connection.

use crate::error::{Result, ShapeError};
use crate::nn::{ForwardCtx, Module};
use crate::tensor::Tensor;

/// Returns `inner(x) + x`. The inner module must preserve shape.
pub struct Residual<M: Module> {
    inner: M,
}

impl<M: Module> Residual<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }
}

impl<M: Module> Module for Residual<M> {
    fn forward(&self, input: &Tensor, ctx: &mut ForwardCtx<'_>) -> Result<Tensor> {
        let out = self.inner.forward(input, ctx)?;
        if out.shape() != input.shape() {
            return Err(ShapeError::Mismatch {
                op: "residual",
                expected: input.shape().to_vec(),
                actual: out.shape().to_vec(),
            }
            .into());
        }
        Ok(&out + input)
    }

    fn parameters(&self) -> Vec<&Tensor> {
        self.inner.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        self.inner.parameters_mut()
    }
}
