//! Dropout.

use crate::config::validate_dropout;
use crate::error::{ConfigError, Result};
use crate::nn::{ForwardCtx, Module};
use crate::tensor::Tensor;
use rand::Rng;

/// Inverted dropout: in training mode each element is zeroed with probability
/// `rate` and survivors are scaled by `1 / (1 - rate)`. Identity in eval mode.
pub struct Dropout {
    rate: f32,
}

impl Dropout {
    pub fn new(rate: f32) -> std::result::Result<Self, ConfigError> {
        validate_dropout("dropout rate", rate)?;
        Ok(Self { rate })
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }
}

impl Module for Dropout {
    fn forward(&self, input: &Tensor, ctx: &mut ForwardCtx<'_>) -> Result<Tensor> {
        if !ctx.is_training() || self.rate == 0.0 {
            return Ok(input.clone());
        }
        let keep = 1.0 - self.rate;
        let scale = 1.0 / keep;
        let rng = ctx.rng();
        let mut out = input.clone();
        out.data_mut().mapv_inplace(|x| if rng.gen::<f32>() < keep { x * scale } else { 0.0 });
        Ok(out)
    }

    fn parameters(&self) -> Vec<&Tensor> {
        vec![]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        vec![]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_in_eval_mode() {
        let dropout = Dropout::new(0.5).unwrap();
        let x = Tensor::full(vec![4, 4], 3.0);
        assert_eq!(dropout.forward(&x, &mut ForwardCtx::eval()).unwrap(), x);
    }

    #[test]
    fn zeroes_and_rescales_in_training() {
        let dropout = Dropout::new(0.5).unwrap();
        let x = Tensor::full(vec![100, 100], 1.0);
        let y = dropout.forward(&x, &mut ForwardCtx::train_seeded(11)).unwrap();
        assert!(y.data().iter().all(|&v| v == 0.0 || v == 2.0));
        let kept = y.data().iter().filter(|&&v| v != 0.0).count() as f32 / 10_000.0;
        assert!((kept - 0.5).abs() < 0.05);
    }

    #[test]
    fn seeded_contexts_draw_the_same_mask() {
        let dropout = Dropout::new(0.3).unwrap();
        let x = Tensor::full(vec![8, 8], 1.0);
        let a = dropout.forward(&x, &mut ForwardCtx::train_seeded(5)).unwrap();
        let b = dropout.forward(&x, &mut ForwardCtx::train_seeded(5)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_rate_of_one() {
        assert_eq!(Dropout::new(0.25).unwrap().rate(), 0.25);
        assert!(Dropout::new(1.0).is_err());
        assert!(Dropout::new(-0.1).is_err());
    }
}
