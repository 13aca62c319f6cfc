pub mod attention;
pub mod dropout;
pub mod encoder;
pub mod feed_forward;
pub mod head;
pub mod layer_norm;
pub mod linear;
pub mod mask;
pub mod patch_embedding;
pub mod residual;

use crate::error::Result;
use crate::nn::mask::AttentionMask;
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Whether stochastic layers (dropout) are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// Per-call state threaded through a forward pass.
///
/// Holds the mode, the optional attention mask and the RNG that dropout draws
/// from. It is created for one call and dropped afterwards; no layer keeps any
/// of it.
pub struct ForwardCtx<'a> {
    mode: Mode,
    mask: Option<&'a AttentionMask>,
    // Seeded on first use; eval passes never draw from it.
    rng: Option<StdRng>,
}

impl<'a> ForwardCtx<'a> {
    /// Inference: dropout is the identity.
    pub fn eval() -> Self {
        Self {
            mode: Mode::Eval,
            mask: None,
            rng: None,
        }
    }

    /// Training mode with fresh dropout masks on every call.
    pub fn train() -> Self {
        Self {
            mode: Mode::Train,
            mask: None,
            rng: None,
        }
    }

    /// Training mode with reproducible dropout masks.
    pub fn train_seeded(seed: u64) -> Self {
        Self {
            mode: Mode::Train,
            mask: None,
            rng: Some(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn with_mask(mut self, mask: &'a AttentionMask) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_training(&self) -> bool {
        self.mode == Mode::Train
    }

    pub fn mask(&self) -> Option<&'a AttentionMask> {
        self.mask
    }

    /// The dropout RNG. An unseeded context draws its seed from OS entropy here.
    pub fn rng(&mut self) -> &mut StdRng {
        self.rng.get_or_insert_with(StdRng::from_entropy)
    }
}

/// A trait for a neural network module.
pub trait Module {
    /// Performs a forward pass on the module.
    fn forward(&self, input: &Tensor, ctx: &mut ForwardCtx<'_>) -> Result<Tensor>;

    /// All learnable parameters, in a fixed order.
    fn parameters(&self) -> Vec<&Tensor>;

    /// Mutable access to the same parameters, in the same order as [`Module::parameters`].
    /// This is the only way to change weights after construction.
    fn parameters_mut(&mut self) -> Vec<&mut Tensor>;

    /// Total number of learnable scalars.
    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.len()).sum()
    }
}
