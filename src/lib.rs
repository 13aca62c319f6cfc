pub mod config;
pub mod error;
pub mod models;
pub mod nn;
pub mod tensor;

pub use config::ViTConfig;
pub use error::{ConfigError, Result, ShapeError, ViTError};
pub use models::vit::ViT;
pub use nn::mask::AttentionMask;
pub use nn::{ForwardCtx, Mode, Module};
pub use tensor::Tensor;
