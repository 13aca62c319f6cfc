//! Error types.
//!
//! Failures split the same way the model's lifecycle does: a bad
//! hyperparameter is a [`ConfigError`] and is caught when a layer is built,
//! a bad input is a [`ShapeError`] and is caught when `forward` is called.
//! Neither is retryable.

use thiserror::Error;

/// Construction-time errors. A model is never built from a config that fails these.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("image size {image_size} is not divisible by patch size {patch_size}")]
    PatchSizeMismatch { image_size: usize, patch_size: usize },

    #[error("embedding width {embedding_width} is not divisible by head count {num_heads}")]
    HeadCountMismatch {
        embedding_width: usize,
        num_heads: usize,
    },

    #[error("{name} must be greater than zero")]
    ZeroDimension { name: &'static str },

    #[error("{name} must be in [0, 1), got {rate}")]
    InvalidDropout { name: &'static str, rate: f32 },

    #[error("layer norm epsilon must be positive and finite, got {0}")]
    InvalidEpsilon(f32),
}

/// Call-time contract violations. A failing call produces no output.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeError {
    #[error("{op}: expected shape {expected:?}, got {actual:?}")]
    Mismatch {
        op: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("{op}: expected a rank-{expected} tensor, got shape {actual:?}")]
    RankMismatch {
        op: &'static str,
        expected: usize,
        actual: Vec<usize>,
    },

    #[error("{dim} of {size} is not divisible by patch size {patch_size}")]
    NotDivisible {
        dim: &'static str,
        size: usize,
        patch_size: usize,
    },

    #[error("mask of shape {mask:?} cannot broadcast to attention scores {scores:?}")]
    MaskNotBroadcastable { mask: Vec<usize>, scores: Vec<usize> },

    #[error("{op}: index {index} out of range for axis of length {len}")]
    OutOfRange {
        op: &'static str,
        index: usize,
        len: usize,
    },

    #[error("batch must contain at least one image")]
    EmptyBatch,

    #[error("{op}: invalid axes {axes:?} for a rank-{rank} tensor")]
    InvalidAxes {
        op: &'static str,
        axes: Vec<usize>,
        rank: usize,
    },

    #[error("{op}: {message}")]
    Layout { op: &'static str, message: String },
}

#[derive(Error, Debug)]
pub enum ViTError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("shape error: {0}")]
    Shape(#[from] ShapeError),

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ndarray::ShapeError> for ViTError {
    fn from(e: ndarray::ShapeError) -> Self {
        ViTError::Shape(ShapeError::Layout {
            op: "ndarray",
            message: e.to_string(),
        })
    }
}

pub type Result<T> = std::result::Result<T, ViTError>;
