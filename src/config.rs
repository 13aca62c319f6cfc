//! Model hyperparameters.

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Defaults for a ViT-Base/16 classifier on 224x224 RGB images.
pub mod settings {
    pub const IN_CHANNELS: usize = 3;
    pub const PATCH_SIZE: usize = 16;
    pub const EMBEDDING_WIDTH: usize = 768;
    pub const IMAGE_SIZE: usize = 224;
    /// Number of encoder blocks.
    pub const DEPTH: usize = 12;
    pub const NUM_CLASSES: usize = 1000;
    pub const NUM_HEADS: usize = 8;
    /// Hidden width of the feed-forward block as a multiple of the embedding width.
    pub const FEED_FORWARD_EXPANSION: usize = 4;
    pub const ATTENTION_DROPOUT_RATE: f32 = 0.0;
    pub const BLOCK_DROPOUT_RATE: f32 = 0.0;
    pub const FEED_FORWARD_DROPOUT_RATE: f32 = 0.0;
    pub const LAYER_NORM_EPS: f32 = 1e-5;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ViTConfig {
    pub in_channels: usize,
    pub patch_size: usize,
    pub embedding_width: usize,
    pub image_size: usize,
    pub depth: usize,
    pub num_classes: usize,
    pub num_heads: usize,
    pub feed_forward_expansion: usize,
    pub attention_dropout_rate: f32,
    pub block_dropout_rate: f32,
    pub feed_forward_dropout_rate: f32,
    pub layer_norm_eps: f32,
}

impl Default for ViTConfig {
    fn default() -> Self {
        Self {
            in_channels: settings::IN_CHANNELS,
            patch_size: settings::PATCH_SIZE,
            embedding_width: settings::EMBEDDING_WIDTH,
            image_size: settings::IMAGE_SIZE,
            depth: settings::DEPTH,
            num_classes: settings::NUM_CLASSES,
            num_heads: settings::NUM_HEADS,
            feed_forward_expansion: settings::FEED_FORWARD_EXPANSION,
            attention_dropout_rate: settings::ATTENTION_DROPOUT_RATE,
            block_dropout_rate: settings::BLOCK_DROPOUT_RATE,
            feed_forward_dropout_rate: settings::FEED_FORWARD_DROPOUT_RATE,
            layer_norm_eps: settings::LAYER_NORM_EPS,
        }
    }
}

impl ViTConfig {
    /// Parses a JSON config. Fields that are absent keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ViTConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Checks every construction-time rule. Layers call this before allocating anything.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let sizes = [
            ("in_channels", self.in_channels),
            ("patch_size", self.patch_size),
            ("embedding_width", self.embedding_width),
            ("image_size", self.image_size),
            ("depth", self.depth),
            ("num_classes", self.num_classes),
            ("num_heads", self.num_heads),
            ("feed_forward_expansion", self.feed_forward_expansion),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(ConfigError::ZeroDimension { name });
            }
        }

        if self.image_size % self.patch_size != 0 {
            return Err(ConfigError::PatchSizeMismatch {
                image_size: self.image_size,
                patch_size: self.patch_size,
            });
        }
        if self.embedding_width % self.num_heads != 0 {
            return Err(ConfigError::HeadCountMismatch {
                embedding_width: self.embedding_width,
                num_heads: self.num_heads,
            });
        }

        let rates = [
            ("attention_dropout_rate", self.attention_dropout_rate),
            ("block_dropout_rate", self.block_dropout_rate),
            ("feed_forward_dropout_rate", self.feed_forward_dropout_rate),
        ];
        for (name, rate) in rates {
            validate_dropout(name, rate)?;
        }

        if !(self.layer_norm_eps.is_finite() && self.layer_norm_eps > 0.0) {
            return Err(ConfigError::InvalidEpsilon(self.layer_norm_eps));
        }
        Ok(())
    }

    /// Patches along one side of the image.
    pub fn grid_size(&self) -> usize {
        self.image_size / self.patch_size
    }

    pub fn num_patches(&self) -> usize {
        self.grid_size() * self.grid_size()
    }

    /// Token sequence length: every patch plus the class token.
    pub fn seq_len(&self) -> usize {
        self.num_patches() + 1
    }

    /// Length of one flattened patch.
    pub fn patch_dim(&self) -> usize {
        self.patch_size * self.patch_size * self.in_channels
    }

    pub fn head_dim(&self) -> usize {
        self.embedding_width / self.num_heads
    }

    /// Width of the feed-forward hidden layer.
    pub fn hidden_width(&self) -> usize {
        self.embedding_width * self.feed_forward_expansion
    }
}

pub(crate) fn validate_dropout(name: &'static str, rate: f32) -> std::result::Result<(), ConfigError> {
    if (0.0..1.0).contains(&rate) {
        Ok(())
    } else {
        Err(ConfigError::InvalidDropout { name, rate })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ViTError;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_config_is_vit_base_16() {
        let cfg = ViTConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.grid_size(), 14);
        assert_eq!(cfg.num_patches(), 196);
        assert_eq!(cfg.seq_len(), 197);
        assert_eq!(cfg.patch_dim(), 768);
        assert_eq!(cfg.head_dim(), 96);
        assert_eq!(cfg.hidden_width(), 3072);
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut cfg = ViTConfig::default();
        cfg.depth = 4;
        cfg.attention_dropout_rate = 0.1;
        let json = serde_json::to_string(&cfg).unwrap();
        let decoded: ViTConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, decoded);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = ViTConfig::from_json_str(r#"{ "image_size": 32, "patch_size": 8, "depth": 2 }"#)
            .unwrap();
        assert_eq!(cfg.image_size, 32);
        assert_eq!(cfg.patch_size, 8);
        assert_eq!(cfg.depth, 2);
        assert_eq!(cfg.embedding_width, settings::EMBEDDING_WIDTH);
        assert_eq!(cfg.seq_len(), 17);
    }

    #[test]
    fn json_with_invalid_geometry_is_rejected() {
        let err = ViTConfig::from_json_str(r#"{ "image_size": 30, "patch_size": 8 }"#).unwrap_err();
        assert!(matches!(
            err,
            ViTError::Config(ConfigError::PatchSizeMismatch {
                image_size: 30,
                patch_size: 8
            })
        ));
    }

    #[test]
    fn rejects_indivisible_heads() {
        let cfg = ViTConfig {
            embedding_width: 100,
            num_heads: 3,
            ..ViTConfig::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::HeadCountMismatch {
                embedding_width: 100,
                num_heads: 3
            })
        );
    }

    #[test]
    fn rejects_zero_sizes_and_bad_rates() {
        let cfg = ViTConfig {
            depth: 0,
            ..ViTConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroDimension { name: "depth" }));

        let cfg = ViTConfig {
            block_dropout_rate: 1.0,
            ..ViTConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidDropout {
                name: "block_dropout_rate",
                ..
            })
        ));

        let cfg = ViTConfig {
            layer_norm_eps: 0.0,
            ..ViTConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidEpsilon(0.0)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = ViTConfig::from_json_file("/nonexistent/vit.json").unwrap_err();
        assert!(matches!(err, ViTError::Io(_)));
    }
}
