//! Patch Embedding module for Vision Transformers.

use crate::config::ViTConfig;
use crate::error::{ConfigError, Result, ShapeError};
use crate::nn::linear::Linear;
use crate::nn::{ForwardCtx, Module};
use crate::tensor::Tensor;
use rand::Rng;

/// Turns an image batch `[B, C, H, W]` into the initial token sequence `[B, N + 1, D]`.
///
/// The image is cut into non-overlapping `P x P` patches in row-major grid order.
/// Each patch is flattened with the channel varying fastest, i.e.
/// `(row in patch, column in patch, channel)`, and projected by one shared
/// linear layer. The class token is prepended and the position embedding is
/// added row by row.
pub struct PatchEmbedding {
    in_channels: usize,
    patch_size: usize,
    image_size: usize,
    projection: Linear,
    class_token: Tensor,
    positions: Tensor,
}

impl PatchEmbedding {
    pub fn new<R: Rng + ?Sized>(config: &ViTConfig, rng: &mut R) -> std::result::Result<Self, ConfigError> {
        if config.patch_size == 0 {
            return Err(ConfigError::ZeroDimension { name: "patch_size" });
        }
        if config.image_size % config.patch_size != 0 {
            return Err(ConfigError::PatchSizeMismatch {
                image_size: config.image_size,
                patch_size: config.patch_size,
            });
        }
        log::debug!(
            "Initializing PatchEmbedding: {}x{} patches of {} values -> width {}",
            config.grid_size(),
            config.grid_size(),
            config.patch_dim(),
            config.embedding_width
        );

        let projection = Linear::new_with(config.patch_dim(), config.embedding_width, rng)?;
        Ok(Self {
            in_channels: config.in_channels,
            patch_size: config.patch_size,
            image_size: config.image_size,
            projection,
            class_token: Tensor::rand_with(vec![config.embedding_width], rng),
            positions: Tensor::rand_with(vec![config.seq_len(), config.embedding_width], rng),
        })
    }

    pub fn class_token(&self) -> &Tensor {
        &self.class_token
    }

    pub fn positions(&self) -> &Tensor {
        &self.positions
    }

    /// Validates the batch and returns its size.
    fn check_input(&self, images: &Tensor) -> Result<usize> {
        let (batch, channels, height, width) = match *images.shape() {
            [b, c, h, w] => (b, c, h, w),
            _ => {
                return Err(ShapeError::RankMismatch {
                    op: "patch_embedding",
                    expected: 4,
                    actual: images.shape().to_vec(),
                }
                .into())
            }
        };
        if batch == 0 {
            return Err(ShapeError::EmptyBatch.into());
        }
        for (dim, size) in [("height", height), ("width", width)] {
            if size % self.patch_size != 0 {
                return Err(ShapeError::NotDivisible {
                    dim,
                    size,
                    patch_size: self.patch_size,
                }
                .into());
            }
        }
        if channels != self.in_channels || height != self.image_size || width != self.image_size {
            return Err(ShapeError::Mismatch {
                op: "patch_embedding",
                expected: vec![batch, self.in_channels, self.image_size, self.image_size],
                actual: images.shape().to_vec(),
            }
            .into());
        }
        Ok(batch)
    }

    /// `[B, C, H, W] -> [B, (H/P)(W/P), P*P*C]`
    fn patchify(&self, images: &Tensor, batch: usize) -> Result<Tensor> {
        let p = self.patch_size;
        let grid = self.image_size / p;
        let c = self.in_channels;
        // b c (gh p1) (gw p2) -> b gh gw p1 p2 c
        images
            .reshape(vec![batch, c, grid, p, grid, p])?
            .permute(&[0, 2, 4, 3, 5, 1])?
            .reshape(vec![batch, grid * grid, p * p * c])
    }
}

impl Module for PatchEmbedding {
    fn forward(&self, images: &Tensor, ctx: &mut ForwardCtx<'_>) -> Result<Tensor> {
        let batch = self.check_input(images)?;
        let patches = self.patchify(images, batch)?;
        let tokens = self.projection.forward(&patches, ctx)?;

        let width = self.projection.out_features();
        let grid = self.image_size / self.patch_size;
        self.class_token.check_shape("class_token", &[width])?;
        self.positions
            .check_shape("positions", &[grid * grid + 1, width])?;

        // One copy of the class token per image.
        let class_tokens = self
            .class_token
            .reshape(vec![1, 1, width])?
            .broadcast_to(&[batch, 1, width])?;
        let sequence = Tensor::concat(1, &[&class_tokens, &tokens])?;
        log::trace!("patch embedding sequence {:?}", sequence.shape());

        sequence.try_add(&self.positions)
    }

    /// `[projection weights, projection bias, class_token, positions]`
    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = self.projection.parameters();
        params.push(&self.class_token);
        params.push(&self.positions);
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.projection.parameters_mut();
        params.push(&mut self.class_token);
        params.push(&mut self.positions);
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ViTError;
    use ndarray::s;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn small_config() -> ViTConfig {
        ViTConfig {
            in_channels: 2,
            patch_size: 2,
            image_size: 4,
            embedding_width: 6,
            ..ViTConfig::default()
        }
    }

    #[test]
    fn produces_class_token_plus_patches() {
        let cfg = small_config();
        let embed = PatchEmbedding::new(&cfg, &mut StdRng::seed_from_u64(0)).unwrap();
        let images = Tensor::rand(vec![3, 2, 4, 4]);
        let out = embed.forward(&images, &mut ForwardCtx::eval()).unwrap();
        assert_eq!(out.shape(), &[3, 5, 6]);
    }

    #[test]
    fn zero_image_yields_class_token_and_bias_plus_positions() {
        let cfg = small_config();
        let embed = PatchEmbedding::new(&cfg, &mut StdRng::seed_from_u64(0)).unwrap();
        let out = embed
            .forward(&Tensor::zeros(vec![2, 2, 4, 4]), &mut ForwardCtx::eval())
            .unwrap();
        for b in 0..2 {
            for d in 0..6 {
                let expected = embed.class_token().data()[[d]] + embed.positions().data()[[0, d]];
                assert_eq!(out.data()[[b, 0, d]], expected);
                // Zero patches project to the (zero) bias.
                assert_eq!(out.data()[[b, 3, d]], embed.positions().data()[[3, d]]);
            }
        }
    }

    #[test]
    fn patches_flatten_rows_then_columns_then_channels() {
        let cfg = small_config();
        let embed = PatchEmbedding::new(&cfg, &mut StdRng::seed_from_u64(0)).unwrap();
        // Pixel value encodes (channel, row, column).
        let mut images = Tensor::zeros(vec![1, 2, 4, 4]);
        for c in 0..2 {
            for y in 0..4 {
                for x in 0..4 {
                    images.data_mut()[[0, c, y, x]] = (c * 100 + y * 10 + x) as f32;
                }
            }
        }
        let patches = embed.patchify(&images, 1).unwrap();
        assert_eq!(patches.shape(), &[1, 4, 8]);
        // Second patch in the grid: rows 0..2, columns 2..4.
        assert_eq!(
            patches.data().slice(s![0, 1, ..]).to_vec(),
            vec![2.0, 102.0, 3.0, 103.0, 12.0, 112.0, 13.0, 113.0]
        );
    }

    #[test]
    fn config_rejects_indivisible_image() {
        let cfg = ViTConfig {
            image_size: 5,
            ..small_config()
        };
        assert!(matches!(
            PatchEmbedding::new(&cfg, &mut StdRng::seed_from_u64(0)).err(),
            Some(ConfigError::PatchSizeMismatch { .. })
        ));
    }

    #[test]
    fn call_rejects_bad_images() {
        let embed = PatchEmbedding::new(&small_config(), &mut StdRng::seed_from_u64(0)).unwrap();
        let mut ctx = ForwardCtx::eval();

        let err = embed.forward(&Tensor::zeros(vec![1, 2, 5, 4]), &mut ctx).unwrap_err();
        assert!(matches!(
            err,
            ViTError::Shape(ShapeError::NotDivisible { dim: "height", .. })
        ));
        let err = embed.forward(&Tensor::zeros(vec![1, 3, 4, 4]), &mut ctx).unwrap_err();
        assert!(matches!(err, ViTError::Shape(ShapeError::Mismatch { .. })));
        let err = embed.forward(&Tensor::zeros(vec![1, 2, 8, 8]), &mut ctx).unwrap_err();
        assert!(matches!(err, ViTError::Shape(ShapeError::Mismatch { .. })));
        let err = embed.forward(&Tensor::zeros(vec![0, 2, 4, 4]), &mut ctx).unwrap_err();
        assert!(matches!(err, ViTError::Shape(ShapeError::EmptyBatch)));
        let err = embed.forward(&Tensor::zeros(vec![2, 4, 4]), &mut ctx).unwrap_err();
        assert!(matches!(err, ViTError::Shape(ShapeError::RankMismatch { .. })));
    }

    #[test]
    fn replaced_positions_are_rejected() {
        let mut embed = PatchEmbedding::new(&small_config(), &mut StdRng::seed_from_u64(0)).unwrap();
        let mut params = embed.parameters_mut();
        *params[3] = Tensor::zeros(vec![4, 6]);
        let err = embed
            .forward(&Tensor::zeros(vec![1, 2, 4, 4]), &mut ForwardCtx::eval())
            .unwrap_err();
        assert!(matches!(
            err,
            ViTError::Shape(ShapeError::Mismatch { op: "positions", .. })
        ));
    }

    #[test]
    fn default_geometry() {
        let cfg = ViTConfig {
            embedding_width: 768,
            ..ViTConfig::default()
        };
        let embed = PatchEmbedding::new(&cfg, &mut StdRng::seed_from_u64(0)).unwrap();
        let out = embed
            .forward(&Tensor::zeros(vec![2, 3, 224, 224]), &mut ForwardCtx::eval())
            .unwrap();
        assert_eq!(out.shape(), &[2, 197, 768]);
        assert_eq!(embed.num_parameters(), 768 * 768 + 768 + 768 + 197 * 768);
    }
}
