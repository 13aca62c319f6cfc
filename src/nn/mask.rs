//! Attention masks.

use crate::error::{Result, ShapeError};
use crate::tensor::Tensor;
use ndarray::{Array2, ArrayD, IxDyn};

/// Marks the (query, key) pairs that may not attend to each other.
///
/// `true` means masked out. The mask must broadcast to the attention score shape
/// `[batch, heads, queries, keys]`, so an `[N, N]` mask applies to every batch
/// item and head, while a `[B, 1, 1, N]` mask can hide padding per image.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionMask {
    masked: ArrayD<bool>,
}

impl AttentionMask {
    pub fn new(masked: ArrayD<bool>) -> Self {
        Self { masked }
    }

    /// Any non-zero entry is masked out.
    pub fn from_tensor(tensor: &Tensor) -> Self {
        Self::new(tensor.data().mapv(|x| x != 0.0))
    }

    /// An `[N, N]` mask that hides the given key positions from every query.
    pub fn block_keys(seq_len: usize, keys: &[usize]) -> Result<Self> {
        let mut masked = Array2::from_elem((seq_len, seq_len), false);
        for &key in keys {
            if key >= seq_len {
                return Err(ShapeError::OutOfRange {
                    op: "block_keys",
                    index: key,
                    len: seq_len,
                }
                .into());
            }
            masked.column_mut(key).fill(true);
        }
        Ok(Self::new(masked.into_dyn()))
    }

    pub fn shape(&self) -> &[usize] {
        self.masked.shape()
    }

    pub fn masked(&self) -> &ArrayD<bool> {
        &self.masked
    }

    /// Fails unless the mask broadcasts to `scores`.
    pub fn check(&self, scores: &[usize]) -> Result<()> {
        if self.masked.broadcast(IxDyn(scores)).is_some() {
            Ok(())
        } else {
            Err(ShapeError::MaskNotBroadcastable {
                mask: self.shape().to_vec(),
                scores: scores.to_vec(),
            }
            .into())
        }
    }

    /// True if some query row, after broadcasting, has every key masked out.
    pub fn has_empty_rows(&self, scores: &[usize]) -> bool {
        match self.masked.broadcast(IxDyn(scores)) {
            Some(view) if !scores.is_empty() => view
                .lanes(ndarray::Axis(scores.len() - 1))
                .into_iter()
                .any(|row| row.iter().all(|&m| m)),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ViTError;

    #[test]
    fn block_keys_hides_columns() {
        let mask = AttentionMask::block_keys(3, &[2]).unwrap();
        for q in 0..3 {
            assert!(!mask.masked()[[q, 0]]);
            assert!(mask.masked()[[q, 2]]);
        }
        assert!(AttentionMask::block_keys(3, &[3]).is_err());
    }

    #[test]
    fn broadcast_rules_follow_trailing_axes() {
        let square = AttentionMask::block_keys(5, &[]).unwrap();
        assert!(square.check(&[2, 4, 5, 5]).is_ok());

        let per_key = AttentionMask::new(ArrayD::from_elem(IxDyn(&[2, 1, 1, 5]), false));
        assert!(per_key.check(&[2, 4, 5, 5]).is_ok());
        assert!(per_key.check(&[3, 4, 5, 5]).is_err());

        let wrong = AttentionMask::block_keys(4, &[]).unwrap();
        assert!(matches!(
            wrong.check(&[1, 2, 5, 5]).unwrap_err(),
            ViTError::Shape(ShapeError::MaskNotBroadcastable { .. })
        ));
    }

    #[test]
    fn from_tensor_treats_nonzero_as_masked() {
        let t = Tensor::new(vec![1.0, 0.0, -2.0, 0.0], vec![2, 2]).unwrap();
        let mask = AttentionMask::from_tensor(&t);
        assert_eq!(mask.masked().iter().copied().collect::<Vec<_>>(), vec![true, false, true, false]);
    }

    #[test]
    fn detects_fully_masked_rows() {
        let mask = AttentionMask::block_keys(2, &[0, 1]).unwrap();
        assert!(mask.has_empty_rows(&[1, 1, 2, 2]));
        let mask = AttentionMask::block_keys(2, &[0]).unwrap();
        assert!(!mask.has_empty_rows(&[1, 1, 2, 2]));
    }
}
