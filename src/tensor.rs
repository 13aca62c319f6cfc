//! A dense f32 tensor for the forward pass.
//!
//! `Tensor` owns its storage. Cloning copies the data, so two tensors never
//! alias; layers hand out `&Tensor` for reading and `&mut Tensor` for the
//! collaborator that loads or trains weights.

use crate::error::{Result, ShapeError};
use ndarray::{Array, Array2, ArrayD, ArrayViewD, ArrayViewMutD, Axis, Ix2, IxDyn, Zip};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use rayon::prelude::*;
use std::fmt;
use std::ops::{Add, Div, Mul, Sub};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Total CPU time spent inside [`Tensor::matmul`], in nanoseconds.
pub static MATMUL_TIME_NS: AtomicU64 = AtomicU64::new(0);

/// Half-width of the uniform range used for weight initialization.
const INIT_RANGE: f32 = 0.02;

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: ArrayD<f32>,
}

impl Tensor {
    /// Creates a tensor from row-major data and a shape.
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(ShapeError::Mismatch {
                op: "Tensor::new",
                expected: shape,
                actual: vec![data.len()],
            }
            .into());
        }
        let data = Array::from_shape_vec(IxDyn(&shape), data)?;
        Ok(Self::from_data(data))
    }

    pub fn from_data(data: ArrayD<f32>) -> Self {
        Self { data }
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::from_data(Array::zeros(IxDyn(&shape)))
    }

    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        Self::from_data(Array::from_elem(IxDyn(&shape), value))
    }

    /// Random values for weight initialization, drawn from the thread RNG.
    pub fn rand(shape: Vec<usize>) -> Self {
        Self::rand_with(shape, &mut rand::thread_rng())
    }

    /// Like [`Tensor::rand`] but from a caller-owned RNG, so a seeded model is reproducible.
    pub fn rand_with<R: Rng + ?Sized>(shape: Vec<usize>, rng: &mut R) -> Self {
        let dist = Uniform::new(-INIT_RANGE, INIT_RANGE);
        Self::from_data(Array::from_shape_simple_fn(IxDyn(&shape), || {
            dist.sample(&mut *rng)
        }))
    }

    // --- Accessors ---

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn ndim(&self) -> usize {
        self.data.ndim()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &ArrayD<f32> {
        &self.data
    }

    /// Writable view of the values. The shape stays fixed; load a whole array with [`Tensor::assign`].
    pub fn data_mut(&mut self) -> ArrayViewMutD<'_, f32> {
        self.data.view_mut()
    }

    pub fn view(&self) -> ArrayViewD<'_, f32> {
        self.data.view()
    }

    pub fn into_data(self) -> ArrayD<f32> {
        self.data
    }

    /// Overwrites the values in place, keeping the shape.
    pub fn assign(&mut self, values: &ArrayD<f32>) -> Result<()> {
        if values.shape() != self.shape() {
            return Err(ShapeError::Mismatch {
                op: "assign",
                expected: self.shape().to_vec(),
                actual: values.shape().to_vec(),
            }
            .into());
        }
        self.data.assign(values);
        Ok(())
    }

    /// Fails unless the shape is exactly `expected`.
    pub fn check_shape(&self, op: &'static str, expected: &[usize]) -> Result<()> {
        if self.shape() == expected {
            Ok(())
        } else {
            Err(ShapeError::Mismatch {
                op,
                expected: expected.to_vec(),
                actual: self.shape().to_vec(),
            }
            .into())
        }
    }

    // --- Element-wise ---

    pub fn mapv(&self, f: impl Fn(f32) -> f32) -> Tensor {
        Tensor::from_data(self.data.mapv(f))
    }

    /// Exact GELU: `x * Phi(x) = 0.5 * x * (1 + erf(x / sqrt(2)))`.
    pub fn gelu(&self) -> Tensor {
        self.mapv(|x| 0.5 * x * (1.0 + libm::erff(x * std::f32::consts::FRAC_1_SQRT_2)))
    }

    /// Adds `other` after broadcasting it to this tensor's shape.
    pub fn try_add(&self, other: &Tensor) -> Result<Tensor> {
        let rhs = other
            .data
            .broadcast(IxDyn(self.shape()))
            .ok_or_else(|| ShapeError::Mismatch {
                op: "add",
                expected: self.shape().to_vec(),
                actual: other.shape().to_vec(),
            })?;
        Ok(Tensor::from_data(&self.data + &rhs))
    }

    /// Returns a copy with `value` written wherever `mask` (broadcast to this shape) is true.
    pub fn masked_fill(&self, mask: &ArrayD<bool>, value: f32) -> Result<Tensor> {
        let mask = mask
            .broadcast(IxDyn(self.shape()))
            .ok_or_else(|| ShapeError::MaskNotBroadcastable {
                mask: mask.shape().to_vec(),
                scores: self.shape().to_vec(),
            })?;
        let mut out = self.data.clone();
        Zip::from(&mut out).and(&mask).for_each(|x, &m| {
            if m {
                *x = value;
            }
        });
        Ok(Tensor::from_data(out))
    }

    // --- Reductions ---

    pub fn sum_axis(&self, axis: usize, keep_dims: bool) -> Result<Tensor> {
        self.check_axis("sum_axis", axis)?;
        let ax = Axis(axis);
        let out = self.data.sum_axis(ax);
        Ok(Tensor::from_data(if keep_dims { out.insert_axis(ax) } else { out }))
    }

    pub fn mean_axis(&self, axis: usize, keep_dims: bool) -> Result<Tensor> {
        self.check_axis("mean_axis", axis)?;
        let n = self.shape()[axis];
        if n == 0 {
            return Err(ShapeError::Layout {
                op: "mean_axis",
                message: format!("axis {} of {:?} is empty", axis, self.shape()),
            }
            .into());
        }
        Ok(self.sum_axis(axis, keep_dims)? / n as f32)
    }

    /// Biased variance along an axis.
    pub fn var_axis(&self, axis: usize, keep_dims: bool) -> Result<Tensor> {
        let mean = self.mean_axis(axis, true)?;
        let centered = self - &mean;
        (&centered * &centered).mean_axis(axis, keep_dims)
    }

    /// Softmax along `axis`, shifted by the per-row maximum so large scores cannot overflow.
    pub fn softmax(&self, axis: usize) -> Result<Tensor> {
        self.check_axis("softmax", axis)?;
        let ax = Axis(axis);
        let max = self
            .data
            .map_axis(ax, |row| row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b)))
            .insert_axis(ax);
        let mut exp = &self.data - &max;
        exp.mapv_inplace(f32::exp);
        let sum = exp.sum_axis(ax).insert_axis(ax);
        Ok(Tensor::from_data(exp / &sum))
    }

    // --- Shape manipulation ---

    /// Matrix product.
    ///
    /// Supports `[m, k] x [k, n]`, `[..., m, k] x [k, n]` (leading axes folded into rows),
    /// and batched `[..., m, k] x [..., k, n]` where the leading axes match exactly.
    /// Batch items are multiplied in parallel.
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        let start = Instant::now();
        let a_shape = self.shape();
        let b_shape = other.shape();
        let incompatible = || ShapeError::Layout {
            op: "matmul",
            message: format!("incompatible shapes {:?} and {:?}", a_shape, b_shape),
        };

        let out = match (a_shape.len(), b_shape.len()) {
            (2, 2) => {
                if a_shape[1] != b_shape[0] {
                    return Err(incompatible().into());
                }
                let a = self.data.view().into_dimensionality::<Ix2>()?;
                let b = other.data.view().into_dimensionality::<Ix2>()?;
                a.dot(&b).into_dyn()
            }
            (rank, 2) if rank > 2 => {
                let k = a_shape[rank - 1];
                if k != b_shape[0] {
                    return Err(incompatible().into());
                }
                let rows: usize = a_shape[..rank - 1].iter().product();
                let a = self
                    .data
                    .as_standard_layout()
                    .into_owned()
                    .into_shape((rows, k))?;
                let b = other.data.view().into_dimensionality::<Ix2>()?;
                let mut out_shape = a_shape[..rank - 1].to_vec();
                out_shape.push(b_shape[1]);
                a.dot(&b).into_shape(IxDyn(&out_shape))?
            }
            (rank, other_rank) if rank == other_rank && rank > 2 => {
                let lead = rank - 2;
                if a_shape[..lead] != b_shape[..lead] || a_shape[rank - 1] != b_shape[rank - 2] {
                    return Err(incompatible().into());
                }
                let batch: usize = a_shape[..lead].iter().product();
                let (m, k, n) = (a_shape[rank - 2], a_shape[rank - 1], b_shape[rank - 1]);
                let a = self
                    .data
                    .as_standard_layout()
                    .into_owned()
                    .into_shape((batch, m, k))?;
                let b = other
                    .data
                    .as_standard_layout()
                    .into_owned()
                    .into_shape((batch, k, n))?;

                let products: Vec<Array2<f32>> = (0..batch)
                    .into_par_iter()
                    .map(|i| a.index_axis(Axis(0), i).dot(&b.index_axis(Axis(0), i)))
                    .collect();

                let mut out_shape = a_shape[..rank - 1].to_vec();
                out_shape.push(n);
                let mut flat = Vec::with_capacity(batch * m * n);
                for product in &products {
                    flat.extend(product.iter().copied());
                }
                Array::from_shape_vec(IxDyn(&out_shape), flat)?
            }
            _ => return Err(incompatible().into()),
        };

        MATMUL_TIME_NS.fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
        Ok(Tensor::from_data(out))
    }

    /// Reshapes into a new shape with the same element count. Copies into row-major order first.
    pub fn reshape(&self, new_shape: Vec<usize>) -> Result<Tensor> {
        if new_shape.iter().product::<usize>() != self.len() {
            return Err(ShapeError::Mismatch {
                op: "reshape",
                expected: new_shape,
                actual: self.shape().to_vec(),
            }
            .into());
        }
        let reshaped = self
            .data
            .as_standard_layout()
            .into_owned()
            .into_shape(IxDyn(&new_shape))?;
        Ok(Tensor::from_data(reshaped))
    }

    /// Swaps two axes.
    pub fn transpose(&self, axis1: usize, axis2: usize) -> Result<Tensor> {
        if axis1 >= self.ndim() || axis2 >= self.ndim() {
            return Err(ShapeError::InvalidAxes {
                op: "transpose",
                axes: vec![axis1, axis2],
                rank: self.ndim(),
            }
            .into());
        }
        let mut view = self.data.view();
        view.swap_axes(axis1, axis2);
        Ok(Tensor::from_data(view.as_standard_layout().into_owned()))
    }

    /// Reorders all axes; `axes[i]` names the source axis that becomes axis `i`.
    pub fn permute(&self, axes: &[usize]) -> Result<Tensor> {
        let rank = self.ndim();
        let mut seen = vec![false; rank];
        let valid = axes.len() == rank
            && axes.iter().all(|&a| a < rank && !std::mem::replace(&mut seen[a], true));
        if !valid {
            return Err(ShapeError::InvalidAxes {
                op: "permute",
                axes: axes.to_vec(),
                rank,
            }
            .into());
        }
        let view = self.data.view().permuted_axes(IxDyn(axes));
        Ok(Tensor::from_data(view.as_standard_layout().into_owned()))
    }

    /// Materializes a broadcast of this tensor to `shape`. The result owns its own copy.
    pub fn broadcast_to(&self, shape: &[usize]) -> Result<Tensor> {
        let view = self
            .data
            .broadcast(IxDyn(shape))
            .ok_or_else(|| ShapeError::Mismatch {
                op: "broadcast_to",
                expected: shape.to_vec(),
                actual: self.shape().to_vec(),
            })?;
        Ok(Tensor::from_data(view.as_standard_layout().into_owned()))
    }

    /// Joins tensors along an existing axis.
    pub fn concat(axis: usize, tensors: &[&Tensor]) -> Result<Tensor> {
        let first = tensors.first().ok_or_else(|| ShapeError::Layout {
            op: "concat",
            message: "no tensors to concatenate".to_string(),
        })?;
        first.check_axis("concat", axis)?;
        let views: Vec<ArrayViewD<'_, f32>> = tensors.iter().map(|t| t.data.view()).collect();
        Ok(Tensor::from_data(ndarray::concatenate(Axis(axis), &views)?))
    }

    fn check_axis(&self, op: &'static str, axis: usize) -> Result<()> {
        if axis < self.ndim() {
            Ok(())
        } else {
            Err(ShapeError::InvalidAxes {
                op,
                axes: vec![axis],
                rank: self.ndim(),
            }
            .into())
        }
    }
}

// --- Operator overloads ---
//
// Tensor-tensor operators follow ndarray broadcasting and panic on incompatible
// shapes, like ndarray itself. Use `try_add` where the shapes come from a caller.

impl Add for &Tensor {
    type Output = Tensor;
    fn add(self, rhs: &Tensor) -> Tensor {
        Tensor::from_data(&self.data + &rhs.data)
    }
}
impl<'a> Add<&'a Tensor> for Tensor { type Output = Tensor; fn add(self, rhs: &'a Tensor) -> Tensor { &self + rhs } }
impl Add<f32> for &Tensor {
    type Output = Tensor;
    fn add(self, rhs: f32) -> Tensor {
        Tensor::from_data(&self.data + rhs)
    }
}
impl Add<f32> for Tensor { type Output = Tensor; fn add(self, rhs: f32) -> Tensor { &self + rhs } }

impl Sub for &Tensor {
    type Output = Tensor;
    fn sub(self, rhs: &Tensor) -> Tensor {
        Tensor::from_data(&self.data - &rhs.data)
    }
}
impl<'a> Sub<&'a Tensor> for Tensor { type Output = Tensor; fn sub(self, rhs: &'a Tensor) -> Tensor { &self - rhs } }

impl Mul for &Tensor {
    type Output = Tensor;
    fn mul(self, rhs: &Tensor) -> Tensor {
        Tensor::from_data(&self.data * &rhs.data)
    }
}
impl<'a> Mul<&'a Tensor> for Tensor { type Output = Tensor; fn mul(self, rhs: &'a Tensor) -> Tensor { &self * rhs } }
impl Mul<f32> for &Tensor {
    type Output = Tensor;
    fn mul(self, rhs: f32) -> Tensor {
        Tensor::from_data(&self.data * rhs)
    }
}
impl Mul<f32> for Tensor { type Output = Tensor; fn mul(self, rhs: f32) -> Tensor { &self * rhs } }

impl Div for &Tensor {
    type Output = Tensor;
    fn div(self, rhs: &Tensor) -> Tensor {
        Tensor::from_data(&self.data / &rhs.data)
    }
}
impl<'a> Div<&'a Tensor> for Tensor { type Output = Tensor; fn div(self, rhs: &'a Tensor) -> Tensor { &self / rhs } }
impl Div<f32> for &Tensor {
    type Output = Tensor;
    fn div(self, rhs: f32) -> Tensor {
        Tensor::from_data(&self.data / rhs)
    }
}
impl Div<f32> for Tensor { type Output = Tensor; fn div(self, rhs: f32) -> Tensor { &self / rhs } }

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor(shape: {:?})\n{}", self.shape(), self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ViTError;
    use ndarray::{arr2, s, Ix1};
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn seq(shape: Vec<usize>) -> Tensor {
        let n = shape.iter().product::<usize>();
        Tensor::new((0..n).map(|i| i as f32).collect(), shape).unwrap()
    }

    #[test]
    fn new_rejects_wrong_length() {
        let err = Tensor::new(vec![1.0; 5], vec![2, 3]).unwrap_err();
        assert!(matches!(err, ViTError::Shape(ShapeError::Mismatch { .. })));
    }

    #[test]
    fn assign_keeps_the_shape() {
        let mut t = Tensor::zeros(vec![2, 2]);
        t.assign(&ndarray::arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn()).unwrap();
        assert_eq!(t.clone().into_data().into_raw_vec(), vec![1.0, 2.0, 3.0, 4.0]);

        let err = t.assign(&ndarray::arr1(&[1.0, 2.0, 3.0]).into_dyn()).unwrap_err();
        assert!(matches!(err, ViTError::Shape(ShapeError::Mismatch { op: "assign", .. })));
        assert_eq!(t.shape(), &[2, 2]);
        assert!(t.check_shape("check", &[2, 2]).is_ok());
        assert!(t.check_shape("check", &[4]).is_err());
    }

    #[test]
    fn rand_with_is_reproducible_and_bounded() {
        let a = Tensor::rand_with(vec![4, 8], &mut StdRng::seed_from_u64(7));
        let b = Tensor::rand_with(vec![4, 8], &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
        assert!(a.data().iter().all(|&x| x.abs() <= INIT_RANGE));
    }

    #[test]
    fn matmul_2d() {
        let a = Tensor::from_data(arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn());
        let b = Tensor::from_data(arr2(&[[5.0, 6.0], [7.0, 8.0]]).into_dyn());
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.data(), &arr2(&[[19.0, 22.0], [43.0, 50.0]]).into_dyn());
    }

    #[test]
    fn matmul_folds_leading_axes_against_a_matrix() {
        let x = seq(vec![2, 3, 4]);
        let w = seq(vec![4, 5]);
        let y = x.matmul(&w).unwrap();
        assert_eq!(y.shape(), &[2, 3, 5]);

        let row = x.data().slice(s![1, 2, ..]).to_owned().into_dimensionality::<Ix1>().unwrap();
        let w2 = w.data().clone().into_dimensionality::<Ix2>().unwrap();
        let expected = row.dot(&w2).to_vec();
        assert_eq!(y.data().slice(s![1, 2, ..]).to_vec(), expected);
    }

    #[test]
    fn batched_matmul_matches_per_slice_products() {
        let a = seq(vec![2, 3, 4, 5]);
        let b = seq(vec![2, 3, 5, 2]);
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), &[2, 3, 4, 2]);

        let slice = |t: &Tensor| {
            t.data()
                .slice(s![1, 1, .., ..])
                .to_owned()
                .into_dimensionality::<Ix2>()
                .unwrap()
        };
        assert_eq!(slice(&c), slice(&a).dot(&slice(&b)));
    }

    #[test]
    fn matmul_rejects_mismatched_inner_dims() {
        let a = seq(vec![2, 3]);
        let b = seq(vec![4, 2]);
        assert!(a.matmul(&b).is_err());

        let a = seq(vec![2, 3, 4]);
        let b = seq(vec![3, 4, 2]);
        assert!(a.matmul(&b).is_err());
    }

    #[test]
    fn reshape_after_transpose_uses_logical_order() {
        let x = seq(vec![2, 3]);
        let t = x.transpose(0, 1).unwrap();
        let flat = t.reshape(vec![6]).unwrap();
        assert_eq!(flat.data().iter().copied().collect::<Vec<_>>(), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
        assert!(x.reshape(vec![4]).is_err());
    }

    #[test]
    fn permute_validates_axes() {
        let x = seq(vec![2, 3, 4]);
        assert_eq!(x.permute(&[2, 0, 1]).unwrap().shape(), &[4, 2, 3]);
        assert!(x.permute(&[0, 0, 1]).is_err());
        assert!(x.permute(&[0, 1]).is_err());
        assert!(x.transpose(0, 3).is_err());
    }

    #[test]
    fn softmax_rows_sum_to_one_even_for_large_scores() {
        let x = Tensor::from_data(arr2(&[[1000.0, 1001.0, 1002.0], [-5.0, 0.0, 5.0]]).into_dyn());
        let p = x.softmax(1).unwrap();
        for row in p.data().rows() {
            assert!((row.sum() - 1.0).abs() < 1e-6);
            assert!(row.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn masked_fill_broadcasts_and_leaves_input_untouched() {
        let x = Tensor::zeros(vec![2, 3, 3]);
        let mask = ndarray::arr1(&[false, true, false]).into_dyn();
        let filled = x.masked_fill(&mask, -1.0).unwrap();
        assert_eq!(filled.data().slice(s![1, 2, ..]).to_vec(), vec![0.0, -1.0, 0.0]);
        assert!(x.data().iter().all(|&v| v == 0.0));

        let bad = ndarray::arr1(&[true, false]).into_dyn();
        assert!(matches!(
            x.masked_fill(&bad, 0.0).unwrap_err(),
            ViTError::Shape(ShapeError::MaskNotBroadcastable { .. })
        ));
    }

    #[test]
    fn broadcast_to_replicates_storage() {
        let v = Tensor::new(vec![1.0, 2.0], vec![1, 1, 2]).unwrap();
        let mut b = v.broadcast_to(&[3, 1, 2]).unwrap();
        b.data_mut()[[0, 0, 0]] = 9.0;
        assert_eq!(b.data()[[1, 0, 0]], 1.0);
        assert_eq!(v.data()[[0, 0, 0]], 1.0);
    }

    #[test]
    fn gelu_uses_the_exact_erf_form() {
        let x = Tensor::new(vec![-1.0, 0.0, 1.0, 2.0], vec![4]).unwrap();
        let y = x.gelu();
        // x * Phi(x)
        let expected = [-0.158_655_26, 0.0, 0.841_344_74, 1.954_499_7];
        for (got, want) in y.data().iter().zip(expected) {
            assert!((got - want).abs() < 1e-6, "{} vs {}", got, want);
        }
    }

    #[test]
    fn var_is_biased() {
        let x = Tensor::new(vec![1.0, 3.0], vec![1, 2]).unwrap();
        let v = x.var_axis(1, false).unwrap();
        assert_eq!(v.data().iter().copied().collect::<Vec<_>>(), vec![1.0]);
    }

    #[test]
    fn concat_and_try_add() {
        let a = Tensor::zeros(vec![2, 1, 3]);
        let b = Tensor::full(vec![2, 4, 3], 1.0);
        let c = Tensor::concat(1, &[&a, &b]).unwrap();
        assert_eq!(c.shape(), &[2, 5, 3]);

        let bias = Tensor::full(vec![3], 0.5);
        assert_eq!(c.try_add(&bias).unwrap().data()[[1, 4, 2]], 1.5);
        assert!(c.try_add(&Tensor::zeros(vec![4])).is_err());
    }
}
