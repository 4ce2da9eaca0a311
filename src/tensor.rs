//! Tensor Operations
//!
//! This module provides the minimal dense tensor the attention code is written
//! against. Tensors store multi-dimensional arrays with shape and stride
//! information for indexing.
//!
//! ## Core Concepts
//!
//! - **Data**: Flat `Vec<f32>` storing all elements in row-major order
//! - **Shape**: Dimensions of the tensor (e.g., `[features, time, batch]`)
//! - **Strides**: Step sizes for each dimension to compute flat indices
//! - **Views**: [`TensorView`] and [`TensorViewMut`] borrow a range of a larger
//!   buffer (a parameter or gradient buffer) and give it a shape without
//!   copying
//!
//! Row-major order is the only element order. `reshape` never reorders data;
//! `permute` is the one operation that moves elements, and applying the
//! inverse permutation restores the original tensor exactly.
//!
//! ## Example
//!
//! ```rust
//! use additive_attention::Tensor;
//!
//! let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
//! let w = Tensor::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![3, 2]);
//! let y = x.matmul(&w);
//! assert_eq!(y.shape, vec![2, 2]);
//! ```
//!
//! ## Performance
//!
//! Matrix multiplication switches to a parallel cache-blocked kernel (Rayon)
//! once the work exceeds a small threshold, and element-wise operations
//! iterate in parallel.

use crate::error::{AttentionError, Result};
use rayon::prelude::*;

/// A multi-dimensional array for neural network computations
///
/// # Memory Layout
///
/// For shape `[2, 3]`, data is stored as:
/// `[row0_col0, row0_col1, row0_col2, row1_col0, row1_col1, row1_col2]`
/// and the strides are `[3, 1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    /// Flat storage of all tensor elements
    pub data: Vec<f32>,
    /// Shape of the tensor (dimensions)
    pub shape: Vec<usize>,
    /// Strides for each dimension (computed from shape)
    pub strides: Vec<usize>,
}

impl Tensor {
    /// Create a new tensor with given data and shape
    ///
    /// # Panics
    ///
    /// Panics if the product of shape dimensions doesn't equal data length.
    /// Use [`Tensor::try_new`] for caller-supplied data.
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        let expected_size: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_size,
            "Data length ({}) doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected_size
        );

        let strides = Self::compute_strides(&shape);
        Self {
            data,
            shape,
            strides,
        }
    }

    /// Fallible constructor for data coming from outside the crate
    ///
    /// ```rust
    /// # use additive_attention::Tensor;
    /// assert!(Tensor::try_new(vec![1.0, 2.0, 3.0], vec![2, 2]).is_err());
    /// ```
    pub fn try_new(data: Vec<f32>, shape: Vec<usize>) -> Result<Self> {
        let expected_size: usize = shape.iter().product();
        if data.len() != expected_size {
            return Err(AttentionError::ShapeMismatch {
                context: "tensor data",
                expected: vec![expected_size],
                actual: vec![data.len()],
            });
        }
        Ok(Self::new(data, shape))
    }

    /// Create a tensor filled with zeros
    pub fn zeros(shape: Vec<usize>) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![0.0; size], shape)
    }

    /// Create a tensor filled with a constant
    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![value; size], shape)
    }

    /// Compute strides from shape (row-major layout)
    ///
    /// For shape `[d0, d1, d2]`, strides are `[d1*d2, d2, 1]`
    fn compute_strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrow the whole tensor as a view
    pub fn view(&self) -> TensorView<'_> {
        TensorView {
            data: &self.data,
            shape: self.shape.clone(),
        }
    }

    /// Borrow the whole tensor as a mutable view
    pub fn view_mut(&mut self) -> TensorViewMut<'_> {
        TensorViewMut {
            data: &mut self.data,
            shape: self.shape.clone(),
        }
    }

    /// 2D matrix multiplication
    ///
    /// For `A @ B` where `A` is `[m, k]` and `B` is `[k, n]` the result is
    /// `[m, n]` with `C[i,j] = sum(A[i,l] * B[l,j])`.
    ///
    /// # Panics
    ///
    /// Panics if either operand is not 2D or the inner dimensions differ.
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        self.view().matmul(&other.view())
    }

    /// 2D transpose
    ///
    /// # Panics
    ///
    /// Panics if the tensor is not 2D.
    pub fn transpose(&self) -> Tensor {
        self.view().transpose()
    }

    /// Reorder axes
    ///
    /// Output axis `k` is input axis `axes[k]`. For a `[batch, features, time]`
    /// tensor, `permute(&[1, 2, 0])` gives `[features, time, batch]`, and
    /// `permute(&[2, 0, 1])` takes it back.
    ///
    /// # Panics
    ///
    /// Panics if `axes` is not a permutation of `0..rank`.
    ///
    /// ```rust
    /// # use additive_attention::Tensor;
    /// let x = Tensor::new((0..6).map(|v| v as f32).collect(), vec![1, 2, 3]);
    /// let y = x.permute(&[1, 2, 0]);
    /// assert_eq!(y.shape, vec![2, 3, 1]);
    /// assert_eq!(y.permute(&[2, 0, 1]), x);
    /// ```
    pub fn permute(&self, axes: &[usize]) -> Tensor {
        let rank = self.shape.len();
        assert_eq!(axes.len(), rank, "permute needs one axis per dimension");
        let mut seen = vec![false; rank];
        for &axis in axes {
            assert!(axis < rank && !seen[axis], "invalid permutation {:?}", axes);
            seen[axis] = true;
        }

        let new_shape: Vec<usize> = axes.iter().map(|&a| self.shape[a]).collect();
        let new_strides = Self::compute_strides(&new_shape);
        // Stride in the source for each output axis
        let src_strides: Vec<usize> = axes.iter().map(|&a| self.strides[a]).collect();

        let result: Vec<f32> = (0..self.data.len())
            .into_par_iter()
            .map(|i| {
                let mut remaining = i;
                let mut src = 0;
                for (stride, src_stride) in new_strides.iter().zip(&src_strides) {
                    let coord = remaining / stride;
                    remaining %= stride;
                    src += coord * src_stride;
                }
                self.data[src]
            })
            .collect();

        Tensor::new(result, new_shape)
    }

    /// Reshape tensor to new shape (element order unchanged)
    ///
    /// # Panics
    ///
    /// Panics if the element count changes.
    pub fn reshape(&self, new_shape: &[usize]) -> Tensor {
        self.clone().into_shape(new_shape)
    }

    /// Reshape without copying the data
    pub fn into_shape(self, new_shape: &[usize]) -> Tensor {
        let new_size: usize = new_shape.iter().product();
        assert_eq!(
            self.data.len(),
            new_size,
            "Cannot reshape {:?} to {:?}: element count mismatch",
            self.shape,
            new_shape
        );
        Tensor::new(self.data, new_shape.to_vec())
    }

    /// Element-wise addition of a same-shaped tensor
    pub fn add(&self, other: &Tensor) -> Tensor {
        assert_eq!(self.shape, other.shape, "Shapes must match for addition");
        let result = self
            .data
            .par_iter()
            .zip(&other.data)
            .map(|(a, b)| a + b)
            .collect();
        Tensor::new(result, self.shape.clone())
    }

    /// Multiply all elements by scalar
    pub fn mul_scalar(&self, scalar: f32) -> Tensor {
        let result = self.data.par_iter().map(|&x| x * scalar).collect();
        Tensor::new(result, self.shape.clone())
    }

    /// Sum of element-wise products with a same-shaped tensor
    ///
    /// Handy as a scalar "loss" when testing gradients: the gradient of
    /// `x.dot(g)` with respect to `x` is `g`.
    pub fn dot(&self, other: &Tensor) -> f32 {
        assert_eq!(self.shape, other.shape, "Shapes must match for dot");
        self.data
            .par_iter()
            .zip(&other.data)
            .map(|(a, b)| a * b)
            .sum()
    }
}

/// Read-only shaped window into a flat buffer
#[derive(Clone, Debug)]
pub struct TensorView<'a> {
    pub data: &'a [f32],
    pub shape: Vec<usize>,
}

impl<'a> TensorView<'a> {
    /// Wrap a slice with a shape
    ///
    /// # Panics
    ///
    /// Panics if the slice length doesn't match the shape.
    pub fn new(data: &'a [f32], shape: Vec<usize>) -> Self {
        assert_eq!(
            data.len(),
            shape.iter().product::<usize>(),
            "View of {} elements can't have shape {:?}",
            data.len(),
            shape
        );
        Self { data, shape }
    }

    /// 2D matrix multiplication, same semantics as [`Tensor::matmul`]
    pub fn matmul(&self, other: &TensorView<'_>) -> Tensor {
        assert!(
            self.shape.len() == 2 && other.shape.len() == 2,
            "Unsupported matmul shapes: {:?} @ {:?}",
            self.shape,
            other.shape
        );
        assert_eq!(
            self.shape[1], other.shape[0],
            "Matrix dimensions incompatible: [{}, {}] @ [{}, {}]",
            self.shape[0], self.shape[1], other.shape[0], other.shape[1]
        );

        let m = self.shape[0];
        let k = self.shape[1];
        let n = other.shape[1];

        // Parallel version only pays off past ~1000 multiply-adds
        if m * n * k >= 1_000 {
            return Tensor::new(matmul_parallel_blocked(self.data, other.data, m, n, k), vec![m, n]);
        }

        let mut result = vec![0.0; m * n];
        for i in 0..m {
            for l in 0..k {
                let a_val = self.data[i * k + l];
                matmul_inner_simd(a_val, &other.data[l * n..(l + 1) * n], &mut result[i * n..(i + 1) * n]);
            }
        }
        Tensor::new(result, vec![m, n])
    }

    /// 2D transpose into an owned tensor
    pub fn transpose(&self) -> Tensor {
        assert_eq!(self.shape.len(), 2, "transpose expects a 2D tensor, got {:?}", self.shape);
        let rows = self.shape[0];
        let cols = self.shape[1];
        let mut result = vec![0.0; rows * cols];
        for i in 0..rows {
            for j in 0..cols {
                result[j * rows + i] = self.data[i * cols + j];
            }
        }
        Tensor::new(result, vec![cols, rows])
    }
}

/// Mutable shaped window into a flat buffer
#[derive(Debug)]
pub struct TensorViewMut<'a> {
    pub data: &'a mut [f32],
    pub shape: Vec<usize>,
}

impl<'a> TensorViewMut<'a> {
    /// Wrap a mutable slice with a shape
    ///
    /// # Panics
    ///
    /// Panics if the slice length doesn't match the shape.
    pub fn new(data: &'a mut [f32], shape: Vec<usize>) -> Self {
        assert_eq!(
            data.len(),
            shape.iter().product::<usize>(),
            "View of {} elements can't have shape {:?}",
            data.len(),
            shape
        );
        Self { data, shape }
    }

    /// Shorter-lived mutable view of the same elements
    pub fn reborrow(&mut self) -> TensorViewMut<'_> {
        TensorViewMut {
            data: &mut *self.data,
            shape: self.shape.clone(),
        }
    }

    /// Overwrite every element with `value`
    pub fn fill(&mut self, value: f32) {
        self.data.iter_mut().for_each(|x| *x = value);
    }

    /// `self += other`, element-wise
    pub fn add_assign(&mut self, other: &Tensor) {
        assert_eq!(self.shape, other.shape, "Shapes must match for accumulation");
        self.data
            .par_iter_mut()
            .zip(&other.data)
            .for_each(|(dst, src)| *dst += src);
    }
}

/// Computes `result[j] += a_val * b[j]`; written so LLVM auto-vectorizes it
#[inline(always)]
fn matmul_inner_simd(a_val: f32, b: &[f32], result: &mut [f32]) {
    for (r, &b_val) in result.iter_mut().zip(b.iter()) {
        *r += a_val * b_val;
    }
}

/// Parallel cache-blocked matrix multiplication
///
/// Works on 8×8 blocks so the operands of the inner loops stay in L1, and
/// hands each block of output rows to a separate Rayon task.
fn matmul_parallel_blocked(a: &[f32], b: &[f32], m: usize, n: usize, k: usize) -> Vec<f32> {
    const BLOCK_SIZE: usize = 8;

    let mut result = vec![0.0; m * n];
    if n == 0 {
        return result;
    }

    result
        .par_chunks_mut(BLOCK_SIZE * n)
        .enumerate()
        .for_each(|(block_i, result_block)| {
            let i_start = block_i * BLOCK_SIZE;
            let i_end = (i_start + BLOCK_SIZE).min(m);

            for j_start in (0..n).step_by(BLOCK_SIZE) {
                let j_end = (j_start + BLOCK_SIZE).min(n);

                for k_start in (0..k).step_by(BLOCK_SIZE) {
                    let k_end = (k_start + BLOCK_SIZE).min(k);

                    for i in i_start..i_end {
                        let row_offset = (i - i_start) * n;
                        for k_idx in k_start..k_end {
                            matmul_inner_simd(
                                a[i * k + k_idx],
                                &b[k_idx * n + j_start..k_idx * n + j_end],
                                &mut result_block[row_offset + j_start..row_offset + j_end],
                            );
                        }
                    }
                }
            }
        });

    result
}
