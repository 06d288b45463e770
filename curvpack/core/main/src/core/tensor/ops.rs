//! Tensor math operations: element-wise arithmetic, reductions, matmul, softmax.

use crate::api::error::{TensorError, TensorResult};
use super::tensor::{Tensor, TensorShape};
use smallvec::SmallVec;

/// Check that rhs shape is a valid broadcast suffix of lhs shape.
fn is_valid_broadcast(lhs_shape: &[usize], rhs_shape: &[usize]) -> bool {
    if rhs_shape.len() > lhs_shape.len() {
        return false;
    }
    let offset = lhs_shape.len() - rhs_shape.len();
    rhs_shape
        .iter()
        .enumerate()
        .all(|(i, &r)| r == lhs_shape[offset + i])
}

impl Tensor {
    // ==================== Element-wise binary ops ====================

    /// Combine two tensors element by element.
    ///
    /// `other` must either have the same shape as `self` or be a trailing
    /// suffix of it (e.g. `[V, N, D] op [N, D]`), in which case it is repeated
    /// over the leading dimensions.
    pub fn zip_with<F>(&self, other: &Tensor, f: F) -> TensorResult<Tensor>
    where
        F: Fn(f64, f64) -> f64,
    {
        let lhs = self.data();
        let rhs = other.data();

        if self.shape() == other.shape() {
            let out: Vec<f64> = lhs.iter().zip(rhs.iter()).map(|(&a, &b)| f(a, b)).collect();
            return Ok(Tensor::from_parts(out, self.shape.clone()));
        }

        if rhs.is_empty() || !is_valid_broadcast(self.shape(), other.shape()) {
            return Err(TensorError::BroadcastError {
                shape1: self.shape.to_vec(),
                shape2: other.shape.to_vec(),
            });
        }

        let rhs_len = rhs.len();
        let out: Vec<f64> = lhs
            .iter()
            .enumerate()
            .map(|(i, &a)| f(a, rhs[i % rhs_len]))
            .collect();
        Ok(Tensor::from_parts(out, self.shape.clone()))
    }

    /// Element-wise addition with suffix broadcasting.
    pub fn add(&self, other: &Tensor) -> TensorResult<Tensor> {
        self.zip_with(other, |a, b| a + b)
    }

    /// Element-wise subtraction with suffix broadcasting.
    pub fn sub(&self, other: &Tensor) -> TensorResult<Tensor> {
        self.zip_with(other, |a, b| a - b)
    }

    /// Element-wise multiplication with suffix broadcasting.
    pub fn mul(&self, other: &Tensor) -> TensorResult<Tensor> {
        self.zip_with(other, |a, b| a * b)
    }

    /// Element-wise division with suffix broadcasting.
    pub fn div(&self, other: &Tensor) -> TensorResult<Tensor> {
        self.zip_with(other, |a, b| a / b)
    }

    // ==================== Scalar / unary ops ====================

    /// Apply `f` to every element.
    pub fn map<F>(&self, f: F) -> Tensor
    where
        F: Fn(f64) -> f64,
    {
        let out: Vec<f64> = self.data().iter().map(|&x| f(x)).collect();
        Tensor::from_parts(out, self.shape.clone())
    }

    pub fn add_scalar(&self, scalar: f64) -> Tensor {
        self.map(|x| x + scalar)
    }

    pub fn mul_scalar(&self, scalar: f64) -> Tensor {
        self.map(|x| x * scalar)
    }

    pub fn div_scalar(&self, scalar: f64) -> Tensor {
        self.map(|x| x / scalar)
    }

    pub fn neg(&self) -> Tensor {
        self.map(|x| -x)
    }

    pub fn square(&self) -> Tensor {
        self.map(|x| x * x)
    }

    pub fn sqrt(&self) -> Tensor {
        self.map(f64::sqrt)
    }

    pub fn pow(&self, exp: f64) -> Tensor {
        self.map(|x| x.powf(exp))
    }

    pub fn exp(&self) -> Tensor {
        self.map(f64::exp)
    }

    pub fn ln(&self) -> Tensor {
        self.map(f64::ln)
    }

    pub fn abs(&self) -> Tensor {
        self.map(f64::abs)
    }

    pub fn tanh(&self) -> Tensor {
        self.map(f64::tanh)
    }

    pub fn sigmoid(&self) -> Tensor {
        self.map(|x| 1.0 / (1.0 + (-x).exp()))
    }

    pub fn relu(&self) -> Tensor {
        self.map(|x| x.max(0.0))
    }

    pub fn clamp_min(&self, min: f64) -> Tensor {
        self.map(|x| x.max(min))
    }

    // ==================== Reductions ====================

    pub fn sum_all(&self) -> f64 {
        self.data().iter().sum()
    }

    pub fn mean_all(&self) -> f64 {
        if self.numel() == 0 {
            return 0.0;
        }
        self.sum_all() / self.numel() as f64
    }

    /// Largest absolute value, 0 for an empty tensor.
    pub fn max_abs(&self) -> f64 {
        self.data().iter().fold(0.0f64, |m, &x| m.max(x.abs()))
    }

    /// Smallest value, `+inf` for an empty tensor.
    pub fn min_all(&self) -> f64 {
        self.data().iter().fold(f64::INFINITY, |m, &x| m.min(x))
    }

    /// Sum over `dim`, removing that dimension.
    pub fn sum(&self, dim: i64) -> TensorResult<Tensor> {
        let d = self.normalize_dim(dim)?;
        let outer: usize = self.shape[..d].iter().product();
        let size = self.shape[d];
        let inner: usize = self.shape[d + 1..].iter().product();

        let data = self.data();
        let mut out = vec![0.0; outer * inner];
        for o in 0..outer {
            for s in 0..size {
                let src = &data[(o * size + s) * inner..(o * size + s + 1) * inner];
                let dst = &mut out[o * inner..(o + 1) * inner];
                for (acc, &x) in dst.iter_mut().zip(src.iter()) {
                    *acc += x;
                }
            }
        }

        let mut shape = self.shape.clone();
        shape.remove(d);
        Ok(Tensor::from_parts(out, shape))
    }

    /// Mean over `dim`, removing that dimension.
    pub fn mean(&self, dim: i64) -> TensorResult<Tensor> {
        let d = self.normalize_dim(dim)?;
        let n = self.shape[d] as f64;
        Ok(self.sum(dim)?.div_scalar(n))
    }

    // ==================== Linear algebra ====================

    /// Matrix product of two 2-D tensors: `[m, k] @ [k, n] -> [m, n]`.
    pub fn matmul(&self, other: &Tensor) -> TensorResult<Tensor> {
        if self.ndim() != 2 || other.ndim() != 2 {
            return Err(TensorError::InvalidOperation(format!(
                "matmul expects 2-D operands, got {:?} and {:?}",
                self.shape(),
                other.shape()
            )));
        }
        let (m, k) = (self.shape[0], self.shape[1]);
        let (k2, n) = (other.shape[0], other.shape[1]);
        if k != k2 {
            return Err(TensorError::ShapeMismatch {
                expected: vec![k, n],
                got: vec![k2, n],
            });
        }

        let mut out = vec![0.0; m * n];
        if m == 0 || n == 0 {
            return Ok(Tensor::from_parts(out, SmallVec::from_slice(&[m, n])));
        }

        // Row-major buffers read as column-major are the transposes: C^T = B^T @ A^T.
        let a_t = faer::mat::from_column_major_slice::<f64>(self.data(), k, m);
        let b_t = faer::mat::from_column_major_slice::<f64>(other.data(), n, k);
        let mut c_t = faer::mat::from_column_major_slice_mut::<f64>(&mut out, n, m);
        c_t.copy_from(b_t * a_t);

        Ok(Tensor::from_parts(out, SmallVec::from_slice(&[m, n])))
    }

    /// Transpose of a 2-D tensor.
    pub fn t(&self) -> TensorResult<Tensor> {
        if self.ndim() != 2 {
            return Err(TensorError::InvalidOperation(format!(
                "t() expects a 2-D tensor, got {:?}",
                self.shape()
            )));
        }
        let (rows, cols) = (self.shape[0], self.shape[1]);
        let data = self.data();
        let mut out = vec![0.0; rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                out[c * rows + r] = data[r * cols + c];
            }
        }
        Ok(Tensor::from_parts(out, SmallVec::from_slice(&[cols, rows])))
    }

    /// Swap two leading-side dimensions `dim0` and `dim1` of any tensor.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> TensorResult<Tensor> {
        let ndim = self.ndim();
        if dim0 >= ndim || dim1 >= ndim {
            return Err(TensorError::InvalidDim {
                dim: dim0.max(dim1) as i64,
                ndim,
            });
        }
        if dim0 == dim1 {
            return Ok(self.clone());
        }

        let mut out_shape: TensorShape = self.shape.clone();
        out_shape.swap(dim0, dim1);

        let in_strides = contiguous_strides(self.shape());
        let out_strides = contiguous_strides(&out_shape);
        let data = self.data();
        let mut out = vec![0.0; self.numel()];
        for (out_idx, slot) in out.iter_mut().enumerate() {
            let mut rem = out_idx;
            let mut src = 0;
            for d in 0..ndim {
                let coord = rem / out_strides[d];
                rem %= out_strides[d];
                let src_dim = if d == dim0 {
                    dim1
                } else if d == dim1 {
                    dim0
                } else {
                    d
                };
                src += coord * in_strides[src_dim];
            }
            *slot = data[src];
        }
        Ok(Tensor::from_parts(out, out_shape))
    }

    /// Numerically stable softmax over the last dimension.
    pub fn softmax(&self) -> TensorResult<Tensor> {
        let last = self.dim(-1)?;
        if last == 0 {
            return Ok(self.clone());
        }
        let mut out = self.to_vec();
        for row in out.chunks_mut(last) {
            let max_val = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let mut sum = 0.0;
            for v in row.iter_mut() {
                *v = (*v - max_val).exp();
                sum += *v;
            }
            for v in row.iter_mut() {
                *v /= sum;
            }
        }
        Ok(Tensor::from_parts(out, self.shape.clone()))
    }

    // ==================== Comparison ====================

    /// `|self - other| <= atol + rtol * |other|` element-wise, shapes equal.
    pub fn allclose(&self, other: &Tensor, rtol: f64, atol: f64) -> bool {
        self.shape() == other.shape()
            && self
                .data()
                .iter()
                .zip(other.data().iter())
                .all(|(&a, &b)| (a - b).abs() <= atol + rtol * b.abs())
    }
}

fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}
