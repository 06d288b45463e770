//! Dense row-major f64 tensor with Arc-shared storage.

use crate::api::error::{TensorError, TensorResult};
use crate::core::shape::Shape;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// Internal shape type: stack-allocated for <= 4 dims.
pub(crate) type TensorShape = SmallVec<[usize; 4]>;

/// A contiguous multi-dimensional array of `f64`.
///
/// Tensors are immutable once built; every operation returns a new tensor.
/// Cloning only bumps the reference count of the storage.
#[derive(Clone)]
pub struct Tensor {
    pub(crate) data: Arc<Vec<f64>>,
    pub(crate) shape: TensorShape,
}

impl Tensor {
    // ==================== Low-level constructors ====================

    /// Wrap an owned buffer. The caller guarantees `data.len() == numel(shape)`.
    pub(crate) fn from_parts(data: Vec<f64>, shape: TensorShape) -> Self {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>());
        Self {
            data: Arc::new(data),
            shape,
        }
    }

    // ==================== High-level constructors ====================

    /// Create a tensor from a vector with the given shape.
    pub fn from_vec(data: Vec<f64>, shape: impl Into<Shape>) -> TensorResult<Self> {
        let shape = shape.into();
        if data.len() != shape.numel() {
            return Err(TensorError::ShapeMismatch {
                expected: shape.dims().to_vec(),
                got: vec![data.len()],
            });
        }
        Ok(Self::from_parts(data, SmallVec::from_slice(shape.dims())))
    }

    /// Create a 0-dimensional tensor holding one value.
    pub fn scalar(value: f64) -> Self {
        Self::from_parts(vec![value], SmallVec::new())
    }

    /// Create a tensor filled with zeros.
    pub fn zeros(shape: impl Into<Shape>) -> Self {
        Self::full(shape, 0.0)
    }

    /// Create a tensor filled with ones.
    pub fn ones(shape: impl Into<Shape>) -> Self {
        Self::full(shape, 1.0)
    }

    /// Create a tensor filled with a specific value.
    pub fn full(shape: impl Into<Shape>, value: f64) -> Self {
        let shape = shape.into();
        Self::from_parts(vec![value; shape.numel()], SmallVec::from_slice(shape.dims()))
    }

    /// Identity matrix of size `n x n`.
    pub fn eye(n: usize) -> Self {
        let mut data = vec![0.0; n * n];
        for i in 0..n {
            data[i * n + i] = 1.0;
        }
        Self::from_parts(data, SmallVec::from_slice(&[n, n]))
    }

    /// Standard-normal samples from the thread-local RNG.
    pub fn randn(shape: impl Into<Shape>) -> Self {
        Self::randn_with(shape, &mut rand::thread_rng())
    }

    /// Standard-normal samples from the given RNG.
    pub fn randn_with<R: Rng + ?Sized>(shape: impl Into<Shape>, rng: &mut R) -> Self {
        let shape = shape.into();
        let data: Vec<f64> = (0..shape.numel())
            .map(|_| StandardNormal.sample(rng))
            .collect();
        Self::from_parts(data, SmallVec::from_slice(shape.dims()))
    }

    /// Uniform samples in `[low, high)` from the given RNG.
    pub fn uniform_with<R: Rng + ?Sized>(
        shape: impl Into<Shape>,
        low: f64,
        high: f64,
        rng: &mut R,
    ) -> Self {
        let shape = shape.into();
        let data: Vec<f64> = (0..shape.numel()).map(|_| rng.gen_range(low..high)).collect();
        Self::from_parts(data, SmallVec::from_slice(shape.dims()))
    }

    // ==================== Accessors ====================

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Size of dimension `dim`; negative values count from the end.
    pub fn dim(&self, dim: i64) -> TensorResult<usize> {
        let d = self.normalize_dim(dim)?;
        Ok(self.shape[d])
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.data.as_ref().clone()
    }

    /// Value of a tensor with exactly one element.
    pub fn item(&self) -> TensorResult<f64> {
        if self.data.len() != 1 {
            return Err(TensorError::ShapeMismatch {
                expected: vec![1],
                got: self.shape.to_vec(),
            });
        }
        Ok(self.data[0])
    }

    // ==================== Shape manipulation ====================

    /// View the data with a new shape. Element count must not change.
    pub fn reshape(&self, shape: &[usize]) -> TensorResult<Tensor> {
        let numel: usize = shape.iter().product();
        if numel != self.numel() {
            return Err(TensorError::ShapeMismatch {
                expected: shape.to_vec(),
                got: self.shape.to_vec(),
            });
        }
        Ok(Self {
            data: Arc::clone(&self.data),
            shape: SmallVec::from_slice(shape),
        })
    }

    /// Insert a dimension of size 1 at `dim` (0..=ndim).
    pub fn unsqueeze(&self, dim: usize) -> TensorResult<Tensor> {
        if dim > self.ndim() {
            return Err(TensorError::InvalidDim {
                dim: dim as i64,
                ndim: self.ndim(),
            });
        }
        let mut shape = self.shape.clone();
        shape.insert(dim, 1);
        Ok(Self {
            data: Arc::clone(&self.data),
            shape,
        })
    }

    /// Remove a dimension of size 1.
    pub fn squeeze(&self, dim: usize) -> TensorResult<Tensor> {
        if dim >= self.ndim() {
            return Err(TensorError::InvalidDim {
                dim: dim as i64,
                ndim: self.ndim(),
            });
        }
        if self.shape[dim] != 1 {
            return Err(TensorError::InvalidOperation(format!(
                "cannot squeeze dimension {} of size {}",
                dim, self.shape[dim]
            )));
        }
        let mut shape = self.shape.clone();
        shape.remove(dim);
        Ok(Self {
            data: Arc::clone(&self.data),
            shape,
        })
    }

    /// Collapse all dimensions from `start` onwards into one.
    pub fn flatten_from(&self, start: usize) -> TensorResult<Tensor> {
        if start > self.ndim() {
            return Err(TensorError::InvalidDim {
                dim: start as i64,
                ndim: self.ndim(),
            });
        }
        let mut shape: Vec<usize> = self.shape[..start].to_vec();
        shape.push(self.shape[start..].iter().product());
        self.reshape(&shape)
    }

    // ==================== Indexing ====================

    /// Select index `index` along the leading dimension, dropping that dimension.
    pub fn select(&self, index: usize) -> TensorResult<Tensor> {
        if self.ndim() == 0 {
            return Err(TensorError::InvalidDim { dim: 0, ndim: 0 });
        }
        let size = self.shape[0];
        if index >= size {
            return Err(TensorError::IndexOutOfBounds {
                dim: 0,
                index,
                size,
            });
        }
        let inner: usize = self.shape[1..].iter().product();
        let data = self.data[index * inner..(index + 1) * inner].to_vec();
        Ok(Self::from_parts(data, SmallVec::from_slice(&self.shape[1..])))
    }

    /// Rows `start..start + len` of the leading dimension.
    pub fn narrow(&self, start: usize, len: usize) -> TensorResult<Tensor> {
        if self.ndim() == 0 {
            return Err(TensorError::InvalidDim { dim: 0, ndim: 0 });
        }
        let size = self.shape[0];
        if start + len > size {
            return Err(TensorError::IndexOutOfBounds {
                dim: 0,
                index: start + len,
                size,
            });
        }
        let inner: usize = self.shape[1..].iter().product();
        let data = self.data[start * inner..(start + len) * inner].to_vec();
        let mut shape = self.shape.clone();
        shape[0] = len;
        Ok(Self::from_parts(data, shape))
    }

    /// Stack equally shaped tensors along a new leading dimension.
    pub fn stack(tensors: &[&Tensor]) -> TensorResult<Tensor> {
        let first = tensors.first().ok_or_else(|| {
            TensorError::InvalidOperation("stack requires at least one tensor".into())
        })?;
        let mut data = Vec::with_capacity(first.numel() * tensors.len());
        for t in tensors {
            if t.shape() != first.shape() {
                return Err(TensorError::ShapeMismatch {
                    expected: first.shape.to_vec(),
                    got: t.shape.to_vec(),
                });
            }
            data.extend_from_slice(t.data());
        }
        let mut shape: TensorShape = SmallVec::from_slice(&[tensors.len()]);
        shape.extend_from_slice(first.shape());
        Ok(Self::from_parts(data, shape))
    }

    /// Concatenate along the leading dimension. Trailing dims must agree.
    pub fn cat(tensors: &[&Tensor]) -> TensorResult<Tensor> {
        let first = tensors.first().ok_or_else(|| {
            TensorError::InvalidOperation("cat requires at least one tensor".into())
        })?;
        if first.ndim() == 0 {
            return Err(TensorError::InvalidDim { dim: 0, ndim: 0 });
        }
        let mut leading = 0;
        let mut data = Vec::new();
        for t in tensors {
            if t.ndim() == 0 || t.shape[1..] != first.shape[1..] {
                return Err(TensorError::ShapeMismatch {
                    expected: first.shape.to_vec(),
                    got: t.shape.to_vec(),
                });
            }
            leading += t.shape[0];
            data.extend_from_slice(t.data());
        }
        let mut shape = first.shape.clone();
        shape[0] = leading;
        Ok(Self::from_parts(data, shape))
    }

    // ==================== Helpers ====================

    pub(crate) fn normalize_dim(&self, dim: i64) -> TensorResult<usize> {
        let ndim = self.ndim() as i64;
        let d = if dim < 0 { dim + ndim } else { dim };
        if d < 0 || d >= ndim {
            return Err(TensorError::InvalidDim {
                dim,
                ndim: self.ndim(),
            });
        }
        Ok(d as usize)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const PREVIEW: usize = 8;
        let shown: Vec<f64> = self.data.iter().take(PREVIEW).copied().collect();
        let ellipsis = if self.numel() > PREVIEW { ", .." } else { "" };
        write!(
            f,
            "Tensor(shape={:?}, data={:?}{})",
            self.shape.as_slice(),
            shown,
            ellipsis
        )
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && self.data == other.data
    }
}
