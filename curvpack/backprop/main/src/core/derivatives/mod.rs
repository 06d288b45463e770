//! Local derivative operators of the built-in layers.

pub mod conv1d;
pub mod elementwise;
pub mod flatten;
pub mod linear;
pub mod pooling;

use crate::api::error::{CurvError, CurvResult};
use curvpack_core::Tensor;

/// Checks that `mat` is `[V, *expected]` and returns `V`.
pub(crate) fn check_batched(name: &str, mat: &Tensor, expected: &[usize]) -> CurvResult<usize> {
    let shape = mat.shape();
    if shape.len() != expected.len() + 1 || &shape[1..] != expected {
        let mut want = vec![shape.first().copied().unwrap_or(0)];
        want.extend_from_slice(expected);
        return Err(CurvError::ShapeMismatch {
            layer: name.to_string(),
            expected: want,
            got: shape.to_vec(),
        });
    }
    Ok(shape[0])
}

/// Checks that `mat` is square with side `dim`.
pub(crate) fn check_square(name: &str, mat: &Tensor, dim: usize) -> CurvResult<()> {
    if mat.shape() != [dim, dim] {
        return Err(CurvError::ShapeMismatch {
            layer: name.to_string(),
            expected: vec![dim, dim],
            got: mat.shape().to_vec(),
        });
    }
    Ok(())
}

/// `[v, *shape]`.
pub(crate) fn with_leading(v: usize, shape: &[usize]) -> Vec<usize> {
    let mut out = Vec::with_capacity(shape.len() + 1);
    out.push(v);
    out.extend_from_slice(shape);
    out
}
