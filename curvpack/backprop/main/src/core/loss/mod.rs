pub mod cross_entropy;
pub mod mse;

use crate::api::error::{CurvError, CurvResult};
use curvpack_core::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;

const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

/// Random stream of Monte-Carlo sample `index` under `seed`.
///
/// Sample `m` always draws from the same stream, whichever chunk it falls in.
pub fn sample_rng(seed: u64, index: usize) -> StdRng {
    StdRng::seed_from_u64(seed ^ (index as u64).wrapping_add(1).wrapping_mul(GOLDEN_GAMMA))
}

/// Predictions and targets must both be `[N, C]`; returns `(N, C)`.
pub(crate) fn check_inputs(loss: &str, predictions: &Tensor, targets: &Tensor) -> CurvResult<(usize, usize)> {
    if predictions.ndim() != 2 {
        return Err(CurvError::ShapeMismatch {
            layer: loss.to_string(),
            expected: vec![predictions.shape().first().copied().unwrap_or(0), 0],
            got: predictions.shape().to_vec(),
        });
    }
    if targets.shape() != predictions.shape() {
        return Err(CurvError::ShapeMismatch {
            layer: loss.to_string(),
            expected: predictions.shape().to_vec(),
            got: targets.shape().to_vec(),
        });
    }
    Ok((predictions.shape()[0], predictions.shape()[1]))
}
