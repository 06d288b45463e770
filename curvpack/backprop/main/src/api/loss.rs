use crate::api::error::CurvResult;
use curvpack_core::Tensor;
use std::ops::Range;

/// How per-example losses are combined into the scalar objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reduction {
    #[default]
    Mean,
    Sum,
}

/// A scalar loss over batched predictions `[N, C]`.
///
/// Besides value and gradient, a loss exposes factorisations of its Hessian
/// with respect to the predictions. A factor `S` of shape `[V, N, C]` satisfies
/// `Σ_v S[v, n] S[v, n]ᵀ = ∂²L/∂f_n²` for each example `n`, including the
/// reduction's scaling.
pub trait Loss: Send + Sync {
    fn name(&self) -> &str;

    fn forward(&self, predictions: &Tensor, targets: &Tensor) -> CurvResult<f64>;

    /// `∂L/∂f`, shape `[N, C]`.
    fn gradient(&self, predictions: &Tensor, targets: &Tensor) -> CurvResult<Tensor>;

    /// Exact symmetric factor of the per-example Hessian, shape `[C, N, C]`.
    fn sqrt_hessian(&self, predictions: &Tensor, targets: &Tensor) -> CurvResult<Tensor>;

    /// Monte-Carlo factor from sample indices `samples`, shape `[len, N, C]`.
    ///
    /// Each column is the loss gradient for a label drawn from the model's
    /// predictive distribution, so that `E[s sᵀ]` equals the exact per-example
    /// Hessian. Columns are not averaged; sample `m` draws from the stream
    /// `sample_rng(seed, m)` so a sample is identical in every chunking.
    fn sqrt_hessian_sampled(
        &self,
        predictions: &Tensor,
        targets: &Tensor,
        samples: Range<usize>,
        seed: u64,
    ) -> CurvResult<Tensor>;

    /// `Σ_n ∂²L/∂f_n²`, shape `[C, C]`.
    fn sum_hessian(&self, predictions: &Tensor, targets: &Tensor) -> CurvResult<Tensor>;
}
