use super::{check_inputs, sample_rng};
use crate::api::error::CurvResult;
use crate::api::loss::{Loss, Reduction};
use curvpack_core::Tensor;
use std::ops::Range;

/// Squared error `Σ (f - y)²`, divided by `N * C` under [`Reduction::Mean`].
///
/// The Hessian with respect to each example's predictions is `2/d · I`
/// (`d` the divisor), so every factor is a scaled identity or a scaled
/// standard-normal draw.
#[derive(Debug, Clone, Copy, Default)]
pub struct MSELoss {
    reduction: Reduction,
}

impl MSELoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reduction(reduction: Reduction) -> Self {
        Self { reduction }
    }

    fn divisor(&self, n: usize, c: usize) -> f64 {
        match self.reduction {
            Reduction::Mean => (n * c) as f64,
            Reduction::Sum => 1.0,
        }
    }
}

impl Loss for MSELoss {
    fn name(&self) -> &str {
        "MSELoss"
    }

    fn forward(&self, predictions: &Tensor, targets: &Tensor) -> CurvResult<f64> {
        let (n, c) = check_inputs(self.name(), predictions, targets)?;
        let diff = predictions.sub(targets)?;
        Ok(diff.square().sum_all() / self.divisor(n, c))
    }

    fn gradient(&self, predictions: &Tensor, targets: &Tensor) -> CurvResult<Tensor> {
        let (n, c) = check_inputs(self.name(), predictions, targets)?;
        // d(MSE)/d(pred) = 2 * (pred - target) / d
        Ok(predictions.sub(targets)?.mul_scalar(2.0 / self.divisor(n, c)))
    }

    fn sqrt_hessian(&self, predictions: &Tensor, targets: &Tensor) -> CurvResult<Tensor> {
        let (n, c) = check_inputs(self.name(), predictions, targets)?;
        let scale = (2.0 / self.divisor(n, c)).sqrt();
        let mut data = vec![0.0; c * n * c];
        for v in 0..c {
            for ex in 0..n {
                data[(v * n + ex) * c + v] = scale;
            }
        }
        Ok(Tensor::from_vec(data, [c, n, c])?)
    }

    fn sqrt_hessian_sampled(
        &self,
        predictions: &Tensor,
        targets: &Tensor,
        samples: Range<usize>,
        seed: u64,
    ) -> CurvResult<Tensor> {
        let (n, c) = check_inputs(self.name(), predictions, targets)?;
        let scale = (2.0 / self.divisor(n, c)).sqrt();
        let count = samples.len();
        let mut columns = Vec::with_capacity(count * n * c);
        for m in samples {
            let draw = Tensor::randn_with([n, c], &mut sample_rng(seed, m));
            columns.extend(draw.mul_scalar(scale).to_vec());
        }
        Ok(Tensor::from_vec(columns, [count, n, c])?)
    }

    fn sum_hessian(&self, predictions: &Tensor, targets: &Tensor) -> CurvResult<Tensor> {
        let (n, c) = check_inputs(self.name(), predictions, targets)?;
        Ok(Tensor::eye(c).mul_scalar(2.0 * n as f64 / self.divisor(n, c)))
    }
}
