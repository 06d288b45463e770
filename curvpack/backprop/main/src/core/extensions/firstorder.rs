//! Statistics of the per-example gradients. These read the plain gradient at
//! each layer output and never carry a signal of their own.

use super::{BackpropExtension, LayerStep, LossInput, Signal, StepOutput};
use crate::api::config::ExtensionKind;
use crate::api::error::{CurvError, CurvResult};
use crate::api::results::{Annotation, Quantity};
use curvpack_core::Tensor;

/// `sum_sq/N - (sum/N)²`, element-wise: the biased (population) variance.
pub(crate) fn variance_from(sum: &Tensor, sum_sq: &Tensor, n: usize) -> CurvResult<Tensor> {
    let n = n as f64;
    Ok(sum_sq.zip_with(sum, |sq, s| sq / n - (s / n) * (s / n))?)
}

pub(crate) struct FirstOrder {
    kind: ExtensionKind,
}

impl FirstOrder {
    pub(crate) fn new(kind: ExtensionKind) -> Self {
        Self { kind }
    }
}

impl BackpropExtension for FirstOrder {
    fn kind(&self) -> ExtensionKind {
        self.kind
    }

    fn initial_signal(&self, _loss: &LossInput<'_>) -> CurvResult<Option<Signal>> {
        Ok(None)
    }

    fn layer_step(&self, step: &LayerStep<'_>, _signal: Option<Signal>) -> CurvResult<StepOutput> {
        let mut out = StepOutput::default();
        let params = step.module.parameters();
        if params.is_empty() {
            return Ok(out);
        }
        // the gradient as a single propagated vector: [1, N, *out]
        let mat = step.grad_output.unsqueeze(0)?;
        for param in params {
            // [N, *param]
            let batch = step
                .derivatives
                .param_jac_t_mat_prod(param.slot(), &mat, false)?
                .squeeze(0)?;
            let value = match self.kind {
                ExtensionKind::BatchGrad => (Quantity::GradBatch, batch),
                ExtensionKind::BatchL2Grad => {
                    (Quantity::BatchL2, batch.square().flatten_from(1)?.sum(1)?)
                }
                ExtensionKind::SumGradSquared => (Quantity::SumGradSquared, batch.square().sum(0)?),
                ExtensionKind::Variance => {
                    let sum = batch.sum(0)?;
                    let sum_sq = batch.square().sum(0)?;
                    (
                        Quantity::Variance,
                        variance_from(&sum, &sum_sq, step.batch_size())?,
                    )
                }
                other => {
                    return Err(CurvError::InvalidConfig(format!(
                        "{} is not a first-order extension",
                        other
                    )))
                }
            };
            out.annotate(param.id(), value.0, Annotation::Tensor(value.1));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variance_is_population_estimator() {
        // samples 1, 3 -> mean 2, population variance 1 (sample variance would be 2)
        let sum = Tensor::from_vec(vec![4.0], [1]).unwrap();
        let sum_sq = Tensor::from_vec(vec![10.0], [1]).unwrap();
        let v = variance_from(&sum, &sum_sq, 2).unwrap();
        assert_eq!(v.to_vec(), vec![1.0]);
    }
}
