//! Diagonal of the generalized Gauss-Newton matrix, exact or Monte-Carlo.

use super::{require_signal, BackpropExtension, LayerStep, LossInput, Signal, StepOutput};
use crate::api::config::ExtensionKind;
use crate::api::error::{CurvError, CurvResult};
use crate::api::results::{Annotation, Quantity};
use std::ops::Range;

/// Where the loss-side curvature factor comes from.
#[derive(Debug, Clone)]
pub(crate) enum FactorSource {
    /// Symmetric factorisation of the loss Hessian.
    Exact,
    /// Label samples `range` drawn from the model's predictive distribution.
    /// The group mean is scaled by `weight` (group size over total samples).
    Sampled {
        range: Range<usize>,
        seed: u64,
        weight: f64,
    },
}

pub(crate) struct DiagGgn {
    source: FactorSource,
    batched: bool,
}

impl DiagGgn {
    pub(crate) fn exact(batched: bool) -> Self {
        Self {
            source: FactorSource::Exact,
            batched,
        }
    }

    pub(crate) fn sampled(range: Range<usize>, seed: u64, weight: f64, batched: bool) -> Self {
        Self {
            source: FactorSource::Sampled {
                range,
                seed,
                weight,
            },
            batched,
        }
    }

    fn quantity(&self) -> Quantity {
        match (&self.source, self.batched) {
            (FactorSource::Exact, false) => Quantity::DiagGgnExact,
            (FactorSource::Exact, true) => Quantity::DiagGgnExactBatch,
            (FactorSource::Sampled { .. }, false) => Quantity::DiagGgnMc,
            (FactorSource::Sampled { .. }, true) => Quantity::DiagGgnMcBatch,
        }
    }

    fn weight(&self) -> f64 {
        match &self.source {
            FactorSource::Exact => 1.0,
            FactorSource::Sampled { weight, .. } => *weight,
        }
    }
}

impl BackpropExtension for DiagGgn {
    fn kind(&self) -> ExtensionKind {
        match (&self.source, self.batched) {
            (FactorSource::Exact, false) => ExtensionKind::DiagGGNExact,
            (FactorSource::Exact, true) => ExtensionKind::BatchDiagGGNExact,
            (FactorSource::Sampled { .. }, false) => ExtensionKind::DiagGGNMC,
            (FactorSource::Sampled { .. }, true) => ExtensionKind::BatchDiagGGNMC,
        }
    }

    fn initial_signal(&self, input: &LossInput<'_>) -> CurvResult<Option<Signal>> {
        let factor = match &self.source {
            FactorSource::Exact => input.loss.sqrt_hessian(input.predictions, input.targets)?,
            FactorSource::Sampled { range, seed, .. } => {
                if range.is_empty() {
                    return Err(CurvError::InvalidSampling("empty sample group".into()));
                }
                input
                    .loss
                    .sqrt_hessian_sampled(input.predictions, input.targets, range.clone(), *seed)?
                    .div_scalar((range.len() as f64).sqrt())
            }
        };
        Ok(Some(Signal::Factor(factor)))
    }

    fn layer_step(&self, step: &LayerStep<'_>, signal: Option<Signal>) -> CurvResult<StepOutput> {
        let factor = match require_signal(step, signal)? {
            Signal::Factor(f) => f,
            _ => {
                return Err(CurvError::GraphError(format!(
                    "diagonal GGN expected a curvature factor at {}",
                    step.label
                )))
            }
        };
        let mut out = StepOutput::default();
        for param in step.module.parameters() {
            let diag = step
                .derivatives
                .param_squared_jac_t_sum(param.slot(), &factor, !self.batched)?;
            let diag = if self.weight() == 1.0 {
                diag
            } else {
                diag.mul_scalar(self.weight())
            };
            out.annotate(param.id(), self.quantity(), Annotation::Tensor(diag));
        }
        if step.propagate {
            out.signal = Some(Signal::Factor(step.derivatives.jac_t_mat_prod(&factor)?));
        }
        Ok(out)
    }
}
