//! Exact diagonal of the Hessian.
//!
//! Alongside the GGN factor the signal carries one factor per layer with a
//! non-zero second derivative. A layer's residual `Σ_c g_c ∂²out_c/∂in²` is
//! diagonal for every built-in layer; it is split into its positive and
//! negative parts, each written as a diagonal square-root factor, and
//! backpropagated like the GGN factor. At a parameter the diagonal is the
//! GGN term plus the signed residual terms.

use super::{
    require_signal, BackpropExtension, LayerStep, LossInput, Residual, Sign, Signal, StepOutput,
};
use crate::api::config::ExtensionKind;
use crate::api::error::{CurvError, CurvResult};
use crate::api::results::{Annotation, Quantity};
use curvpack_core::Tensor;

pub(crate) struct DiagHessian {
    batched: bool,
}

impl DiagHessian {
    pub(crate) fn new(batched: bool) -> Self {
        Self { batched }
    }
}

/// `[N, *f] -> [D, N, *f]` with `out[d, n, d'] = δ_dd' values[n, d]`, so that
/// `Σ_d out[d, n] out[d, n]ᵀ = diag(values[n])²`.
pub(crate) fn diagonal_factor(values: &Tensor) -> CurvResult<Tensor> {
    let shape = values.shape();
    let n = shape[0];
    let d: usize = shape[1..].iter().product();
    let src = values.data();
    let mut data = vec![0.0; d * n * d];
    for col in 0..d {
        for ex in 0..n {
            data[(col * n + ex) * d + col] = src[ex * d + col];
        }
    }
    let mut out_shape = vec![d];
    out_shape.extend_from_slice(shape);
    Ok(Tensor::from_vec(data, out_shape)?)
}

impl BackpropExtension for DiagHessian {
    fn kind(&self) -> ExtensionKind {
        if self.batched {
            ExtensionKind::BatchDiagHessian
        } else {
            ExtensionKind::DiagHessian
        }
    }

    fn initial_signal(&self, input: &LossInput<'_>) -> CurvResult<Option<Signal>> {
        Ok(Some(Signal::Hessian {
            ggn: input.loss.sqrt_hessian(input.predictions, input.targets)?,
            residuals: Vec::new(),
        }))
    }

    fn layer_step(&self, step: &LayerStep<'_>, signal: Option<Signal>) -> CurvResult<StepOutput> {
        let (ggn, residuals) = match require_signal(step, signal)? {
            Signal::Hessian { ggn, residuals } => (ggn, residuals),
            _ => {
                return Err(CurvError::GraphError(format!(
                    "diagonal Hessian expected a Hessian signal at {}",
                    step.label
                )))
            }
        };
        let derivs = step.derivatives;
        let quantity = if self.batched {
            Quantity::DiagHBatch
        } else {
            Quantity::DiagH
        };

        let mut out = StepOutput::default();
        for param in step.module.parameters() {
            let mut diag = derivs.param_squared_jac_t_sum(param.slot(), &ggn, !self.batched)?;
            for r in &residuals {
                let term = derivs.param_squared_jac_t_sum(param.slot(), &r.factor, !self.batched)?;
                diag = diag.zip_with(&term, |a, b| a + r.sign.value() * b)?;
            }
            out.annotate(param.id(), quantity, Annotation::Tensor(diag));
        }

        if !step.propagate {
            return Ok(out);
        }
        let mut next = Vec::with_capacity(residuals.len() + 2);
        for r in &residuals {
            next.push(Residual {
                origin: r.origin,
                sign: r.sign,
                factor: derivs.jac_t_mat_prod(&r.factor)?,
            });
        }
        if !derivs.hessian_is_zero() {
            let local = derivs.hessian_diagonal(step.grad_output)?;
            let positive = local.clamp_min(0.0);
            let negative = local.neg().clamp_min(0.0);
            for (sign, part) in [(Sign::Positive, positive), (Sign::Negative, negative)] {
                if part.max_abs() > 0.0 {
                    log::trace!("{}: {:?} residual at {}", self.kind(), sign, step.label);
                    next.push(Residual {
                        origin: step.node,
                        sign,
                        factor: diagonal_factor(&part.sqrt())?,
                    });
                }
            }
        }
        out.signal = Some(Signal::Hessian {
            ggn: derivs.jac_t_mat_prod(&ggn)?,
            residuals: next,
        });
        Ok(out)
    }
}
