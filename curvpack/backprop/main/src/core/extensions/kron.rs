//! Kronecker-factored curvature for fully-connected layers.
//!
//! For a weight of shape `[O, I]` the block is approximated as `B ⊗ A`
//! with input factor `A = XᵀX / N` and an output-side factor `B`:
//! - KFAC: `B` from a Monte-Carlo curvature factor,
//! - KFLR: `B` from the exact loss factorisation,
//! - KFRA: `B` from a batch-averaged recursion on `[D, D]` matrices.
//!
//! The bias block is `B` alone.

use super::{require_signal, BackpropExtension, LayerStep, LossInput, Signal, StepOutput};
use crate::api::config::ExtensionKind;
use crate::api::error::{CurvError, CurvResult};
use crate::api::module::{LayerKind, ParamSlot};
use crate::api::results::{Annotation, Quantity};
use curvpack_core::Tensor;

#[derive(Debug, Clone, Copy)]
pub(crate) enum KronMode {
    Kfac { samples: usize, seed: u64 },
    Kflr,
    Kfra,
}

pub(crate) struct Kron {
    mode: KronMode,
}

impl Kron {
    pub(crate) fn new(mode: KronMode) -> Self {
        Self { mode }
    }

    fn quantity(&self) -> Quantity {
        match self.mode {
            KronMode::Kfac { .. } => Quantity::Kfac,
            KronMode::Kflr => Quantity::Kflr,
            KronMode::Kfra => Quantity::Kfra,
        }
    }

    /// Output-side factor at this layer.
    fn output_factor(signal: &Signal) -> CurvResult<Tensor> {
        match signal {
            // Σ_{v,n} s sᵀ
            Signal::Factor(s) => {
                let width = s.shape()[s.ndim() - 1];
                let rows = s.reshape(&[s.numel() / width.max(1), width])?;
                Ok(rows.t()?.matmul(&rows)?)
            }
            Signal::Averaged(g) => Ok(g.clone()),
            Signal::Hessian { .. } => Err(CurvError::GraphError(
                "Kronecker factors cannot be built from a Hessian signal".into(),
            )),
        }
    }

    fn annotate_linear(
        &self,
        step: &LayerStep<'_>,
        signal: &Signal,
        out: &mut StepOutput,
    ) -> CurvResult<()> {
        let params = step.module.parameters();
        if params.is_empty() {
            return Ok(());
        }
        let b = Self::output_factor(signal)?;
        let x = step.record.input();
        let n = x.shape()[0].max(1) as f64;
        let a = x.t()?.matmul(x)?.div_scalar(n);
        for param in params {
            let factors = match param.slot() {
                ParamSlot::Weight => vec![b.clone(), a.clone()],
                ParamSlot::Bias => vec![b.clone()],
            };
            out.annotate(param.id(), self.quantity(), Annotation::Kron(factors));
        }
        Ok(())
    }

    fn backpropagate(&self, step: &LayerStep<'_>, signal: Signal) -> CurvResult<Signal> {
        let derivs = step.derivatives;
        match signal {
            Signal::Factor(s) => Ok(Signal::Factor(derivs.jac_t_mat_prod(&s)?)),
            Signal::Averaged(g) => {
                let mut g_in = derivs.ea_jac_t_mat_jac_prod(&g)?;
                if !derivs.hessian_is_zero() {
                    // batch-summed residual, same scale as the recursion
                    let residual = derivs
                        .hessian_diagonal(step.grad_output)?
                        .flatten_from(1)?
                        .sum(0)?;
                    let d = residual.numel();
                    g_in = g_in.add(&Tensor::eye(d).mul(&residual)?)?;
                }
                Ok(Signal::Averaged(g_in))
            }
            Signal::Hessian { .. } => Err(CurvError::GraphError(format!(
                "unexpected Hessian signal at {}",
                step.label
            ))),
        }
    }
}

impl BackpropExtension for Kron {
    fn kind(&self) -> ExtensionKind {
        match self.mode {
            KronMode::Kfac { .. } => ExtensionKind::KFAC,
            KronMode::Kflr => ExtensionKind::KFLR,
            KronMode::Kfra => ExtensionKind::KFRA,
        }
    }

    fn initial_signal(&self, input: &LossInput<'_>) -> CurvResult<Option<Signal>> {
        let (loss, f, y) = (input.loss, input.predictions, input.targets);
        let signal = match self.mode {
            KronMode::Kfac { samples, seed } => Signal::Factor(
                loss.sqrt_hessian_sampled(f, y, 0..samples, seed)?
                    .div_scalar((samples as f64).sqrt()),
            ),
            KronMode::Kflr => Signal::Factor(loss.sqrt_hessian(f, y)?),
            KronMode::Kfra => Signal::Averaged(loss.sum_hessian(f, y)?),
        };
        Ok(Some(signal))
    }

    fn layer_step(&self, step: &LayerStep<'_>, signal: Option<Signal>) -> CurvResult<StepOutput> {
        let signal = require_signal(step, signal)?;
        let mut out = StepOutput::default();
        match step.module.kind() {
            LayerKind::Linear => self.annotate_linear(step, &signal, &mut out)?,
            _ if step.module.parameters().is_empty() => {}
            _ => {
                return Err(CurvError::UnsupportedLayer {
                    layer: step.label.to_string(),
                    extension: self.kind().to_string(),
                })
            }
        }
        if step.propagate {
            out.signal = Some(self.backpropagate(step, signal)?);
        }
        Ok(out)
    }
}
