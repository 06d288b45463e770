//! Built-in extension hooks deriving statistics from per-example gradients.

use crate::api::error::{CurvError, CurvResult};
use crate::api::hook::{ExtensionHook, HookContext};
use crate::api::results::{Annotation, ParamStats, Quantity};
use curvpack_core::Tensor;

fn grad_batch<'s>(hook: &str, ctx: &HookContext<'_>, stats: &'s ParamStats) -> CurvResult<&'s Tensor> {
    stats.tensor(Quantity::GradBatch).ok_or_else(|| {
        CurvError::InvalidConfig(format!(
            "{} needs BatchGrad, missing on {} of {}",
            hook, ctx.parameter.name(), ctx.node
        ))
    })
}

/// Per-example squared ℓ2 norm of the gradient, written to `batch_l2_hook`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BatchL2Hook;

impl ExtensionHook for BatchL2Hook {
    fn name(&self) -> &str {
        "batch_l2_hook"
    }

    fn on_parameter(&mut self, ctx: &HookContext<'_>, stats: &mut ParamStats) -> CurvResult<()> {
        let norms = grad_batch(self.name(), ctx, stats)?
            .square()
            .flatten_from(1)?
            .sum(1)?;
        stats.insert(Quantity::Custom("batch_l2_hook"), Annotation::Tensor(norms))
    }
}

/// Batch sum of squared per-example gradients, written to
/// `sum_grad_squared_hook`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SumGradSquaredHook;

impl ExtensionHook for SumGradSquaredHook {
    fn name(&self) -> &str {
        "sum_grad_squared_hook"
    }

    fn on_parameter(&mut self, ctx: &HookContext<'_>, stats: &mut ParamStats) -> CurvResult<()> {
        let sgs = grad_batch(self.name(), ctx, stats)?.square().sum(0)?;
        stats.insert(
            Quantity::Custom("sum_grad_squared_hook"),
            Annotation::Tensor(sgs),
        )
    }
}
