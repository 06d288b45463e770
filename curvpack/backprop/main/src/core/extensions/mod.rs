//! Backward-pass extensions.
//!
//! Every extension instance owns its own backward signal. During a sweep the
//! dispatcher hands each layer the fully accumulated signal of every
//! instance, and the instance returns the annotations it writes plus the
//! signal for the layer's input.

pub(crate) mod diag_ggn;
pub(crate) mod diag_hessian;
pub(crate) mod firstorder;
pub(crate) mod kron;
pub(crate) mod monte_carlo;

use crate::api::config::ExtensionKind;
use crate::api::derivatives::Derivatives;
use crate::api::error::{CurvError, CurvResult};
use crate::api::loss::Loss;
use crate::api::module::{Module, NodeId, ParamId};
use crate::api::results::{Annotation, Quantity};
use crate::core::graph::LayerRecord;
use curvpack_core::Tensor;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// Whether a residual factor enters the curvature with a plus or minus sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Sign {
    Positive,
    Negative,
}

impl Sign {
    pub(crate) fn value(&self) -> f64 {
        match self {
            Sign::Positive => 1.0,
            Sign::Negative => -1.0,
        }
    }
}

/// A factor `F` with `Σ_v F_v F_vᵀ` equal to a second-order term created at
/// layer `origin`.
#[derive(Debug, Clone)]
pub(crate) struct Residual {
    pub(crate) origin: NodeId,
    pub(crate) sign: Sign,
    pub(crate) factor: Tensor,
}

/// The backward signal of one extension instance at one node output.
#[derive(Debug, Clone)]
pub(crate) enum Signal {
    /// Curvature factor `[V, N, *out]`.
    Factor(Tensor),
    /// Loss factor plus signed factors of every layer Hessian met so far.
    Hessian {
        ggn: Tensor,
        residuals: Vec<Residual>,
    },
    /// Batch-averaged curvature over flattened features `[D, D]`.
    Averaged(Tensor),
}

impl Signal {
    /// Sum of the signals arriving over two branches at the same node output.
    pub(crate) fn accumulate(self, other: Signal) -> CurvResult<Signal> {
        match (self, other) {
            (Signal::Factor(a), Signal::Factor(b)) => Ok(Signal::Factor(a.add(&b)?)),
            (Signal::Averaged(a), Signal::Averaged(b)) => Ok(Signal::Averaged(a.add(&b)?)),
            (
                Signal::Hessian { ggn, mut residuals },
                Signal::Hessian {
                    ggn: other_ggn,
                    residuals: other_residuals,
                },
            ) => {
                // Residuals born at the same layer travel the same paths, so
                // their per-branch pieces are parts of one factor.
                for r in other_residuals {
                    match residuals
                        .iter_mut()
                        .find(|own| own.origin == r.origin && own.sign == r.sign)
                    {
                        Some(own) => own.factor = own.factor.add(&r.factor)?,
                        None => residuals.push(r),
                    }
                }
                Ok(Signal::Hessian {
                    ggn: ggn.add(&other_ggn)?,
                    residuals,
                })
            }
            _ => Err(CurvError::GraphError(
                "signals of different types met at a branch".into(),
            )),
        }
    }

    /// Rejects a signal whose trailing dimensions do not match the batched
    /// output shape `[N, *out]` of the layer receiving it.
    pub(crate) fn check_shape(&self, layer: &str, output_shape: &[usize]) -> CurvResult<()> {
        let check_factor = |t: &Tensor| {
            if t.ndim() != output_shape.len() + 1 || &t.shape()[1..] != output_shape {
                return Err(CurvError::ShapeMismatch {
                    layer: layer.to_string(),
                    expected: output_shape.to_vec(),
                    got: t.shape().get(1..).unwrap_or(&[]).to_vec(),
                });
            }
            Ok(())
        };
        match self {
            Signal::Factor(t) => check_factor(t),
            Signal::Hessian { ggn, residuals } => {
                check_factor(ggn)?;
                residuals.iter().try_for_each(|r| check_factor(&r.factor))
            }
            Signal::Averaged(t) => {
                let d: usize = output_shape[1..].iter().product();
                if t.shape() != [d, d] {
                    return Err(CurvError::ShapeMismatch {
                        layer: layer.to_string(),
                        expected: vec![d, d],
                        got: t.shape().to_vec(),
                    });
                }
                Ok(())
            }
        }
    }
}

/// Everything an extension may read at the loss.
pub(crate) struct LossInput<'a> {
    pub(crate) loss: &'a dyn Loss,
    pub(crate) predictions: &'a Tensor,
    pub(crate) targets: &'a Tensor,
}

/// Everything an extension may read at one layer.
pub(crate) struct LayerStep<'a> {
    pub(crate) node: NodeId,
    pub(crate) label: &'a str,
    pub(crate) module: &'a dyn Module,
    pub(crate) record: &'a LayerRecord,
    pub(crate) derivatives: &'a dyn Derivatives,
    /// Gradient of the loss with respect to the layer output, `[N, *out]`.
    pub(crate) grad_output: &'a Tensor,
    /// False when the layer reads the graph input, where signals are dropped.
    pub(crate) propagate: bool,
}

impl LayerStep<'_> {
    pub(crate) fn batch_size(&self) -> usize {
        self.grad_output.shape()[0]
    }
}

/// What one extension produces at one layer.
#[derive(Default)]
pub(crate) struct StepOutput {
    pub(crate) signal: Option<Signal>,
    pub(crate) annotations: Vec<(ParamId, Quantity, Annotation)>,
}

impl StepOutput {
    pub(crate) fn annotate(&mut self, param: ParamId, quantity: Quantity, value: Annotation) {
        self.annotations.push((param, quantity, value));
    }
}

pub(crate) trait BackpropExtension: Send + Sync {
    fn kind(&self) -> ExtensionKind;

    /// Signal seeded at the network output, `None` for extensions that only
    /// read the plain gradient.
    fn initial_signal(&self, loss: &LossInput<'_>) -> CurvResult<Option<Signal>>;

    fn layer_step(&self, step: &LayerStep<'_>, signal: Option<Signal>) -> CurvResult<StepOutput>;
}

/// Annotations produced by one or more sweeps, not yet attached to results.
#[derive(Debug, Default)]
pub(crate) struct Partial {
    values: BTreeMap<(ParamId, Quantity), Annotation>,
}

impl Partial {
    /// Records a value; a slot may only be written once.
    pub(crate) fn insert(
        &mut self,
        param: ParamId,
        quantity: Quantity,
        value: Annotation,
    ) -> CurvResult<()> {
        match self.values.entry((param, quantity)) {
            Entry::Occupied(_) => Err(CurvError::DuplicateAnnotation {
                param: param.to_string(),
                quantity: quantity.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(())
            }
        }
    }

    /// Moves every value of `other` into `self`; slots must be disjoint.
    pub(crate) fn merge(&mut self, other: Partial) -> CurvResult<()> {
        for ((param, quantity), value) in other.values {
            self.insert(param, quantity, value)?;
        }
        Ok(())
    }

    /// Adds matching slots of two partial results of the same extension.
    pub(crate) fn fold(mut self, other: Partial) -> CurvResult<Partial> {
        for (key, value) in other.values {
            let summed = match self.values.remove(&key) {
                Some(own) => own.add(&value)?,
                None => value,
            };
            self.values.insert(key, summed);
        }
        Ok(self)
    }

    pub(crate) fn len(&self) -> usize {
        self.values.len()
    }

    pub(crate) fn into_values(self) -> impl Iterator<Item = ((ParamId, Quantity), Annotation)> {
        self.values.into_iter()
    }
}

/// The signal an extension expects to have received, or an internal error.
pub(crate) fn require_signal(step: &LayerStep<'_>, signal: Option<Signal>) -> CurvResult<Signal> {
    signal.ok_or_else(|| {
        CurvError::GraphError(format!("no backward signal reached {}", step.label))
    })
}
