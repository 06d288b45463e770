//! Per-parameter statistics returned from a backward pass.

use crate::api::error::{CurvError, CurvResult};
use crate::api::module::{ParamId, Parameter};
use curvpack_core::Tensor;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Name of an annotation slot on a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Quantity {
    Grad,
    GradBatch,
    BatchL2,
    SumGradSquared,
    Variance,
    DiagGgnExact,
    DiagGgnExactBatch,
    DiagGgnMc,
    DiagGgnMcBatch,
    DiagH,
    DiagHBatch,
    Kfac,
    Kflr,
    Kfra,
    /// Slot written by an extension hook.
    Custom(&'static str),
}

impl Quantity {
    pub fn field_name(&self) -> &'static str {
        match self {
            Quantity::Grad => "grad",
            Quantity::GradBatch => "grad_batch",
            Quantity::BatchL2 => "batch_l2",
            Quantity::SumGradSquared => "sum_grad_squared",
            Quantity::Variance => "variance",
            Quantity::DiagGgnExact => "diag_ggn_exact",
            Quantity::DiagGgnExactBatch => "diag_ggn_exact_batch",
            Quantity::DiagGgnMc => "diag_ggn_mc",
            Quantity::DiagGgnMcBatch => "diag_ggn_mc_batch",
            Quantity::DiagH => "diag_h",
            Quantity::DiagHBatch => "diag_h_batch",
            Quantity::Kfac => "kfac",
            Quantity::Kflr => "kflr",
            Quantity::Kfra => "kfra",
            Quantity::Custom(name) => name,
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field_name())
    }
}

/// Value stored in an annotation slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Annotation {
    Tensor(Tensor),
    /// Kronecker factors, outermost first: `[B, A]` for a weight, `[B]` for a bias.
    Kron(Vec<Tensor>),
}

impl Annotation {
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Annotation::Tensor(t) => Some(t),
            Annotation::Kron(_) => None,
        }
    }

    pub fn as_kron(&self) -> Option<&[Tensor]> {
        match self {
            Annotation::Kron(factors) => Some(factors),
            Annotation::Tensor(_) => None,
        }
    }

    /// `self + other`, used to fold Monte-Carlo chunks.
    pub(crate) fn add(&self, other: &Annotation) -> CurvResult<Annotation> {
        match (self, other) {
            (Annotation::Tensor(a), Annotation::Tensor(b)) => Ok(Annotation::Tensor(a.add(b)?)),
            _ => Err(CurvError::InvalidConfig(
                "only tensor annotations can be accumulated".into(),
            )),
        }
    }
}

/// All annotations attached to one parameter.
#[derive(Debug, Clone)]
pub struct ParamStats {
    name: &'static str,
    shape: Vec<usize>,
    values: BTreeMap<Quantity, Annotation>,
}

impl ParamStats {
    pub(crate) fn new(param: &Parameter) -> Self {
        Self {
            name: param.name(),
            shape: param.shape().to_vec(),
            values: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Shape of the parameter the statistics belong to.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn get(&self, quantity: Quantity) -> Option<&Annotation> {
        self.values.get(&quantity)
    }

    pub fn tensor(&self, quantity: Quantity) -> Option<&Tensor> {
        self.get(quantity).and_then(Annotation::as_tensor)
    }

    pub fn quantities(&self) -> impl Iterator<Item = &Quantity> {
        self.values.keys()
    }

    /// Write a slot. Each slot has exactly one writer per pass.
    pub fn insert(&mut self, quantity: Quantity, value: Annotation) -> CurvResult<()> {
        if self.values.contains_key(&quantity) {
            return Err(CurvError::DuplicateAnnotation {
                param: self.name.to_string(),
                quantity: quantity.to_string(),
            });
        }
        self.values.insert(quantity, value);
        Ok(())
    }
}

/// Results of one backward pass, keyed by parameter identity.
#[derive(Debug, Clone, Default)]
pub struct PassResults {
    pub(crate) loss: f64,
    pub(crate) batch_size: usize,
    pub(crate) params: HashMap<ParamId, ParamStats>,
}

impl PassResults {
    /// Value of the loss for the recorded forward pass.
    pub fn loss(&self) -> f64 {
        self.loss
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn stats(&self, id: ParamId) -> Option<&ParamStats> {
        self.params.get(&id)
    }

    pub fn get(&self, param: &Parameter, quantity: Quantity) -> Option<&Annotation> {
        self.params.get(&param.id()).and_then(|s| s.get(quantity))
    }

    pub fn tensor(&self, param: &Parameter, quantity: Quantity) -> Option<&Tensor> {
        self.get(param, quantity).and_then(Annotation::as_tensor)
    }

    pub fn kron(&self, param: &Parameter, quantity: Quantity) -> Option<&[Tensor]> {
        self.get(param, quantity).and_then(Annotation::as_kron)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}
