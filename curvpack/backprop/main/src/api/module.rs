use crate::api::error::{CurvError, CurvResult};
use curvpack_core::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_PARAM_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a trainable parameter, stable for the lifetime of the parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(pub(crate) u64);

impl ParamId {
    fn next() -> Self {
        ParamId(NEXT_PARAM_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParamId({})", self.0)
    }
}

/// Position of a node in a graph's topological order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// Which parameter of a layer a derivative operator is asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamSlot {
    Weight,
    Bias,
}

impl ParamSlot {
    pub fn name(&self) -> &'static str {
        match self {
            ParamSlot::Weight => "weight",
            ParamSlot::Bias => "bias",
        }
    }
}

/// A trainable tensor owned by a layer.
#[derive(Debug, Clone)]
pub struct Parameter {
    id: ParamId,
    slot: ParamSlot,
    value: Tensor,
}

impl Parameter {
    pub fn new(slot: ParamSlot, value: Tensor) -> Self {
        Self {
            id: ParamId::next(),
            slot,
            value,
        }
    }

    pub fn id(&self) -> ParamId {
        self.id
    }

    pub fn slot(&self) -> ParamSlot {
        self.slot
    }

    pub fn name(&self) -> &'static str {
        self.slot.name()
    }

    pub fn value(&self) -> &Tensor {
        &self.value
    }

    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }

    pub fn numel(&self) -> usize {
        self.value.numel()
    }

    /// Replace the values; the shape must stay the same.
    pub fn set_value(&mut self, value: Tensor) -> CurvResult<()> {
        if value.shape() != self.value.shape() {
            return Err(CurvError::ShapeMismatch {
                layer: format!("parameter {}", self.name()),
                expected: self.value.shape().to_vec(),
                got: value.shape().to_vec(),
            });
        }
        self.value = value;
        Ok(())
    }
}

/// Layer-type tag used to look up derivative operators in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Linear,
    Conv1d,
    Flatten,
    ReLU,
    Sigmoid,
    Tanh,
    Dropout,
    AvgPool1d,
    MaxPool1d,
    Custom(&'static str),
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerKind::Custom(name) => write!(f, "{}", name),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Settings for one forward pass.
pub struct ForwardContext {
    pub training: bool,
    pub rng: StdRng,
}

impl ForwardContext {
    /// Training mode with an entropy-seeded RNG.
    pub fn new() -> Self {
        Self {
            training: true,
            rng: StdRng::from_entropy(),
        }
    }

    /// Training mode with a reproducible RNG.
    pub fn seeded(seed: u64) -> Self {
        Self {
            training: true,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Evaluation mode: stochastic layers act as identity.
    pub fn eval(mut self) -> Self {
        self.training = false;
        self
    }
}

impl Default for ForwardContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Output of a module's forward pass.
///
/// `aux` carries per-pass state the derivative operators need later (the
/// dropout mask). It lives in the recorded pass, never on the module.
pub struct Forwarded {
    pub output: Tensor,
    pub aux: Option<Tensor>,
}

impl Forwarded {
    pub fn new(output: Tensor) -> Self {
        Self { output, aux: None }
    }

    pub fn with_aux(output: Tensor, aux: Tensor) -> Self {
        Self {
            output,
            aux: Some(aux),
        }
    }
}

/// A layer of the computation graph.
///
/// Inputs and outputs are batched: the leading dimension is the example index.
pub trait Module: Send + Sync {
    fn kind(&self) -> LayerKind;
    fn forward(&self, input: &Tensor, ctx: &mut ForwardContext) -> CurvResult<Forwarded>;
    fn parameters(&self) -> Vec<&Parameter>;
    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;
    fn as_any(&self) -> &dyn Any;

    fn parameter_count(&self) -> usize {
        self.parameters().iter().map(|p| p.numel()).sum()
    }
}
