//! Layer-type → derivative-operator mapping.

use crate::api::config::ExtensionKind;
use crate::api::derivatives::Derivatives;
use crate::api::error::{CurvError, CurvResult};
use crate::api::module::{LayerKind, Module};
use crate::core::derivatives::conv1d::Conv1dDerivatives;
use crate::core::derivatives::elementwise::ElementwiseDerivatives;
use crate::core::derivatives::flatten::FlattenDerivatives;
use crate::core::derivatives::linear::LinearDerivatives;
use crate::core::derivatives::pooling::PoolDerivatives;
use crate::core::graph::LayerRecord;
use crate::core::nn::conv1d::Conv1d;
use crate::core::nn::linear::Linear;
use crate::core::nn::pooling::{AvgPool1d, MaxPool1d};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Builds the operator of one layer from one recorded forward pass.
pub type DerivativesFactory = fn(&dyn Module, &LayerRecord) -> CurvResult<Box<dyn Derivatives>>;

/// Factory plus the extensions that can run through the layer.
#[derive(Clone)]
pub struct RegistryEntry {
    pub(crate) factory: DerivativesFactory,
    pub(crate) supported: BTreeSet<ExtensionKind>,
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("supported", &self.supported)
            .finish_non_exhaustive()
    }
}

impl RegistryEntry {
    pub fn supports(&self, kind: ExtensionKind) -> bool {
        self.supported.contains(&kind)
    }
}

/// Table consulted once per layer when a graph is built.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: HashMap<LayerKind, RegistryEntry>,
}

impl Registry {
    /// A registry with no layer types.
    pub fn empty() -> Self {
        Self::default()
    }

    /// All built-in layers. Kronecker-factored extensions are available for
    /// `Linear` and for the parameter-free layers they pass through.
    pub fn with_builtins() -> Self {
        let mut reg = Self::empty();
        reg.register(LayerKind::Linear, linear_factory, &ExtensionKind::ALL);
        reg.register(LayerKind::Conv1d, conv1d_factory, &ExtensionKind::ELEMENTWISE);
        reg.register(LayerKind::Flatten, flatten_factory, &ExtensionKind::ALL);
        reg.register(LayerKind::ReLU, relu_factory, &ExtensionKind::ALL);
        reg.register(LayerKind::Sigmoid, sigmoid_factory, &ExtensionKind::ALL);
        reg.register(LayerKind::Tanh, tanh_factory, &ExtensionKind::ALL);
        reg.register(LayerKind::Dropout, dropout_factory, &ExtensionKind::ALL);
        reg.register(LayerKind::AvgPool1d, avg_pool_factory, &ExtensionKind::ALL);
        reg.register(LayerKind::MaxPool1d, max_pool_factory, &ExtensionKind::ALL);
        reg
    }

    /// Adds or replaces the entry for `kind`.
    pub fn register(
        &mut self,
        kind: LayerKind,
        factory: DerivativesFactory,
        supported: &[ExtensionKind],
    ) {
        log::debug!("registering derivatives for {} ({} extensions)", kind, supported.len());
        self.entries.insert(
            kind,
            RegistryEntry {
                factory,
                supported: supported.iter().copied().collect(),
            },
        );
    }

    pub fn entry(&self, kind: LayerKind) -> Option<&RegistryEntry> {
        self.entries.get(&kind)
    }

    pub fn supports(&self, kind: LayerKind, extension: ExtensionKind) -> bool {
        self.entry(kind).map_or(false, |e| e.supports(extension))
    }
}

/// Downcasts a module handed to a factory to its concrete type.
pub fn downcast<T: 'static>(module: &dyn Module) -> CurvResult<&T> {
    module.as_any().downcast_ref::<T>().ok_or_else(|| {
        CurvError::GraphError(format!(
            "derivatives registered for {} received a different module type",
            module.kind()
        ))
    })
}

fn linear_factory(module: &dyn Module, record: &LayerRecord) -> CurvResult<Box<dyn Derivatives>> {
    Ok(Box::new(LinearDerivatives::new(downcast::<Linear>(module)?, record)?))
}

fn conv1d_factory(module: &dyn Module, record: &LayerRecord) -> CurvResult<Box<dyn Derivatives>> {
    Ok(Box::new(Conv1dDerivatives::new(downcast::<Conv1d>(module)?, record)?))
}

fn flatten_factory(_module: &dyn Module, record: &LayerRecord) -> CurvResult<Box<dyn Derivatives>> {
    Ok(Box::new(FlattenDerivatives::new(record)))
}

fn relu_factory(_module: &dyn Module, record: &LayerRecord) -> CurvResult<Box<dyn Derivatives>> {
    Ok(Box::new(ElementwiseDerivatives::relu(record)))
}

fn sigmoid_factory(_module: &dyn Module, record: &LayerRecord) -> CurvResult<Box<dyn Derivatives>> {
    Ok(Box::new(ElementwiseDerivatives::sigmoid(record)))
}

fn tanh_factory(_module: &dyn Module, record: &LayerRecord) -> CurvResult<Box<dyn Derivatives>> {
    Ok(Box::new(ElementwiseDerivatives::tanh(record)))
}

fn dropout_factory(_module: &dyn Module, record: &LayerRecord) -> CurvResult<Box<dyn Derivatives>> {
    Ok(Box::new(ElementwiseDerivatives::dropout(record)?))
}

fn avg_pool_factory(module: &dyn Module, record: &LayerRecord) -> CurvResult<Box<dyn Derivatives>> {
    let geometry = downcast::<AvgPool1d>(module)?.geometry();
    Ok(Box::new(PoolDerivatives::average(geometry, record)?))
}

fn max_pool_factory(module: &dyn Module, record: &LayerRecord) -> CurvResult<Box<dyn Derivatives>> {
    downcast::<MaxPool1d>(module)?;
    Ok(Box::new(PoolDerivatives::max(record)?))
}
