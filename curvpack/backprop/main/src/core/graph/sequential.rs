use super::{Graph, GraphBuilder};
use crate::api::error::CurvResult;
use crate::api::module::Module;
use crate::core::registry::Registry;

/// A chain of layers, each feeding the next.
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
    registry: Registry,
}

impl Sequential {
    pub fn new(layers: Vec<Box<dyn Module>>) -> Self {
        Self {
            layers,
            registry: Registry::with_builtins(),
        }
    }

    /// Uses `registry` instead of the built-in one and returns self (builder pattern).
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// Appends a layer and returns self (builder pattern).
    pub fn push<M: Module + 'static>(mut self, layer: M) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn build(self) -> CurvResult<Graph> {
        let mut builder = GraphBuilder::with_registry(self.registry);
        let mut last = builder.input();
        for layer in self.layers {
            last = builder.layer_boxed(layer, last)?;
        }
        builder.build(last)
    }
}

impl Default for Sequential {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}
