use super::{Graph, Node, NodeOp, Source};
use crate::api::error::{CurvError, CurvResult};
use crate::api::module::{Module, NodeId};
use crate::core::registry::Registry;

/// Assembles a [`Graph`] node by node. Nodes can only read from the input or
/// from nodes added before them, so insertion order is a topological order.
pub struct GraphBuilder {
    registry: Registry,
    nodes: Vec<Node>,
}

impl GraphBuilder {
    /// A builder resolving layers against the built-in registry.
    pub fn new() -> Self {
        Self::with_registry(Registry::with_builtins())
    }

    pub fn with_registry(registry: Registry) -> Self {
        Self {
            registry,
            nodes: Vec::new(),
        }
    }

    pub fn input(&self) -> Source {
        Source::Input
    }

    /// Adds a layer reading from `input`.
    pub fn layer<M: Module + 'static>(&mut self, module: M, input: Source) -> CurvResult<Source> {
        self.layer_boxed(Box::new(module), input)
    }

    pub fn layer_boxed(&mut self, module: Box<dyn Module>, input: Source) -> CurvResult<Source> {
        self.check_source(input)?;
        let kind = module.kind();
        let entry = self.registry.entry(kind).cloned().ok_or_else(|| {
            CurvError::UnsupportedLayer {
                layer: kind.to_string(),
                extension: "backpropagation".into(),
            }
        })?;
        Ok(self.push(NodeOp::Layer { module, entry }, vec![input]))
    }

    /// Adds a branch merge summing all `inputs`.
    pub fn sum(&mut self, inputs: &[Source]) -> CurvResult<Source> {
        if inputs.is_empty() {
            return Err(CurvError::GraphError("sum node needs at least one input".into()));
        }
        for src in inputs {
            self.check_source(*src)?;
        }
        Ok(self.push(NodeOp::Sum, inputs.to_vec()))
    }

    /// Finishes the graph. Every node must contribute to `output`.
    pub fn build(self, output: Source) -> CurvResult<Graph> {
        let output = match output {
            Source::Node(id) if id.0 < self.nodes.len() => id,
            Source::Node(id) => {
                return Err(CurvError::GraphError(format!("unknown output {}", id)));
            }
            Source::Input => {
                return Err(CurvError::GraphError(
                    "graph output must be a node, not the input".into(),
                ));
            }
        };

        let mut reaches = vec![false; self.nodes.len()];
        reaches[output.0] = true;
        for idx in (0..=output.0).rev() {
            if !reaches[idx] {
                continue;
            }
            for src in &self.nodes[idx].inputs {
                if let Source::Node(id) = src {
                    reaches[id.0] = true;
                }
            }
        }
        if let Some(idx) = reaches.iter().position(|r| !r) {
            return Err(CurvError::GraphError(format!(
                "{} does not contribute to the output",
                self.nodes[idx].label(NodeId(idx))
            )));
        }

        log::debug!("built graph with {} nodes", self.nodes.len());
        Ok(Graph::new(self.nodes, output))
    }

    fn check_source(&self, src: Source) -> CurvResult<()> {
        match src {
            Source::Node(id) if id.0 >= self.nodes.len() => Err(CurvError::GraphError(format!(
                "{} is not an earlier node of this graph",
                id
            ))),
            _ => Ok(()),
        }
    }

    fn push(&mut self, op: NodeOp, inputs: Vec<Source>) -> Source {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node { op, inputs });
        Source::Node(id)
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}
