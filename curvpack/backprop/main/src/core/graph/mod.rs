//! Computation graph: a DAG of layers and branch merges kept in topological
//! order, with forward recording.

mod builder;
mod pass;
mod sequential;

pub use builder::GraphBuilder;
pub use pass::{ForwardPass, LayerRecord};
pub use sequential::Sequential;

use crate::api::error::{CurvError, CurvResult};
use crate::api::module::{ForwardContext, Module, NodeId, Parameter};
use crate::core::registry::RegistryEntry;
use curvpack_core::Tensor;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(1);

/// Where a node reads its input from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    /// The graph input.
    Input,
    Node(NodeId),
}

pub(crate) enum NodeOp {
    Layer {
        module: Box<dyn Module>,
        entry: RegistryEntry,
    },
    /// Element-wise sum of equally shaped inputs.
    Sum,
}

pub(crate) struct Node {
    pub(crate) op: NodeOp,
    pub(crate) inputs: Vec<Source>,
}

impl Node {
    pub(crate) fn module(&self) -> Option<&dyn Module> {
        match &self.op {
            NodeOp::Layer { module, .. } => Some(module.as_ref()),
            NodeOp::Sum => None,
        }
    }

    /// Label used in logs and errors, e.g. `Linear (node2)`.
    pub(crate) fn label(&self, id: NodeId) -> String {
        match &self.op {
            NodeOp::Layer { module, .. } => format!("{} ({})", module.kind(), id),
            NodeOp::Sum => format!("Sum ({})", id),
        }
    }
}

/// A validated graph. Structure is fixed once built; parameter values may
/// change between passes through [`Graph::parameters_mut`].
pub struct Graph {
    id: u64,
    generation: u64,
    nodes: Vec<Node>,
    output: NodeId,
}

impl Graph {
    fn new(nodes: Vec<Node>, output: NodeId) -> Self {
        Self {
            id: NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed),
            generation: 0,
            nodes,
            output,
        }
    }

    /// Runs a training-mode forward pass with an entropy-seeded RNG.
    pub fn forward(&self, input: &Tensor) -> CurvResult<ForwardPass> {
        self.forward_with(input, &mut ForwardContext::new())
    }

    /// Runs the forward pass and records every node's input and output.
    pub fn forward_with(&self, input: &Tensor, ctx: &mut ForwardContext) -> CurvResult<ForwardPass> {
        if input.ndim() == 0 {
            return Err(CurvError::ShapeMismatch {
                layer: "graph input".into(),
                expected: vec![0],
                got: vec![],
            });
        }
        let mut records: Vec<LayerRecord> = Vec::with_capacity(self.nodes.len());
        for (idx, node) in self.nodes.iter().enumerate() {
            let fetch = |src: &Source| match src {
                Source::Input => input.clone(),
                Source::Node(id) => records[id.0].output().clone(),
            };
            let record = match &node.op {
                NodeOp::Layer { module, .. } => {
                    let x = fetch(&node.inputs[0]);
                    let out = module.forward(&x, ctx)?;
                    LayerRecord::new(x, out.output, out.aux)
                }
                NodeOp::Sum => {
                    let mut acc = fetch(&node.inputs[0]);
                    for src in &node.inputs[1..] {
                        let t = fetch(src);
                        if t.shape() != acc.shape() {
                            return Err(CurvError::ShapeMismatch {
                                layer: node.label(NodeId(idx)),
                                expected: acc.shape().to_vec(),
                                got: t.shape().to_vec(),
                            });
                        }
                        acc = acc.add(&t)?;
                    }
                    LayerRecord::new(acc.clone(), acc, None)
                }
            };
            log::trace!(
                "forward {} -> {:?}",
                node.label(NodeId(idx)),
                record.output().shape()
            );
            records.push(record);
        }
        Ok(ForwardPass::new(
            self.id,
            self.generation,
            input.clone(),
            records,
            self.output,
        ))
    }

    /// Trainable parameters in node order.
    pub fn parameters(&self) -> Vec<&Parameter> {
        self.nodes
            .iter()
            .filter_map(Node::module)
            .flat_map(|m| m.parameters())
            .collect()
    }

    /// Mutable access to the parameters. Invalidates earlier forward passes.
    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.generation += 1;
        self.nodes
            .iter_mut()
            .filter_map(|n| match &mut n.op {
                NodeOp::Layer { module, .. } => Some(module),
                NodeOp::Sum => None,
            })
            .flat_map(|m| m.parameters_mut())
            .collect()
    }

    /// The module at `id`, `None` for branch merges or unknown ids.
    pub fn module(&self, id: NodeId) -> Option<&dyn Module> {
        self.nodes.get(id.0).and_then(Node::module)
    }

    /// Ids of all layer nodes, in topological order.
    pub fn layer_ids(&self) -> Vec<NodeId> {
        (0..self.nodes.len())
            .map(NodeId)
            .filter(|id| self.nodes[id.0].module().is_some())
            .collect()
    }

    pub fn output_node(&self) -> NodeId {
        self.output
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn parameter_count(&self) -> usize {
        self.parameters().iter().map(|p| p.numel()).sum()
    }

    pub(crate) fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Rejects passes recorded on another graph or before a parameter update.
    pub(crate) fn check_pass(&self, pass: &ForwardPass) -> CurvResult<()> {
        if pass.graph_id() != self.id {
            return Err(CurvError::StaleForwardPass(format!(
                "pass was recorded on graph {}, not {}",
                pass.graph_id(),
                self.id
            )));
        }
        if pass.generation() != self.generation {
            return Err(CurvError::StaleForwardPass(
                "parameters changed since the forward pass".into(),
            ));
        }
        if pass.len() != self.nodes.len() {
            return Err(CurvError::StaleForwardPass(format!(
                "pass records {} nodes, graph has {}",
                pass.len(),
                self.nodes.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::nn::activations::{ReLU, Tanh};
    use crate::core::nn::linear::Linear;

    fn residual() -> Graph {
        let mut b = GraphBuilder::new();
        let x = b.input();
        let h = b.layer(Linear::new(3, 3), x).unwrap();
        let a = b.layer(Tanh::new(), h).unwrap();
        let r = b.layer(ReLU::new(), h).unwrap();
        let s = b.sum(&[a, r]).unwrap();
        let out = b.layer(Linear::new(3, 2), s).unwrap();
        b.build(out).unwrap()
    }

    #[test]
    fn forward_records_every_node() {
        let g = residual();
        let pass = g.forward(&Tensor::randn([4, 3])).unwrap();
        assert_eq!(pass.len(), 5);
        assert_eq!(pass.output().shape(), &[4, 2]);
        let h = pass.record(NodeId(0)).unwrap().output().clone();
        let merged = h.tanh().add(&h.relu()).unwrap();
        assert!(pass.record(NodeId(3)).unwrap().output().allclose(&merged, 1e-12, 1e-12));
    }

    #[test]
    fn parameter_update_invalidates_pass() {
        let mut g = residual();
        let pass = g.forward(&Tensor::randn([2, 3])).unwrap();
        assert!(g.check_pass(&pass).is_ok());
        let _ = g.parameters_mut();
        assert!(matches!(g.check_pass(&pass), Err(CurvError::StaleForwardPass(_))));
    }

    #[test]
    fn pass_from_other_graph_is_rejected() {
        let g1 = residual();
        let g2 = residual();
        let pass = g1.forward(&Tensor::randn([2, 3])).unwrap();
        assert!(g2.check_pass(&pass).is_err());
    }

    #[test]
    fn parameters_in_node_order() {
        let g = residual();
        assert_eq!(g.parameters().len(), 4);
        assert_eq!(g.parameter_count(), 3 * 3 + 3 + 3 * 2 + 2);
        assert_eq!(g.layer_ids().len(), 4);
    }
}
