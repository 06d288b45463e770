use crate::api::module::NodeId;
use curvpack_core::Tensor;

/// Activations of one node saved by the forward pass.
#[derive(Debug, Clone)]
pub struct LayerRecord {
    input: Tensor,
    output: Tensor,
    aux: Option<Tensor>,
}

impl LayerRecord {
    pub fn new(input: Tensor, output: Tensor, aux: Option<Tensor>) -> Self {
        Self { input, output, aux }
    }

    pub fn input(&self) -> &Tensor {
        &self.input
    }

    pub fn output(&self) -> &Tensor {
        &self.output
    }

    /// Per-pass state returned by the module, such as a dropout mask.
    pub fn aux(&self) -> Option<&Tensor> {
        self.aux.as_ref()
    }
}

/// A recorded forward pass, valid for the graph and parameter values that
/// produced it.
#[derive(Debug, Clone)]
pub struct ForwardPass {
    graph_id: u64,
    generation: u64,
    input: Tensor,
    records: Vec<LayerRecord>,
    output: NodeId,
}

impl ForwardPass {
    pub(crate) fn new(
        graph_id: u64,
        generation: u64,
        input: Tensor,
        records: Vec<LayerRecord>,
        output: NodeId,
    ) -> Self {
        Self {
            graph_id,
            generation,
            input,
            records,
            output,
        }
    }

    /// Network predictions.
    pub fn output(&self) -> &Tensor {
        self.records[self.output.0].output()
    }

    pub fn input(&self) -> &Tensor {
        &self.input
    }

    pub fn record(&self, id: NodeId) -> Option<&LayerRecord> {
        self.records.get(id.0)
    }

    pub fn batch_size(&self) -> usize {
        self.input.shape()[0]
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn graph_id(&self) -> u64 {
        self.graph_id
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }
}
