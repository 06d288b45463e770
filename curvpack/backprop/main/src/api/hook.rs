use crate::api::error::CurvResult;
use crate::api::module::{LayerKind, NodeId, Parameter};
use crate::api::results::ParamStats;

/// What a hook sees about the layer whose parameter it is visiting.
pub struct HookContext<'a> {
    pub node: NodeId,
    pub kind: LayerKind,
    pub batch_size: usize,
    pub parameter: &'a Parameter,
}

/// User callback run once per parameter after every extension of the pass has
/// finished, visiting layers in reverse topological order.
///
/// Hooks derive further statistics from the annotations already present and
/// write them into their own slots (`Quantity::Custom`).
pub trait ExtensionHook: Send {
    fn name(&self) -> &str;
    fn on_parameter(&mut self, ctx: &HookContext<'_>, stats: &mut ParamStats) -> CurvResult<()>;
}
