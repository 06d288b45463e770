//! The extension dispatcher.
//!
//! A backward pass runs in three stages:
//! 1. the plain gradient is propagated once and kept per node output;
//! 2. every configured extension is swept through the graph in reverse
//!    topological order, each with its own signal, and Monte-Carlo groups
//!    run as separate sweeps whose results are folded;
//! 3. the collected annotations are attached to the parameters, then hooks run.
//!
//! Nothing is returned unless every stage succeeded.

use crate::api::config::{BackpackConfig, Extension, ExtensionKind};
use crate::api::derivatives::Derivatives;
use crate::api::error::{CurvError, CurvResult};
use crate::api::hook::{ExtensionHook, HookContext};
use crate::api::loss::Loss;
use crate::api::module::NodeId;
use crate::api::results::{Annotation, ParamStats, PassResults, Quantity};
use crate::core::extensions::diag_ggn::DiagGgn;
use crate::core::extensions::diag_hessian::DiagHessian;
use crate::core::extensions::firstorder::FirstOrder;
use crate::core::extensions::kron::{Kron, KronMode};
use crate::core::extensions::monte_carlo::chunk_instances;
use crate::core::extensions::{BackpropExtension, LayerStep, LossInput, Partial, Signal};
use crate::core::graph::{ForwardPass, Graph, NodeOp, Source};
use curvpack_core::Tensor;
use rand::Rng;
use rayon::prelude::*;
use std::collections::HashMap;
use std::time::Instant;

type Instances = Vec<Box<dyn BackpropExtension>>;

/// Runs backward passes with extensions over one graph.
pub struct Backpack<'g> {
    graph: &'g Graph,
    config: BackpackConfig,
    hooks: Vec<Box<dyn ExtensionHook>>,
}

/// Read-only state shared by every sweep of one pass.
struct SweepContext<'a> {
    graph: &'a Graph,
    pass: &'a ForwardPass,
    operators: &'a [Option<Box<dyn Derivatives>>],
    grads: &'a [Option<Tensor>],
    loss: LossInput<'a>,
}

impl<'g> Backpack<'g> {
    pub fn new(graph: &'g Graph, config: BackpackConfig) -> CurvResult<Self> {
        config.validate()?;
        Ok(Self {
            graph,
            config,
            hooks: Vec::new(),
        })
    }

    /// Adds a hook and returns self (builder pattern).
    pub fn with_hook<H: ExtensionHook + 'static>(mut self, hook: H) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    pub fn config(&self) -> &BackpackConfig {
        &self.config
    }

    /// Computes the loss gradient and every configured statistic for `pass`.
    pub fn backward(
        &mut self,
        pass: &ForwardPass,
        loss: &dyn Loss,
        targets: &Tensor,
    ) -> CurvResult<PassResults> {
        let started = Instant::now();
        self.graph.check_pass(pass)?;
        self.check_support()?;

        let predictions = pass.output();
        let loss_value = loss.forward(predictions, targets)?;
        log::debug!(
            "backward: {} on batch of {}, {} nodes, extensions {:?}",
            loss.name(),
            pass.batch_size(),
            self.graph.len(),
            self.config.extensions.iter().map(Extension::kind).collect::<Vec<_>>()
        );

        let operators = self.build_operators(pass)?;
        let (grads, mut partial) =
            self.gradients(pass, &operators, loss.gradient(predictions, targets)?)?;

        let ctx = SweepContext {
            graph: self.graph,
            pass,
            operators: &operators,
            grads: &grads,
            loss: LossInput {
                loss,
                predictions,
                targets,
            },
        };

        let (main, groups) = self.instantiate();
        if !main.is_empty() {
            partial.merge(sweep(&ctx, &main)?)?;
        }
        for group in groups {
            partial.merge(self.run_chunks(&ctx, &group)?)?;
        }

        let mut results = commit(self.graph, pass, loss_value, partial)?;
        self.run_hooks(pass, &mut results)?;
        log::debug!(
            "backward done in {:.2?}: {} parameters annotated",
            started.elapsed(),
            results.len()
        );
        Ok(results)
    }

    /// Every configured extension must be registered for every layer.
    fn check_support(&self) -> CurvResult<()> {
        for (idx, node) in self.graph.nodes().iter().enumerate() {
            match &node.op {
                NodeOp::Layer { entry, .. } => {
                    for ext in &self.config.extensions {
                        if !entry.supports(ext.kind()) {
                            return Err(CurvError::UnsupportedLayer {
                                layer: node.label(NodeId(idx)),
                                extension: ext.kind().to_string(),
                            });
                        }
                    }
                }
                // KFRA's averaged signal does not split across branches.
                NodeOp::Sum => {
                    if let Some(ext) = self
                        .config
                        .extensions
                        .iter()
                        .find(|ext| ext.kind() == ExtensionKind::KFRA)
                    {
                        return Err(CurvError::UnsupportedLayer {
                            layer: node.label(NodeId(idx)),
                            extension: ext.kind().to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn build_operators(&self, pass: &ForwardPass) -> CurvResult<Vec<Option<Box<dyn Derivatives>>>> {
        let mut operators = Vec::with_capacity(self.graph.len());
        for (idx, node) in self.graph.nodes().iter().enumerate() {
            let id = NodeId(idx);
            let op = match &node.op {
                NodeOp::Layer { module, entry } => {
                    let record = pass.record(id).ok_or_else(|| {
                        CurvError::StaleForwardPass(format!("no record for {}", id))
                    })?;
                    let derivs = (entry.factory)(module.as_ref(), record)?;
                    if derivs.output_shape() != record.output().shape() {
                        return Err(CurvError::ShapeMismatch {
                            layer: node.label(id),
                            expected: record.output().shape().to_vec(),
                            got: derivs.output_shape().to_vec(),
                        });
                    }
                    Some(derivs)
                }
                NodeOp::Sum => None,
            };
            operators.push(op);
        }
        Ok(operators)
    }

    /// Plain backpropagation: the loss gradient at every node output, plus
    /// the aggregate parameter gradients.
    fn gradients(
        &self,
        pass: &ForwardPass,
        operators: &[Option<Box<dyn Derivatives>>],
        grad_loss: Tensor,
    ) -> CurvResult<(Vec<Option<Tensor>>, Partial)> {
        let nodes = self.graph.nodes();
        let mut incoming: Vec<Option<Tensor>> = vec![None; nodes.len()];
        incoming[self.graph.output_node().index()] = Some(grad_loss);
        let mut grads: Vec<Option<Tensor>> = vec![None; nodes.len()];
        let mut partial = Partial::default();

        for idx in (0..nodes.len()).rev() {
            let node = &nodes[idx];
            let g = incoming[idx].take().ok_or_else(|| {
                CurvError::GraphError(format!("no gradient reached {}", node.label(NodeId(idx))))
            })?;
            match &node.op {
                NodeOp::Sum => {
                    for src in &node.inputs {
                        route(&mut incoming, *src, g.clone())?;
                    }
                }
                NodeOp::Layer { module, .. } => {
                    let derivs = operator(operators, idx)?;
                    let mat = g.unsqueeze(0)?;
                    for param in module.parameters() {
                        let grad = derivs
                            .param_jac_t_mat_prod(param.slot(), &mat, true)?
                            .squeeze(0)?;
                        partial.insert(param.id(), Quantity::Grad, Annotation::Tensor(grad))?;
                    }
                    if node.inputs[0] != Source::Input {
                        let g_in = derivs.jac_t_mat_prod(&mat)?.squeeze(0)?;
                        route(&mut incoming, node.inputs[0], g_in)?;
                    }
                }
            }
            grads[idx] = Some(g);
        }
        log::trace!("plain gradient through {} nodes of pass {:?}", nodes.len(), pass.output().shape());
        Ok((grads, partial))
    }

    /// Extension instances: those sharing the main sweep, and one group of
    /// instances per chunked Monte-Carlo extension.
    fn instantiate(&self) -> (Instances, Vec<Instances>) {
        let mut rng = rand::thread_rng();
        let mut main: Instances = Vec::new();
        let mut groups: Vec<Instances> = Vec::new();
        for ext in &self.config.extensions {
            match ext {
                Extension::BatchGrad
                | Extension::BatchL2Grad
                | Extension::SumGradSquared
                | Extension::Variance => main.push(Box::new(FirstOrder::new(ext.kind()))),
                Extension::DiagGGNExact => main.push(Box::new(DiagGgn::exact(false))),
                Extension::BatchDiagGGNExact => main.push(Box::new(DiagGgn::exact(true))),
                Extension::DiagGGNMC(mc) | Extension::BatchDiagGGNMC(mc) => {
                    let batched = ext.kind() == ExtensionKind::BatchDiagGGNMC;
                    // one seed per pass, shared by every group of the pass
                    let seed = mc.seed.unwrap_or_else(|| rng.gen());
                    let group = chunk_instances(mc, seed, batched);
                    if group.len() == 1 {
                        main.extend(group);
                    } else {
                        groups.push(group);
                    }
                }
                Extension::DiagHessian => main.push(Box::new(DiagHessian::new(false))),
                Extension::BatchDiagHessian => main.push(Box::new(DiagHessian::new(true))),
                Extension::KFAC { mc_samples, seed } => main.push(Box::new(Kron::new(KronMode::Kfac {
                    samples: *mc_samples,
                    seed: seed.unwrap_or_else(|| rng.gen()),
                }))),
                Extension::KFLR => main.push(Box::new(Kron::new(KronMode::Kflr))),
                Extension::KFRA => main.push(Box::new(Kron::new(KronMode::Kfra))),
            }
        }
        (main, groups)
    }

    /// Sweeps each Monte-Carlo group separately and adds up the results.
    fn run_chunks(&self, ctx: &SweepContext<'_>, group: &[Box<dyn BackpropExtension>]) -> CurvResult<Partial> {
        if self.config.parallel_chunks {
            group
                .par_iter()
                .map(|inst| sweep(ctx, std::slice::from_ref(inst)))
                .try_reduce(Partial::default, |a, b| a.fold(b))
        } else {
            group.iter().try_fold(Partial::default(), |acc, inst| {
                acc.fold(sweep(ctx, std::slice::from_ref(inst))?)
            })
        }
    }

    /// Hooks visit layers in reverse topological order, after all sweeps.
    fn run_hooks(&mut self, pass: &ForwardPass, results: &mut PassResults) -> CurvResult<()> {
        if self.hooks.is_empty() {
            return Ok(());
        }
        let graph = self.graph;
        for id in graph.layer_ids().into_iter().rev() {
            let Some(module) = graph.module(id) else {
                continue;
            };
            for param in module.parameters() {
                let ctx = HookContext {
                    node: id,
                    kind: module.kind(),
                    batch_size: pass.batch_size(),
                    parameter: param,
                };
                let stats = results.params.get_mut(&param.id()).ok_or_else(|| {
                    CurvError::GraphError(format!("no statistics for {}", param.id()))
                })?;
                for hook in self.hooks.iter_mut() {
                    log::trace!("hook {} on {} {}", hook.name(), id, param.name());
                    hook.on_parameter(&ctx, stats)?;
                }
            }
        }
        Ok(())
    }
}

fn operator(operators: &[Option<Box<dyn Derivatives>>], idx: usize) -> CurvResult<&dyn Derivatives> {
    operators
        .get(idx)
        .and_then(|op| op.as_deref())
        .ok_or_else(|| CurvError::GraphError(format!("no derivatives for node{}", idx)))
}

/// Adds `value` to what has already arrived at `src`.
fn route(slots: &mut [Option<Tensor>], src: Source, value: Tensor) -> CurvResult<()> {
    if let Source::Node(id) = src {
        let slot = &mut slots[id.index()];
        *slot = Some(match slot.take() {
            Some(existing) => existing.add(&value)?,
            None => value,
        });
    }
    Ok(())
}

/// Signal counterpart of [`route`].
fn deliver(slots: &mut [Option<Signal>], src: Source, signal: Signal) -> CurvResult<()> {
    if let Source::Node(id) = src {
        let slot = &mut slots[id.index()];
        *slot = Some(match slot.take() {
            Some(existing) => existing.accumulate(signal)?,
            None => signal,
        });
    }
    Ok(())
}

/// One reverse traversal carrying a signal per instance.
fn sweep(ctx: &SweepContext<'_>, instances: &[Box<dyn BackpropExtension>]) -> CurvResult<Partial> {
    let nodes = ctx.graph.nodes();
    let mut signals: Vec<Vec<Option<Signal>>> = vec![vec![None; nodes.len()]; instances.len()];
    let output = ctx.graph.output_node().index();
    for (i, ext) in instances.iter().enumerate() {
        signals[i][output] = ext.initial_signal(&ctx.loss)?;
    }

    let mut partial = Partial::default();
    for idx in (0..nodes.len()).rev() {
        let node = &nodes[idx];
        let id = NodeId(idx);
        match &node.op {
            NodeOp::Sum => {
                for per_instance in signals.iter_mut() {
                    if let Some(signal) = per_instance[idx].take() {
                        for src in &node.inputs {
                            deliver(per_instance, *src, signal.clone())?;
                        }
                    }
                }
            }
            NodeOp::Layer { module, .. } => {
                let label = node.label(id);
                let derivatives = operator(ctx.operators, idx)?;
                let record = ctx.pass.record(id).ok_or_else(|| {
                    CurvError::StaleForwardPass(format!("no record for {}", id))
                })?;
                let grad_output = ctx.grads[idx].as_ref().ok_or_else(|| {
                    CurvError::GraphError(format!("no gradient reached {}", label))
                })?;
                let step = LayerStep {
                    node: id,
                    label: &label,
                    module: module.as_ref(),
                    record,
                    derivatives,
                    grad_output,
                    propagate: node.inputs[0] != Source::Input,
                };
                for (ext, per_instance) in instances.iter().zip(signals.iter_mut()) {
                    let incoming = per_instance[idx].take();
                    if let Some(signal) = &incoming {
                        signal.check_shape(&label, derivatives.output_shape())?;
                    }
                    log::trace!("{} at {}", ext.kind(), label);
                    let out = ext.layer_step(&step, incoming)?;
                    for (param, quantity, value) in out.annotations {
                        partial.insert(param, quantity, value)?;
                    }
                    if let Some(signal) = out.signal {
                        deliver(per_instance, node.inputs[0], signal)?;
                    }
                }
            }
        }
    }
    Ok(partial)
}

/// Expected shape of a tensor annotation on a parameter of shape `param`.
fn expected_shape(quantity: Quantity, param: &[usize], batch: usize) -> Option<Vec<usize>> {
    let batched = || {
        let mut shape = vec![batch];
        shape.extend_from_slice(param);
        shape
    };
    match quantity {
        Quantity::GradBatch
        | Quantity::DiagGgnExactBatch
        | Quantity::DiagGgnMcBatch
        | Quantity::DiagHBatch => Some(batched()),
        Quantity::BatchL2 => Some(vec![batch]),
        Quantity::Kfac | Quantity::Kflr | Quantity::Kfra | Quantity::Custom(_) => None,
        _ => Some(param.to_vec()),
    }
}

/// Attaches the collected annotations to their parameters.
fn commit(graph: &Graph, pass: &ForwardPass, loss: f64, partial: Partial) -> CurvResult<PassResults> {
    let mut params: HashMap<_, ParamStats> = graph
        .parameters()
        .into_iter()
        .map(|p| (p.id(), ParamStats::new(p)))
        .collect();
    let batch = pass.batch_size();
    log::trace!("committing {} annotations", partial.len());
    for ((id, quantity), value) in partial.into_values() {
        let stats = params
            .get_mut(&id)
            .ok_or_else(|| CurvError::GraphError(format!("annotation for unknown {}", id)))?;
        if let (Some(expected), Annotation::Tensor(t)) =
            (expected_shape(quantity, stats.shape(), batch), &value)
        {
            if t.shape() != expected.as_slice() {
                return Err(CurvError::ShapeMismatch {
                    layer: format!("{} of {}", quantity, stats.name()),
                    expected,
                    got: t.shape().to_vec(),
                });
            }
        }
        stats.insert(quantity, value)?;
    }
    Ok(PassResults {
        loss,
        batch_size: batch,
        params,
    })
}
