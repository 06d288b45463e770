use crate::api::error::{CurvError, CurvResult};
use crate::api::module::{ForwardContext, Forwarded, LayerKind, Module, Parameter};
use curvpack_core::Tensor;
use std::any::Any;

/// Collapses every feature dimension: `[N, *] -> [N, prod(*)]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Flatten;

impl Flatten {
    pub fn new() -> Self {
        Self
    }
}

impl Module for Flatten {
    fn kind(&self) -> LayerKind {
        LayerKind::Flatten
    }

    fn forward(&self, input: &Tensor, _ctx: &mut ForwardContext) -> CurvResult<Forwarded> {
        if input.ndim() == 0 {
            return Err(CurvError::ShapeMismatch {
                layer: "Flatten".into(),
                expected: vec![0, 0],
                got: vec![],
            });
        }
        Ok(Forwarded::new(input.flatten_from(1)?))
    }

    fn parameters(&self) -> Vec<&Parameter> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        Vec::new()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
