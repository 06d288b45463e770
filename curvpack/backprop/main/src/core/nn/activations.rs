use crate::api::error::CurvResult;
use crate::api::module::{ForwardContext, Forwarded, LayerKind, Module, Parameter};
use curvpack_core::Tensor;
use std::any::Any;

macro_rules! activation {
    ($(#[$doc:meta])* $name:ident, $kind:expr, $op:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl $name {
            pub fn new() -> Self {
                Self
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Module for $name {
            fn kind(&self) -> LayerKind {
                $kind
            }

            fn forward(&self, input: &Tensor, _ctx: &mut ForwardContext) -> CurvResult<Forwarded> {
                Ok(Forwarded::new(input.$op()))
            }

            fn parameters(&self) -> Vec<&Parameter> {
                vec![]
            }

            fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
                vec![]
            }

            fn as_any(&self) -> &dyn Any {
                self
            }
        }
    };
}

activation!(
    /// `max(x, 0)`, element-wise.
    ReLU,
    LayerKind::ReLU,
    relu
);
activation!(
    /// `1 / (1 + e^-x)`, element-wise.
    Sigmoid,
    LayerKind::Sigmoid,
    sigmoid
);
activation!(Tanh, LayerKind::Tanh, tanh);
