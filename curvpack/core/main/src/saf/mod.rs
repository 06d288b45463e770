//! Facade re-exports for curvpack-core

pub use crate::api::error::*;
pub use crate::core::shape::Shape;
pub use crate::core::tensor::Tensor;
