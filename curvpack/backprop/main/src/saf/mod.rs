// SAF (Simple API Facade) — re-exports for convenient access

// API traits and types
pub use crate::api::config::{BackpackConfig, Extension, ExtensionKind, MonteCarlo};
pub use crate::api::derivatives::Derivatives;
pub use crate::api::error::{CurvError, CurvResult};
pub use crate::api::hook::{ExtensionHook, HookContext};
pub use crate::api::loss::{Loss, Reduction};
pub use crate::api::module::{
    ForwardContext, Forwarded, LayerKind, Module, NodeId, ParamId, ParamSlot, Parameter,
};
pub use crate::api::results::{Annotation, ParamStats, PassResults, Quantity};

// Graph and dispatcher
pub use crate::core::backpack::Backpack;
pub use crate::core::graph::{ForwardPass, Graph, GraphBuilder, LayerRecord, Sequential, Source};
pub use crate::core::registry::{downcast, DerivativesFactory, Registry, RegistryEntry};

// Hooks
pub use crate::core::hooks::{BatchL2Hook, SumGradSquaredHook};

// Loss functions
pub use crate::core::loss::cross_entropy::CrossEntropyLoss;
pub use crate::core::loss::mse::MSELoss;
pub use crate::core::loss::sample_rng;

// Neural network layers
pub use crate::core::nn::activations::{ReLU, Sigmoid, Tanh};
pub use crate::core::nn::conv1d::{Conv1d, ConvGeometry};
pub use crate::core::nn::dropout::Dropout;
pub use crate::core::nn::flatten::Flatten;
pub use crate::core::nn::linear::Linear;
pub use crate::core::nn::pooling::{AvgPool1d, MaxPool1d, PoolGeometry};

// Derivative operators
pub use crate::core::derivatives::conv1d::Conv1dDerivatives;
pub use crate::core::derivatives::elementwise::ElementwiseDerivatives;
pub use crate::core::derivatives::flatten::FlattenDerivatives;
pub use crate::core::derivatives::linear::LinearDerivatives;
pub use crate::core::derivatives::pooling::PoolDerivatives;
