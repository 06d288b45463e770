//! # curvpack backprop
//!
//! Backward-pass extensions that compute, alongside the usual gradient,
//! statistics of per-example gradients and approximations of curvature.
//!
//! This crate provides:
//! - A small layer set (`Linear`, `Conv1d`, pooling, `Flatten`, activations,
//!   `Dropout`) wired into a DAG with branch merges
//! - Matrix-free local derivative operators for every layer
//! - First-order extensions: per-example gradients, their squared norms,
//!   sum of squares and variance
//! - Second-order extensions: diagonal GGN (exact and Monte-Carlo, chunked),
//!   diagonal Hessian and Kronecker factors (KFAC, KFLR, KFRA)
//!
//! ## Example
//!
//! ```rust
//! use curvpack_backprop::*;
//! use curvpack_core::Tensor;
//!
//! let graph = Sequential::new(vec![])
//!     .push(Linear::new(4, 8))
//!     .push(Tanh::new())
//!     .push(Linear::new(8, 3))
//!     .build()
//!     .unwrap();
//!
//! let x = Tensor::randn([5, 4]);
//! let y = Tensor::randn([5, 3]);
//! let pass = graph.forward(&x).unwrap();
//!
//! let config = BackpackConfig::new()
//!     .with(Extension::BatchGrad)
//!     .with(Extension::DiagGGNExact);
//! let mut backpack = Backpack::new(&graph, config).unwrap();
//! let results = backpack.backward(&pass, &MSELoss::new(), &y).unwrap();
//!
//! let w = graph.parameters()[0];
//! assert_eq!(results.tensor(w, Quantity::GradBatch).unwrap().shape(), &[5, 8, 4]);
//! ```

pub mod api;
mod core;
mod saf;

pub use saf::*;
