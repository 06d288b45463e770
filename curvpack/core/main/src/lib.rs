//! # curvpack core
//!
//! Dense tensor substrate for the curvpack backward-pass extensions.
//!
//! This crate provides a row-major `f64` `Tensor` with the operations the
//! matrix-free derivative operators need:
//!
//! - Shape manipulation (reshape, unsqueeze, flatten)
//! - Element-wise arithmetic with suffix broadcasting
//! - Reductions along a dimension
//! - 2-D matrix products and softmax
//!
//! Storage is shared behind an `Arc`, so cloning a tensor is cheap and forward
//! activations can be read by several extensions (or threads) at once.
//!
//! ## Example
//!
//! ```rust
//! use curvpack_core::Tensor;
//!
//! let a = Tensor::randn([2, 3]);
//! let b = Tensor::randn([3, 4]);
//! let c = a.matmul(&b).unwrap();
//! assert_eq!(c.shape(), &[2, 4]);
//! ```

pub mod api;
mod core;
mod saf;

pub use saf::*;
