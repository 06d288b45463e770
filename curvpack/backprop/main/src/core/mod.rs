pub mod backpack;
pub mod derivatives;
pub(crate) mod extensions;
pub mod graph;
pub mod hooks;
pub mod loss;
pub mod nn;
pub mod registry;
