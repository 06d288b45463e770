pub mod activations;
pub mod conv1d;
pub mod dropout;
pub mod flatten;
pub mod linear;
pub mod pooling;
