use curvpack_core::TensorError;
use thiserror::Error;

pub type CurvResult<T> = Result<T, CurvError>;

#[derive(Debug, Error)]
pub enum CurvError {
    #[error("Tensor error: {0}")]
    TensorError(#[from] TensorError),

    #[error("Layer {layer} has no derivatives registered for extension {extension}")]
    UnsupportedLayer { layer: String, extension: String },

    #[error("Shape mismatch at {layer}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        layer: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Stale forward pass: {0}")]
    StaleForwardPass(String),

    #[error("Invalid sampling configuration: {0}")]
    InvalidSampling(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Graph error: {0}")]
    GraphError(String),

    #[error("Annotation {quantity} written twice for parameter {param}")]
    DuplicateAnnotation { param: String, quantity: String },
}
