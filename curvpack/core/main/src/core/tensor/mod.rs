mod ops;
#[allow(clippy::module_inception)]
mod tensor;

pub use tensor::Tensor;
pub(crate) use tensor::TensorShape;
