pub mod shape;
pub mod tensor;
