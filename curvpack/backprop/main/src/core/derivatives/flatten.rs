use super::{check_batched, check_square, with_leading};
use crate::api::derivatives::Derivatives;
use crate::api::error::CurvResult;
use crate::core::graph::LayerRecord;
use curvpack_core::Tensor;

/// Operators of a reshape: the Jacobian is a permutation-free relabelling of
/// features, so every product is a reshape.
pub struct FlattenDerivatives {
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
}

impl FlattenDerivatives {
    pub fn new(record: &LayerRecord) -> Self {
        Self {
            input_shape: record.input().shape().to_vec(),
            output_shape: record.output().shape().to_vec(),
        }
    }
}

impl Derivatives for FlattenDerivatives {
    fn name(&self) -> &str {
        "Flatten"
    }

    fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    fn jac_mat_prod(&self, mat: &Tensor) -> CurvResult<Tensor> {
        let v = check_batched(self.name(), mat, &self.input_shape)?;
        Ok(mat.reshape(&with_leading(v, &self.output_shape))?)
    }

    fn jac_t_mat_prod(&self, mat: &Tensor) -> CurvResult<Tensor> {
        let v = check_batched(self.name(), mat, &self.output_shape)?;
        Ok(mat.reshape(&with_leading(v, &self.input_shape))?)
    }

    fn hessian_is_zero(&self) -> bool {
        true
    }

    fn ea_jac_t_mat_jac_prod(&self, mat: &Tensor) -> CurvResult<Tensor> {
        check_square(self.name(), mat, self.output_shape[1..].iter().product())?;
        Ok(mat.clone())
    }
}
