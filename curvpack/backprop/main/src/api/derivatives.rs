//! Local derivative operators.
//!
//! An operator is built for one layer from the activations of one forward
//! pass and answers every sensitivity query the extensions need for that
//! layer, without materialising a Jacobian or Hessian.
//!
//! Batched "matrices" follow one layout throughout: `[V, N, *feature]`, where
//! `V` counts the vectors being propagated (columns of a curvature factor,
//! Monte-Carlo samples, or 1 for a plain gradient) and `N` is the batch.

use crate::api::error::{CurvError, CurvResult};
use crate::api::module::ParamSlot;
use curvpack_core::Tensor;

pub trait Derivatives: Send + Sync {
    /// Layer name used in error messages.
    fn name(&self) -> &str;

    /// Batched input shape `[N, *in]` recorded in the forward pass.
    fn input_shape(&self) -> &[usize];

    /// Batched output shape `[N, *out]` recorded in the forward pass.
    fn output_shape(&self) -> &[usize];

    /// `J v`: `[V, N, *in] -> [V, N, *out]`.
    fn jac_mat_prod(&self, mat: &Tensor) -> CurvResult<Tensor>;

    /// `Jᵀ v`: `[V, N, *out] -> [V, N, *in]`.
    fn jac_t_mat_prod(&self, mat: &Tensor) -> CurvResult<Tensor>;

    /// True when `∂²out/∂in²` vanishes identically.
    ///
    /// Callers skip every second-order input term for such layers.
    fn hessian_is_zero(&self) -> bool;

    /// Per-example diagonal of `Σ_c g_c ∂²out_c/∂in²`, shape `[N, *in]`,
    /// where `g` is the backward signal `[N, *out]`.
    fn hessian_diagonal(&self, _grad_output: &Tensor) -> CurvResult<Tensor> {
        if self.hessian_is_zero() {
            return Ok(Tensor::zeros(self.input_shape()));
        }
        Err(CurvError::UnsupportedLayer {
            layer: self.name().to_string(),
            extension: "hessian_diagonal".into(),
        })
    }

    /// Applies `Σ_c g_c ∂²out_c/∂in²` to `[V, N, *in]`.
    ///
    /// Every built-in layer with a non-zero local Hessian is element-wise, so
    /// the default multiplies by the diagonal.
    fn hessian_mat_prod(&self, grad_output: &Tensor, mat: &Tensor) -> CurvResult<Tensor> {
        if self.hessian_is_zero() {
            return Ok(Tensor::zeros(mat.shape()));
        }
        let diag = self.hessian_diagonal(grad_output)?;
        Ok(mat.mul(&diag)?)
    }

    /// Batch-averaged `(1/N) Σ_n J_nᵀ M J_n` for a matrix over flattened
    /// output features: `[D_out, D_out] -> [D_in, D_in]`.
    fn ea_jac_t_mat_jac_prod(&self, _mat: &Tensor) -> CurvResult<Tensor> {
        Err(CurvError::UnsupportedLayer {
            layer: self.name().to_string(),
            extension: "ea_jac_t_mat_jac_prod".into(),
        })
    }

    /// Parameter-direction `Jᵀ v`: `[V, N, *out] -> [V, N, *param]`, or
    /// `[V, *param]` when `sum_batch` is set.
    fn param_jac_t_mat_prod(
        &self,
        slot: ParamSlot,
        _mat: &Tensor,
        _sum_batch: bool,
    ) -> CurvResult<Tensor> {
        Err(CurvError::GraphError(format!(
            "{} has no {} parameter",
            self.name(),
            slot.name()
        )))
    }

    /// Diagonal contribution `Σ_v (J_θᵀ m_v)²` of a curvature factor to the
    /// parameter: `[V, N, *out] -> [N, *param]`, or `[*param]` when
    /// `sum_batch` is set. Layers may override with a cheaper contraction.
    fn param_squared_jac_t_sum(
        &self,
        slot: ParamSlot,
        mat: &Tensor,
        sum_batch: bool,
    ) -> CurvResult<Tensor> {
        let per_example = self.param_jac_t_mat_prod(slot, mat, false)?;
        let summed = per_example.square().sum(0)?;
        if sum_batch {
            Ok(summed.sum(0)?)
        } else {
            Ok(summed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Identity map that relies on every default method.
    struct Identity {
        shape: Vec<usize>,
        curved: bool,
    }

    impl Derivatives for Identity {
        fn name(&self) -> &str {
            "Identity"
        }

        fn input_shape(&self) -> &[usize] {
            &self.shape
        }

        fn output_shape(&self) -> &[usize] {
            &self.shape
        }

        fn jac_mat_prod(&self, mat: &Tensor) -> CurvResult<Tensor> {
            Ok(mat.clone())
        }

        fn jac_t_mat_prod(&self, mat: &Tensor) -> CurvResult<Tensor> {
            Ok(mat.clone())
        }

        fn hessian_is_zero(&self) -> bool {
            !self.curved
        }
    }

    #[test]
    fn linear_layers_get_zero_curvature_by_default() {
        let d = Identity { shape: vec![2, 3], curved: false };
        let g = Tensor::ones([2, 3]);
        assert_eq!(d.hessian_diagonal(&g).unwrap(), Tensor::zeros([2, 3]));
        let mat = Tensor::ones([4, 2, 3]);
        assert_eq!(d.hessian_mat_prod(&g, &mat).unwrap(), Tensor::zeros([4, 2, 3]));
    }

    #[test]
    fn missing_operators_report_the_layer() {
        let d = Identity { shape: vec![2, 3], curved: true };
        let g = Tensor::ones([2, 3]);
        assert!(matches!(
            d.hessian_diagonal(&g),
            Err(CurvError::UnsupportedLayer { ref layer, .. }) if layer == "Identity"
        ));
        assert!(d.ea_jac_t_mat_jac_prod(&Tensor::ones([3, 3])).is_err());
        let err = d
            .param_jac_t_mat_prod(ParamSlot::Bias, &Tensor::ones([1, 2, 3]), true)
            .unwrap_err();
        assert!(err.to_string().contains("bias"), "{}", err);
    }
}
