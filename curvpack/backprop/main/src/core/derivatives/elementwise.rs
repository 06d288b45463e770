use super::{check_batched, check_square};
use crate::api::derivatives::Derivatives;
use crate::api::error::{CurvError, CurvResult};
use crate::core::graph::LayerRecord;
use curvpack_core::Tensor;

/// Operators of a layer acting independently on every feature:
/// `out_i = φ(in_i)`. The Jacobian is `diag(φ')` and the local Hessian of
/// output `i` has the single entry `φ''` at `(i, i)`.
pub struct ElementwiseDerivatives {
    name: String,
    shape: Vec<usize>,
    first: Tensor,          // φ'(x), [N, *]
    second: Option<Tensor>, // φ''(x), [N, *]; None when identically zero
}

impl ElementwiseDerivatives {
    pub fn new(name: &str, first: Tensor, second: Option<Tensor>) -> Self {
        Self {
            name: name.to_string(),
            shape: first.shape().to_vec(),
            first,
            second,
        }
    }

    /// φ' = 1[x > 0]; φ'' = 0 almost everywhere.
    pub fn relu(record: &LayerRecord) -> Self {
        let first = record.input().map(|x| if x > 0.0 { 1.0 } else { 0.0 });
        Self::new("ReLU", first, None)
    }

    /// With s = σ(x): φ' = s(1 - s), φ'' = s(1 - s)(1 - 2s).
    pub fn sigmoid(record: &LayerRecord) -> Self {
        let s = record.output();
        let first = s.map(|s| s * (1.0 - s));
        let second = s.map(|s| s * (1.0 - s) * (1.0 - 2.0 * s));
        Self::new("Sigmoid", first, Some(second))
    }

    /// With t = tanh(x): φ' = 1 - t², φ'' = -2t(1 - t²).
    pub fn tanh(record: &LayerRecord) -> Self {
        let t = record.output();
        let first = t.map(|t| 1.0 - t * t);
        let second = t.map(|t| -2.0 * t * (1.0 - t * t));
        Self::new("Tanh", first, Some(second))
    }

    /// Multiplication by the scaled mask recorded in the forward pass.
    pub fn dropout(record: &LayerRecord) -> CurvResult<Self> {
        let mask = record.aux().cloned().ok_or_else(|| {
            CurvError::GraphError("Dropout record carries no mask".into())
        })?;
        Ok(Self::new("Dropout", mask, None))
    }

    fn features(&self) -> usize {
        self.shape[1..].iter().product()
    }
}

impl Derivatives for ElementwiseDerivatives {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_shape(&self) -> &[usize] {
        &self.shape
    }

    fn output_shape(&self) -> &[usize] {
        &self.shape
    }

    fn jac_mat_prod(&self, mat: &Tensor) -> CurvResult<Tensor> {
        check_batched(&self.name, mat, &self.shape)?;
        Ok(mat.mul(&self.first)?)
    }

    fn jac_t_mat_prod(&self, mat: &Tensor) -> CurvResult<Tensor> {
        self.jac_mat_prod(mat)
    }

    fn hessian_is_zero(&self) -> bool {
        self.second.is_none()
    }

    fn hessian_diagonal(&self, grad_output: &Tensor) -> CurvResult<Tensor> {
        if grad_output.shape() != self.shape.as_slice() {
            return Err(CurvError::ShapeMismatch {
                layer: self.name.clone(),
                expected: self.shape.clone(),
                got: grad_output.shape().to_vec(),
            });
        }
        match &self.second {
            Some(second) => Ok(grad_output.mul(second)?),
            None => Ok(Tensor::zeros(self.shape.as_slice())),
        }
    }

    fn ea_jac_t_mat_jac_prod(&self, mat: &Tensor) -> CurvResult<Tensor> {
        let d = self.features();
        check_square(&self.name, mat, d)?;
        // (1/N) Σ_n diag(φ'_n) M diag(φ'_n) = M ⊙ (1/N) Σ_n φ'_n φ'_nᵀ
        let n = self.shape[0].max(1) as f64;
        let f = self.first.reshape(&[self.shape[0], d])?;
        let outer = f.t()?.matmul(&f)?.div_scalar(n);
        Ok(mat.mul(&outer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(x: Tensor, y: Tensor) -> LayerRecord {
        LayerRecord::new(x, y, None)
    }

    #[test]
    fn tanh_second_derivative_matches_finite_difference() {
        let x = Tensor::from_vec(vec![-1.3, 0.2, 0.7, 2.1], [2, 2]).unwrap();
        let d = ElementwiseDerivatives::tanh(&record(x.clone(), x.tanh()));
        let h = d.hessian_diagonal(&Tensor::ones([2, 2])).unwrap().to_vec();
        let eps = 1e-5;
        for (i, &xi) in x.to_vec().iter().enumerate() {
            let fd = ((xi + eps).tanh() - 2.0 * xi.tanh() + (xi - eps).tanh()) / (eps * eps);
            assert!((h[i] - fd).abs() < 1e-4, "{} vs {}", h[i], fd);
        }
    }

    #[test]
    fn hessian_product_scales_by_diagonal() {
        let x = Tensor::from_vec(vec![0.5, -0.25], [1, 2]).unwrap();
        let y = x.sigmoid();
        let d = ElementwiseDerivatives::sigmoid(&record(x, y));
        let g = Tensor::from_vec(vec![2.0, -1.0], [1, 2]).unwrap();
        let v = Tensor::from_vec(vec![1.0, 1.0, 3.0, -2.0], [2, 1, 2]).unwrap();
        let hv = d.hessian_mat_prod(&g, &v).unwrap();
        let diag = d.hessian_diagonal(&g).unwrap();
        assert!(hv.select(1).unwrap().allclose(&v.select(1).unwrap().mul(&diag).unwrap(), 1e-12, 0.0));
    }

    #[test]
    fn relu_has_zero_hessian() {
        let x = Tensor::randn([3, 4]);
        let d = ElementwiseDerivatives::relu(&record(x.clone(), x.relu()));
        assert!(d.hessian_is_zero());
        assert_eq!(d.hessian_diagonal(&Tensor::ones([3, 4])).unwrap().max_abs(), 0.0);
    }

    #[test]
    fn ea_product_averages_over_batch() {
        let x = Tensor::from_vec(vec![0.3, -0.4, 1.0, 0.5], [2, 2]).unwrap();
        let y = x.sigmoid();
        let d = ElementwiseDerivatives::sigmoid(&record(x, y.clone()));
        let m = Tensor::from_vec(vec![2.0, 1.0, 1.0, 3.0], [2, 2]).unwrap();
        let got = d.ea_jac_t_mat_jac_prod(&m).unwrap().to_vec();

        let p: Vec<f64> = y.to_vec().iter().map(|s| s * (1.0 - s)).collect();
        let m = m.to_vec();
        for i in 0..2 {
            for j in 0..2 {
                let avg = (p[i] * p[j] + p[2 + i] * p[2 + j]) / 2.0;
                assert!((got[i * 2 + j] - m[i * 2 + j] * avg).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn dropout_without_mask_is_an_error() {
        let x = Tensor::ones([2, 2]);
        assert!(ElementwiseDerivatives::dropout(&record(x.clone(), x)).is_err());
    }
}
