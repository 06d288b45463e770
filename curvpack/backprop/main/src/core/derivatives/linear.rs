use super::{check_batched, check_square};
use crate::api::derivatives::Derivatives;
use crate::api::error::{CurvError, CurvResult};
use crate::api::module::ParamSlot;
use crate::core::graph::LayerRecord;
use crate::core::nn::linear::Linear;
use curvpack_core::Tensor;

/// Operators of `y = x Wᵀ + b` for input `[N, I]` and output `[N, O]`.
pub struct LinearDerivatives {
    name: String,
    input: Tensor,  // [N, I]
    weight: Tensor, // [O, I]
    has_bias: bool,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
}

impl LinearDerivatives {
    pub fn new(layer: &Linear, record: &LayerRecord) -> CurvResult<Self> {
        let input = record.input().clone();
        let n = input.shape().first().copied().unwrap_or(0);
        Ok(Self {
            name: "Linear".into(),
            input_shape: vec![n, layer.in_features()],
            output_shape: vec![n, layer.out_features()],
            weight: layer.weight().value().clone(),
            has_bias: layer.bias().is_some(),
            input,
        })
    }

    fn batch(&self) -> usize {
        self.input_shape[0]
    }

    /// `[V, N, a] @ m -> [V, N, b]` through one 2-D product.
    fn right_multiply(&self, mat: &Tensor, m: &Tensor) -> CurvResult<Tensor> {
        let v = mat.shape()[0];
        let rows = mat.reshape(&[v * self.batch(), mat.shape()[2]])?;
        let out = rows.matmul(m)?;
        let cols = out.shape()[1];
        Ok(out.reshape(&[v, self.batch(), cols])?)
    }

    /// Per-example outer products `s[v, n] ⊗ x[n]`: `[V, N, O, I]`.
    fn weight_outer(&self, mat: &Tensor) -> CurvResult<Tensor> {
        let v = mat.shape()[0];
        let (n, o, i) = (self.batch(), self.output_shape[1], self.input_shape[1]);
        let s = mat.data();
        let x = self.input.data();
        let mut out = vec![0.0; v * n * o * i];
        for vn in 0..v * n {
            let x_row = &x[(vn % n) * i..(vn % n + 1) * i];
            for oo in 0..o {
                let scale = s[vn * o + oo];
                let dst = &mut out[(vn * o + oo) * i..(vn * o + oo + 1) * i];
                for (d, &xv) in dst.iter_mut().zip(x_row) {
                    *d = scale * xv;
                }
            }
        }
        Ok(Tensor::from_vec(out, [v, n, o, i])?)
    }
}

impl Derivatives for LinearDerivatives {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    fn jac_mat_prod(&self, mat: &Tensor) -> CurvResult<Tensor> {
        check_batched(&self.name, mat, &self.input_shape)?;
        self.right_multiply(mat, &self.weight.t()?)
    }

    fn jac_t_mat_prod(&self, mat: &Tensor) -> CurvResult<Tensor> {
        check_batched(&self.name, mat, &self.output_shape)?;
        self.right_multiply(mat, &self.weight)
    }

    fn hessian_is_zero(&self) -> bool {
        true
    }

    fn ea_jac_t_mat_jac_prod(&self, mat: &Tensor) -> CurvResult<Tensor> {
        check_square(&self.name, mat, self.output_shape[1])?;
        // Wᵀ M W
        Ok(self.weight.t()?.matmul(mat)?.matmul(&self.weight)?)
    }

    fn param_jac_t_mat_prod(
        &self,
        slot: ParamSlot,
        mat: &Tensor,
        sum_batch: bool,
    ) -> CurvResult<Tensor> {
        let v = check_batched(&self.name, mat, &self.output_shape)?;
        match slot {
            ParamSlot::Weight if sum_batch => {
                // per column: Sᵀ X
                let mut slices = Vec::with_capacity(v);
                for col in 0..v {
                    slices.push(mat.select(col)?.t()?.matmul(&self.input)?);
                }
                let refs: Vec<&Tensor> = slices.iter().collect();
                Ok(Tensor::stack(&refs)?)
            }
            ParamSlot::Weight => self.weight_outer(mat),
            ParamSlot::Bias if self.has_bias => {
                if sum_batch {
                    Ok(mat.sum(1)?)
                } else {
                    Ok(mat.clone())
                }
            }
            ParamSlot::Bias => Err(CurvError::GraphError(format!(
                "{} has no bias parameter",
                self.name
            ))),
        }
    }

    fn param_squared_jac_t_sum(
        &self,
        slot: ParamSlot,
        mat: &Tensor,
        sum_batch: bool,
    ) -> CurvResult<Tensor> {
        check_batched(&self.name, mat, &self.output_shape)?;
        if slot == ParamSlot::Bias && !self.has_bias {
            return Err(CurvError::GraphError(format!(
                "{} has no bias parameter",
                self.name
            )));
        }
        // Σ_v (s_vno x_ni)² = (Σ_v s_vno²) x_ni²
        let s2 = mat.square().sum(0)?; // [N, O]
        match slot {
            ParamSlot::Weight => {
                let x2 = self.input.square();
                if sum_batch {
                    Ok(s2.t()?.matmul(&x2)?)
                } else {
                    let (n, o, i) = (self.batch(), self.output_shape[1], self.input_shape[1]);
                    let (s2, x2) = (s2.data(), x2.data());
                    let mut out = vec![0.0; n * o * i];
                    for nn in 0..n {
                        for oo in 0..o {
                            let scale = s2[nn * o + oo];
                            let dst = &mut out[(nn * o + oo) * i..(nn * o + oo + 1) * i];
                            for (d, &xv) in dst.iter_mut().zip(&x2[nn * i..(nn + 1) * i]) {
                                *d = scale * xv;
                            }
                        }
                    }
                    Ok(Tensor::from_vec(out, [n, o, i])?)
                }
            }
            ParamSlot::Bias => {
                if sum_batch {
                    Ok(s2.sum(0)?)
                } else {
                    Ok(s2)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::module::{ForwardContext, Module};

    fn setup() -> (Linear, LayerRecord) {
        let w = Tensor::from_vec(vec![1.0, -2.0, 0.5, 3.0, 0.0, -1.0], [2, 3]).unwrap();
        let b = Tensor::from_vec(vec![0.1, -0.2], [2]).unwrap();
        let layer = Linear::from_tensors(w, Some(b)).unwrap();
        let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, -1.0, 0.5, 2.0], [2, 3]).unwrap();
        let out = layer.forward(&x, &mut ForwardContext::seeded(0)).unwrap();
        let record = LayerRecord::new(x, out.output, out.aux);
        (layer, record)
    }

    fn dot(a: &Tensor, b: &Tensor) -> f64 {
        a.mul(b).unwrap().sum_all()
    }

    #[test]
    fn jac_t_is_adjoint_of_jac() {
        let (layer, record) = setup();
        let d = LinearDerivatives::new(&layer, &record).unwrap();
        let u = Tensor::randn([3, 2, 3]);
        let v = Tensor::randn([3, 2, 2]);
        let lhs = dot(&d.jac_mat_prod(&u).unwrap(), &v);
        let rhs = dot(&u, &d.jac_t_mat_prod(&v).unwrap());
        assert!((lhs - rhs).abs() < 1e-10);
    }

    #[test]
    fn summed_weight_jac_t_matches_per_example_sum() {
        let (layer, record) = setup();
        let d = LinearDerivatives::new(&layer, &record).unwrap();
        let s = Tensor::randn([4, 2, 2]);
        let per_example = d.param_jac_t_mat_prod(ParamSlot::Weight, &s, false).unwrap();
        let summed = d.param_jac_t_mat_prod(ParamSlot::Weight, &s, true).unwrap();
        assert!(per_example.sum(1).unwrap().allclose(&summed, 1e-12, 1e-12));
    }

    #[test]
    fn squared_sum_override_matches_default_contraction() {
        let (layer, record) = setup();
        let d = LinearDerivatives::new(&layer, &record).unwrap();
        let s = Tensor::randn([5, 2, 2]);
        for slot in [ParamSlot::Weight, ParamSlot::Bias] {
            let reference = d
                .param_jac_t_mat_prod(slot, &s, false)
                .unwrap()
                .square()
                .sum(0)
                .unwrap();
            let fast = d.param_squared_jac_t_sum(slot, &s, false).unwrap();
            assert!(fast.allclose(&reference, 1e-10, 1e-12));
            let fast_sum = d.param_squared_jac_t_sum(slot, &s, true).unwrap();
            assert!(fast_sum.allclose(&reference.sum(0).unwrap(), 1e-10, 1e-12));
        }
    }

    #[test]
    fn wrong_signal_shape_is_rejected() {
        let (layer, record) = setup();
        let d = LinearDerivatives::new(&layer, &record).unwrap();
        assert!(d.jac_t_mat_prod(&Tensor::zeros([1, 2, 3])).is_err());
    }
}
