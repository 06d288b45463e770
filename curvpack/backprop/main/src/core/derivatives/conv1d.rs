use super::{check_batched, check_square};
use crate::api::derivatives::Derivatives;
use crate::api::error::CurvResult;
use crate::api::module::ParamSlot;
use crate::core::graph::LayerRecord;
use crate::core::nn::conv1d::{Conv1d, ConvGeometry};
use curvpack_core::Tensor;

/// Operators of a 1-D convolution, expressed through the unfolded input so
/// no convolution matrix is ever built.
pub struct Conv1dDerivatives {
    name: String,
    geometry: ConvGeometry,
    weight: Tensor,   // [C_out, C_in * K]
    unfolded: Tensor, // [N, C_in * K, L_out]
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
}

impl Conv1dDerivatives {
    pub fn new(layer: &Conv1d, record: &LayerRecord) -> CurvResult<Self> {
        let g = layer.geometry();
        let input = record.input();
        let (n, length) = (input.shape()[0], input.shape()[2]);
        let out_length = g.out_length(length)?;

        let sample = g.in_channels * length;
        let mut unfolded = Vec::with_capacity(n * g.patch_size() * out_length);
        for chunk in input.data().chunks(sample) {
            unfolded.extend(g.unfold(chunk, length, out_length));
        }

        Ok(Self {
            name: "Conv1d".into(),
            geometry: g,
            weight: layer.weight().value().reshape(&[g.out_channels, g.patch_size()])?,
            unfolded: Tensor::from_vec(unfolded, [n, g.patch_size(), out_length])?,
            input_shape: vec![n, g.in_channels, length],
            output_shape: vec![n, g.out_channels, out_length],
        })
    }

    fn length(&self) -> usize {
        self.input_shape[2]
    }

    fn out_length(&self) -> usize {
        self.output_shape[2]
    }

    /// `Jᵀ m` for one example: `[C_out * L_out] -> [C_in * L]`.
    fn apply_jac_t(&self, m: &[f64]) -> CurvResult<Vec<f64>> {
        let m = Tensor::from_vec(m.to_vec(), [self.geometry.out_channels, self.out_length()])?;
        let cols = self.weight.t()?.matmul(&m)?;
        Ok(self
            .geometry
            .fold(cols.data(), self.length(), self.out_length()))
    }

    /// `J u` for one example: `[C_in * L] -> [C_out * L_out]`.
    fn apply_jac(&self, u: &[f64]) -> CurvResult<Vec<f64>> {
        let cols = self.geometry.unfold(u, self.length(), self.out_length());
        let cols = Tensor::from_vec(cols, [self.geometry.patch_size(), self.out_length()])?;
        Ok(self.weight.matmul(&cols)?.to_vec())
    }
}

impl Derivatives for Conv1dDerivatives {
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
        let v = check_batched(&self.name, mat, &self.input_shape)?;
        let sample = self.input_shape[1] * self.input_shape[2];
        let mut out = Vec::new();
        for u in mat.data().chunks(sample) {
            out.extend(self.apply_jac(u)?);
        }
        let mut shape = vec![v];
        shape.extend_from_slice(&self.output_shape);
        Ok(Tensor::from_vec(out, shape)?)
    }

    fn jac_t_mat_prod(&self, mat: &Tensor) -> CurvResult<Tensor> {
        let v = check_batched(&self.name, mat, &self.output_shape)?;
        let sample = self.output_shape[1] * self.output_shape[2];
        let mut out = Vec::new();
        for m in mat.data().chunks(sample) {
            out.extend(self.apply_jac_t(m)?);
        }
        let mut shape = vec![v];
        shape.extend_from_slice(&self.input_shape);
        Ok(Tensor::from_vec(out, shape)?)
    }

    fn hessian_is_zero(&self) -> bool {
        true
    }

    fn ea_jac_t_mat_jac_prod(&self, mat: &Tensor) -> CurvResult<Tensor> {
        let d_out = self.output_shape[1] * self.output_shape[2];
        let d_in = self.input_shape[1] * self.input_shape[2];
        check_square(&self.name, mat, d_out)?;

        // The Jacobian does not depend on the example, so the batch average
        // is Jᵀ M J. First Jᵀ M column by column, then (Jᵀ (Jᵀ M)ᵀ)ᵀ.
        let m_t = mat.t()?;
        let mut jt_m_t = Vec::with_capacity(d_out * d_in); // rows: (Jᵀ M)ᵀ
        for col in m_t.data().chunks(d_out) {
            jt_m_t.extend(self.apply_jac_t(col)?);
        }
        let jt_m = Tensor::from_vec(jt_m_t, [d_out, d_in])?.t()?; // [D_in, D_out]
        let mut rows = Vec::with_capacity(d_in * d_in);
        for row in jt_m.data().chunks(d_out) {
            rows.extend(self.apply_jac_t(row)?);
        }
        Ok(Tensor::from_vec(rows, [d_in, d_in])?)
    }

    fn param_jac_t_mat_prod(
        &self,
        slot: ParamSlot,
        mat: &Tensor,
        sum_batch: bool,
    ) -> CurvResult<Tensor> {
        let v = check_batched(&self.name, mat, &self.output_shape)?;
        let g = &self.geometry;
        let n = self.input_shape[0];
        let per_example = match slot {
            ParamSlot::Weight => {
                // m [C_out, L_out] @ U_nᵀ [L_out, C_in*K]
                let mut grads = Vec::with_capacity(v * n * g.out_channels * g.patch_size());
                for col in 0..v {
                    let m_v = mat.select(col)?;
                    for ex in 0..n {
                        let u_t = self.unfolded.select(ex)?.t()?;
                        grads.extend(m_v.select(ex)?.matmul(&u_t)?.to_vec());
                    }
                }
                Tensor::from_vec(grads, [v, n, g.out_channels, g.in_channels, g.kernel_size])?
            }
            ParamSlot::Bias => mat.sum(-1)?,
        };
        if sum_batch {
            Ok(per_example.sum(1)?)
        } else {
            Ok(per_example)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::module::{ForwardContext, Module};

    fn setup() -> (Conv1d, LayerRecord) {
        let layer = Conv1d::new(2, 3, 3).unwrap().with_stride(2).with_padding(1);
        let x = Tensor::randn([2, 2, 7]);
        let out = layer.forward(&x, &mut ForwardContext::seeded(0)).unwrap();
        (layer, LayerRecord::new(x, out.output, out.aux))
    }

    fn dot(a: &Tensor, b: &Tensor) -> f64 {
        a.mul(b).unwrap().sum_all()
    }

    #[test]
    fn jac_reproduces_forward_without_bias() {
        let (layer, record) = setup();
        let d = Conv1dDerivatives::new(&layer, &record).unwrap();
        let out = d.jac_mat_prod(&record.input().unsqueeze(0).unwrap()).unwrap();
        // bias is zero-initialised
        assert!(out
            .squeeze(0)
            .unwrap()
            .allclose(record.output(), 1e-10, 1e-12));
    }

    #[test]
    fn jac_t_is_adjoint_of_jac() {
        let (layer, record) = setup();
        let d = Conv1dDerivatives::new(&layer, &record).unwrap();
        let u = Tensor::randn([2, 2, 2, 7]);
        let v = Tensor::randn([2, 2, 3, 4]);
        let lhs = dot(&d.jac_mat_prod(&u).unwrap(), &v);
        let rhs = dot(&u, &d.jac_t_mat_prod(&v).unwrap());
        assert!((lhs - rhs).abs() < 1e-9);
    }

    #[test]
    fn ea_product_of_identity_is_gram_of_jacobian() {
        let (layer, record) = setup();
        let d = Conv1dDerivatives::new(&layer, &record).unwrap();
        let result = d.ea_jac_t_mat_jac_prod(&Tensor::eye(12)).unwrap();
        assert_eq!(result.shape(), &[14, 14]);

        // (JᵀJ)[i, j] = <J e_i, J e_j>
        let columns: Vec<Vec<f64>> = (0..14)
            .map(|i| {
                let mut e = vec![0.0; 14];
                e[i] = 1.0;
                d.apply_jac(&e).unwrap()
            })
            .collect();
        let got = result.to_vec();
        for i in 0..14 {
            for j in 0..14 {
                let want: f64 = columns[i].iter().zip(&columns[j]).map(|(a, b)| a * b).sum();
                assert!((got[i * 14 + j] - want).abs() < 1e-10);
            }
        }
    }
}
