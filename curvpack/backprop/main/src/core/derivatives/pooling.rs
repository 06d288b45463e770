use super::{check_batched, check_square, with_leading};
use crate::api::derivatives::Derivatives;
use crate::api::error::{CurvError, CurvResult};
use crate::core::graph::LayerRecord;
use crate::core::nn::pooling::PoolGeometry;
use curvpack_core::Tensor;

/// `(input feature, weight)` pairs feeding one output feature.
type Taps = Vec<Vec<(usize, f64)>>;

/// Operators of a 1-D pooling layer. Both variants are linear per example:
/// average pooling with a fixed stencil, max pooling with the stencil picked
/// by the recorded winners. The local Hessian vanishes.
pub struct PoolDerivatives {
    name: &'static str,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
    // one table shared by the batch, or one per example
    tables: Vec<Taps>,
}

impl PoolDerivatives {
    pub fn average(geometry: PoolGeometry, record: &LayerRecord) -> CurvResult<Self> {
        let (input_shape, output_shape) = Self::shapes("AvgPool1d", record)?;
        let (channels, length, out_length) = (input_shape[1], input_shape[2], output_shape[2]);
        let w = 1.0 / geometry.kernel_size as f64;
        let mut taps = Vec::with_capacity(channels * out_length);
        for c in 0..channels {
            for o in 0..out_length {
                taps.push(geometry.window(o).map(|pos| (c * length + pos, w)).collect());
            }
        }
        Ok(Self {
            name: "AvgPool1d",
            input_shape,
            output_shape,
            tables: vec![taps],
        })
    }

    /// Routes through the winner positions recorded in the forward pass.
    pub fn max(record: &LayerRecord) -> CurvResult<Self> {
        let (input_shape, output_shape) = Self::shapes("MaxPool1d", record)?;
        let indices = record.aux().ok_or_else(|| {
            CurvError::GraphError("MaxPool1d record carries no indices".into())
        })?;
        if indices.shape() != output_shape.as_slice() {
            return Err(CurvError::ShapeMismatch {
                layer: "MaxPool1d".into(),
                expected: output_shape,
                got: indices.shape().to_vec(),
            });
        }
        let (batch, channels, length) = (input_shape[0], input_shape[1], input_shape[2]);
        let out_length = output_shape[2];
        let per_example = channels * out_length;
        let tables = indices
            .data()
            .chunks(per_example.max(1))
            .take(batch)
            .map(|winners| {
                winners
                    .iter()
                    .enumerate()
                    .map(|(j, &pos)| vec![((j / out_length) * length + pos as usize, 1.0)])
                    .collect()
            })
            .collect();
        Ok(Self {
            name: "MaxPool1d",
            input_shape,
            output_shape,
            tables,
        })
    }

    fn shapes(name: &str, record: &LayerRecord) -> CurvResult<(Vec<usize>, Vec<usize>)> {
        let input = record.input().shape().to_vec();
        let output = record.output().shape().to_vec();
        if input.len() != 3 || output.len() != 3 || input[..2] != output[..2] {
            return Err(CurvError::ShapeMismatch {
                layer: name.into(),
                expected: input,
                got: output,
            });
        }
        Ok((input, output))
    }

    fn table(&self, n: usize) -> &Taps {
        if self.tables.len() == 1 {
            &self.tables[0]
        } else {
            &self.tables[n]
        }
    }

    fn in_features(&self) -> usize {
        self.input_shape[1..].iter().product()
    }

    fn out_features(&self) -> usize {
        self.output_shape[1..].iter().product()
    }
}

impl Derivatives for PoolDerivatives {
    fn name(&self) -> &str {
        self.name
    }

    fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    fn jac_mat_prod(&self, mat: &Tensor) -> CurvResult<Tensor> {
        let v = check_batched(self.name, mat, &self.input_shape)?;
        let (batch, d_in, d_out) = (self.input_shape[0], self.in_features(), self.out_features());
        let data = mat.data();
        let mut out = vec![0.0; v * batch * d_out];
        for (k, (src, dst)) in data
            .chunks(d_in.max(1))
            .zip(out.chunks_mut(d_out.max(1)))
            .enumerate()
        {
            for (o, taps) in dst.iter_mut().zip(self.table(k % batch.max(1))) {
                *o = taps.iter().map(|&(i, w)| w * src[i]).sum();
            }
        }
        Ok(Tensor::from_vec(out, with_leading(v, &self.output_shape))?)
    }

    fn jac_t_mat_prod(&self, mat: &Tensor) -> CurvResult<Tensor> {
        let v = check_batched(self.name, mat, &self.output_shape)?;
        let (batch, d_in, d_out) = (self.input_shape[0], self.in_features(), self.out_features());
        let data = mat.data();
        let mut out = vec![0.0; v * batch * d_in];
        for (k, (src, dst)) in data
            .chunks(d_out.max(1))
            .zip(out.chunks_mut(d_in.max(1)))
            .enumerate()
        {
            for (&g, taps) in src.iter().zip(self.table(k % batch.max(1))) {
                for &(i, w) in taps {
                    dst[i] += w * g;
                }
            }
        }
        Ok(Tensor::from_vec(out, with_leading(v, &self.input_shape))?)
    }

    fn hessian_is_zero(&self) -> bool {
        true
    }

    fn ea_jac_t_mat_jac_prod(&self, mat: &Tensor) -> CurvResult<Tensor> {
        let (d_in, d_out) = (self.in_features(), self.out_features());
        check_square(self.name, mat, d_out)?;
        let m = mat.data();
        let mut out = vec![0.0; d_in * d_in];
        // (1/N) Σ_n J_nᵀ M J_n over the sparse stencils
        for table in &self.tables {
            for (a, taps_a) in table.iter().enumerate() {
                for (b, taps_b) in table.iter().enumerate() {
                    let mab = m[a * d_out + b];
                    if mab == 0.0 {
                        continue;
                    }
                    for &(i, wi) in taps_a {
                        for &(j, wj) in taps_b {
                            out[i * d_in + j] += wi * wj * mab;
                        }
                    }
                }
            }
        }
        let scale = 1.0 / self.tables.len().max(1) as f64;
        Ok(Tensor::from_vec(out, [d_in, d_in])?.mul_scalar(scale))
    }
}
