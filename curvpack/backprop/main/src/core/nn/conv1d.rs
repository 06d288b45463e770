use crate::api::error::{CurvError, CurvResult};
use crate::api::module::{ForwardContext, Forwarded, LayerKind, Module, ParamSlot, Parameter};
use curvpack_core::Tensor;
use rand::Rng;
use std::any::Any;

/// Hyper-parameters of a 1-D convolution, shared by the layer and its
/// derivative operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
    pub dilation: usize,
}

impl ConvGeometry {
    /// `(length + 2*padding - dilation*(kernel_size-1) - 1) / stride + 1`
    pub fn out_length(&self, length: usize) -> CurvResult<usize> {
        if self.kernel_size == 0 || self.stride == 0 {
            return Err(CurvError::InvalidConfig(format!(
                "Conv1d needs positive kernel_size and stride, got {} and {}",
                self.kernel_size, self.stride
            )));
        }
        let span = self.dilation * (self.kernel_size - 1) + 1;
        let padded = length + 2 * self.padding;
        if padded < span {
            return Err(CurvError::ShapeMismatch {
                layer: "Conv1d".into(),
                expected: vec![span.saturating_sub(2 * self.padding)],
                got: vec![length],
            });
        }
        Ok((padded - span) / self.stride + 1)
    }

    /// Rows of the unfolded input: one per (input channel, kernel tap).
    pub fn patch_size(&self) -> usize {
        self.in_channels * self.kernel_size
    }

    /// Input position read by output position `o` through tap `k`, if inside
    /// the unpadded signal.
    fn source(&self, o: usize, k: usize, length: usize) -> Option<usize> {
        let pos = (o * self.stride + k * self.dilation) as isize - self.padding as isize;
        (pos >= 0 && (pos as usize) < length).then_some(pos as usize)
    }

    /// im2col for one example: `[C_in, L] -> [C_in*K, L_out]`.
    pub fn unfold(&self, signal: &[f64], length: usize, out_length: usize) -> Vec<f64> {
        let k_size = self.kernel_size;
        let mut cols = vec![0.0; self.patch_size() * out_length];
        for c in 0..self.in_channels {
            for k in 0..k_size {
                let row = (c * k_size + k) * out_length;
                for o in 0..out_length {
                    if let Some(pos) = self.source(o, k, length) {
                        cols[row + o] = signal[c * length + pos];
                    }
                }
            }
        }
        cols
    }

    /// Adjoint of [`ConvGeometry::unfold`]: scatter-adds columns back onto
    /// `[C_in, L]`.
    pub fn fold(&self, cols: &[f64], length: usize, out_length: usize) -> Vec<f64> {
        let k_size = self.kernel_size;
        let mut signal = vec![0.0; self.in_channels * length];
        for c in 0..self.in_channels {
            for k in 0..k_size {
                let row = (c * k_size + k) * out_length;
                for o in 0..out_length {
                    if let Some(pos) = self.source(o, k, length) {
                        signal[c * length + pos] += cols[row + o];
                    }
                }
            }
        }
        signal
    }
}

/// 1-D convolutional layer.
///
/// Applies a 1-D convolution over an input signal of shape
/// `[batch, in_channels, length]`, producing output of shape
/// `[batch, out_channels, out_length]`.
///
/// Xavier initialization for weights, zeros for bias.
pub struct Conv1d {
    weight: Parameter, // [out_channels, in_channels, kernel_size]
    bias: Parameter,   // [out_channels]
    geometry: ConvGeometry,
}

impl Conv1d {
    /// Creates a new Conv1d layer with stride=1, padding=0, dilation=1.
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize) -> CurvResult<Self> {
        Self::with_rng(in_channels, out_channels, kernel_size, &mut rand::thread_rng())
    }

    pub fn with_rng<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        rng: &mut R,
    ) -> CurvResult<Self> {
        if in_channels == 0 || out_channels == 0 || kernel_size == 0 {
            return Err(CurvError::InvalidConfig(format!(
                "Conv1d({}, {}, kernel_size={}) has an empty dimension",
                in_channels, out_channels, kernel_size
            )));
        }
        let fan_in = in_channels * kernel_size;
        let fan_out = out_channels * kernel_size;
        let scale = (6.0 / (fan_in + fan_out) as f64).sqrt();
        let weight =
            Tensor::randn_with([out_channels, in_channels, kernel_size], rng).mul_scalar(scale);

        Ok(Self {
            weight: Parameter::new(ParamSlot::Weight, weight),
            bias: Parameter::new(ParamSlot::Bias, Tensor::zeros([out_channels])),
            geometry: ConvGeometry {
                in_channels,
                out_channels,
                kernel_size,
                stride: 1,
                padding: 0,
                dilation: 1,
            },
        })
    }

    /// Sets the stride and returns self (builder pattern).
    pub fn with_stride(mut self, stride: usize) -> Self {
        self.geometry.stride = stride.max(1);
        self
    }

    /// Sets the padding and returns self (builder pattern).
    pub fn with_padding(mut self, padding: usize) -> Self {
        self.geometry.padding = padding;
        self
    }

    /// Sets the dilation and returns self (builder pattern).
    pub fn with_dilation(mut self, dilation: usize) -> Self {
        self.geometry.dilation = dilation.max(1);
        self
    }

    pub fn geometry(&self) -> ConvGeometry {
        self.geometry
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    pub fn bias(&self) -> &Parameter {
        &self.bias
    }

    fn check_input(&self, input: &Tensor) -> CurvResult<(usize, usize)> {
        let shape = input.shape();
        if shape.len() != 3 || shape[1] != self.geometry.in_channels {
            return Err(CurvError::ShapeMismatch {
                layer: "Conv1d".into(),
                expected: vec![
                    shape.first().copied().unwrap_or(0),
                    self.geometry.in_channels,
                    shape.get(2).copied().unwrap_or(0),
                ],
                got: shape.to_vec(),
            });
        }
        Ok((shape[0], shape[2]))
    }
}

impl Module for Conv1d {
    fn kind(&self) -> LayerKind {
        LayerKind::Conv1d
    }

    fn forward(&self, input: &Tensor, _ctx: &mut ForwardContext) -> CurvResult<Forwarded> {
        let (batch, length) = self.check_input(input)?;
        let g = &self.geometry;
        let out_length = g.out_length(length)?;

        // weight viewed as [out_channels, in_channels * kernel_size]
        let weight = self.weight.value().reshape(&[g.out_channels, g.patch_size()])?;
        let bias = self.bias.value().data();
        let data = input.data();
        let sample = g.in_channels * length;

        let mut output = Vec::with_capacity(batch * g.out_channels * out_length);
        for b in 0..batch {
            let cols = g.unfold(&data[b * sample..(b + 1) * sample], length, out_length);
            let cols = Tensor::from_vec(cols, [g.patch_size(), out_length])?;
            let y = weight.matmul(&cols)?;
            for (oc, row) in y.data().chunks(out_length).enumerate() {
                output.extend(row.iter().map(|v| v + bias[oc]));
            }
        }
        let output = Tensor::from_vec(output, [batch, g.out_channels, out_length])?;
        Ok(Forwarded::new(output))
    }

    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.weight, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.weight, &mut self.bias]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
