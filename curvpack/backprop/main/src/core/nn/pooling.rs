use crate::api::error::{CurvError, CurvResult};
use crate::api::module::{ForwardContext, Forwarded, LayerKind, Module, Parameter};
use curvpack_core::Tensor;
use std::any::Any;
use std::ops::Range;

/// Window layout of a 1-D pooling layer without padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolGeometry {
    pub kernel_size: usize,
    pub stride: usize,
}

impl PoolGeometry {
    fn new(name: &str, kernel_size: usize) -> CurvResult<Self> {
        if kernel_size == 0 {
            return Err(CurvError::InvalidConfig(format!(
                "{} needs a positive kernel_size",
                name
            )));
        }
        Ok(Self {
            kernel_size,
            stride: kernel_size,
        })
    }

    /// `(length - kernel_size) / stride + 1`
    pub fn out_length(&self, length: usize) -> CurvResult<usize> {
        if self.kernel_size == 0 || self.stride == 0 {
            return Err(CurvError::InvalidConfig(format!(
                "pooling needs positive kernel_size and stride, got {} and {}",
                self.kernel_size, self.stride
            )));
        }
        if length < self.kernel_size {
            return Err(CurvError::ShapeMismatch {
                layer: "pooling".into(),
                expected: vec![self.kernel_size],
                got: vec![length],
            });
        }
        Ok((length - self.kernel_size) / self.stride + 1)
    }

    /// Input positions read by output position `o`.
    pub fn window(&self, o: usize) -> Range<usize> {
        let start = o * self.stride;
        start..start + self.kernel_size
    }
}

fn check_input(name: &str, input: &Tensor) -> CurvResult<(usize, usize, usize)> {
    let shape = input.shape();
    if shape.len() != 3 {
        return Err(CurvError::ShapeMismatch {
            layer: name.into(),
            expected: vec![shape.first().copied().unwrap_or(0), 0, 0],
            got: shape.to_vec(),
        });
    }
    Ok((shape[0], shape[1], shape[2]))
}

/// 1-D average pooling over `[batch, channels, length]`.
///
/// Stride defaults to the kernel size.
#[derive(Debug, Clone, Copy)]
pub struct AvgPool1d {
    geometry: PoolGeometry,
}

impl AvgPool1d {
    pub fn new(kernel_size: usize) -> CurvResult<Self> {
        Ok(Self {
            geometry: PoolGeometry::new("AvgPool1d", kernel_size)?,
        })
    }

    /// Sets the stride and returns self (builder pattern).
    pub fn with_stride(mut self, stride: usize) -> Self {
        self.geometry.stride = stride.max(1);
        self
    }

    pub fn geometry(&self) -> PoolGeometry {
        self.geometry
    }
}

impl Module for AvgPool1d {
    fn kind(&self) -> LayerKind {
        LayerKind::AvgPool1d
    }

    fn forward(&self, input: &Tensor, _ctx: &mut ForwardContext) -> CurvResult<Forwarded> {
        let (batch, channels, length) = check_input("AvgPool1d", input)?;
        let g = &self.geometry;
        let out_length = g.out_length(length)?;
        let inv = 1.0 / g.kernel_size as f64;

        let mut output = Vec::with_capacity(batch * channels * out_length);
        for row in input.data().chunks(length.max(1)).take(batch * channels) {
            for o in 0..out_length {
                output.push(row[g.window(o)].iter().sum::<f64>() * inv);
            }
        }
        let output = Tensor::from_vec(output, [batch, channels, out_length])?;
        Ok(Forwarded::new(output))
    }

    fn parameters(&self) -> Vec<&Parameter> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        Vec::new()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// 1-D max pooling over `[batch, channels, length]`.
///
/// The position of each window's maximum is returned as auxiliary output,
/// shape `[batch, channels, out_length]`, so the derivative operator routes
/// through exactly the recorded winners. Ties go to the first position.
#[derive(Debug, Clone, Copy)]
pub struct MaxPool1d {
    geometry: PoolGeometry,
}

impl MaxPool1d {
    pub fn new(kernel_size: usize) -> CurvResult<Self> {
        Ok(Self {
            geometry: PoolGeometry::new("MaxPool1d", kernel_size)?,
        })
    }

    /// Sets the stride and returns self (builder pattern).
    pub fn with_stride(mut self, stride: usize) -> Self {
        self.geometry.stride = stride.max(1);
        self
    }

    pub fn geometry(&self) -> PoolGeometry {
        self.geometry
    }
}

impl Module for MaxPool1d {
    fn kind(&self) -> LayerKind {
        LayerKind::MaxPool1d
    }

    fn forward(&self, input: &Tensor, _ctx: &mut ForwardContext) -> CurvResult<Forwarded> {
        let (batch, channels, length) = check_input("MaxPool1d", input)?;
        let g = &self.geometry;
        let out_length = g.out_length(length)?;

        let size = batch * channels * out_length;
        let mut output = Vec::with_capacity(size);
        let mut indices = Vec::with_capacity(size);
        for row in input.data().chunks(length.max(1)).take(batch * channels) {
            for o in 0..out_length {
                let mut best = o * g.stride;
                for pos in g.window(o) {
                    if row[pos] > row[best] {
                        best = pos;
                    }
                }
                output.push(row[best]);
                indices.push(best as f64);
            }
        }
        let shape = [batch, channels, out_length];
        Ok(Forwarded::with_aux(
            Tensor::from_vec(output, shape)?,
            Tensor::from_vec(indices, shape)?,
        ))
    }

    fn parameters(&self) -> Vec<&Parameter> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        Vec::new()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
