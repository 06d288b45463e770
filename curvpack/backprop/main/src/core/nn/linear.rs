use crate::api::error::{CurvError, CurvResult};
use crate::api::module::{ForwardContext, Forwarded, LayerKind, Module, ParamSlot, Parameter};
use curvpack_core::Tensor;
use rand::Rng;
use std::any::Any;

/// Linear layer: y = x @ W^T + b
/// Xavier initialization for weights, zeros for bias.
pub struct Linear {
    weight: Parameter,       // [out_features, in_features]
    bias: Option<Parameter>, // [out_features]
    in_features: usize,
    out_features: usize,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize) -> Self {
        Self::with_rng(in_features, out_features, &mut rand::thread_rng())
    }

    /// Same as [`Linear::new`] but draws the initial weights from `rng`.
    pub fn with_rng<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        // Xavier scale: sqrt(6 / (fan_in + fan_out))
        let scale = (6.0 / (in_features + out_features) as f64).sqrt();
        let weight = Tensor::randn_with([out_features, in_features], rng).mul_scalar(scale);
        Self {
            weight: Parameter::new(ParamSlot::Weight, weight),
            bias: Some(Parameter::new(ParamSlot::Bias, Tensor::zeros([out_features]))),
            in_features,
            out_features,
        }
    }

    /// Build from explicit values. `weight` is `[out, in]`, `bias` is `[out]`.
    pub fn from_tensors(weight: Tensor, bias: Option<Tensor>) -> CurvResult<Self> {
        if weight.ndim() != 2 {
            return Err(CurvError::ShapeMismatch {
                layer: "Linear".into(),
                expected: vec![0, 0],
                got: weight.shape().to_vec(),
            });
        }
        let (out_features, in_features) = (weight.shape()[0], weight.shape()[1]);
        if let Some(b) = &bias {
            if b.shape() != [out_features] {
                return Err(CurvError::ShapeMismatch {
                    layer: "Linear".into(),
                    expected: vec![out_features],
                    got: b.shape().to_vec(),
                });
            }
        }
        Ok(Self {
            weight: Parameter::new(ParamSlot::Weight, weight),
            bias: bias.map(|b| Parameter::new(ParamSlot::Bias, b)),
            in_features,
            out_features,
        })
    }

    /// Drops the bias term and returns self (builder pattern).
    pub fn without_bias(mut self) -> Self {
        self.bias = None;
        self
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }
}

impl Module for Linear {
    fn kind(&self) -> LayerKind {
        LayerKind::Linear
    }

    fn forward(&self, input: &Tensor, _ctx: &mut ForwardContext) -> CurvResult<Forwarded> {
        if input.ndim() != 2 || input.shape()[1] != self.in_features {
            return Err(CurvError::ShapeMismatch {
                layer: "Linear".into(),
                expected: vec![input.shape().first().copied().unwrap_or(0), self.in_features],
                got: input.shape().to_vec(),
            });
        }
        // y = input @ weight^T + bias
        let mut output = input.matmul(&self.weight.value().t()?)?;
        if let Some(bias) = &self.bias {
            output = output.add(bias.value())?;
        }
        Ok(Forwarded::new(output))
    }

    fn parameters(&self) -> Vec<&Parameter> {
        let mut params = vec![&self.weight];
        params.extend(self.bias.as_ref());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = vec![&mut self.weight];
        params.extend(self.bias.as_mut());
        params
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
