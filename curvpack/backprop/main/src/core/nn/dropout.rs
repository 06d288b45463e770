use crate::api::error::{CurvError, CurvResult};
use crate::api::module::{ForwardContext, Forwarded, LayerKind, Module, Parameter};
use curvpack_core::Tensor;
use rand::Rng;
use std::any::Any;

/// Dropout layer.
///
/// During training, randomly zeroes elements with probability `p` and scales
/// the remaining elements by `1 / (1 - p)` (inverted dropout).
/// During evaluation, acts as identity.
///
/// The scaled mask is returned as auxiliary output so the derivative operator
/// reuses exactly the mask of the recorded pass.
#[derive(Debug, Clone, Copy)]
pub struct Dropout {
    p: f64,
}

impl Dropout {
    /// Creates a new Dropout layer with drop probability `p` in `[0, 1)`.
    pub fn new(p: f64) -> CurvResult<Self> {
        if !(0.0..1.0).contains(&p) {
            return Err(CurvError::InvalidConfig(format!(
                "dropout probability must be in [0, 1), got {}",
                p
            )));
        }
        Ok(Self { p })
    }

    /// Returns the drop probability.
    pub fn p(&self) -> f64 {
        self.p
    }
}

impl Module for Dropout {
    fn kind(&self) -> LayerKind {
        LayerKind::Dropout
    }

    fn forward(&self, input: &Tensor, ctx: &mut ForwardContext) -> CurvResult<Forwarded> {
        let mask = if !ctx.training || self.p == 0.0 {
            Tensor::ones(input.shape())
        } else {
            let scale = 1.0 / (1.0 - self.p);
            // each element kept with probability (1 - p)
            let data: Vec<f64> = (0..input.numel())
                .map(|_| if ctx.rng.gen::<f64>() >= self.p { scale } else { 0.0 })
                .collect();
            Tensor::from_vec(data, input.shape())?
        };
        let output = input.mul(&mask)?;
        Ok(Forwarded::with_aux(output, mask))
    }

    fn parameters(&self) -> Vec<&Parameter> {
        vec![]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
