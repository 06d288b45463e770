//! Extension catalog and pass configuration.

use crate::api::error::{CurvError, CurvResult};
use std::fmt;

/// Monte-Carlo sampling settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonteCarlo {
    /// Total number of samples `M`.
    pub samples: usize,
    /// Number of groups the samples are split into (memory bound).
    pub chunks: usize,
    /// Base seed of the per-sample streams. `None` draws one per pass.
    pub seed: Option<u64>,
}

impl MonteCarlo {
    pub fn new(samples: usize) -> Self {
        Self {
            samples,
            chunks: 1,
            seed: None,
        }
    }

    /// Sets the chunk count and returns self (builder pattern).
    pub fn with_chunks(mut self, chunks: usize) -> Self {
        self.chunks = chunks;
        self
    }

    /// Sets the seed and returns self (builder pattern).
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn validate(&self) -> CurvResult<()> {
        if self.samples == 0 {
            return Err(CurvError::InvalidSampling(
                "sample count must be positive".into(),
            ));
        }
        if self.chunks == 0 {
            return Err(CurvError::InvalidSampling(
                "chunk count must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for MonteCarlo {
    fn default() -> Self {
        Self::new(1)
    }
}

/// A statistic computed during the backward pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Extension {
    /// Per-example gradients (`grad_batch`).
    BatchGrad,
    /// Per-example squared ℓ2 norms of the gradient (`batch_l2`).
    BatchL2Grad,
    /// Sum over the batch of squared per-example gradients (`sum_grad_squared`).
    SumGradSquared,
    /// Population variance of per-example gradients (`variance`).
    Variance,
    /// Exact diagonal of the generalized Gauss-Newton (`diag_ggn_exact`).
    DiagGGNExact,
    /// Per-example exact diagonal GGN (`diag_ggn_exact_batch`).
    BatchDiagGGNExact,
    /// Monte-Carlo diagonal GGN (`diag_ggn_mc`).
    DiagGGNMC(MonteCarlo),
    /// Per-example Monte-Carlo diagonal GGN (`diag_ggn_mc_batch`).
    BatchDiagGGNMC(MonteCarlo),
    /// Exact diagonal of the Hessian (`diag_h`).
    DiagHessian,
    /// Per-example diagonal Hessian (`diag_h_batch`).
    BatchDiagHessian,
    /// Kronecker factors from a sampled curvature factor (`kfac`).
    /// `seed: None` draws one per pass.
    KFAC { mc_samples: usize, seed: Option<u64> },
    /// Kronecker factors from the exact curvature factor (`kflr`).
    KFLR,
    /// Kronecker factors from the batch-averaged Hessian recursion (`kfra`).
    KFRA,
}

impl Extension {
    pub fn kind(&self) -> ExtensionKind {
        match self {
            Extension::BatchGrad => ExtensionKind::BatchGrad,
            Extension::BatchL2Grad => ExtensionKind::BatchL2Grad,
            Extension::SumGradSquared => ExtensionKind::SumGradSquared,
            Extension::Variance => ExtensionKind::Variance,
            Extension::DiagGGNExact => ExtensionKind::DiagGGNExact,
            Extension::BatchDiagGGNExact => ExtensionKind::BatchDiagGGNExact,
            Extension::DiagGGNMC(_) => ExtensionKind::DiagGGNMC,
            Extension::BatchDiagGGNMC(_) => ExtensionKind::BatchDiagGGNMC,
            Extension::DiagHessian => ExtensionKind::DiagHessian,
            Extension::BatchDiagHessian => ExtensionKind::BatchDiagHessian,
            Extension::KFAC { .. } => ExtensionKind::KFAC,
            Extension::KFLR => ExtensionKind::KFLR,
            Extension::KFRA => ExtensionKind::KFRA,
        }
    }

    pub fn validate(&self) -> CurvResult<()> {
        match self {
            Extension::DiagGGNMC(mc) | Extension::BatchDiagGGNMC(mc) => mc.validate(),
            Extension::KFAC { mc_samples, .. } if *mc_samples == 0 => Err(
                CurvError::InvalidSampling("KFAC needs at least one sample".into()),
            ),
            _ => Ok(()),
        }
    }
}

/// Configuration-free tag of an [`Extension`], used for registry lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExtensionKind {
    BatchGrad,
    BatchL2Grad,
    SumGradSquared,
    Variance,
    DiagGGNExact,
    BatchDiagGGNExact,
    DiagGGNMC,
    BatchDiagGGNMC,
    DiagHessian,
    BatchDiagHessian,
    KFAC,
    KFLR,
    KFRA,
}

impl ExtensionKind {
    pub const ALL: [ExtensionKind; 13] = [
        ExtensionKind::BatchGrad,
        ExtensionKind::BatchL2Grad,
        ExtensionKind::SumGradSquared,
        ExtensionKind::Variance,
        ExtensionKind::DiagGGNExact,
        ExtensionKind::BatchDiagGGNExact,
        ExtensionKind::DiagGGNMC,
        ExtensionKind::BatchDiagGGNMC,
        ExtensionKind::DiagHessian,
        ExtensionKind::BatchDiagHessian,
        ExtensionKind::KFAC,
        ExtensionKind::KFLR,
        ExtensionKind::KFRA,
    ];

    /// Everything except the Kronecker-factored family.
    pub const ELEMENTWISE: [ExtensionKind; 10] = [
        ExtensionKind::BatchGrad,
        ExtensionKind::BatchL2Grad,
        ExtensionKind::SumGradSquared,
        ExtensionKind::Variance,
        ExtensionKind::DiagGGNExact,
        ExtensionKind::BatchDiagGGNExact,
        ExtensionKind::DiagGGNMC,
        ExtensionKind::BatchDiagGGNMC,
        ExtensionKind::DiagHessian,
        ExtensionKind::BatchDiagHessian,
    ];
}

impl fmt::Display for ExtensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Which extensions run in a backward pass and how.
#[derive(Debug, Clone, Default)]
pub struct BackpackConfig {
    pub extensions: Vec<Extension>,
    /// Run Monte-Carlo chunks on the rayon pool instead of one after another.
    pub parallel_chunks: bool,
}

impl BackpackConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an extension and returns self (builder pattern).
    pub fn with(mut self, extension: Extension) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Enables parallel Monte-Carlo chunks and returns self (builder pattern).
    pub fn with_parallel_chunks(mut self, parallel: bool) -> Self {
        self.parallel_chunks = parallel;
        self
    }

    /// Rejects invalid sampling settings and extensions requested twice,
    /// which would write the same annotation slot.
    pub fn validate(&self) -> CurvResult<()> {
        let mut seen = Vec::with_capacity(self.extensions.len());
        for ext in &self.extensions {
            ext.validate()?;
            let kind = ext.kind();
            if seen.contains(&kind) {
                return Err(CurvError::InvalidConfig(format!(
                    "extension {} requested more than once",
                    kind
                )));
            }
            seen.push(kind);
        }
        Ok(())
    }
}
