use super::{check_inputs, sample_rng};
use crate::api::error::{CurvError, CurvResult};
use crate::api::loss::{Loss, Reduction};
use curvpack_core::Tensor;
use rand::Rng;
use std::ops::Range;

/// Cross-entropy on raw logits (log-softmax + NLL).
///
/// Predictions are logits of shape `[batch, classes]`; targets are one-hot or
/// probability rows of the same shape.
///
/// Loss = -Σ_n Σ_c t_nc log p_nc, divided by `N` under [`Reduction::Mean`].
/// With `p = softmax(f)` the per-example Hessian is `(diag p - p pᵀ) / d`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropyLoss {
    reduction: Reduction,
}

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reduction(reduction: Reduction) -> Self {
        Self { reduction }
    }

    fn divisor(&self, n: usize) -> f64 {
        match self.reduction {
            Reduction::Mean => n as f64,
            Reduction::Sum => 1.0,
        }
    }

    /// Validates the inputs and returns `(softmax(predictions), N, C)`.
    fn probabilities(&self, predictions: &Tensor, targets: &Tensor) -> CurvResult<(Tensor, usize, usize)> {
        let (n, c) = check_inputs(self.name(), predictions, targets)?;
        for (row, t) in targets.data().chunks(c).enumerate() {
            let total: f64 = t.iter().sum();
            if t.iter().any(|&v| v < 0.0) || (total - 1.0).abs() > 1e-6 {
                return Err(CurvError::InvalidConfig(format!(
                    "target row {} is not a probability vector",
                    row
                )));
            }
        }
        Ok((predictions.softmax()?, n, c))
    }
}

impl Loss for CrossEntropyLoss {
    fn name(&self) -> &str {
        "CrossEntropyLoss"
    }

    fn forward(&self, predictions: &Tensor, targets: &Tensor) -> CurvResult<f64> {
        let (_, n, c) = self.probabilities(predictions, targets)?;
        // log_softmax = x - max - log(sum(exp(x - max)))
        let mut total = 0.0;
        for (logits, t) in predictions.data().chunks(c).zip(targets.data().chunks(c)) {
            let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let log_sum = logits.iter().map(|&x| (x - max).exp()).sum::<f64>().ln();
            total -= logits
                .iter()
                .zip(t)
                .map(|(&x, &tc)| tc * (x - max - log_sum))
                .sum::<f64>();
        }
        Ok(total / self.divisor(n))
    }

    fn gradient(&self, predictions: &Tensor, targets: &Tensor) -> CurvResult<Tensor> {
        let (probs, n, _) = self.probabilities(predictions, targets)?;
        Ok(probs.sub(targets)?.div_scalar(self.divisor(n)))
    }

    fn sqrt_hessian(&self, predictions: &Tensor, targets: &Tensor) -> CurvResult<Tensor> {
        let (probs, n, c) = self.probabilities(predictions, targets)?;
        let scale = self.divisor(n).sqrt();
        let p = probs.data();
        // S[v, n, c] = (δ_cv √p_v - p_c √p_v) / √d, so Σ_v S Sᵀ = diag p - p pᵀ
        let mut data = vec![0.0; c * n * c];
        for v in 0..c {
            for ex in 0..n {
                let row = &p[ex * c..(ex + 1) * c];
                let root = row[v].sqrt();
                let dst = &mut data[(v * n + ex) * c..(v * n + ex + 1) * c];
                for (cls, d) in dst.iter_mut().enumerate() {
                    let delta = if cls == v { root } else { 0.0 };
                    *d = (delta - row[cls] * root) / scale;
                }
            }
        }
        Ok(Tensor::from_vec(data, [c, n, c])?)
    }

    fn sqrt_hessian_sampled(
        &self,
        predictions: &Tensor,
        targets: &Tensor,
        samples: Range<usize>,
        seed: u64,
    ) -> CurvResult<Tensor> {
        let (probs, n, c) = self.probabilities(predictions, targets)?;
        let scale = self.divisor(n).sqrt();
        let p = probs.data();
        let count = samples.len();
        let mut columns = Vec::with_capacity(count * n * c);
        for m in samples {
            let mut rng = sample_rng(seed, m);
            for ex in 0..n {
                let row = &p[ex * c..(ex + 1) * c];
                let label = sample_categorical(row, rng.gen::<f64>());
                columns.extend(row.iter().enumerate().map(|(cls, &pc)| {
                    let onehot = if cls == label { 1.0 } else { 0.0 };
                    (pc - onehot) / scale
                }));
            }
        }
        Ok(Tensor::from_vec(columns, [count, n, c])?)
    }

    fn sum_hessian(&self, predictions: &Tensor, targets: &Tensor) -> CurvResult<Tensor> {
        let (probs, n, c) = self.probabilities(predictions, targets)?;
        let p = probs.data();
        let mut data = vec![0.0; c * c];
        for row in p.chunks(c) {
            for i in 0..c {
                for j in 0..c {
                    let diag = if i == j { row[i] } else { 0.0 };
                    data[i * c + j] += diag - row[i] * row[j];
                }
            }
        }
        Ok(Tensor::from_vec(data, [c, c])?.div_scalar(self.divisor(n)))
    }
}

/// Inverse-CDF draw from `probs` with a uniform variate `u` in `[0, 1)`.
fn sample_categorical(probs: &[f64], u: f64) -> usize {
    let mut cumulative = 0.0;
    for (i, &p) in probs.iter().enumerate() {
        cumulative += p;
        if u < cumulative {
            return i;
        }
    }
    probs.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_hot(labels: &[usize], classes: usize) -> Tensor {
        let mut data = vec![0.0; labels.len() * classes];
        for (i, &l) in labels.iter().enumerate() {
            data[i * classes + l] = 1.0;
        }
        Tensor::from_vec(data, [labels.len(), classes]).unwrap()
    }

    fn per_example_gram(s: &Tensor, n: usize, c: usize) -> Vec<f64> {
        let v_count = s.shape()[0];
        let d = s.data();
        let mut out = vec![0.0; n * c * c];
        for v in 0..v_count {
            for ex in 0..n {
                for i in 0..c {
                    for j in 0..c {
                        out[(ex * c + i) * c + j] += d[(v * n + ex) * c + i] * d[(v * n + ex) * c + j];
                    }
                }
            }
        }
        out
    }

    #[test]
    fn sqrt_hessian_reproduces_softmax_hessian() {
        let loss = CrossEntropyLoss::new();
        let f = Tensor::from_vec(vec![0.2, -1.0, 0.7, 1.5, 0.0, -0.3], [2, 3]).unwrap();
        let y = one_hot(&[2, 0], 3);
        let s = loss.sqrt_hessian(&f, &y).unwrap();
        let gram = per_example_gram(&s, 2, 3);
        let p = f.softmax().unwrap().to_vec();
        for ex in 0..2 {
            for i in 0..3 {
                for j in 0..3 {
                    let diag = if i == j { p[ex * 3 + i] } else { 0.0 };
                    let want = (diag - p[ex * 3 + i] * p[ex * 3 + j]) / 2.0;
                    assert!((gram[(ex * 3 + i) * 3 + j] - want).abs() < 1e-12);
                }
            }
        }
    }

    #[test]
    fn sum_hessian_is_batch_sum_of_gram() {
        let loss = CrossEntropyLoss::with_reduction(Reduction::Sum);
        let f = Tensor::randn([4, 3]);
        let y = one_hot(&[0, 1, 2, 1], 3);
        let gram = per_example_gram(&loss.sqrt_hessian(&f, &y).unwrap(), 4, 3);
        let summed = loss.sum_hessian(&f, &y).unwrap().to_vec();
        for k in 0..9 {
            let want: f64 = (0..4).map(|ex| gram[ex * 9 + k]).sum();
            assert!((summed[k] - want).abs() < 1e-12);
        }
    }

    #[test]
    fn gradient_is_probabilities_minus_targets() {
        let loss = CrossEntropyLoss::with_reduction(Reduction::Sum);
        let f = Tensor::randn([2, 4]);
        let y = one_hot(&[3, 1], 4);
        let g = loss.gradient(&f, &y).unwrap();
        let want = f.softmax().unwrap().sub(&y).unwrap();
        assert!(g.allclose(&want, 1e-12, 1e-12));
        assert!(g.sum(1).unwrap().max_abs() < 1e-12);
    }

    #[test]
    fn non_probability_targets_are_rejected() {
        let loss = CrossEntropyLoss::new();
        let f = Tensor::zeros([1, 2]);
        let y = Tensor::from_vec(vec![1.0, 1.0], [1, 2]).unwrap();
        assert!(matches!(loss.forward(&f, &y), Err(CurvError::InvalidConfig(_))));
    }

    #[test]
    fn categorical_sampling_follows_cdf() {
        let probs = [0.2, 0.5, 0.3];
        assert_eq!(sample_categorical(&probs, 0.1), 0);
        assert_eq!(sample_categorical(&probs, 0.69), 1);
        assert_eq!(sample_categorical(&probs, 0.71), 2);
        assert_eq!(sample_categorical(&probs, 0.999_999_999), 2);
    }
}
