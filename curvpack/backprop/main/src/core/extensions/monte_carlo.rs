//! Splitting Monte-Carlo samples into groups that are swept separately.
//!
//! Group `k` covers sample indices `range_k` and contributes its own mean
//! scaled by `|range_k| / M`; the weighted group results add up to the mean
//! over all `M` samples. Sample `m` draws from the same random stream in every
//! grouping, so chunking only changes rounding.

use super::diag_ggn::DiagGgn;
use super::BackpropExtension;
use crate::api::config::MonteCarlo;
use std::ops::Range;

/// `chunks` groups of `samples / chunks` indices, plus a final smaller group
/// for the remainder. `chunks` is clamped to `samples`.
pub(crate) fn chunk_plan(samples: usize, chunks: usize) -> Vec<Range<usize>> {
    let chunks = if chunks > samples {
        log::warn!(
            "{} chunks requested for {} samples, using {}",
            chunks,
            samples,
            samples
        );
        samples
    } else {
        chunks
    };
    if chunks == 0 {
        return Vec::new();
    }
    let size = samples / chunks;
    let mut plan: Vec<Range<usize>> = (0..chunks).map(|k| k * size..(k + 1) * size).collect();
    if chunks * size < samples {
        plan.push(chunks * size..samples);
    }
    plan
}

/// One diagonal-GGN instance per group of `plan`.
pub(crate) fn chunk_instances(
    mc: &MonteCarlo,
    seed: u64,
    batched: bool,
) -> Vec<Box<dyn BackpropExtension>> {
    let plan = chunk_plan(mc.samples, mc.chunks);
    log::info!(
        "Monte-Carlo plan: {} samples in {} groups (seed {})",
        mc.samples,
        plan.len(),
        seed
    );
    let total = mc.samples as f64;
    plan.into_iter()
        .map(|range| {
            let weight = range.len() as f64 / total;
            Box::new(DiagGgn::sampled(range, seed, weight, batched)) as Box<dyn BackpropExtension>
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(plan: &[Range<usize>]) -> Vec<usize> {
        plan.iter().map(|r| r.len()).collect()
    }

    #[test]
    fn even_split() {
        assert_eq!(sizes(&chunk_plan(12, 3)), vec![4, 4, 4]);
    }

    #[test]
    fn remainder_becomes_extra_group() {
        let plan = chunk_plan(10, 3);
        assert_eq!(sizes(&plan), vec![3, 3, 3, 1]);
        assert_eq!(plan.last().unwrap().end, 10);
    }

    #[test]
    fn chunks_are_clamped_to_samples() {
        assert_eq!(sizes(&chunk_plan(2, 5)), vec![1, 1]);
    }

    #[test]
    fn groups_cover_every_sample_once() {
        let plan = chunk_plan(1000, 7);
        let mut next = 0;
        for r in &plan {
            assert_eq!(r.start, next);
            next = r.end;
        }
        assert_eq!(next, 1000);
    }

    #[test]
    fn weights_sum_to_one() {
        let plan = chunk_plan(10, 4);
        let total: f64 = plan.iter().map(|r| r.len() as f64 / 10.0).sum();
        assert!((total - 1.0).abs() < 1e-15);
    }
}
