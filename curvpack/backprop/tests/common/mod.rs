#![allow(dead_code)]

use curvpack_backprop::*;
use curvpack_core::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const FD_EPS: f64 = 1e-6;
pub const FD_EPS_2ND: f64 = 1e-4;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

pub fn one_hot(labels: &[usize], classes: usize) -> Tensor {
    let mut data = vec![0.0; labels.len() * classes];
    for (i, &l) in labels.iter().enumerate() {
        data[i * classes + l] = 1.0;
    }
    Tensor::from_vec(data, [labels.len(), classes]).unwrap()
}

pub fn random_one_hot(n: usize, classes: usize, rng: &mut StdRng) -> Tensor {
    let labels: Vec<usize> = (0..n).map(|_| rng.gen_range(0..classes)).collect();
    one_hot(&labels, classes)
}

/// Network output on the graph's current parameters. The fixed seed keeps
/// dropout masks identical between calls.
pub fn outputs(graph: &Graph, x: &Tensor) -> Tensor {
    graph
        .forward_with(x, &mut ForwardContext::seeded(0))
        .unwrap()
        .output()
        .clone()
}

pub fn run(graph: &Graph, x: &Tensor, y: &Tensor, loss: &dyn Loss, config: BackpackConfig) -> PassResults {
    let pass = graph.forward_with(x, &mut ForwardContext::seeded(0)).unwrap();
    Backpack::new(graph, config)
        .unwrap()
        .backward(&pass, loss, y)
        .unwrap()
}

/// One flattened annotation per parameter, in graph order.
pub fn quantity(graph: &Graph, results: &PassResults, q: Quantity) -> Vec<Vec<f64>> {
    graph
        .parameters()
        .iter()
        .map(|p| {
            results
                .tensor(p, q)
                .unwrap_or_else(|| panic!("{} missing on {}", q, p.name()))
                .to_vec()
        })
        .collect()
}

/// Adds `delta` to element `elem` of the `p`-th parameter.
pub fn nudge(graph: &mut Graph, p: usize, elem: usize, delta: f64) {
    let mut params = graph.parameters_mut();
    let param = &mut params[p];
    let shape = param.shape().to_vec();
    let mut data = param.value().to_vec();
    data[elem] += delta;
    param.set_value(Tensor::from_vec(data, shape).unwrap()).unwrap();
}

fn parameter_sizes(graph: &Graph) -> Vec<usize> {
    graph.parameters().iter().map(|p| p.numel()).collect()
}

/// Central-difference gradient of `f` with respect to every parameter.
pub fn fd_gradient<F: Fn(&Graph) -> f64>(graph: &mut Graph, f: F) -> Vec<Vec<f64>> {
    let sizes = parameter_sizes(graph);
    let mut out = Vec::new();
    for (p, &numel) in sizes.iter().enumerate() {
        let mut grads = Vec::with_capacity(numel);
        for k in 0..numel {
            nudge(graph, p, k, FD_EPS);
            let plus = f(&*graph);
            nudge(graph, p, k, -2.0 * FD_EPS);
            let minus = f(&*graph);
            nudge(graph, p, k, FD_EPS);
            grads.push((plus - minus) / (2.0 * FD_EPS));
        }
        out.push(grads);
    }
    out
}

/// Central second difference of `f` along every parameter coordinate.
pub fn fd_hessian_diagonal<F: Fn(&Graph) -> f64>(graph: &mut Graph, f: F) -> Vec<Vec<f64>> {
    let sizes = parameter_sizes(graph);
    let center = f(&*graph);
    let h = FD_EPS_2ND;
    let mut out = Vec::new();
    for (p, &numel) in sizes.iter().enumerate() {
        let mut diag = Vec::with_capacity(numel);
        for k in 0..numel {
            nudge(graph, p, k, h);
            let plus = f(&*graph);
            nudge(graph, p, k, -2.0 * h);
            let minus = f(&*graph);
            nudge(graph, p, k, h);
            diag.push((plus - 2.0 * center + minus) / (h * h));
        }
        out.push(diag);
    }
    out
}

/// Per-example loss Hessians `[N][C * C]` with respect to the predictions.
pub fn mse_hessians(preds: &Tensor, divisor: f64) -> Vec<Vec<f64>> {
    let (n, c) = (preds.shape()[0], preds.shape()[1]);
    (0..n)
        .map(|_| {
            let mut h = vec![0.0; c * c];
            for i in 0..c {
                h[i * c + i] = 2.0 / divisor;
            }
            h
        })
        .collect()
}

pub fn cross_entropy_hessians(preds: &Tensor, divisor: f64) -> Vec<Vec<f64>> {
    let c = preds.shape()[1];
    let probs = preds.softmax().unwrap().to_vec();
    probs
        .chunks(c)
        .map(|p| {
            let mut h = vec![0.0; c * c];
            for i in 0..c {
                for j in 0..c {
                    let diag = if i == j { p[i] } else { 0.0 };
                    h[i * c + j] = (diag - p[i] * p[j]) / divisor;
                }
            }
            h
        })
        .collect()
}

/// Per-example diagonal GGN `[param][N][numel]` from finite-difference
/// output Jacobians: `diag(J_nᵀ H_n J_n)`.
pub fn brute_force_ggn_batch(graph: &mut Graph, x: &Tensor, hessians: &[Vec<f64>]) -> Vec<Vec<Vec<f64>>> {
    let sizes = parameter_sizes(graph);
    let base = outputs(graph, x);
    let (n, c) = (base.shape()[0], base.shape()[1]);
    let mut out = Vec::new();
    for (p, &numel) in sizes.iter().enumerate() {
        let mut per_example = vec![vec![0.0; numel]; n];
        for k in 0..numel {
            nudge(graph, p, k, FD_EPS);
            let plus = outputs(graph, x).to_vec();
            nudge(graph, p, k, -2.0 * FD_EPS);
            let minus = outputs(graph, x).to_vec();
            nudge(graph, p, k, FD_EPS);
            let column: Vec<f64> = plus
                .iter()
                .zip(&minus)
                .map(|(a, b)| (a - b) / (2.0 * FD_EPS))
                .collect();
            for ex in 0..n {
                let j = &column[ex * c..(ex + 1) * c];
                let h = &hessians[ex];
                let mut value = 0.0;
                for a in 0..c {
                    for b in 0..c {
                        value += j[a] * h[a * c + b] * j[b];
                    }
                }
                per_example[ex][k] = value;
            }
        }
        out.push(per_example);
    }
    out
}

pub fn sum_over_batch(batched: &[Vec<Vec<f64>>]) -> Vec<Vec<f64>> {
    batched
        .iter()
        .map(|per_example| {
            let mut total = vec![0.0; per_example[0].len()];
            for row in per_example {
                for (t, v) in total.iter_mut().zip(row) {
                    *t += v;
                }
            }
            total
        })
        .collect()
}

pub fn flatten_batch(batched: &[Vec<Vec<f64>>]) -> Vec<Vec<f64>> {
    batched.iter().map(|rows| rows.concat()).collect()
}

pub fn assert_close(name: &str, got: &[f64], want: &[f64], rtol: f64, atol: f64) {
    assert_eq!(got.len(), want.len(), "{name}: length mismatch");
    for (i, (g, w)) in got.iter().zip(want).enumerate() {
        assert!(
            (g - w).abs() <= atol + rtol * w.abs(),
            "{name}[{i}]: got={g}, want={w}"
        );
    }
}

pub fn assert_all_close(name: &str, got: &[Vec<f64>], want: &[Vec<f64>], rtol: f64, atol: f64) {
    assert_eq!(got.len(), want.len(), "{name}: parameter count mismatch");
    for (p, (g, w)) in got.iter().zip(want).enumerate() {
        assert_close(&format!("{name}/param{p}"), g, w, rtol, atol);
    }
}

/// Linear(4→5) → Sigmoid → Linear(5→3).
pub fn sigmoid_mlp(seed: u64) -> Graph {
    let mut r = rng(seed);
    Sequential::new(vec![])
        .push(Linear::with_rng(4, 5, &mut r))
        .push(Sigmoid::new())
        .push(Linear::with_rng(5, 3, &mut r))
        .build()
        .unwrap()
}

/// Linear(3→4) = h; out = Linear(4→2)(Sigmoid(h + Linear(4→4)(Tanh(h)))).
pub fn residual_net(seed: u64) -> Graph {
    let mut r = rng(seed);
    let mut b = GraphBuilder::new();
    let x = b.input();
    let h = b.layer(Linear::with_rng(3, 4, &mut r), x).unwrap();
    let a = b.layer(Tanh::new(), h).unwrap();
    let branch = b.layer(Linear::with_rng(4, 4, &mut r), a).unwrap();
    let s = b.sum(&[h, branch]).unwrap();
    let act = b.layer(Sigmoid::new(), s).unwrap();
    let out = b.layer(Linear::with_rng(4, 2, &mut r), act).unwrap();
    b.build(out).unwrap()
}
