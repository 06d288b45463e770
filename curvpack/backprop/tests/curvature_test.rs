mod common;

use common::*;
use curvpack_backprop::*;
use curvpack_core::Tensor;

const RTOL: f64 = 1e-5;
const ATOL: f64 = 1e-6;

#[test]
fn affine_sigmoid_squared_error_end_to_end() {
    init_logging();
    let n = 4;
    let mut r = rng(100);
    let mut graph = Sequential::new(vec![])
        .push(Linear::with_rng(3, 2, &mut r))
        .push(Sigmoid::new())
        .build()
        .unwrap();
    let x = Tensor::randn_with([n, 3], &mut r);
    let y = Tensor::randn_with([n, 2], &mut r);
    let loss = MSELoss::with_reduction(Reduction::Sum);

    let config = BackpackConfig::new()
        .with(Extension::BatchGrad)
        .with(Extension::Variance)
        .with(Extension::DiagGGNExact);
    let results = run(&graph, &x, &y, &loss, config);
    let grad_batch = quantity(&graph, &results, Quantity::GradBatch);
    let variance = quantity(&graph, &results, Quantity::Variance);
    let diag_ggn = quantity(&graph, &results, Quantity::DiagGgnExact);

    let per_example: Vec<Vec<Vec<f64>>> = (0..n)
        .map(|ex| {
            let y_ex = y.narrow(ex, 1).unwrap();
            fd_gradient(&mut graph, |g| {
                loss.forward(&outputs(g, &x).narrow(ex, 1).unwrap(), &y_ex).unwrap()
            })
        })
        .collect();
    for p in 0..grad_batch.len() {
        let numel = per_example[0][p].len();
        let expected: Vec<f64> = per_example.iter().flat_map(|e| e[p].clone()).collect();
        assert_close("grad_batch", &grad_batch[p], &expected, 0.0, ATOL);

        let expected_var: Vec<f64> = (0..numel)
            .map(|k| {
                let mean = per_example.iter().map(|e| e[p][k]).sum::<f64>() / n as f64;
                per_example
                    .iter()
                    .map(|e| (e[p][k] - mean).powi(2))
                    .sum::<f64>()
                    / n as f64
            })
            .collect();
        assert_close("variance", &variance[p], &expected_var, 0.0, ATOL);
    }

    let preds = outputs(&graph, &x);
    let hessians = mse_hessians(&preds, 1.0);
    let expected = sum_over_batch(&brute_force_ggn_batch(&mut graph, &x, &hessians));
    assert_all_close("diag_ggn_exact", &diag_ggn, &expected, 0.0, ATOL);
}

#[test]
fn diag_ggn_matches_brute_force_for_cross_entropy() {
    let mut graph = sigmoid_mlp(101);
    let n = 5;
    let x = Tensor::randn_with([n, 4], &mut rng(102));
    let y = random_one_hot(n, 3, &mut rng(103));
    let loss = CrossEntropyLoss::new();

    let results = run(
        &graph,
        &x,
        &y,
        &loss,
        BackpackConfig::new()
            .with(Extension::DiagGGNExact)
            .with(Extension::BatchDiagGGNExact),
    );
    let diag = quantity(&graph, &results, Quantity::DiagGgnExact);
    let batch = quantity(&graph, &results, Quantity::DiagGgnExactBatch);

    let preds = outputs(&graph, &x);
    let hessians = cross_entropy_hessians(&preds, n as f64);
    let expected_batch = brute_force_ggn_batch(&mut graph, &x, &hessians);

    assert_all_close("diag_ggn_exact", &diag, &sum_over_batch(&expected_batch), RTOL, ATOL);
    assert_all_close(
        "diag_ggn_exact_batch",
        &batch,
        &flatten_batch(&expected_batch),
        RTOL,
        ATOL,
    );
}

#[test]
fn diag_ggn_is_non_negative_and_batch_sums_to_total() {
    let graph = sigmoid_mlp(104);
    let n = 7;
    let x = Tensor::randn_with([n, 4], &mut rng(105));
    let y = Tensor::randn_with([n, 3], &mut rng(106));
    let results = run(
        &graph,
        &x,
        &y,
        &MSELoss::new(),
        BackpackConfig::new()
            .with(Extension::DiagGGNExact)
            .with(Extension::BatchDiagGGNExact),
    );

    for param in graph.parameters() {
        let total = results.tensor(param, Quantity::DiagGgnExact).unwrap();
        let batch = results.tensor(param, Quantity::DiagGgnExactBatch).unwrap();
        assert_eq!(total.shape(), param.shape());
        assert_eq!(batch.shape()[0], n);
        assert!(total.data().iter().all(|&v| v >= 0.0));
        assert!(batch.sum(0).unwrap().allclose(total, 1e-10, 1e-12));
    }
}

#[test]
fn diag_hessian_matches_finite_differences() {
    let mut graph = {
        let mut r = rng(107);
        Sequential::new(vec![])
            .push(Linear::with_rng(3, 4, &mut r))
            .push(Tanh::new())
            .push(Linear::with_rng(4, 4, &mut r))
            .push(Sigmoid::new())
            .push(Linear::with_rng(4, 3, &mut r))
            .build()
            .unwrap()
    };
    let n = 4;
    let x = Tensor::randn_with([n, 3], &mut rng(108));
    let y = random_one_hot(n, 3, &mut rng(109));
    let loss = CrossEntropyLoss::new();

    let results = run(
        &graph,
        &x,
        &y,
        &loss,
        BackpackConfig::new()
            .with(Extension::DiagHessian)
            .with(Extension::BatchDiagHessian),
    );
    let diag_h = quantity(&graph, &results, Quantity::DiagH);
    let expected = fd_hessian_diagonal(&mut graph, |g| loss.forward(&outputs(g, &x), &y).unwrap());
    assert_all_close("diag_h", &diag_h, &expected, 1e-4, 1e-6);

    for param in graph.parameters() {
        let total = results.tensor(param, Quantity::DiagH).unwrap();
        let batch = results.tensor(param, Quantity::DiagHBatch).unwrap();
        assert!(batch.sum(0).unwrap().allclose(total, 1e-10, 1e-12));
    }
}

#[test]
fn per_example_diag_hessian_matches_finite_differences() {
    let mut graph = sigmoid_mlp(110);
    let n = 3;
    let x = Tensor::randn_with([n, 4], &mut rng(111));
    let y = Tensor::randn_with([n, 3], &mut rng(112));
    let loss = MSELoss::with_reduction(Reduction::Sum);

    let results = run(
        &graph,
        &x,
        &y,
        &loss,
        BackpackConfig::new().with(Extension::BatchDiagHessian),
    );
    let batch = quantity(&graph, &results, Quantity::DiagHBatch);

    let per_example: Vec<Vec<Vec<f64>>> = (0..n)
        .map(|ex| {
            let y_ex = y.narrow(ex, 1).unwrap();
            fd_hessian_diagonal(&mut graph, |g| {
                loss.forward(&outputs(g, &x).narrow(ex, 1).unwrap(), &y_ex).unwrap()
            })
        })
        .collect();
    for p in 0..batch.len() {
        let expected: Vec<f64> = per_example.iter().flat_map(|e| e[p].clone()).collect();
        assert_close("diag_h_batch", &batch[p], &expected, 1e-4, 1e-6);
    }
}

#[test]
fn diag_hessian_equals_diag_ggn_for_piecewise_linear_nets() {
    let mut r = rng(113);
    let graph = Sequential::new(vec![])
        .push(Linear::with_rng(4, 6, &mut r))
        .push(ReLU::new())
        .push(Linear::with_rng(6, 5, &mut r))
        .push(ReLU::new())
        .push(Linear::with_rng(5, 3, &mut r))
        .build()
        .unwrap();
    let x = Tensor::randn_with([6, 4], &mut r);
    let y = random_one_hot(6, 3, &mut r);
    let results = run(
        &graph,
        &x,
        &y,
        &CrossEntropyLoss::new(),
        BackpackConfig::new()
            .with(Extension::DiagHessian)
            .with(Extension::DiagGGNExact),
    );

    for param in graph.parameters() {
        let h = results.tensor(param, Quantity::DiagH).unwrap();
        let ggn = results.tensor(param, Quantity::DiagGgnExact).unwrap();
        assert!(h.allclose(ggn, 1e-10, 1e-12), "{}", param.name());
    }
}

#[test]
fn diag_hessian_differs_from_ggn_behind_curved_activations() {
    let mut r = rng(114);
    let graph = Sequential::new(vec![])
        .push(Linear::with_rng(2, 8, &mut r))
        .push(Tanh::new())
        .push(Linear::with_rng(8, 1, &mut r))
        .build()
        .unwrap();
    // large residuals make the second-order term dominate
    let x = Tensor::randn_with([16, 2], &mut r).mul_scalar(2.0);
    let y = Tensor::randn_with([16, 1], &mut r).mul_scalar(50.0);
    let results = run(
        &graph,
        &x,
        &y,
        &MSELoss::new(),
        BackpackConfig::new()
            .with(Extension::DiagHessian)
            .with(Extension::DiagGGNExact),
    );

    let first_weight = graph.parameters()[0];
    let h = results.tensor(first_weight, Quantity::DiagH).unwrap();
    let ggn = results.tensor(first_weight, Quantity::DiagGgnExact).unwrap();
    assert!(ggn.data().iter().all(|&v| v >= 0.0));
    assert!(!h.allclose(ggn, 1e-6, 1e-9));
}
