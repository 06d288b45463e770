mod common;

use common::*;
use curvpack_backprop::*;
use curvpack_core::Tensor;

/// Conv1d(2→3, k=3) → Sigmoid → Flatten → Linear(3·Lout → 2).
fn conv_net(seed: u64, stride: usize, padding: usize, dilation: usize, length: usize) -> Graph {
    let mut r = rng(seed);
    let conv = Conv1d::with_rng(2, 3, 3, &mut r)
        .unwrap()
        .with_stride(stride)
        .with_padding(padding)
        .with_dilation(dilation);
    let out_length = conv.geometry().out_length(length).unwrap();
    Sequential::new(vec![])
        .push(conv)
        .push(Sigmoid::new())
        .push(Flatten::new())
        .push(Linear::with_rng(3 * out_length, 2, &mut r))
        .build()
        .unwrap()
}

#[test]
fn conv_gradients_match_finite_differences() {
    init_logging();
    let mut graph = conv_net(600, 2, 1, 1, 7);
    let x = Tensor::randn_with([3, 2, 7], &mut rng(601));
    let y = Tensor::randn_with([3, 2], &mut rng(602));
    let loss = MSELoss::new();

    let results = run(&graph, &x, &y, &loss, BackpackConfig::new().with(Extension::BatchGrad));
    let grad = quantity(&graph, &results, Quantity::Grad);
    let expected = fd_gradient(&mut graph, |g| loss.forward(&outputs(g, &x), &y).unwrap());
    assert_all_close("grad", &grad, &expected, 1e-5, 1e-8);

    let conv_weight = graph.parameters()[0];
    assert_eq!(conv_weight.shape(), &[3, 2, 3]);
    let batch = results.tensor(conv_weight, Quantity::GradBatch).unwrap();
    assert_eq!(batch.shape(), &[3, 3, 2, 3]);
    assert!(batch
        .sum(0)
        .unwrap()
        .allclose(results.tensor(conv_weight, Quantity::Grad).unwrap(), 1e-10, 1e-12));
}

#[test]
fn conv_diag_ggn_matches_brute_force() {
    let mut graph = conv_net(603, 1, 2, 2, 6);
    let n = 3;
    let x = Tensor::randn_with([n, 2, 6], &mut rng(604));
    let y = random_one_hot(n, 2, &mut rng(605));
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

    let hessians = cross_entropy_hessians(&outputs(&graph, &x), n as f64);
    let expected = brute_force_ggn_batch(&mut graph, &x, &hessians);
    assert_all_close("diag_ggn_exact", &diag, &sum_over_batch(&expected), 1e-5, 1e-8);
    assert_all_close("diag_ggn_exact_batch", &batch, &flatten_batch(&expected), 1e-5, 1e-8);
}

#[test]
fn conv_diag_hessian_matches_finite_differences() {
    let mut graph = conv_net(606, 2, 0, 1, 9);
    let x = Tensor::randn_with([2, 2, 9], &mut rng(607));
    let y = Tensor::randn_with([2, 2], &mut rng(608)).mul_scalar(2.0);
    let loss = MSELoss::new();

    let results = run(&graph, &x, &y, &loss, BackpackConfig::new().with(Extension::DiagHessian));
    let diag_h = quantity(&graph, &results, Quantity::DiagH);
    let expected = fd_hessian_diagonal(&mut graph, |g| loss.forward(&outputs(g, &x), &y).unwrap());
    assert_all_close("diag_h", &diag_h, &expected, 1e-4, 1e-6);
}

#[test]
fn conv_input_length_mismatch_is_reported() {
    let graph = conv_net(609, 1, 0, 1, 5);
    let err = graph.forward(&Tensor::zeros([1, 2, 8])).err().unwrap();
    assert!(matches!(err, CurvError::ShapeMismatch { .. }), "{}", err);
}
