mod common;

use common::*;
use curvpack_backprop::*;
use curvpack_core::Tensor;

/// Conv1d(2→3, k=2) → Sigmoid → pool → Flatten → Linear(3·Lout → 2).
fn pooled_net(seed: u64, pool: Box<dyn Module>, pooled_length: usize) -> Graph {
    let mut r = rng(seed);
    let conv = Conv1d::with_rng(2, 3, 2, &mut r).unwrap();
    let layers: Vec<Box<dyn Module>> = vec![Box::new(conv), Box::new(Sigmoid::new()), pool];
    Sequential::new(layers)
        .push(Flatten::new())
        .push(Linear::with_rng(3 * pooled_length, 2, &mut r))
        .build()
        .unwrap()
}

// length 9 -> conv 8 -> pooled 4 (max, k=2) or 3 (avg, k=3, stride 2)
fn max_net(seed: u64) -> Graph {
    pooled_net(seed, Box::new(MaxPool1d::new(2).unwrap()), 4)
}

fn avg_net(seed: u64) -> Graph {
    pooled_net(seed, Box::new(AvgPool1d::new(3).unwrap().with_stride(2)), 3)
}

#[test]
fn pooled_gradients_match_finite_differences() {
    init_logging();
    for (name, mut graph) in [("max", max_net(700)), ("avg", avg_net(701))] {
        let x = Tensor::randn_with([3, 2, 9], &mut rng(702));
        let y = Tensor::randn_with([3, 2], &mut rng(703));
        let loss = MSELoss::new();

        let results = run(&graph, &x, &y, &loss, BackpackConfig::new().with(Extension::BatchGrad));
        let grad = quantity(&graph, &results, Quantity::Grad);
        let expected = fd_gradient(&mut graph, |g| loss.forward(&outputs(g, &x), &y).unwrap());
        assert_all_close(name, &grad, &expected, 1e-5, 1e-8);
    }
}

#[test]
fn pooled_diag_ggn_matches_brute_force() {
    for (name, mut graph) in [("max", max_net(704)), ("avg", avg_net(705))] {
        let n = 3;
        let x = Tensor::randn_with([n, 2, 9], &mut rng(706));
        let y = random_one_hot(n, 2, &mut rng(707));
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
        assert_all_close(name, &diag, &sum_over_batch(&expected), 1e-5, 1e-8);
        assert_all_close(name, &batch, &flatten_batch(&expected), 1e-5, 1e-8);
    }
}

#[test]
fn pooled_diag_hessian_matches_finite_differences() {
    for (name, mut graph) in [("max", max_net(708)), ("avg", avg_net(709))] {
        let x = Tensor::randn_with([2, 2, 9], &mut rng(710));
        let y = Tensor::randn_with([2, 2], &mut rng(711)).mul_scalar(2.0);
        let loss = MSELoss::new();

        let results = run(&graph, &x, &y, &loss, BackpackConfig::new().with(Extension::DiagHessian));
        let diag_h = quantity(&graph, &results, Quantity::DiagH);
        let expected = fd_hessian_diagonal(&mut graph, |g| loss.forward(&outputs(g, &x), &y).unwrap());
        assert_all_close(name, &diag_h, &expected, 1e-4, 1e-6);
    }
}

#[test]
fn kfra_matches_kflr_on_one_example_through_max_pooling() {
    let mut r = rng(712);
    let graph = Sequential::new(vec![])
        .push(MaxPool1d::new(2).unwrap())
        .push(Flatten::new())
        .push(Linear::with_rng(4, 3, &mut r))
        .push(ReLU::new())
        .push(Linear::with_rng(3, 2, &mut r))
        .build()
        .unwrap();
    let x = Tensor::randn_with([1, 1, 8], &mut r);
    let y = Tensor::randn_with([1, 2], &mut r);
    let results = run(
        &graph,
        &x,
        &y,
        &MSELoss::with_reduction(Reduction::Sum),
        BackpackConfig::new().with(Extension::KFLR).with(Extension::KFRA),
    );

    for param in graph.parameters() {
        let kflr = results.kron(param, Quantity::Kflr).unwrap();
        let kfra = results.kron(param, Quantity::Kfra).unwrap();
        assert_eq!(kflr.len(), kfra.len());
        for (a, b) in kflr.iter().zip(kfra) {
            assert!(a.allclose(b, 1e-10, 1e-12), "{}", param.name());
        }
    }
}

#[test]
fn pooling_window_longer_than_input_is_reported() {
    let graph = max_net(713);
    let err = graph.forward(&Tensor::zeros([1, 2, 2])).err().unwrap();
    assert!(matches!(err, CurvError::ShapeMismatch { .. }), "{}", err);
}
