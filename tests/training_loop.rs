use burn::backend::{Autodiff, NdArray};
use pde_discovery::config::{CoefficientMode, EstimatorConfig, LossKind, TrainingConfig};
use pde_discovery::data::{Dataset, DatasetKind, GroundTruth};
use pde_discovery::library::LibraryLayout;
use pde_discovery::model::Model;
use pde_discovery::sparsity::Criterion;
use pde_discovery::training::{TrainingData, train};
use rand::SeedableRng;
use rand::rngs::StdRng;

type TestBackend = Autodiff<NdArray<f64>>;

fn short_config() -> TrainingConfig {
    TrainingConfig {
        max_iterations: 30,
        learning_rate: 1e-3,
        reestimation_interval: 5,
        warmup_iterations: 10,
        log_interval: 10,
        hidden_dims: vec![8, 8],
        poly_order: 1,
        diff_order: 2,
        estimator: EstimatorConfig::InformationCriterion {
            criterion: Criterion::Bic,
        },
        ..TrainingConfig::default()
    }
}

fn burgers_data(config: &TrainingConfig) -> TrainingData<TestBackend> {
    let device = Default::default();
    let mut rng = StdRng::seed_from_u64(3);
    let layout = LibraryLayout::new(config.poly_order, config.diff_order);
    let (solution, grid) = DatasetKind::Burgers.build();
    let dataset = Dataset::create(solution.as_ref(), &grid, 200, 0.01, &mut rng).unwrap();
    let truth = GroundTruth::from_solution(solution.as_ref(), &dataset.coords, &layout, 1e-3);
    TrainingData::from_dataset(&dataset, Some(truth), &device)
}

#[test_log::test]
fn refreshes_follow_the_schedule() {
    let config = short_config();
    let data = burgers_data(&config);
    let model = Model::<TestBackend>::new(2, &config.hidden_dims, 1, &Default::default());
    let mut observed = Vec::new();

    let (_, report) = train(model, &data, &config, |stats| observed.push(stats.iteration)).unwrap();

    assert_eq!(report.iterations, 30);
    assert!(!report.stopped_early);
    assert_eq!(report.refreshes, vec![10, 15, 20, 25]);
    assert_eq!(observed, vec![0, 10, 20, 29]);
    assert_eq!(report.mask.len(), 6);
    assert_eq!(report.coefficients.len(), 6);
    for (j, c) in report.coefficients.iter().enumerate() {
        if !report.mask.is_active(j) {
            assert_eq!(*c, 0.0);
        }
    }
    let last = report.history.last().unwrap();
    assert!(last.loss.is_finite());
    assert_eq!(last.mae_library.as_ref().map(Vec::len), Some(6));
    assert!(last.mae_time_deriv.is_some());
}

#[test_log::test]
fn unchanged_masks_stop_training_early() {
    let config = TrainingConfig {
        max_iterations: 50,
        learning_rate: 1e-12,
        warmup_iterations: 0,
        reestimation_interval: 1,
        stable_refreshes: 2,
        ..short_config()
    };
    let data = burgers_data(&config);
    let model = Model::<TestBackend>::new(2, &config.hidden_dims, 1, &Default::default());

    let (_, report) = train(model, &data, &config, |_| {}).unwrap();

    assert!(report.stopped_early);
    assert_eq!(report.refreshes, vec![0, 1, 2]);
    assert_eq!(report.iterations, 3);
}

#[test_log::test]
fn least_squares_mode_with_log_likelihood_stays_finite() {
    let config = TrainingConfig {
        max_iterations: 12,
        loss: LossKind::LogLikelihood,
        coefficients: CoefficientMode::LeastSquares,
        warmup_iterations: 5,
        log_interval: 1,
        ..short_config()
    };
    let data = burgers_data(&config);
    let model = Model::<TestBackend>::new(2, &config.hidden_dims, 1, &Default::default());

    let (_, report) = train(model, &data, &config, |_| {}).unwrap();

    assert_eq!(report.history.len(), 12);
    for stats in &report.history {
        assert!(stats.loss.is_finite(), "iteration {}", stats.iteration);
        assert!(stats.coefficients.iter().all(|c| c.is_finite()));
    }
    // 最初の再推定より前は全項が有効
    assert_eq!(report.history[0].mask.n_active(), 6);
}

#[test_log::test]
fn estimator_coefficients_are_held_between_refreshes() {
    let config = TrainingConfig {
        max_iterations: 20,
        learning_rate: 1e-2,
        threshold_cutoff: 0.0,
        log_interval: 1,
        coefficients: CoefficientMode::Estimator,
        ..short_config()
    };
    let data = burgers_data(&config);
    let model = Model::<TestBackend>::new(2, &config.hidden_dims, 1, &Default::default());

    let (_, report) = train(model, &data, &config, |_| {}).unwrap();

    assert_eq!(report.refreshes, vec![10, 15]);
    let history = &report.history;
    assert_eq!(history.len(), 20);
    // 最初の再推定までは毎反復の最小二乗なので係数が動く
    assert_ne!(history[0].coefficients, history[1].coefficients);
    assert!(history[15].mask.n_active() > 0);
    for refresh in [10, 15] {
        for stats in &history[refresh + 1..refresh + 5] {
            assert_eq!(stats.coefficients, history[refresh].coefficients);
            assert_eq!(stats.mask, history[refresh].mask);
        }
    }
    assert_ne!(history[14].coefficients, history[15].coefficients);
}

#[test_log::test]
fn planar_dataset_trains_with_three_inputs() {
    let kind = DatasetKind::AdvectionDiffusion2d;
    let config = TrainingConfig {
        max_iterations: 6,
        warmup_iterations: 3,
        reestimation_interval: 3,
        log_interval: 1,
        ..TrainingConfig::for_dataset(kind)
    };
    let device = Default::default();
    let mut rng = StdRng::seed_from_u64(8);
    let (solution, grid) = kind.build();
    let layout = config.layout(grid.spatial_dims());
    let dataset = Dataset::create(solution.as_ref(), &grid, 150, 0.0, &mut rng).unwrap();
    let truth = GroundTruth::from_solution(solution.as_ref(), &dataset.coords, &layout, 1e-3);
    let data = TrainingData::<TestBackend>::from_dataset(&dataset, Some(truth), &device);
    let model = Model::<TestBackend>::new(layout.n_inputs(), &config.hidden_dims, 1, &device);

    let (_, report) = train(model, &data, &config, |_| {}).unwrap();

    assert_eq!(report.refreshes, vec![3]);
    assert_eq!(report.mask.len(), 6);
    assert_eq!(report.history.len(), 6);
    assert!(report.history.iter().all(|s| s.loss.is_finite()));
    assert_eq!(report.history[5].mae_library.as_ref().map(Vec::len), Some(6));
}
