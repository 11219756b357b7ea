use crate::config::{CoefficientMode, LossKind, TrainingConfig};
use crate::data::{Dataset, DatasetKind, GroundTruth};
use crate::error::{SparseError, SparseResult};
use crate::library::{LibraryLayout, assemble, from_array1, from_array2, to_array1, to_array2};
use crate::linalg::least_squares;
use crate::model::{FunctionApproximator, Model};
use crate::sparsity::{SparsityMask, scale, threshold};
use crate::{COEFFICIENTS_FILENAME, LOSS_GRAPH_FILENAME, MODEL_FILENAME};
use burn::backend::{Autodiff, NdArray};
use burn::module::{AutodiffModule, Module};
use burn::nn::loss::{MseLoss, Reduction};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::Backend;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Tensor};
use log::{debug, info, warn};
use ndarray::{Array1, Axis};
use plotters::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::path::Path;
use std::time::Instant;

type MyBackend = Autodiff<NdArray<f64>>;

/// 学習ループへの入力。座標は `(t, x)` または `(t, x, y)` の順、ターゲットは `[n, 1]`。
#[derive(Debug, Clone)]
pub struct TrainingData<B: Backend> {
    pub coords: Tensor<B, 2>,
    pub target: Tensor<B, 2>,
    /// 既知なら、ライブラリと時間微分の誤差を記録に含めます
    pub ground_truth: Option<GroundTruth>,
}

impl<B: Backend> TrainingData<B> {
    pub fn from_dataset(
        dataset: &Dataset,
        ground_truth: Option<GroundTruth>,
        device: &B::Device,
    ) -> Self {
        Self {
            coords: from_array2(&dataset.coords, device),
            target: from_array1(&dataset.field, device),
            ground_truth,
        }
    }
}

/// ある反復での損失と係数の記録。
#[derive(Debug, Clone, Serialize)]
pub struct IterationStats {
    pub iteration: usize,
    pub loss: f64,
    pub loss_mse: f64,
    pub loss_reg: f64,
    pub coefficients: Vec<f64>,
    pub scaled: Vec<f64>,
    pub mask: SparsityMask,
    /// 正解ライブラリとの列ごとの平均絶対誤差
    pub mae_library: Option<Vec<f64>>,
    pub mae_time_deriv: Option<f64>,
}

/// 学習の結果。
#[derive(Debug, Clone)]
pub struct TrainingReport {
    /// 実行した反復数
    pub iterations: usize,
    pub coefficients: Array1<f64>,
    pub scaled: Array1<f64>,
    pub mask: SparsityMask,
    /// 疎推定を行った反復
    pub refreshes: Vec<usize>,
    pub history: Vec<IterationStats>,
    pub stopped_early: bool,
}

/// 反復 `iteration` で疎推定をやり直すかどうか。
pub fn is_refresh(iteration: usize, config: &TrainingConfig) -> bool {
    iteration >= config.warmup_iterations
        && (iteration - config.warmup_iterations) % config.reestimation_interval == 0
}

/// ネットワークを学習しながら、疎な係数ベクトルを定期的に推定し直します。
///
/// 勾配はネットワークの重みにだけ流れ、係数ベクトルは定数として損失に入ります。
/// `observer` には `log_interval` ごと（と最終反復）に統計値が渡されます。
pub fn train<B, M>(
    mut model: M,
    data: &TrainingData<B>,
    config: &TrainingConfig,
    mut observer: impl FnMut(&IterationStats),
) -> SparseResult<(M, TrainingReport)>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + FunctionApproximator<B>,
{
    config.validate()?;
    let estimator = config.estimator.build()?;
    let [n_samples, n_inputs] = data.coords.dims();
    let layout = config.layout(n_inputs.saturating_sub(1));
    layout.validate()?;
    let n_terms = layout.n_terms();

    let [n_target, _] = data.target.dims();
    if n_samples != n_target {
        return Err(SparseError::RowMismatch {
            library: n_samples,
            target: n_target,
        });
    }
    if let Some(truth) = &data.ground_truth {
        if truth.theta.dim() != (n_samples, n_terms) || truth.time_deriv.len() != n_samples {
            return Err(SparseError::configuration(format!(
                "正解ライブラリの形状 {:?} が ({n_samples}, {n_terms}) と一致しません",
                truth.theta.dim()
            )));
        }
    }

    let device = data.coords.device();
    let mut optim = AdamConfig::new()
        .with_beta_1(0.99)
        .with_beta_2(0.999)
        .init::<B, M>();

    let mut mask = SparsityMask::all(n_terms);
    let mut coefficients = Array1::<f64>::zeros(n_terms);
    let mut scaled = Array1::<f64>::zeros(n_terms);
    let mut held = false;
    let mut refreshes = Vec::new();
    let mut history = Vec::new();
    let mut stable = 0;
    let mut stopped_early = false;
    let mut iterations = 0;

    debug!(
        "学習ループ開始: 推定器 {}, 項数 {n_terms}, サンプル数 {n_samples}",
        estimator.name()
    );

    for iteration in 0..config.max_iterations {
        iterations = iteration + 1;
        let fields = model.evaluate(data.coords.clone(), &layout, config.stencil_step);
        let theta = assemble(&fields, &layout);

        let refresh = is_refresh(iteration, config);
        let last = iteration + 1 == config.max_iterations;
        let record = iteration % config.log_interval == 0 || last;
        let arrays = if refresh || !held || record {
            Some((
                to_array2(theta.clone().detach())?,
                to_array1(fields.time_deriv.clone().detach())?,
            ))
        } else {
            None
        };

        if let (true, Some((theta_nd, dt_nd))) = (refresh, &arrays) {
            let estimate = estimator.fit(theta_nd.view(), dt_nd.view())?;
            let estimate_scaled = scale(estimate.view(), theta_nd.view(), dt_nd.view());
            let refreshed = threshold(estimate_scaled.view(), config.threshold_cutoff);
            stable = if !refreshes.is_empty() && refreshed == mask {
                stable + 1
            } else {
                0
            };
            mask = refreshed;
            coefficients = mask.apply(estimate.view());
            scaled = mask.apply(estimate_scaled.view());
            held = config.coefficients == CoefficientMode::Estimator;
            refreshes.push(iteration);
            debug!(
                "反復 {iteration}: 疎推定を更新 (有効項 {}/{n_terms}, 連続一致 {stable})",
                mask.n_active()
            );
            if mask.n_active() == 0 {
                warn!("反復 {iteration}: すべての項が除外されました");
            }
        }

        if let (false, Some((theta_nd, dt_nd))) = (held, &arrays) {
            coefficients = least_squares(theta_nd.view(), dt_nd.view(), &mask.active_indices())?;
            scaled = scale(coefficients.view(), theta_nd.view(), dt_nd.view());
        }

        let coefficient_tensor = from_array1::<B>(&coefficients, &device);
        let loss_mse = MseLoss::new().forward(
            fields.prediction.clone(),
            data.target.clone(),
            Reduction::Mean,
        );
        let residual = fields.time_deriv.clone() - theta.matmul(coefficient_tensor);
        let loss_reg = (residual.clone() * residual).mean();
        let loss = match config.loss {
            LossKind::Mse => loss_mse.clone() + loss_reg.clone(),
            LossKind::LogLikelihood => {
                let log_likelihood = loss_mse.clone().mul_scalar(2.0 * PI).log();
                log_likelihood.mul_scalar(2.0) + loss_reg.clone() / loss_mse.clone()
            }
        };

        let converged =
            refresh && config.stable_refreshes > 0 && stable >= config.stable_refreshes;
        if let (true, Some((theta_nd, dt_nd))) = (record || converged, &arrays) {
            let (mae_library, mae_time_deriv) = match &data.ground_truth {
                Some(truth) => {
                    let library_error = (theta_nd - &truth.theta).mapv(f64::abs);
                    let time_error = (dt_nd - &truth.time_deriv).mapv(f64::abs);
                    (
                        library_error.mean_axis(Axis(0)).map(|m| m.to_vec()),
                        time_error.mean(),
                    )
                }
                None => (None, None),
            };
            let stats = IterationStats {
                iteration,
                loss: loss.clone().into_scalar().elem::<f64>(),
                loss_mse: loss_mse.clone().into_scalar().elem::<f64>(),
                loss_reg: loss_reg.clone().into_scalar().elem::<f64>(),
                coefficients: coefficients.to_vec(),
                scaled: scaled.to_vec(),
                mask: mask.clone(),
                mae_library,
                mae_time_deriv,
            };
            observer(&stats);
            history.push(stats);
        }

        if converged {
            info!("反復 {iteration}: マスクが {stable} 回連続で変化しなかったため終了します");
            stopped_early = true;
            break;
        }

        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &model);
        model = optim.step(config.learning_rate, model, grads);
    }

    Ok((
        model,
        TrainingReport {
            iterations,
            coefficients,
            scaled,
            mask,
            refreshes,
            history,
            stopped_early,
        },
    ))
}

/// 学習結果として保存する方程式。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredEquation {
    pub dataset: DatasetKind,
    pub layout: LibraryLayout,
    pub hidden_dims: Vec<usize>,
    pub terms: Vec<String>,
    pub coefficients: Vec<f64>,
    pub mask: SparsityMask,
}

impl DiscoveredEquation {
    /// `u_t = +0.1000 u_xx -1.0000 u*u_x` の形の文字列。
    pub fn describe(&self) -> String {
        let terms: Vec<String> = self
            .terms
            .iter()
            .zip(&self.coefficients)
            .enumerate()
            .filter(|(j, _)| self.mask.is_active(*j))
            .map(|(_, (name, c))| format!("{c:+.4} {name}"))
            .collect();
        if terms.is_empty() {
            "u_t = 0".to_string()
        } else {
            format!("u_t = {}", terms.join(" "))
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> SparseResult<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> SparseResult<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }
}

/// `train` サブコマンドの入力。
#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub dataset: DatasetKind,
    pub n_samples: usize,
    pub noise: f64,
    pub seed: u64,
    pub config: TrainingConfig,
}

/// `train`サブコマンドを実行します。
pub fn run(options: TrainOptions) -> SparseResult<()> {
    let device = Default::default();
    <MyBackend as Backend>::seed(options.seed);
    let mut rng = StdRng::seed_from_u64(options.seed);
    let config = options.config;
    config.validate()?;

    // --- データセットの準備 ---
    let (solution, grid) = options.dataset.build();
    let layout = config.layout(grid.spatial_dims());
    layout.validate()?;
    let dataset = Dataset::create(
        solution.as_ref(),
        &grid,
        options.n_samples,
        options.noise,
        &mut rng,
    )?;
    let truth = GroundTruth::from_solution(
        solution.as_ref(),
        &dataset.coords,
        &layout,
        config.stencil_step,
    );
    let data = TrainingData::<MyBackend>::from_dataset(&dataset, Some(truth), &device);
    let model = Model::<MyBackend>::new(layout.n_inputs(), &config.hidden_dims, 1, &device);

    info!(
        "学習を開始します ({}) - バックエンド: NdArray (CPU), サンプル数 {}, ノイズ {}",
        solution.name(),
        dataset.len(),
        options.noise
    );
    info!("| Iteration | Progress | Time remaining |     Cost |      MSE |      Reg |");

    // --- 学習ループ ---
    let training_start = Instant::now();
    let max_iterations = config.max_iterations;
    let (model, report) = train(model, &data, &config, |stats| {
        let done = stats.iteration + 1;
        let elapsed = training_start.elapsed().as_secs_f64();
        let remaining = elapsed / done as f64 * (max_iterations - done) as f64;
        info!(
            "| {:>9} | {:>7.1}% | {:>13.1}s | {:.2e} | {:.2e} | {:.2e} |",
            stats.iteration,
            100.0 * done as f64 / max_iterations as f64,
            remaining,
            stats.loss,
            stats.loss_mse,
            stats.loss_reg
        );
        if let Some(mae) = stats.mae_time_deriv {
            debug!("  時間微分の MAE: {mae:.3e}");
        }
    })?;
    info!("学習が完了しました。");
    info!("=> 学習時間: {:.2?}", training_start.elapsed());

    // --- 結果の保存と描画 ---
    let equation = DiscoveredEquation {
        dataset: options.dataset,
        layout,
        hidden_dims: config.hidden_dims.clone(),
        terms: layout.term_names(),
        coefficients: report.coefficients.to_vec(),
        mask: report.mask.clone(),
    };
    info!("発見された方程式: {}", equation.describe());
    let expected = solution.true_coefficients(&layout);
    let expected_mask = SparsityMask::from_coefficients(expected.view());
    if expected_mask == report.mask {
        info!("=> 有効項は真の方程式と一致しました。");
    } else {
        warn!(
            "=> 有効項が真の方程式と一致しません: 期待 {:?}, 結果 {:?}",
            expected_mask.active_indices(),
            report.mask.active_indices()
        );
    }

    plot_loss_history(&report.history, LOSS_GRAPH_FILENAME)?;
    info!("=> 損失グラフを '{}' に保存しました。", LOSS_GRAPH_FILENAME);

    model.save_file(
        MODEL_FILENAME,
        &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
    )?;
    equation.save(COEFFICIENTS_FILENAME)?;
    info!(
        "=> モデルを '{}' に、係数を '{}' に保存しました。",
        MODEL_FILENAME, COEFFICIENTS_FILENAME
    );

    Ok(())
}

/// 学習過程の損失をグラフとしてPNGファイルに出力します。
fn plot_loss_history(history: &[IterationStats], path: &str) -> SparseResult<()> {
    draw_loss_history(history, path).map_err(SparseError::plot)
}

fn draw_loss_history(
    history: &[IterationStats],
    path: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let root = BitMapBackend::new(path, (800, 600)).into_drawing_area();
    root.fill(&WHITE)?;
    let log10 = |v: f64| v.max(1e-300).log10();
    let values: Vec<f64> = history
        .iter()
        .flat_map(|s| [log10(s.loss_mse), log10(s.loss_reg)])
        .collect();
    let max_log_loss = values.iter().copied().fold(f64::NEG_INFINITY, f64::max).max(0.0) + 0.5;
    let min_log_loss = values.iter().copied().fold(f64::INFINITY, f64::min).min(-6.0) - 0.5;
    let max_iteration = history.last().map_or(1, |s| s.iteration.max(1));
    let mut chart = ChartBuilder::on(&root)
        .caption("Loss History", ("sans-serif", 40).into_font())
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(0..max_iteration, min_log_loss..max_log_loss)?;
    chart
        .configure_mesh()
        .y_desc("Loss (log10 scale)")
        .x_desc("Iteration")
        .draw()?;
    chart
        .draw_series(LineSeries::new(
            history.iter().map(|s| (s.iteration, log10(s.loss_mse))),
            &RED,
        ))?
        .label("MSE")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &RED));
    chart
        .draw_series(LineSeries::new(
            history.iter().map(|s| (s.iteration, log10(s.loss_reg))),
            &BLUE,
        ))?
        .label("Regression")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &BLUE));
    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()?;
    root.present()?;
    Ok(())
}

/// 学習済みの方程式と真の係数の平均絶対誤差。
pub fn coefficient_error(found: &Array1<f64>, expected: &Array1<f64>) -> f64 {
    (found - expected).mapv(f64::abs).mean().unwrap_or(0.0)
}
