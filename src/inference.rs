use crate::data::{GroundTruth, evaluate};
use crate::error::{SparseError, SparseResult};
use crate::library::{assemble, from_array2, to_array1, to_array2};
use crate::linalg::predict;
use crate::model::{FunctionApproximator, Model};
use crate::training::{DiscoveredEquation, coefficient_error};
use crate::{COEFFICIENTS_FILENAME, MODEL_FILENAME};
use burn::backend::NdArray;
use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use log::info;
use ndarray::Array1;
use std::path::Path;
use std::time::Instant;

type MyBackend = NdArray<f64>;

/// 推論の評価結果。
#[derive(Debug, Clone)]
pub struct InferenceSummary {
    pub n_points: usize,
    /// 予測値と解析解の平均絶対誤差
    pub field_error: f64,
    /// ネットワークの時間微分と、発見した方程式の右辺との平均絶対誤差
    pub residual_error: f64,
    pub coefficient_error: f64,
}

/// `infer`サブコマンドを実行します。
pub fn run() -> SparseResult<InferenceSummary> {
    let device = Default::default();

    for path in [MODEL_FILENAME, COEFFICIENTS_FILENAME] {
        if !Path::new(path).exists() {
            return Err(SparseError::configuration(format!(
                "ファイル '{path}' が見つかりません。最初に 'train' コマンドでモデルを学習・保存してください。"
            )));
        }
    }

    info!("推論を実行します - バックエンド: NdArray (CPU)");
    let inference_start = Instant::now();

    info!("保存済みモデルを '{}' からロード中...", MODEL_FILENAME);
    let equation = DiscoveredEquation::load(COEFFICIENTS_FILENAME)?;
    let n_inputs = equation.layout.n_inputs();
    let model = Model::<MyBackend>::new(n_inputs, &equation.hidden_dims, 1, &device).load_file(
        MODEL_FILENAME,
        &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
        &device,
    )?;
    info!("方程式: {}", equation.describe());

    let (solution, grid) = equation.dataset.build();
    if grid.spatial_dims() != equation.layout.spatial_dims {
        return Err(SparseError::configuration(format!(
            "データセット {:?} は空間 {} 次元ですが、保存された構成は {} 次元です",
            equation.dataset,
            grid.spatial_dims(),
            equation.layout.spatial_dims
        )));
    }
    let coords = grid.coords();
    let step = 1e-3;
    let fields = model.evaluate(
        from_array2::<MyBackend>(&coords, &device),
        &equation.layout,
        step,
    );
    let theta = to_array2(assemble(&fields, &equation.layout))?;
    let time_deriv = to_array1(fields.time_deriv)?;
    let prediction = to_array1(fields.prediction)?;

    let exact = evaluate(solution.as_ref(), &coords);
    let coefficients = Array1::from_vec(equation.coefficients.clone());
    let rhs = predict(theta.view(), coefficients.view());
    let expected = solution.true_coefficients(&equation.layout);
    let truth = GroundTruth::from_solution(solution.as_ref(), &coords, &equation.layout, step);

    let mean_abs =
        |a: &Array1<f64>, b: &Array1<f64>| (a - b).mapv(f64::abs).mean().unwrap_or(0.0);
    let summary = InferenceSummary {
        n_points: coords.nrows(),
        field_error: mean_abs(&prediction, &exact),
        residual_error: mean_abs(&time_deriv, &rhs),
        coefficient_error: coefficient_error(&coefficients, &expected),
    };

    let shape: Vec<String> = std::iter::once(&grid.t)
        .chain(&grid.space)
        .map(|axis| axis.len().to_string())
        .collect();
    info!(
        "推論が完了しました。格子点数: {}={}",
        shape.join("x"),
        summary.n_points
    );
    info!("=> 場の平均絶対誤差: {:.3e}", summary.field_error);
    info!("=> 方程式残差の平均絶対誤差: {:.3e}", summary.residual_error);
    info!(
        "=> 時間微分の平均絶対誤差 (解析解比): {:.3e}",
        mean_abs(&time_deriv, &truth.time_deriv)
    );
    info!("=> 係数の平均絶対誤差: {:.3e}", summary.coefficient_error);
    info!("=> 推論時間: {:.2?}", inference_start.elapsed());

    Ok(summary)
}
