//! 正解ライブラリに対する SBL のノイズ感度調査。
//!
//! 解析解から作ったライブラリに対し、時間微分へ段階的にノイズを加えて SBL を当て、
//! 各水準で残った項をヒートマップとして出力します。

use crate::SWEEP_GRAPH_FILENAME;
use crate::data::{Dataset, DatasetKind, GroundTruth, linspace};
use crate::error::{SparseError, SparseResult};
use crate::library::LibraryLayout;
use crate::linalg::variance;
use crate::sparsity::{
    SblEstimator, SblOptions, SblStatus, SparsityMask, scale, scaling::DEFAULT_CUTOFF, threshold,
};
use log::{info, warn};
use plotters::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// ノイズ水準ごとの結果。
#[derive(Debug, Clone)]
pub struct SweepPoint {
    /// 時間微分の分散に対するノイズ分散の比
    pub noise_level: f64,
    pub mask: SparsityMask,
    pub status: SblStatus,
    pub noise_precision: f64,
}

/// `levels` 個のノイズ水準で SBL を当てた結果を返します。
pub fn noise_sweep(
    dataset: DatasetKind,
    layout: &LibraryLayout,
    n_samples: usize,
    levels: usize,
    seed: u64,
) -> SparseResult<Vec<SweepPoint>> {
    if levels == 0 {
        return Err(SparseError::configuration("levels は 1 以上が必要です"));
    }
    layout.validate()?;
    let mut rng = StdRng::seed_from_u64(seed);
    let (solution, grid) = dataset.build();
    if grid.spatial_dims() != layout.spatial_dims {
        return Err(SparseError::configuration(format!(
            "{dataset:?} の空間次元 {} とライブラリの空間次元 {} が一致しません",
            grid.spatial_dims(),
            layout.spatial_dims
        )));
    }
    let data = Dataset::create(solution.as_ref(), &grid, n_samples, 0.0, &mut rng)?;
    let truth = GroundTruth::from_solution(solution.as_ref(), &data.coords, layout, 1e-3);
    let estimator = SblEstimator::new(SblOptions::default());
    let dt_variance = variance(truth.time_deriv.view());

    let mut points = Vec::with_capacity(levels);
    for noise_level in linspace(1e-5, 0.1, levels) {
        let std = (dt_variance * noise_level).sqrt();
        let target = truth
            .time_deriv
            .mapv(|v| v + std * rng.sample::<f64, _>(StandardNormal));
        let fit = estimator.fit_posterior(truth.theta.view(), target.view())?;
        let scaled = scale(fit.mu.view(), truth.theta.view(), target.view());
        let mask = threshold(scaled.view(), DEFAULT_CUTOFF);
        info!(
            "ノイズ {noise_level:.3e}: 有効項 {:?} ({:?}, {} 反復)",
            mask.active_indices(),
            fit.status,
            fit.iterations
        );
        points.push(SweepPoint {
            noise_level,
            mask,
            status: fit.status,
            noise_precision: fit.noise_precision,
        });
    }
    Ok(points)
}

/// `sweep`サブコマンドを実行します。
pub fn run(dataset: DatasetKind, n_samples: usize, levels: usize, seed: u64) -> SparseResult<()> {
    let layout = dataset.default_layout();
    let (solution, _) = dataset.build();
    let expected = SparsityMask::from_coefficients(solution.true_coefficients(&layout).view());
    let points = noise_sweep(dataset, &layout, n_samples, levels, seed)?;

    let recovered = points.iter().filter(|p| p.mask == expected).count();
    info!("{recovered}/{} 水準で真の項を復元しました。", points.len());
    if recovered == 0 {
        warn!("どのノイズ水準でも真の項を復元できませんでした");
    }

    draw_heatmap(&points, &layout.term_names(), SWEEP_GRAPH_FILENAME)
        .map_err(SparseError::plot)?;
    info!("=> ヒートマップを '{}' に保存しました。", SWEEP_GRAPH_FILENAME);
    Ok(())
}

fn draw_heatmap(
    points: &[SweepPoint],
    terms: &[String],
    path: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let root = BitMapBackend::new(path, (900, 600)).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .caption("Active terms vs. noise", ("sans-serif", 32).into_font())
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(90)
        .build_cartesian_2d(0..points.len(), 0..terms.len())?;
    chart
        .configure_mesh()
        .disable_mesh()
        .x_desc("Noise level")
        .x_label_formatter(&|i| {
            points
                .get(*i)
                .map_or_else(String::new, |p| format!("{:.0e}", p.noise_level))
        })
        .y_label_formatter(&|j| terms.get(*j).cloned().unwrap_or_default())
        .draw()?;
    chart.draw_series(points.iter().enumerate().flat_map(|(i, point)| {
        (0..terms.len()).map(move |j| {
            let color = if point.mask.is_active(j) { BLUE } else { WHITE };
            Rectangle::new([(i, j), (i + 1, j + 1)], color.filled())
        })
    }))?;
    root.present()?;
    Ok(())
}
