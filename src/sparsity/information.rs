use super::lars::lasso_path;
use super::{SparsityEstimator, validate_problem};
use crate::error::SparseResult;
use crate::linalg::{column_norms, least_squares, predict, variance};
use log::debug;
use ndarray::{Array1, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

/// モデル選択に使う情報量規準。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    #[default]
    Aic,
    Bic,
}

impl Criterion {
    /// 自由度 1 あたりのペナルティ。
    fn penalty(&self, n_samples: usize) -> f64 {
        match self {
            Criterion::Aic => 2.0,
            Criterion::Bic => (n_samples as f64).ln(),
        }
    }
}

/// Lasso パス上で情報量規準が最小となるモデルを選ぶ推定器。
///
/// 各節点のスコアは `rss / sigma2 + K * df`（`df` は非ゼロ係数の数）。
/// ノイズ分散 `sigma2` は全列の最小二乗残差 `rss_ols / (n - p)` で見積もり、
/// `n <= p` のときは `var(target)` を使います。
/// 切片は推定せず、スコアが同じ場合はより疎なモデルを選びます。
/// 選んだ節点の非ゼロ項に限って最小二乗で係数を当て直すので、Lasso の縮小は残りません。
#[derive(Debug, Clone, Default)]
pub struct InformationCriterionEstimator {
    pub criterion: Criterion,
}

impl InformationCriterionEstimator {
    pub fn new(criterion: Criterion) -> Self {
        Self { criterion }
    }
}

impl SparsityEstimator for InformationCriterionEstimator {
    fn fit(&self, theta: ArrayView2<f64>, target: ArrayView1<f64>) -> SparseResult<Array1<f64>> {
        validate_problem(theta, target)?;
        let n_samples = theta.nrows();
        let path = lasso_path(theta, target)?;

        let sigma2 = noise_variance(theta, target)?;
        let k = self.criterion.penalty(n_samples);

        let mut best: Option<(f64, usize, usize)> = None;
        for (knot, coef) in path.coefficients.iter().enumerate() {
            let residual = &target - &predict(theta, coef.view());
            let rss = residual.dot(&residual);
            let df = coef.iter().filter(|c| c.abs() > f64::EPSILON).count();
            let score = rss / sigma2 + k * df as f64;
            let better = match best {
                None => true,
                Some((best_score, best_df, _)) => {
                    let tie = (score - best_score).abs() <= 1e-12 * best_score.abs().max(1.0);
                    if tie { df < best_df } else { score < best_score }
                }
            };
            if better {
                best = Some((score, df, knot));
            }
        }

        let (score, df, knot) = best.unwrap_or((0.0, 0, 0));
        debug!(
            "{:?}: 節点 {knot}/{} を選択 (スコア {score:.4}, 非ゼロ項 {df}, sigma2 {sigma2:.3e})",
            self.criterion,
            path.coefficients.len()
        );
        let support: Vec<usize> = path.coefficients[knot]
            .iter()
            .enumerate()
            .filter(|(_, c)| c.abs() > f64::EPSILON)
            .map(|(j, _)| j)
            .collect();
        least_squares(theta, target, &support)
    }

    fn name(&self) -> &'static str {
        "information-criterion"
    }
}

/// 情報量規準に使うノイズ分散の推定値。
///
/// ノルムが非ゼロの列すべてで最小二乗を当てた残差から求め、
/// `var(target)` の `1e-12` 倍を下限とします。
fn noise_variance(theta: ArrayView2<f64>, target: ArrayView1<f64>) -> SparseResult<f64> {
    let n_samples = theta.nrows();
    let total = variance(target);
    let usable: Vec<usize> = column_norms(theta)
        .iter()
        .enumerate()
        .filter(|(_, norm)| **norm > 0.0)
        .map(|(j, _)| j)
        .collect();
    let estimate = if n_samples > usable.len() {
        let coef = least_squares(theta, target, &usable)?;
        let residual = &target - &predict(theta, coef.view());
        residual.dot(&residual) / (n_samples - usable.len()) as f64
    } else {
        total
    };
    Ok(estimate.max(1e-12 * total).max(f64::MIN_POSITIVE))
}
