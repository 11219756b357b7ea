//! 再標本化とクラスタリングによる安定な項選択。
//!
//! 基底推定器を独立に摂動した問題へ何度も適用し、各回のスケール済み係数の
//! 大きさを 2 クラスタ（有効・無効）に分けます。過半数の回で「有効」と判定された
//! 項だけを残し、最後に元の問題でその項に限った最小二乗で係数を求めます。
//! 各回は独立にシードされた乱数生成器を持つため、並列化しても結果は変わりません。

use super::scaling::scale;
use super::{SparsityEstimator, validate_problem};
use crate::error::{SparseError, SparseResult};
use crate::linalg::{least_squares, take_rows, variance};
use log::debug;
use ndarray::{Array1, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// 各回の問題の作り方。
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resampling {
    /// 行を復元抽出する
    #[default]
    Bootstrap,
    /// ターゲットに `relative_level * std(target)` の正規ノイズを加える
    Noise { relative_level: f64 },
}

/// 任意の基底推定器の上に載るクラスタリング推定器。
#[derive(Debug)]
pub struct ClusteringEstimator {
    pub base: Box<dyn SparsityEstimator>,
    pub n_runs: usize,
    pub resampling: Resampling,
    pub seed: u64,
    /// 対数スケールでの最大値と最小値の差がこれ未満なら 2 分割しない（単位: 桁）
    pub min_separation: f64,
}

impl ClusteringEstimator {
    pub fn new(base: Box<dyn SparsityEstimator>, n_runs: usize, seed: u64) -> Self {
        Self {
            base,
            n_runs,
            resampling: Resampling::default(),
            seed,
            min_separation: 1.0,
        }
    }

    #[must_use]
    pub fn with_resampling(mut self, resampling: Resampling) -> Self {
        self.resampling = resampling;
        self
    }

    fn validate(&self) -> SparseResult<()> {
        if self.n_runs == 0 {
            return Err(SparseError::configuration("n_runs は 1 以上が必要です"));
        }
        if let Resampling::Noise { relative_level } = self.resampling {
            if !(relative_level.is_finite() && relative_level >= 0.0) {
                return Err(SparseError::configuration(format!(
                    "relative_level は 0 以上の有限値が必要です: {relative_level}"
                )));
            }
        }
        if !(self.min_separation.is_finite() && self.min_separation >= 0.0) {
            return Err(SparseError::configuration("min_separation は 0 以上が必要です"));
        }
        Ok(())
    }

    /// 1 回分の推定を行い、その回で「有効」と判定された項を返します。
    fn run_once(
        &self,
        theta: ArrayView2<f64>,
        target: ArrayView1<f64>,
        rng: &mut StdRng,
    ) -> SparseResult<Vec<bool>> {
        let n = theta.nrows();
        let (theta_run, target_run) = match self.resampling {
            Resampling::Bootstrap => {
                let rows: Vec<usize> = (0..n).map(|_| rng.random_range(0..n)).collect();
                (take_rows(theta, &rows), target.select(ndarray::Axis(0), &rows))
            }
            Resampling::Noise { relative_level } => {
                let std = variance(target).sqrt() * relative_level;
                let noisy = target.mapv(|v| v + std * rng.sample::<f64, _>(StandardNormal));
                (theta.to_owned(), noisy)
            }
        };
        let coefficients = self.base.fit(theta_run.view(), target_run.view())?;
        let scaled = scale(coefficients.view(), theta_run.view(), target_run.view());
        Ok(split_active(scaled.view(), self.min_separation))
    }
}

impl SparsityEstimator for ClusteringEstimator {
    fn fit(&self, theta: ArrayView2<f64>, target: ArrayView1<f64>) -> SparseResult<Array1<f64>> {
        validate_problem(theta, target)?;
        self.validate()?;

        let mut seeds = StdRng::seed_from_u64(self.seed);
        let mut votes = vec![0usize; theta.ncols()];
        for run in 0..self.n_runs {
            let mut rng = StdRng::seed_from_u64(seeds.next_u64());
            let active = self.run_once(theta, target, &mut rng)?;
            for (vote, is_active) in votes.iter_mut().zip(&active) {
                *vote += usize::from(*is_active);
            }
            debug!("クラスタリング {}: 回 {run} の有効項 {:?}", self.base.name(), active);
        }

        let retained: Vec<usize> = votes
            .iter()
            .enumerate()
            .filter_map(|(j, v)| (2 * v > self.n_runs).then_some(j))
            .collect();
        debug!("クラスタリング: 得票 {votes:?}, 採用 {retained:?}");
        least_squares(theta, target, &retained)
    }

    fn name(&self) -> &'static str {
        "clustering"
    }
}

/// スケール済み係数の対数絶対値を 1 次元 2-means で分け、大きい側を有効とします。
///
/// 係数 0 の項は常に無効で、クラスタリングにも参加しません。非ゼロの値の広がりが
/// `min_separation` 桁未満なら分割せず、非ゼロの項をすべて有効とします。
pub fn split_active(scaled: ArrayView1<f64>, min_separation: f64) -> Vec<bool> {
    let nonzero: Vec<bool> = scaled.iter().map(|s| *s != 0.0).collect();
    let logs: Vec<f64> = scaled
        .iter()
        .filter(|s| **s != 0.0)
        .map(|s| s.abs().log10())
        .collect();
    if logs.len() < 2 {
        return nonzero;
    }

    let (lo, hi) = logs
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    if hi - lo < min_separation {
        return nonzero;
    }

    let boundary = two_means_boundary(&logs);
    scaled
        .iter()
        .map(|s| *s != 0.0 && s.abs().log10() >= boundary)
        .collect()
}

/// 1 次元 2-means の厳密解。上側クラスタの最小値を返します。
fn two_means_boundary(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();

    let prefix: Vec<f64> = std::iter::once(0.0)
        .chain(sorted.iter().scan(0.0, |acc, v| {
            *acc += v;
            Some(*acc)
        }))
        .collect();
    let prefix_sq: Vec<f64> = std::iter::once(0.0)
        .chain(sorted.iter().scan(0.0, |acc, v| {
            *acc += v * v;
            Some(*acc)
        }))
        .collect();
    let sse = |from: usize, to: usize| {
        let count = (to - from) as f64;
        let sum = prefix[to] - prefix[from];
        (prefix_sq[to] - prefix_sq[from]) - sum * sum / count
    };

    let mut best = (f64::INFINITY, n - 1);
    for split in 1..n {
        let cost = sse(0, split) + sse(split, n);
        if cost < best.0 {
            best = (cost, split);
        }
    }
    sorted[best.1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparsity::InformationCriterionEstimator;
    use ndarray::{Array2, array};

    #[test]
    fn split_separates_large_from_small_terms() {
        let scaled = array![1e-4, 0.9, 2e-4, 0.37, 0.0];
        assert_eq!(
            split_active(scaled.view(), 1.0),
            vec![false, true, false, true, false]
        );
    }

    #[test]
    fn split_keeps_everything_nonzero_when_values_are_close() {
        let scaled = array![0.5, 0.8, 0.0, 0.6];
        assert_eq!(split_active(scaled.view(), 1.0), vec![true, true, false, true]);
    }

    #[test]
    fn two_means_boundary_picks_gap() {
        let boundary = two_means_boundary(&[-12.0, -11.5, -0.3, -0.1, -12.0]);
        assert_eq!(boundary, -0.3);
    }

    #[test]
    fn clustering_runs_are_reproducible_for_a_seed() {
        let mut rng = StdRng::seed_from_u64(2);
        let theta = Array2::from_shape_fn((50, 4), |_| rng.random_range(-1.0..1.0));
        let y = theta.dot(&array![0.0, 1.0, 0.0, -2.0]);
        let base = Box::new(InformationCriterionEstimator::default());
        let estimator = ClusteringEstimator::new(base, 5, 9)
            .with_resampling(Resampling::Noise { relative_level: 0.01 });
        let first = estimator.fit(theta.view(), y.view()).unwrap();
        let second = estimator.fit(theta.view(), y.view()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn zero_runs_is_a_configuration_error() {
        let theta = array![[1.0], [2.0]];
        let y = array![1.0, 2.0];
        let base = Box::new(InformationCriterionEstimator::default());
        let estimator = ClusteringEstimator::new(base, 0, 1);
        assert!(matches!(
            estimator.fit(theta.view(), y.view()),
            Err(SparseError::Configuration(_))
        ));
    }
}
