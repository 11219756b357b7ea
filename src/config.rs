//! 推定器と学習ループの設定。
//!
//! すべて JSON で読み書きでき、省略したフィールドは既定値で埋まります。

use crate::data::DatasetKind;
use crate::error::{SparseError, SparseResult};
use crate::library::LibraryLayout;
use crate::sparsity::{
    ClusteringEstimator, Criterion, InformationCriterionEstimator, Resampling, SblEstimator,
    SblOptions, SparsityEstimator, scaling::DEFAULT_CUTOFF,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 使用する疎推定器とそのオプション。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EstimatorConfig {
    Sbl(SblOptions),
    InformationCriterion {
        #[serde(default)]
        criterion: Criterion,
    },
    Clustering {
        base: Box<EstimatorConfig>,
        n_runs: usize,
        #[serde(default)]
        resampling: Resampling,
        #[serde(default)]
        seed: u64,
        #[serde(default = "default_min_separation")]
        min_separation: f64,
    },
}

fn default_min_separation() -> f64 {
    1.0
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        EstimatorConfig::InformationCriterion {
            criterion: Criterion::Aic,
        }
    }
}

impl EstimatorConfig {
    /// 設定から推定器を組み立てます。入れ子の基底推定器も再帰的に構築します。
    pub fn build(&self) -> SparseResult<Box<dyn SparsityEstimator>> {
        Ok(match self {
            EstimatorConfig::Sbl(options) => {
                options.validate()?;
                Box::new(SblEstimator::new(options.clone()))
            }
            EstimatorConfig::InformationCriterion { criterion } => {
                Box::new(InformationCriterionEstimator::new(*criterion))
            }
            EstimatorConfig::Clustering {
                base,
                n_runs,
                resampling,
                seed,
                min_separation,
            } => {
                if *n_runs == 0 {
                    return Err(SparseError::configuration("n_runs は 1 以上が必要です"));
                }
                let mut estimator = ClusteringEstimator::new(base.build()?, *n_runs, *seed)
                    .with_resampling(*resampling);
                estimator.min_separation = *min_separation;
                Box::new(estimator)
            }
        })
    }
}

/// 学習時の損失の組み立て方。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    /// データ MSE + 回帰 MSE
    #[default]
    Mse,
    /// ガウス対数尤度: `2 ln(2π mse) + reg / mse`
    LogLikelihood,
}

/// 回帰損失に使う係数ベクトルの更新方法。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoefficientMode {
    /// 疎推定器の出力を次の再推定まで固定する
    #[default]
    Estimator,
    /// マスクされた列に限った最小二乗で毎反復更新する
    LeastSquares,
}

/// 学習ループの設定。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub max_iterations: usize,
    pub learning_rate: f64,
    /// スケール済み係数がこれ未満の項は除外
    pub threshold_cutoff: f64,
    /// 疎推定を何反復ごとにやり直すか
    pub reestimation_interval: usize,
    /// 最初の疎推定を行う反復
    pub warmup_iterations: usize,
    /// マスクがこの回数連続で変わらなければ早期終了（0 で無効）
    pub stable_refreshes: usize,
    /// 観測者に統計値を渡す間隔
    pub log_interval: usize,
    pub loss: LossKind,
    pub coefficients: CoefficientMode,
    pub hidden_dims: Vec<usize>,
    pub poly_order: usize,
    pub diff_order: usize,
    /// 差分ステンシルの刻み幅
    pub stencil_step: f64,
    pub estimator: EstimatorConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5000,
            learning_rate: 2e-3,
            threshold_cutoff: DEFAULT_CUTOFF,
            reestimation_interval: 500,
            warmup_iterations: 1000,
            stable_refreshes: 0,
            log_interval: 100,
            loss: LossKind::default(),
            coefficients: CoefficientMode::default(),
            hidden_dims: vec![30, 30, 30, 30],
            poly_order: 2,
            diff_order: 3,
            stencil_step: 1e-3,
            estimator: EstimatorConfig::default(),
        }
    }
}

impl TrainingConfig {
    /// データセットに合わせたライブラリ構成とネットワーク幅を既定値に重ねます。
    pub fn for_dataset(dataset: DatasetKind) -> Self {
        let layout = dataset.default_layout();
        let hidden_dims = match layout.spatial_dims {
            1 => vec![30; 4],
            _ => vec![30; 5],
        };
        Self {
            poly_order: layout.poly_order,
            diff_order: layout.diff_order,
            hidden_dims,
            ..Self::default()
        }
    }

    /// 空間 `spatial_dims` 次元の座標に対するライブラリ構成。
    pub fn layout(&self, spatial_dims: usize) -> LibraryLayout {
        LibraryLayout {
            poly_order: self.poly_order,
            diff_order: self.diff_order,
            spatial_dims,
        }
    }

    /// JSON ファイルから設定を読み込みます。
    pub fn from_json_file(path: impl AsRef<Path>) -> SparseResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// 値の範囲を検証します。
    pub fn validate(&self) -> SparseResult<()> {
        if self.max_iterations == 0 {
            return Err(SparseError::configuration("max_iterations は 1 以上が必要です"));
        }
        if self.reestimation_interval == 0 {
            return Err(SparseError::configuration(
                "reestimation_interval は 1 以上が必要です",
            ));
        }
        if self.log_interval == 0 {
            return Err(SparseError::configuration("log_interval は 1 以上が必要です"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(SparseError::configuration(format!(
                "learning_rate は正の有限値が必要です: {}",
                self.learning_rate
            )));
        }
        if !(self.threshold_cutoff.is_finite() && self.threshold_cutoff >= 0.0) {
            return Err(SparseError::configuration(format!(
                "threshold_cutoff は 0 以上の有限値が必要です: {}",
                self.threshold_cutoff
            )));
        }
        if !(self.stencil_step.is_finite() && self.stencil_step > 0.0) {
            return Err(SparseError::configuration("stencil_step は正の値が必要です"));
        }
        if self.hidden_dims.is_empty() || self.hidden_dims.contains(&0) {
            return Err(SparseError::configuration(format!(
                "hidden_dims が不正です: {:?}",
                self.hidden_dims
            )));
        }
        if self.diff_order == 0 || self.diff_order > crate::library::MAX_DIFF_ORDER {
            return Err(SparseError::configuration(format!(
                "diff_order は 1..={} の範囲が必要です: {}",
                crate::library::MAX_DIFF_ORDER,
                self.diff_order
            )));
        }
        self.estimator.build()?;
        Ok(())
    }
}
