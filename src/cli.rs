use crate::config::{EstimatorConfig, TrainingConfig};
use crate::data::DatasetKind;
use crate::error::SparseResult;
use crate::sparsity::{Criterion, Resampling, SblOptions};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// clapでコマンドラインの構造を定義します。
#[derive(Parser, Debug)]
#[command(author, version, about = "Sparse PDE discovery with neural network surrogates and Burn", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// 実行するサブコマンドを定義します。
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// ネットワークを学習しながら方程式を推定し、結果をファイルに保存します
    Train(TrainArgs),
    /// 保存されたモデルと係数を読み込み、誤差を評価します
    Infer,
    /// 正解ライブラリに対して SBL のノイズ感度を調べます
    Sweep(SweepArgs),
}

/// コマンドラインから選べる推定器。
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EstimatorChoice {
    Sbl,
    Aic,
    Bic,
    /// SBL を基底にしたクラスタリング推定
    Clustering,
}

impl EstimatorChoice {
    pub fn to_config(self, seed: u64) -> EstimatorConfig {
        match self {
            EstimatorChoice::Sbl => EstimatorConfig::Sbl(SblOptions::default()),
            EstimatorChoice::Aic => EstimatorConfig::InformationCriterion {
                criterion: Criterion::Aic,
            },
            EstimatorChoice::Bic => EstimatorConfig::InformationCriterion {
                criterion: Criterion::Bic,
            },
            EstimatorChoice::Clustering => EstimatorConfig::Clustering {
                base: Box::new(EstimatorConfig::Sbl(SblOptions::default())),
                n_runs: 10,
                resampling: Resampling::Bootstrap,
                seed,
                min_separation: 1.0,
            },
        }
    }
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    #[arg(long, value_enum, default_value_t = DatasetKind::Burgers)]
    pub dataset: DatasetKind,
    /// 学習に使う点の数（0 で全格子点）
    #[arg(long, default_value_t = 1000)]
    pub samples: usize,
    /// 観測値の標準偏差に対するノイズの比率
    #[arg(long, default_value_t = 0.01)]
    pub noise: f64,
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
    /// 学習設定の JSON ファイル
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// 設定ファイルの推定器を上書きします
    #[arg(long, value_enum)]
    pub estimator: Option<EstimatorChoice>,
    #[arg(long)]
    pub iterations: Option<usize>,
    #[arg(long)]
    pub cutoff: Option<f64>,
}

impl TrainArgs {
    /// 設定ファイル（なければ既定値）にコマンドラインの指定を重ねます。
    pub fn training_config(&self) -> SparseResult<TrainingConfig> {
        let mut config = match &self.config {
            Some(path) => TrainingConfig::from_json_file(path)?,
            None => TrainingConfig::for_dataset(self.dataset),
        };
        if let Some(choice) = self.estimator {
            config.estimator = choice.to_config(self.seed);
        }
        if let Some(iterations) = self.iterations {
            config.max_iterations = iterations;
        }
        if let Some(cutoff) = self.cutoff {
            config.threshold_cutoff = cutoff;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug)]
pub struct SweepArgs {
    #[arg(long, value_enum, default_value_t = DatasetKind::Burgers)]
    pub dataset: DatasetKind,
    /// 調べるノイズ水準の数
    #[arg(long, default_value_t = 10)]
    pub levels: usize,
    #[arg(long, default_value_t = 1000)]
    pub samples: usize,
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
}
