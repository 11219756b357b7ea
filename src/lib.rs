//! # 疎回帰による偏微分方程式の発見
//!
//! `burn` のニューラルネットワークで観測データを近似し、その出力と微分から
//! 候補項のライブラリ行列を組み立て、疎推定器で方程式 `u_t = Θ ξ` の係数 `ξ` を求めます。
//!
//! 疎推定器（SBL・情報量規準・クラスタリング）は `ndarray` の行列に対して動くので、
//! 学習ループの外でも単独で使えます。

pub mod cli;
pub mod config;
pub mod data;
pub mod error;
pub mod inference;
pub mod library;
pub mod linalg;
pub mod model;
pub mod sparsity;
pub mod sweep;
pub mod training;

/// モデルを保存するファイル名
pub const MODEL_FILENAME: &str = "pde_model.mpk";

/// 発見した方程式を保存するファイル名
pub const COEFFICIENTS_FILENAME: &str = "coefficients.json";

/// 損失の推移グラフを保存するファイル名
pub const LOSS_GRAPH_FILENAME: &str = "loss_graph.png";

/// ノイズ感度のヒートマップを保存するファイル名
pub const SWEEP_GRAPH_FILENAME: &str = "noise_sweep.png";
