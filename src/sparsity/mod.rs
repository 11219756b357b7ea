//! 疎係数推定のサブシステム。
//!
//! `theta · ξ ≈ u_t` という悪条件の密な回帰問題を、少数の項だけが非ゼロの
//! 係数ベクトル `ξ` に変換します。推定器はすべて [`SparsityEstimator`] を実装し、
//! 学習ループやクラスタリング推定器から差し替え可能です。推定器は呼び出し間で
//! 状態を持たないため、同じ入力には同じ出力を返します。

pub mod clustering;
pub mod information;
pub mod lars;
pub mod sbl;
pub mod scaling;

pub use clustering::{ClusteringEstimator, Resampling};
pub use information::{Criterion, InformationCriterionEstimator};
pub use sbl::{Precision, SblDiagnostic, SblEstimator, SblFit, SblOptions, SblStatus};
pub use scaling::{scale, threshold};

use crate::error::{SparseError, SparseResult};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// `(theta, target)` から疎な係数ベクトルを推定する能力。
pub trait SparsityEstimator: Debug {
    /// 係数ベクトル（ライブラリの列ごとに 1 つ、除外された項は 0）を返します。
    fn fit(&self, theta: ArrayView2<f64>, target: ArrayView1<f64>) -> SparseResult<Array1<f64>>;

    /// ログ出力用の短い名前。
    fn name(&self) -> &'static str;

    /// ターゲットの各列を独立に推定し、`項数 × 出力数` の係数行列を返します。
    fn fit_columns(
        &self,
        theta: ArrayView2<f64>,
        targets: ArrayView2<f64>,
    ) -> SparseResult<Array2<f64>> {
        let mut coefficients = Array2::zeros((theta.ncols(), targets.ncols()));
        for (k, target) in targets.columns().into_iter().enumerate() {
            let column = self.fit(theta, target)?;
            coefficients.column_mut(k).assign(&column);
        }
        Ok(coefficients)
    }
}

/// 項ごとの採否。`true` は項を残すことを表します。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparsityMask(Vec<bool>);

impl SparsityMask {
    /// すべての項を残すマスク。
    pub fn all(n_terms: usize) -> Self {
        Self(vec![true; n_terms])
    }

    /// 非ゼロ係数をそのまま採用するマスク。
    pub fn from_coefficients(coefficients: ArrayView1<f64>) -> Self {
        Self(coefficients.iter().map(|c| *c != 0.0).collect())
    }

    pub fn from_vec(active: Vec<bool>) -> Self {
        Self(active)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_active(&self, term: usize) -> bool {
        self.0.get(term).copied().unwrap_or(false)
    }

    /// 残っている項の数。
    pub fn n_active(&self) -> usize {
        self.0.iter().filter(|a| **a).count()
    }

    /// 残っている項のインデックス（昇順）。
    pub fn active_indices(&self) -> Vec<usize> {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(j, a)| a.then_some(j))
            .collect()
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.0
    }

    /// 除外された項の係数を 0 にしたコピーを返します。
    pub fn apply(&self, coefficients: ArrayView1<f64>) -> Array1<f64> {
        Array1::from_iter(
            coefficients
                .iter()
                .zip(&self.0)
                .map(|(c, active)| if *active { *c } else { 0.0 }),
        )
    }
}

/// 推定器の入口で行う形状・有限性のチェック。
///
/// 失敗した場合は何も計算せずにエラーを返します。
pub fn validate_problem(theta: ArrayView2<f64>, target: ArrayView1<f64>) -> SparseResult<()> {
    if theta.nrows() != target.len() {
        return Err(SparseError::RowMismatch {
            library: theta.nrows(),
            target: target.len(),
        });
    }
    if theta.nrows() == 0 || theta.ncols() == 0 {
        return Err(SparseError::configuration(format!(
            "ライブラリ行列が空です ({} x {})",
            theta.nrows(),
            theta.ncols()
        )));
    }
    if theta.iter().chain(target.iter()).any(|v| !v.is_finite()) {
        return Err(SparseError::configuration(
            "ライブラリ行列またはターゲットに有限でない値が含まれています",
        ));
    }
    Ok(())
}
