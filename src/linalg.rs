//! `ndarray` と `nalgebra` の橋渡し、および推定器が共有する小さな線形代数ヘルパー。
//!
//! 公開 API は `ndarray` で受け渡し、分解（Cholesky, SVD, 固有値分解）が必要な
//! 箇所だけ `nalgebra::DMatrix` に写して計算します。

use crate::error::{SparseError, SparseResult};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

/// SVD で特異値を打ち切る相対閾値
pub const SVD_EPS: f64 = 1e-12;

/// 指定した列だけを取り出して `DMatrix` に写します。
pub fn to_dmatrix(theta: ArrayView2<f64>, columns: &[usize]) -> DMatrix<f64> {
    DMatrix::from_fn(theta.nrows(), columns.len(), |i, k| theta[[i, columns[k]]])
}

pub fn to_dvector(values: ArrayView1<f64>) -> DVector<f64> {
    DVector::from_iterator(values.len(), values.iter().copied())
}

/// 各列のユークリッドノルム。
pub fn column_norms(theta: ArrayView2<f64>) -> Array1<f64> {
    theta.map_axis(Axis(0), |col| col.dot(&col).sqrt())
}

/// 標本分散（自由度補正なし）。空ベクトルは 0 を返します。
pub fn variance(values: ArrayView1<f64>) -> f64 {
    let n = values.len();
    if n == 0 {
        return 0.0;
    }
    let mean = values.sum() / n as f64;
    values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n as f64
}

/// `columns` に限定した最小二乗解を、全列長のベクトル（それ以外は 0）で返します。
///
/// 列がランク落ちしていても SVD の擬似逆で最小ノルム解を返します。
pub fn least_squares(
    theta: ArrayView2<f64>,
    target: ArrayView1<f64>,
    columns: &[usize],
) -> SparseResult<Array1<f64>> {
    let mut coefficients = Array1::zeros(theta.ncols());
    if columns.is_empty() {
        return Ok(coefficients);
    }
    let a = to_dmatrix(theta, columns);
    let b = to_dvector(target);
    let svd = a.svd(true, true);
    let cutoff = SVD_EPS * svd.singular_values.max();
    let solution = svd
        .solve(&b, cutoff)
        .map_err(|e| SparseError::NumericalInstability(e.to_string()))?;
    for (k, &j) in columns.iter().enumerate() {
        coefficients[j] = solution[k];
    }
    Ok(coefficients)
}

/// `theta · coefficients` を計算します。
pub fn predict(theta: ArrayView2<f64>, coefficients: ArrayView1<f64>) -> Array1<f64> {
    theta.dot(&coefficients)
}

/// 行インデックスで行を抜き出した新しい行列（重複可）。
pub fn take_rows(theta: ArrayView2<f64>, rows: &[usize]) -> Array2<f64> {
    theta.select(Axis(0), rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn to_dmatrix_keeps_selected_columns_in_order() {
        let theta = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let m = to_dmatrix(theta.view(), &[2, 0]);
        assert_eq!(m.shape(), (2, 2));
        assert_eq!(m[(0, 0)], 3.0);
        assert_eq!(m[(1, 1)], 4.0);
    }

    #[test]
    fn least_squares_recovers_exact_solution_on_subset() {
        let theta = array![[1.0, 0.0, 5.0], [0.0, 1.0, -1.0], [1.0, 1.0, 2.0], [2.0, -1.0, 0.5]];
        let truth = array![1.5, -0.5, 0.0];
        let y = theta.dot(&truth);
        let coef = least_squares(theta.view(), y.view(), &[0, 1]).unwrap();
        assert!((coef[0] - 1.5).abs() < 1e-12);
        assert!((coef[1] + 0.5).abs() < 1e-12);
        assert_eq!(coef[2], 0.0);
    }

    #[test]
    fn least_squares_with_no_columns_is_zero() {
        let theta = array![[1.0, 2.0], [3.0, 4.0]];
        let y = array![1.0, 1.0];
        let coef = least_squares(theta.view(), y.view(), &[]).unwrap();
        assert_eq!(coef, array![0.0, 0.0]);
    }

    #[test]
    fn column_norms_handles_zero_column() {
        let theta = array![[3.0, 0.0], [4.0, 0.0]];
        assert_eq!(column_norms(theta.view()), array![5.0, 0.0]);
    }
}
