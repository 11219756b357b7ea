//! Least Angle Regression による Lasso 正則化パス。
//!
//! 切片は推定しません（物理モデルに定数オフセット項はないため）。
//! パスの各節点（変数が出入りする点）の係数を、疎なものから順に返します。

use crate::error::SparseResult;
use crate::linalg::column_norms;
use log::trace;
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, ArrayView1, ArrayView2};

/// Lasso パスの節点列。
#[derive(Debug, Clone)]
pub struct LassoPath {
    /// 各節点の係数。先頭はすべて 0。
    pub coefficients: Vec<Array1<f64>>,
    /// 各節点の正則化強度（最大相関 / サンプル数）
    pub penalties: Vec<f64>,
}

/// `theta`, `target` の Lasso パスを LARS で計算します。
///
/// ノルム 0 の列は候補に入りません。能動集合のグラム行列が特異になった時点で
/// パスを打ち切ります。
pub fn lasso_path(theta: ArrayView2<f64>, target: ArrayView1<f64>) -> SparseResult<LassoPath> {
    let n_samples = theta.nrows() as f64;
    let n_terms = theta.ncols();
    let usable: Vec<bool> = column_norms(theta).iter().map(|n| *n > 0.0).collect();

    let mut coef = Array1::<f64>::zeros(n_terms);
    let mut residual = target.to_owned();
    let mut active: Vec<usize> = Vec::new();

    let correlations = theta.t().dot(&residual);
    let c_initial = (0..n_terms)
        .filter(|j| usable[*j])
        .map(|j| correlations[j].abs())
        .fold(0.0_f64, f64::max);

    let mut path = LassoPath {
        coefficients: vec![coef.clone()],
        penalties: vec![c_initial / n_samples],
    };
    if c_initial == 0.0 {
        return Ok(path);
    }
    let tolerance = 1e-12 * c_initial;

    for step in 0..8 * n_terms.max(1) {
        let correlations = theta.t().dot(&residual);
        if active.is_empty() {
            let first = (0..n_terms)
                .filter(|j| usable[*j])
                .max_by(|a, b| correlations[*a].abs().total_cmp(&correlations[*b].abs()));
            match first {
                Some(j) => active.push(j),
                None => break,
            }
        }

        let c_max = active
            .iter()
            .map(|j| correlations[*j].abs())
            .fold(0.0_f64, f64::max);
        if c_max <= tolerance {
            break;
        }

        let k = active.len();
        let signs = DVector::from_fn(k, |a, _| correlations[active[a]].signum());
        let gram = DMatrix::from_fn(k, k, |a, b| {
            theta.column(active[a]).dot(&theta.column(active[b]))
        });
        let Some(cholesky) = gram.cholesky() else {
            trace!("LARS: 能動集合が退化したためパスを打ち切ります (step {step})");
            break;
        };
        let mut direction = cholesky.solve(&signs);
        let a_norm = 1.0 / signs.dot(&direction).sqrt();
        if !a_norm.is_finite() {
            break;
        }
        direction *= a_norm;

        let mut equiangular = Array1::<f64>::zeros(theta.nrows());
        for (a, &j) in active.iter().enumerate() {
            equiangular.scaled_add(direction[a], &theta.column(j));
        }
        let inner = theta.t().dot(&equiangular);

        let full_step = c_max / a_norm;
        let eps = f64::EPSILON * full_step;
        let mut gamma = full_step;
        let mut entering = None;
        for j in (0..n_terms).filter(|j| usable[*j] && !active.contains(j)) {
            for candidate in [
                (c_max - correlations[j]) / (a_norm - inner[j]),
                (c_max + correlations[j]) / (a_norm + inner[j]),
            ] {
                if candidate.is_finite() && candidate > eps && candidate < gamma {
                    gamma = candidate;
                    entering = Some(j);
                }
            }
        }

        let mut dropping = None;
        for (a, &j) in active.iter().enumerate() {
            if direction[a] == 0.0 {
                continue;
            }
            let crossing = -coef[j] / direction[a];
            if crossing > eps && crossing < gamma {
                gamma = crossing;
                dropping = Some(a);
            }
        }
        if dropping.is_some() {
            entering = None;
        }

        for (a, &j) in active.iter().enumerate() {
            coef[j] += gamma * direction[a];
        }
        residual.scaled_add(-gamma, &equiangular);

        if let Some(a) = dropping {
            let j = active.remove(a);
            coef[j] = 0.0;
        } else if let Some(j) = entering {
            active.push(j);
        }

        path.coefficients.push(coef.clone());
        path.penalties.push((c_max - gamma * a_norm).max(0.0) / n_samples);

        if entering.is_none() && dropping.is_none() {
            break;
        }
    }

    Ok(path)
}
