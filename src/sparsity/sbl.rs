//! 疎ベイズ学習（Sparse Bayesian Learning, SBL）。
//!
//! 各項の係数に精度 `alpha_j` の正規事前分布を置き、エビデンスを最大化するように
//! `alpha` とノイズ精度 `beta` を交互に更新します。`alpha_j` が発散した項は
//! [`Precision::Pruned`] となり、以降の行列計算から外れます。途中で一度外れかけた項も
//! 発散するまでは再評価されるため、初期の不安定な反復で項を取りこぼしにくくなります。

use super::{SparsityEstimator, SparsityMask, validate_problem};
use crate::error::{SparseError, SparseResult};
use crate::linalg::{column_norms, to_dmatrix, variance};
use log::{debug, trace, warn};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

/// 擬似逆で打ち切る固有値の相対閾値
const EIGEN_EPS: f64 = 1e-12;
/// Cholesky の対角要素の二乗が対応する精度の対角要素のこの倍率を下回れば、列がほぼ共線とみなす
const COLLINEARITY_EPS: f64 = 1e-10;

/// 1 項あたりの事前精度。
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Precision {
    /// 有限の精度を持ち、まだ回帰に参加している項
    Active(f64),
    /// 精度が発散し、係数が 0 に固定された項
    Pruned,
}

impl Precision {
    pub fn is_active(&self) -> bool {
        matches!(self, Precision::Active(_))
    }

    /// 報告用の値。枝刈りされた項は `f64::INFINITY`。
    pub fn value(&self) -> f64 {
        match self {
            Precision::Active(alpha) => *alpha,
            Precision::Pruned => f64::INFINITY,
        }
    }
}

/// SBL の反復設定。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SblOptions {
    /// 反復回数の上限
    pub max_iterations: usize,
    /// `ln(alpha)` の最大変化量がこれを下回れば収束とみなす
    pub convergence_tol: f64,
    /// 収束判定を何回連続で満たす必要があるか
    pub patience: usize,
    /// すべての項に共通の初期精度
    pub initial_alpha: f64,
    /// これを超えた精度は発散（枝刈り）として扱う
    pub prune_cutoff: f64,
    /// ノイズ標準偏差の下限（ターゲットの標準偏差に対する比）
    pub noise_floor: f64,
}

impl Default for SblOptions {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            convergence_tol: 1e-6,
            patience: 3,
            initial_alpha: 1e-2,
            prune_cutoff: 1e9,
            noise_floor: 1e-6,
        }
    }
}

impl SblOptions {
    /// 値の範囲を検証します。
    pub fn validate(&self) -> SparseResult<()> {
        if self.max_iterations == 0 {
            return Err(SparseError::configuration("max_iterations は 1 以上が必要です"));
        }
        if !(self.convergence_tol.is_finite() && self.convergence_tol > 0.0) {
            return Err(SparseError::configuration(format!(
                "convergence_tol は正の有限値が必要です: {}",
                self.convergence_tol
            )));
        }
        if self.patience == 0 {
            return Err(SparseError::configuration("patience は 1 以上が必要です"));
        }
        for (name, value) in [
            ("initial_alpha", self.initial_alpha),
            ("prune_cutoff", self.prune_cutoff),
            ("noise_floor", self.noise_floor),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(SparseError::configuration(format!(
                    "{name} は正の有限値が必要です: {value}"
                )));
            }
        }
        if self.initial_alpha >= self.prune_cutoff {
            return Err(SparseError::configuration(
                "initial_alpha は prune_cutoff より小さくなければなりません",
            ));
        }
        Ok(())
    }
}

/// 反復の終わり方。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SblStatus {
    Converged,
    /// 収束前に `max_iterations` に達した（エラーではなく最後の反復値を返す）
    IterationBudgetExhausted,
    /// すべての項が枝刈りされた
    AllPruned,
}

/// 数値的に問題があったが推定値は返せたことを示す診断情報。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SblDiagnostic {
    /// 事後精度行列が特異またはほぼ特異（列がほぼ共線）で、擬似逆で代用した
    SingularPosterior { iteration: usize },
    /// 更新値が有限でなくなったため、直前の推定値で打ち切った
    NonFiniteUpdate { iteration: usize },
}

impl From<SblDiagnostic> for SparseError {
    fn from(diagnostic: SblDiagnostic) -> Self {
        match diagnostic {
            SblDiagnostic::SingularPosterior { iteration } => SparseError::NumericalInstability(
                format!("反復 {iteration} で事後精度行列が特異になりました"),
            ),
            SblDiagnostic::NonFiniteUpdate { iteration } => SparseError::NumericalInstability(
                format!("反復 {iteration} で有限でない更新値が発生しました"),
            ),
        }
    }
}

/// SBL の推定結果。
#[derive(Debug, Clone)]
pub struct SblFit {
    pub precisions: Vec<Precision>,
    /// 事後平均。枝刈りされた項はちょうど 0。
    pub mu: Array1<f64>,
    /// 事後共分散（`項数 × 項数`）。枝刈りされた項の行と列は 0。
    pub covariance: Array2<f64>,
    pub noise_precision: f64,
    pub iterations: usize,
    pub status: SblStatus,
    pub diagnostic: Option<SblDiagnostic>,
}

impl SblFit {
    /// 報告用の `alpha`（枝刈りされた項は無限大）。
    pub fn alpha(&self) -> Array1<f64> {
        self.precisions.iter().map(Precision::value).collect()
    }

    pub fn mask(&self) -> SparsityMask {
        SparsityMask::from_vec(self.precisions.iter().map(Precision::is_active).collect())
    }
}

/// エビデンス最大化による SBL 推定器。
#[derive(Debug, Clone, Default)]
pub struct SblEstimator {
    pub options: SblOptions,
}

/// 事後分布の計算に必要な、反復をまたいで不変な量。
struct Moments {
    gram: DMatrix<f64>,
    projection: DVector<f64>,
}

struct Posterior {
    mu: DVector<f64>,
    sigma: DMatrix<f64>,
    singular: bool,
}

impl SblEstimator {
    pub fn new(options: SblOptions) -> Self {
        Self { options }
    }

    /// SBL を実行し、精度・事後平均・共分散・ノイズ精度を返します。
    ///
    /// 形状や設定の誤りは計算前に `Err` になります。数値的な問題は
    /// `SblFit::diagnostic` で報告され、その時点で最良の推定値が返ります。
    pub fn fit_posterior(
        &self,
        theta: ArrayView2<f64>,
        target: ArrayView1<f64>,
    ) -> SparseResult<SblFit> {
        validate_problem(theta, target)?;
        self.options.validate()?;
        let options = &self.options;

        let n_samples = theta.nrows();
        let n_terms = theta.ncols();
        let all: Vec<usize> = (0..n_terms).collect();
        let design = to_dmatrix(theta, &all);
        let y = DVector::from_iterator(n_samples, target.iter().copied());
        let moments = Moments {
            gram: design.transpose() * &design,
            projection: design.transpose() * &y,
        };

        let target_variance = variance(target);
        let beta_max = if target_variance > 0.0 {
            1.0 / (options.noise_floor * options.noise_floor * target_variance)
        } else {
            1.0 / (options.noise_floor * options.noise_floor)
        };
        let mut beta = if target_variance > 0.0 {
            (1.0 / (0.1 * target_variance)).min(beta_max)
        } else {
            beta_max
        };

        let norms = column_norms(theta);
        let mut precisions: Vec<Precision> = norms
            .iter()
            .map(|norm| {
                if *norm > 0.0 {
                    Precision::Active(options.initial_alpha)
                } else {
                    Precision::Pruned
                }
            })
            .collect();

        let mut status = SblStatus::IterationBudgetExhausted;
        let mut diagnostic = None;
        let mut stable = 0;
        let mut iterations = 0;

        for iteration in 1..=options.max_iterations {
            let active = active_indices(&precisions);
            if active.is_empty() {
                status = SblStatus::AllPruned;
                break;
            }
            iterations = iteration;

            let posterior = posterior(&moments, &active, &precisions, beta);
            if posterior.singular && diagnostic.is_none() {
                diagnostic = Some(SblDiagnostic::SingularPosterior { iteration });
            }

            let design_active = design.select_columns(active.iter());
            let residual = &y - &design_active * &posterior.mu;
            let rss = residual.norm_squared();

            let mut next = precisions.clone();
            let mut gamma_sum = 0.0;
            let mut max_change: f64 = 0.0;
            let mut pruned_now = 0;
            for (k, &j) in active.iter().enumerate() {
                let alpha = precisions[j].value();
                let gamma = 1.0 - alpha * posterior.sigma[(k, k)];
                let mu = posterior.mu[k];
                gamma_sum += gamma.max(0.0);
                let updated = gamma / (mu * mu);
                if gamma <= 0.0
                    || mu == 0.0
                    || !updated.is_finite()
                    || updated > options.prune_cutoff
                {
                    next[j] = Precision::Pruned;
                    pruned_now += 1;
                } else {
                    max_change = max_change.max((updated / alpha).ln().abs());
                    next[j] = Precision::Active(updated);
                }
            }

            let next_beta = if rss > 0.0 {
                ((n_samples as f64 - gamma_sum).max(f64::EPSILON) / rss).min(beta_max)
            } else {
                beta_max
            };

            if !(max_change.is_finite() && next_beta.is_finite()) {
                diagnostic = Some(SblDiagnostic::NonFiniteUpdate { iteration });
                break;
            }

            trace!(
                "SBL 反復 {iteration}: 有効項 {} -> {}, beta = {next_beta:.3e}, 最大変化 {max_change:.3e}",
                active.len(),
                active.len() - pruned_now
            );

            precisions = next;
            beta = next_beta;

            if pruned_now == 0 && max_change < options.convergence_tol {
                stable += 1;
                if stable >= options.patience {
                    status = SblStatus::Converged;
                    break;
                }
            } else {
                stable = 0;
            }
        }

        let active = active_indices(&precisions);
        let mut mu = Array1::zeros(n_terms);
        let mut covariance = Array2::zeros((n_terms, n_terms));
        if active.is_empty() {
            status = SblStatus::AllPruned;
        } else {
            let posterior = posterior(&moments, &active, &precisions, beta);
            if posterior.singular && diagnostic.is_none() {
                diagnostic = Some(SblDiagnostic::SingularPosterior { iteration: iterations });
            }
            for (k, &j) in active.iter().enumerate() {
                mu[j] = posterior.mu[k];
                for (l, &i) in active.iter().enumerate() {
                    covariance[[j, i]] = posterior.sigma[(k, l)];
                }
            }
        }

        if let Some(d) = diagnostic {
            warn!("SBL: {}", SparseError::from(d));
        }
        debug!(
            "SBL 終了: {:?}, 反復 {iterations}, 有効項 {}/{n_terms}, beta = {beta:.3e}",
            status,
            active.len()
        );

        Ok(SblFit {
            precisions,
            mu,
            covariance,
            noise_precision: beta,
            iterations,
            status,
            diagnostic,
        })
    }
}

impl SparsityEstimator for SblEstimator {
    fn fit(&self, theta: ArrayView2<f64>, target: ArrayView1<f64>) -> SparseResult<Array1<f64>> {
        Ok(self.fit_posterior(theta, target)?.mu)
    }

    fn name(&self) -> &'static str {
        "sbl"
    }
}

fn active_indices(precisions: &[Precision]) -> Vec<usize> {
    precisions
        .iter()
        .enumerate()
        .filter_map(|(j, p)| p.is_active().then_some(j))
        .collect()
}

/// `Sigma = (beta * G_AA + diag(alpha_A))^-1`, `mu = beta * Sigma * b_A`。
///
/// Cholesky 分解に失敗した場合や、分解できてもある列が他の列とほぼ共線な場合は
/// 固有値を打ち切った擬似逆を使います。
fn posterior(
    moments: &Moments,
    active: &[usize],
    precisions: &[Precision],
    beta: f64,
) -> Posterior {
    let k = active.len();
    let precision_matrix = DMatrix::from_fn(k, k, |a, b| {
        let value = beta * moments.gram[(active[a], active[b])];
        if a == b {
            value + precisions[active[a]].value()
        } else {
            value
        }
    });
    let projection = DVector::from_fn(k, |a, _| moments.projection[active[a]]);

    let factor = precision_matrix.clone().cholesky();
    let well_posed = factor.as_ref().is_some_and(|cholesky| {
        let l = cholesky.l();
        (0..k).all(|a| l[(a, a)].powi(2) >= COLLINEARITY_EPS * precision_matrix[(a, a)])
    });
    let (sigma, singular) = match factor {
        Some(cholesky) if well_posed => (cholesky.inverse(), false),
        _ => (pseudo_inverse(precision_matrix), true),
    };
    let mu = &sigma * projection * beta;
    Posterior { mu, sigma, singular }
}

fn pseudo_inverse(matrix: DMatrix<f64>) -> DMatrix<f64> {
    let eigen = matrix.symmetric_eigen();
    let largest = eigen.eigenvalues.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    let q = &eigen.eigenvectors;
    let n = eigen.eigenvalues.len();
    let mut inverse = DMatrix::zeros(n, n);
    for (k, &lambda) in eigen.eigenvalues.iter().enumerate() {
        if lambda > EIGEN_EPS * largest {
            let column = q.column(k).into_owned();
            inverse += &column * column.transpose() / lambda;
        }
    }
    inverse
}
