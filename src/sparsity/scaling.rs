use super::SparsityMask;
use crate::linalg::column_norms;
use ndarray::{Array1, ArrayView1, ArrayView2};

/// 学習ループで使う既定の閾値
pub const DEFAULT_CUTOFF: f64 = 0.1;

/// 係数を列の大きさで正規化し、項どうしを比較可能にします。
///
/// `scaled[j] = coefficients[j] * ‖theta[:, j]‖ / ‖target‖`。
/// ノルムが 0 の列（またはターゲット）はスケール係数 0 として扱い、
/// 0 除算は起こしません。入力は変更しません。
pub fn scale(
    coefficients: ArrayView1<f64>,
    theta: ArrayView2<f64>,
    target: ArrayView1<f64>,
) -> Array1<f64> {
    let target_norm = target.dot(&target).sqrt();
    let norms = column_norms(theta);
    Array1::from_iter(coefficients.iter().zip(norms.iter()).map(|(c, norm)| {
        if *norm == 0.0 || target_norm == 0.0 {
            0.0
        } else {
            c * (norm / target_norm)
        }
    }))
}

/// スケール済み係数の絶対値が `cutoff` 未満の項を除外したマスクを返します。
///
/// 係数がちょうど 0 の項は `cutoff` に関係なく除外されます。
pub fn threshold(scaled: ArrayView1<f64>, cutoff: f64) -> SparsityMask {
    SparsityMask::from_vec(
        scaled
            .iter()
            .map(|s| *s != 0.0 && s.abs() >= cutoff)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, array};

    fn problem() -> (Array2<f64>, Array1<f64>, Array1<f64>) {
        let theta = array![
            [1.0, 10.0, 0.0],
            [2.0, -20.0, 0.0],
            [-1.0, 30.0, 0.0],
            [0.5, 5.0, 0.0]
        ];
        let coef = array![1.0, 0.1, 3.0];
        let y = theta.dot(&coef);
        (theta, coef, y)
    }

    #[test]
    fn scale_is_repeatable() {
        let (theta, coef, y) = problem();
        let first = scale(coef.view(), theta.view(), y.view());
        let second = scale(coef.view(), theta.view(), y.view());
        assert_eq!(first, second);
    }

    #[test]
    fn scale_is_invariant_to_column_units() {
        let (theta, coef, y) = problem();
        let before = scale(coef.view(), theta.view(), y.view());

        let factor = 250.0;
        let mut rescaled = theta.clone();
        rescaled.column_mut(1).mapv_inplace(|v| v * factor);
        let mut rescaled_coef = coef.clone();
        rescaled_coef[1] /= factor;
        let after = scale(rescaled_coef.view(), rescaled.view(), y.view());

        for (a, b) in before.iter().zip(after.iter()) {
            assert!((a - b).abs() < 1e-12, "{a} != {b}");
        }
    }

    #[test]
    fn zero_column_scales_to_zero() {
        let (theta, coef, y) = problem();
        let scaled = scale(coef.view(), theta.view(), y.view());
        assert_eq!(scaled[2], 0.0);
        assert!(scaled.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn zero_target_does_not_divide_by_zero() {
        let (theta, coef, _) = problem();
        let y = Array1::zeros(theta.nrows());
        let scaled = scale(coef.view(), theta.view(), y.view());
        assert!(scaled.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn threshold_drops_small_and_zero_terms() {
        let mask = threshold(array![0.5, -0.05, 0.0, -0.2].view(), 0.1);
        assert_eq!(mask.as_slice(), &[true, false, false, true]);
    }

    #[test]
    fn raising_cutoff_never_adds_terms() {
        let scaled = array![0.9, -0.31, 0.05, 0.0, 0.2, -0.0001, 1.5];
        let mut previous = usize::MAX;
        for cutoff in [0.0, 1e-4, 0.01, 0.1, 0.2, 0.31, 0.5, 1.0, 2.0] {
            let n = threshold(scaled.view(), cutoff).n_active();
            assert!(n <= previous);
            previous = n;
        }
    }
}
