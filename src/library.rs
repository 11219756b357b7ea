use crate::error::{SparseError, SparseResult};
use crate::model::FunctionApproximator;
use burn::prelude::Backend;
use burn::tensor::{Tensor, TensorData};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// サポートする空間微分の最大階数
pub const MAX_DIFF_ORDER: usize = 4;

/// 空間 2 次元のライブラリで扱える微分の最大階数
pub const MAX_PLANAR_DIFF_ORDER: usize = 2;

fn one() -> usize {
    1
}

/// ライブラリ行列の列構成（多項式の次数 × 空間微分）。
///
/// 空間 1 次元では微分は `1, u_x, u_xx, ...`、2 次元では
/// `1, u_x, u_y, u_xx, u_yy, u_xy` の順に並びます。座標の列は `(t, x)` または `(t, x, y)`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryLayout {
    pub poly_order: usize,
    pub diff_order: usize,
    #[serde(default = "one")]
    pub spatial_dims: usize,
}

impl LibraryLayout {
    pub fn new(poly_order: usize, diff_order: usize) -> Self {
        Self {
            poly_order,
            diff_order,
            spatial_dims: 1,
        }
    }

    /// 空間 2 次元 `(x, y)` のレイアウト。
    pub fn planar(poly_order: usize, diff_order: usize) -> Self {
        Self {
            poly_order,
            diff_order,
            spatial_dims: 2,
        }
    }

    /// ネットワークの入力次元（時間 + 空間）。
    pub fn n_inputs(&self) -> usize {
        self.spatial_dims + 1
    }

    /// 定数 `1` を含む微分項の数。
    pub fn n_derivative_terms(&self) -> usize {
        self.derivative_names().len()
    }

    pub fn n_terms(&self) -> usize {
        (self.poly_order + 1) * self.n_derivative_terms()
    }

    /// `u^p` と `k` 番目の微分項の積の列番号。多項式の次数が外側のループです。
    pub fn term(&self, p: usize, k: usize) -> usize {
        p * self.n_derivative_terms() + k
    }

    /// 微分項の名前（定数項は空文字列）。
    pub fn derivative_names(&self) -> Vec<String> {
        let mut names = vec![String::new()];
        if self.spatial_dims == 1 {
            names.extend((1..=self.diff_order).map(|d| format!("u_{}", "x".repeat(d))));
        } else {
            if self.diff_order >= 1 {
                names.extend(["u_x", "u_y"].map(String::from));
            }
            if self.diff_order >= 2 {
                names.extend(["u_xx", "u_yy", "u_xy"].map(String::from));
            }
        }
        names
    }

    /// 列の並びに対応する項の名前（`1`, `u_x`, `u*u_xx`, `u^2*u_xxx` など）。
    pub fn term_names(&self) -> Vec<String> {
        let derivatives = self.derivative_names();
        let mut names = Vec::with_capacity(self.n_terms());
        for p in 0..=self.poly_order {
            let poly = match p {
                0 => String::new(),
                1 => "u".to_string(),
                _ => format!("u^{p}"),
            };
            for deriv in &derivatives {
                names.push(match (poly.is_empty(), deriv.is_empty()) {
                    (true, true) => "1".to_string(),
                    (false, true) => poly.clone(),
                    (true, false) => deriv.clone(),
                    (false, false) => format!("{poly}*{deriv}"),
                });
            }
        }
        names
    }

    /// 空間次元と微分の階数の組み合わせを検証します。
    pub fn validate(&self) -> SparseResult<()> {
        let max_order = match self.spatial_dims {
            1 => MAX_DIFF_ORDER,
            2 => MAX_PLANAR_DIFF_ORDER,
            dims => {
                return Err(SparseError::configuration(format!(
                    "空間次元は 1 または 2 が必要です: {dims}"
                )));
            }
        };
        if self.diff_order == 0 || self.diff_order > max_order {
            return Err(SparseError::configuration(format!(
                "空間 {} 次元では diff_order は 1..={max_order} の範囲が必要です: {}",
                self.spatial_dims, self.diff_order
            )));
        }
        Ok(())
    }
}

/// ネットワーク出力とその微分。すべて重みへの勾配を保持しています。
#[derive(Debug, Clone)]
pub struct FieldDerivatives<B: Backend> {
    /// `u` の予測値 `[n, 1]`
    pub prediction: Tensor<B, 2>,
    /// `u_t` `[n, 1]`
    pub time_deriv: Tensor<B, 2>,
    /// 定数項を除いた微分項 `[n, 1]`。並びは [`LibraryLayout::derivative_names`] と同じ
    pub spatial: Vec<Tensor<B, 2>>,
}

/// 中心差分ステンシルで `u_t` と空間微分を計算します。
///
/// ずらした座標をまとめて 1 回の順伝播に通すので、微分はネットワークの重みに対して
/// 自動微分可能なままです。
pub fn stencil_derivatives<B: Backend, M: FunctionApproximator<B> + ?Sized>(
    model: &M,
    coords: Tensor<B, 2>,
    layout: &LibraryLayout,
    step: f64,
) -> FieldDerivatives<B> {
    let [n, n_cols] = coords.dims();
    let device = coords.device();
    let shifted = |offsets: &[(usize, f64)]| {
        let columns = (0..n_cols)
            .map(|c| {
                let amount = offsets
                    .iter()
                    .find(|(column, _)| *column == c)
                    .map_or(0.0, |(_, a)| *a);
                Tensor::<B, 2>::ones([n, 1], &device).mul_scalar(amount)
            })
            .collect();
        coords.clone() + Tensor::cat(columns, 1)
    };

    let h = step;
    let mut batch = vec![coords.clone(), shifted(&[(0, h)]), shifted(&[(0, -h)])];
    for axis in 1..=layout.spatial_dims {
        batch.push(shifted(&[(axis, h)]));
        batch.push(shifted(&[(axis, -h)]));
    }
    let wide = layout.spatial_dims == 1 && layout.diff_order >= 3;
    if wide {
        batch.push(shifted(&[(1, 2.0 * h)]));
        batch.push(shifted(&[(1, -2.0 * h)]));
    }
    let mixed = layout.spatial_dims == 2 && layout.diff_order >= 2;
    if mixed {
        for (sx, sy) in [(h, h), (h, -h), (-h, h), (-h, -h)] {
            batch.push(shifted(&[(1, sx), (2, sy)]));
        }
    }
    let output = model.forward(Tensor::cat(batch, 0));
    let block = |k: usize| output.clone().slice([k * n..(k + 1) * n, 0..1]);

    let u = block(0);
    let time_deriv = (block(1) - block(2)).div_scalar(2.0 * h);
    let first = |axis: usize| (block(1 + 2 * axis) - block(2 + 2 * axis)).div_scalar(2.0 * h);
    let second = |axis: usize| {
        (block(1 + 2 * axis) - u.clone().mul_scalar(2.0) + block(2 + 2 * axis))
            .div_scalar(h * h)
    };

    let mut spatial = Vec::with_capacity(layout.n_derivative_terms() - 1);
    if layout.spatial_dims == 1 {
        spatial.push(first(1));
        if layout.diff_order >= 2 {
            spatial.push(second(1));
        }
        if wide {
            let (up, um, up2, um2) = (block(3), block(4), block(5), block(6));
            spatial.push(
                (up2.clone() - up.clone().mul_scalar(2.0) + um.clone().mul_scalar(2.0)
                    - um2.clone())
                .div_scalar(2.0 * h.powi(3)),
            );
            if layout.diff_order >= 4 {
                spatial.push(
                    (up2 - up.mul_scalar(4.0) + u.clone().mul_scalar(6.0) - um.mul_scalar(4.0)
                        + um2)
                        .div_scalar(h.powi(4)),
                );
            }
        }
    } else {
        spatial.push(first(1));
        spatial.push(first(2));
        if mixed {
            spatial.push(second(1));
            spatial.push(second(2));
            spatial.push((block(7) - block(8) - block(9) + block(10)).div_scalar(4.0 * h * h));
        }
    }

    FieldDerivatives {
        prediction: u,
        time_deriv,
        spatial,
    }
}

/// 多項式 × 微分のライブラリ行列 `[n, n_terms]` を組み立てます。
pub fn assemble<B: Backend>(fields: &FieldDerivatives<B>, layout: &LibraryLayout) -> Tensor<B, 2> {
    let u = fields.prediction.clone();
    let ones = Tensor::ones_like(&u);

    let mut poly = vec![ones.clone()];
    for p in 1..=layout.poly_order {
        poly.push(poly[p - 1].clone() * u.clone());
    }
    let mut derivs = vec![ones];
    derivs.extend(
        fields
            .spatial
            .iter()
            .take(layout.n_derivative_terms() - 1)
            .cloned(),
    );

    let mut columns = Vec::with_capacity(layout.n_terms());
    for p in &poly {
        for d in &derivs {
            columns.push(p.clone() * d.clone());
        }
    }
    Tensor::cat(columns, 1)
}

/// 2 次元テンソルを（勾配を切り離して）`Array2<f64>` に写します。
pub fn to_array2<B: Backend>(tensor: Tensor<B, 2>) -> SparseResult<Array2<f64>> {
    let [rows, cols] = tensor.dims();
    let values = tensor
        .into_data()
        .convert::<f64>()
        .to_vec::<f64>()
        .map_err(SparseError::tensor)?;
    Array2::from_shape_vec((rows, cols), values).map_err(SparseError::tensor)
}

/// `[n, 1]` のテンソルを `Array1<f64>` に写します。
pub fn to_array1<B: Backend>(tensor: Tensor<B, 2>) -> SparseResult<Array1<f64>> {
    let values = tensor
        .into_data()
        .convert::<f64>()
        .to_vec::<f64>()
        .map_err(SparseError::tensor)?;
    Ok(Array1::from_vec(values))
}

pub fn from_array2<B: Backend>(array: &Array2<f64>, device: &B::Device) -> Tensor<B, 2> {
    let values: Vec<f64> = array.iter().copied().collect();
    Tensor::from_data(TensorData::new(values, [array.nrows(), array.ncols()]), device)
}

/// `Array1` を列ベクトル `[n, 1]` のテンソルにします。
pub fn from_array1<B: Backend>(array: &Array1<f64>, device: &B::Device) -> Tensor<B, 2> {
    Tensor::from_data(TensorData::new(array.to_vec(), [array.len(), 1]), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f64>;

    /// 解析的に微分が分かる関数 `u = x^3 + 2t`
    struct Cubic;

    impl FunctionApproximator<TestBackend> for Cubic {
        fn forward(&self, coords: Tensor<TestBackend, 2>) -> Tensor<TestBackend, 2> {
            let [n, _] = coords.dims();
            let t = coords.clone().slice([0..n, 0..1]);
            let x = coords.slice([0..n, 1..2]);
            x.clone() * x.clone() * x + t.mul_scalar(2.0)
        }
    }

    /// `u = x^2 y + y^3 + 3t`
    struct Planar;

    impl FunctionApproximator<TestBackend> for Planar {
        fn forward(&self, coords: Tensor<TestBackend, 2>) -> Tensor<TestBackend, 2> {
            let [n, _] = coords.dims();
            let t = coords.clone().slice([0..n, 0..1]);
            let x = coords.clone().slice([0..n, 1..2]);
            let y = coords.slice([0..n, 2..3]);
            x.clone() * x * y.clone() + y.clone() * y.clone() * y + t.mul_scalar(3.0)
        }
    }

    #[test]
    fn term_names_follow_column_order() {
        let names = LibraryLayout::new(2, 2).term_names();
        assert_eq!(
            names,
            vec!["1", "u_x", "u_xx", "u", "u*u_x", "u*u_xx", "u^2", "u^2*u_x", "u^2*u_xx"]
        );
        assert_eq!(LibraryLayout::new(2, 2).term(1, 1), 4);
    }

    #[test]
    fn planar_layout_lists_mixed_derivative_last() {
        let layout = LibraryLayout::planar(1, 2);
        assert_eq!(layout.n_inputs(), 3);
        assert_eq!(
            layout.term_names(),
            vec![
                "1", "u_x", "u_y", "u_xx", "u_yy", "u_xy", "u", "u*u_x", "u*u_y", "u*u_xx",
                "u*u_yy", "u*u_xy"
            ]
        );
        assert_eq!(layout.term(1, 3), 9);
        assert!(LibraryLayout::planar(0, 3).validate().is_err());
        assert!(LibraryLayout::new(2, 4).validate().is_ok());
    }

    #[test]
    fn planar_stencil_matches_analytic_derivatives() {
        let device = Default::default();
        let points = [[0.1, 1.0, 0.5], [0.7, -2.0, 1.5]];
        let coords = from_array2::<TestBackend>(
            &ndarray::array![[0.1, 1.0, 0.5], [0.7, -2.0, 1.5]],
            &device,
        );
        let fields = stencil_derivatives(&Planar, coords, &LibraryLayout::planar(0, 2), 1e-3);
        assert_eq!(fields.spatial.len(), 5);
        let ut = to_array1(fields.time_deriv).unwrap();
        let derivs: Vec<Array1<f64>> = fields
            .spatial
            .into_iter()
            .map(|d| to_array1(d).unwrap())
            .collect();
        for (k, [_, x, y]) in points.iter().enumerate() {
            let expected = [2.0 * x * y, x * x + 3.0 * y * y, 2.0 * y, 6.0 * y, 2.0 * x];
            assert!((ut[k] - 3.0).abs() < 1e-6);
            for (d, e) in derivs.iter().zip(expected) {
                assert!((d[k] - e).abs() < 1e-4, "{} vs {e}", d[k]);
            }
        }
    }

    #[test]
    fn stencil_matches_analytic_derivatives() {
        let device = Default::default();
        let coords = from_array2::<TestBackend>(
            &ndarray::array![[0.5, 1.0], [1.0, -0.5], [0.2, 2.0]],
            &device,
        );
        let fields = stencil_derivatives(&Cubic, coords, &LibraryLayout::new(1, 3), 1e-3);
        let ut = to_array1(fields.time_deriv).unwrap();
        let ux = to_array1(fields.spatial[0].clone()).unwrap();
        let uxx = to_array1(fields.spatial[1].clone()).unwrap();
        let uxxx = to_array1(fields.spatial[2].clone()).unwrap();
        for (k, x) in [1.0, -0.5, 2.0].iter().enumerate() {
            assert!((ut[k] - 2.0).abs() < 1e-6);
            assert!((ux[k] - 3.0 * x * x).abs() < 1e-5);
            assert!((uxx[k] - 6.0 * x).abs() < 1e-4);
            assert!((uxxx[k] - 6.0).abs() < 1e-3);
        }
    }

    #[test]
    fn assembled_library_has_expected_columns() {
        let device = Default::default();
        let coords = from_array2::<TestBackend>(&ndarray::array![[0.5, 1.0], [1.0, 2.0]], &device);
        let layout = LibraryLayout::new(1, 2);
        let fields = stencil_derivatives(&Cubic, coords, &layout, 1e-3);
        let theta = to_array2(assemble(&fields, &layout)).unwrap();
        assert_eq!(theta.dim(), (2, layout.n_terms()));
        // u*u_x at (t, x) = (0.5, 1.0): u = 2, u_x = 3
        assert!((theta[[0, layout.term(1, 1)]] - 6.0).abs() < 1e-5);
        assert_eq!(theta[[1, 0]], 1.0);
    }
}
