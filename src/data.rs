//! 解析解からの学習データ生成。
//!
//! 格子上で解析解を評価し、ランダムに間引いてノイズを加えたものを学習データとします。
//! 正解ライブラリと時間微分も解析解の差分から作り、学習中の誤差評価に使います。

use crate::error::{SparseError, SparseResult};
use crate::library::LibraryLayout;
use crate::linalg::variance;
use ndarray::{Array1, Array2};
use rand::Rng;
use rand::seq::index::sample;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// 解析解 `u(t, x)`。`x` は空間座標（1 次元なら `[x]`、2 次元なら `[x, y]`）。
pub trait Solution {
    fn value(&self, t: f64, x: &[f64]) -> f64;

    fn name(&self) -> &'static str;

    /// 既知の真の係数（ライブラリの並びに合わせたもの）。
    fn true_coefficients(&self, layout: &LibraryLayout) -> Array1<f64>;
}

/// デルタ関数を初期条件とする Burgers 方程式 `u_t = v u_xx - u u_x`。
#[derive(Debug, Clone, Copy)]
pub struct BurgersDelta {
    pub viscosity: f64,
    pub amplitude: f64,
}

impl Solution for BurgersDelta {
    fn value(&self, t: f64, x: &[f64]) -> f64 {
        let v = self.viscosity;
        let r = self.amplitude / (2.0 * v);
        let z = x[0] / (4.0 * v * t).sqrt();
        let growth = r.exp() - 1.0;
        (v / (PI * t)).sqrt() * growth * (-z * z).exp() / (1.0 + growth / 2.0 * libm::erfc(z))
    }

    fn name(&self) -> &'static str {
        "burgers"
    }

    fn true_coefficients(&self, layout: &LibraryLayout) -> Array1<f64> {
        let mut coefficients = Array1::zeros(layout.n_terms());
        if layout.spatial_dims != 1 {
            return coefficients;
        }
        if layout.diff_order >= 2 {
            coefficients[layout.term(0, 2)] = self.viscosity;
        }
        if layout.poly_order >= 1 {
            coefficients[layout.term(1, 1)] = -1.0;
        }
        coefficients
    }
}

/// 1 次元拡散方程式 `u_t = D u_xx` のガウス解。
#[derive(Debug, Clone, Copy)]
pub struct Diffusion {
    pub diffusivity: f64,
}

impl Solution for Diffusion {
    fn value(&self, t: f64, x: &[f64]) -> f64 {
        let spread = 4.0 * self.diffusivity * t;
        (-x[0] * x[0] / spread).exp() / (PI * spread).sqrt()
    }

    fn name(&self) -> &'static str {
        "diffusion"
    }

    fn true_coefficients(&self, layout: &LibraryLayout) -> Array1<f64> {
        let mut coefficients = Array1::zeros(layout.n_terms());
        if layout.spatial_dims == 1 && layout.diff_order >= 2 {
            coefficients[layout.term(0, 2)] = self.diffusivity;
        }
        coefficients
    }
}

/// 平面上の移流拡散方程式 `u_t = D (u_xx + u_yy) - v_x u_x - v_y u_y` のガウス解。
///
/// 幅 `sigma` のガウス分布が速度 `velocity` で流されながら広がります。
#[derive(Debug, Clone, Copy)]
pub struct AdvectionDiffusion2d {
    pub diffusivity: f64,
    pub velocity: [f64; 2],
    pub center: [f64; 2],
    pub sigma: f64,
}

impl Solution for AdvectionDiffusion2d {
    fn value(&self, t: f64, x: &[f64]) -> f64 {
        let spread = self.sigma * self.sigma + 2.0 * self.diffusivity * t;
        let dx = x[0] - self.center[0] - self.velocity[0] * t;
        let dy = x[1] - self.center[1] - self.velocity[1] * t;
        (-(dx * dx + dy * dy) / (2.0 * spread)).exp() / (2.0 * PI * spread)
    }

    fn name(&self) -> &'static str {
        "advection-diffusion-2d"
    }

    fn true_coefficients(&self, layout: &LibraryLayout) -> Array1<f64> {
        let mut coefficients = Array1::zeros(layout.n_terms());
        if layout.spatial_dims != 2 {
            return coefficients;
        }
        coefficients[layout.term(0, 1)] = -self.velocity[0];
        coefficients[layout.term(0, 2)] = -self.velocity[1];
        if layout.diff_order >= 2 {
            coefficients[layout.term(0, 3)] = self.diffusivity;
            coefficients[layout.term(0, 4)] = self.diffusivity;
        }
        coefficients
    }
}

/// 学習に使う方程式の種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    Burgers,
    Diffusion,
    #[serde(rename = "advection_diffusion_2d")]
    #[value(name = "advection-diffusion-2d")]
    AdvectionDiffusion2d,
}

impl DatasetKind {
    /// 解析解と既定の格子を返します。
    pub fn build(&self) -> (Box<dyn Solution>, Grid) {
        match self {
            DatasetKind::Burgers => (
                Box::new(BurgersDelta {
                    viscosity: 0.1,
                    amplitude: 1.0,
                }),
                Grid::new(linspace(-3.0, 4.0, 100), linspace(0.5, 5.0, 50)),
            ),
            DatasetKind::Diffusion => (
                Box::new(Diffusion { diffusivity: 0.5 }),
                Grid::new(linspace(-5.0, 5.0, 100), linspace(0.5, 2.5, 25)),
            ),
            DatasetKind::AdvectionDiffusion2d => (
                Box::new(AdvectionDiffusion2d {
                    diffusivity: 1.0,
                    velocity: [0.25, 0.25],
                    center: [0.0, 0.0],
                    sigma: 0.5,
                }),
                Grid::planar(
                    linspace(-4.0, 4.0, 40),
                    linspace(-4.0, 4.0, 40),
                    linspace(0.0, 1.0, 20),
                ),
            ),
        }
    }

    /// このデータセットで使う既定のライブラリ構成。
    pub fn default_layout(&self) -> LibraryLayout {
        match self {
            DatasetKind::Burgers | DatasetKind::Diffusion => LibraryLayout::new(2, 3),
            DatasetKind::AdvectionDiffusion2d => LibraryLayout::planar(0, 2),
        }
    }
}

/// `[start, end]` を `n` 等分した点列。
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => (0..n)
            .map(|i| start + (end - start) * i as f64 / (n - 1) as f64)
            .collect(),
    }
}

/// 空間×時間の直積格子。
#[derive(Debug, Clone)]
pub struct Grid {
    /// 空間の各軸の点列（`x`、2 次元なら `x, y`）
    pub space: Vec<Vec<f64>>,
    pub t: Vec<f64>,
}

impl Grid {
    pub fn new(x: Vec<f64>, t: Vec<f64>) -> Self {
        Self { space: vec![x], t }
    }

    pub fn planar(x: Vec<f64>, y: Vec<f64>, t: Vec<f64>) -> Self {
        Self {
            space: vec![x, y],
            t,
        }
    }

    pub fn spatial_dims(&self) -> usize {
        self.space.len()
    }

    pub fn len(&self) -> usize {
        self.t.len() * self.space.iter().map(Vec::len).product::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// すべての格子点の座標 `(t, x[, y])` を `len × (1 + 空間次元)` 行列で返します。
    pub fn coords(&self) -> Array2<f64> {
        let mut points: Vec<Vec<f64>> = self.t.iter().map(|t| vec![*t]).collect();
        for axis in &self.space {
            points = points
                .into_iter()
                .flat_map(|point| {
                    axis.iter().map(move |x| {
                        let mut next = point.clone();
                        next.push(*x);
                        next
                    })
                })
                .collect();
        }
        let mut coords = Array2::zeros((points.len(), 1 + self.spatial_dims()));
        for (row, point) in points.iter().enumerate() {
            for (col, value) in point.iter().enumerate() {
                coords[[row, col]] = *value;
            }
        }
        coords
    }
}

/// 学習データ。座標は `(t, x[, y])` の順。
#[derive(Debug, Clone)]
pub struct Dataset {
    pub coords: Array2<f64>,
    /// ノイズを加えた観測値
    pub field: Array1<f64>,
    /// ノイズなしの解析解
    pub clean: Array1<f64>,
}

/// 座標行列の各行で解析解を評価します。
pub fn evaluate(solution: &dyn Solution, coords: &Array2<f64>) -> Array1<f64> {
    Array1::from_iter(coords.rows().into_iter().map(|row| {
        let x: Vec<f64> = row.iter().skip(1).copied().collect();
        solution.value(row[0], &x)
    }))
}

impl Dataset {
    /// 格子から `n_samples` 点を非復元抽出し、`noise * std(u)` の正規ノイズを加えます。
    ///
    /// `n_samples == 0` のときは全格子点を使います。
    pub fn create<R: Rng>(
        solution: &dyn Solution,
        grid: &Grid,
        n_samples: usize,
        noise: f64,
        rng: &mut R,
    ) -> SparseResult<Self> {
        if grid.is_empty() {
            return Err(SparseError::configuration("格子が空です"));
        }
        if n_samples > grid.len() {
            return Err(SparseError::configuration(format!(
                "サンプル数 {n_samples} が格子点数 {} を超えています",
                grid.len()
            )));
        }
        if !(noise.is_finite() && noise >= 0.0) {
            return Err(SparseError::configuration(format!("ノイズ水準が不正です: {noise}")));
        }

        let all = grid.coords();
        let coords = if n_samples == 0 {
            all
        } else {
            let rows = sample(rng, grid.len(), n_samples).into_vec();
            all.select(ndarray::Axis(0), &rows)
        };
        let clean = evaluate(solution, &coords);
        let std = variance(clean.view()).sqrt() * noise;
        let field = clean.mapv(|u| u + std * rng.sample::<f64, _>(StandardNormal));
        Ok(Self {
            coords,
            field,
            clean,
        })
    }

    pub fn len(&self) -> usize {
        self.field.len()
    }

    pub fn is_empty(&self) -> bool {
        self.field.is_empty()
    }
}

/// 正解のライブラリ行列と時間微分。
#[derive(Debug, Clone)]
pub struct GroundTruth {
    pub theta: Array2<f64>,
    pub time_deriv: Array1<f64>,
}

/// 空間の 1 点の周りで中心差分をとり、レイアウトの並びで微分項を返します。
fn analytic_derivatives(layout: &LibraryLayout, u: impl Fn(&[f64]) -> f64, h: f64) -> Vec<f64> {
    let mut derivatives = vec![1.0];
    if layout.spatial_dims == 1 {
        let at = |dx: f64| u(&[dx]);
        let all = [
            (at(h) - at(-h)) / (2.0 * h),
            (at(h) - 2.0 * at(0.0) + at(-h)) / (h * h),
            (at(2.0 * h) - 2.0 * at(h) + 2.0 * at(-h) - at(-2.0 * h)) / (2.0 * h.powi(3)),
            (at(2.0 * h) - 4.0 * at(h) + 6.0 * at(0.0) - 4.0 * at(-h) + at(-2.0 * h)) / h.powi(4),
        ];
        derivatives.extend(all.iter().take(layout.diff_order));
    } else {
        let at = |dx: f64, dy: f64| u(&[dx, dy]);
        let center = at(0.0, 0.0);
        derivatives.push((at(h, 0.0) - at(-h, 0.0)) / (2.0 * h));
        derivatives.push((at(0.0, h) - at(0.0, -h)) / (2.0 * h));
        if layout.diff_order >= 2 {
            derivatives.push((at(h, 0.0) - 2.0 * center + at(-h, 0.0)) / (h * h));
            derivatives.push((at(0.0, h) - 2.0 * center + at(0.0, -h)) / (h * h));
            derivatives.push((at(h, h) - at(h, -h) - at(-h, h) + at(-h, -h)) / (4.0 * h * h));
        }
    }
    derivatives
}

impl GroundTruth {
    /// 解析解の中心差分で、各座標における正解ライブラリを作ります。
    pub fn from_solution(
        solution: &dyn Solution,
        coords: &Array2<f64>,
        layout: &LibraryLayout,
        step: f64,
    ) -> Self {
        let n = coords.nrows();
        let mut theta = Array2::zeros((n, layout.n_terms()));
        let mut time_deriv = Array1::zeros(n);
        for (row, point) in coords.rows().into_iter().enumerate() {
            let t = point[0];
            let x: Vec<f64> = point.iter().skip(1).copied().collect();
            let shifted = |offset: &[f64]| {
                let moved: Vec<f64> = x.iter().zip(offset).map(|(a, b)| a + b).collect();
                solution.value(t, &moved)
            };
            let derivatives = analytic_derivatives(layout, shifted, step);
            time_deriv[row] =
                (solution.value(t + step, &x) - solution.value(t - step, &x)) / (2.0 * step);
            let value = solution.value(t, &x);
            for p in 0..=layout.poly_order {
                for (k, derivative) in derivatives.iter().enumerate() {
                    theta[[row, layout.term(p, k)]] = value.powi(p as i32) * derivative;
                }
            }
        }
        Self { theta, time_deriv }
    }
}
