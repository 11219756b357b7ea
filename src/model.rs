use crate::library::{FieldDerivatives, LibraryLayout, stencil_derivatives};
use burn::module::Module;
use burn::nn::{Linear, LinearConfig, Tanh};
use burn::prelude::Backend;
use burn::tensor::Tensor;

/// 座標から場の値への微分可能な近似関数。
pub trait FunctionApproximator<B: Backend> {
    /// 座標 `[n, n_in]` から予測 `[n, n_out]` を計算します。
    fn forward(&self, coords: Tensor<B, 2>) -> Tensor<B, 2>;

    /// 予測値と、ライブラリの組み立てに必要な微分をまとめて返します。
    fn evaluate(
        &self,
        coords: Tensor<B, 2>,
        layout: &LibraryLayout,
        step: f64,
    ) -> FieldDerivatives<B>
    where
        Self: Sized,
    {
        stencil_derivatives(self, coords, layout, step)
    }
}

/// 場を近似する多層パーセプトロン（MLP）。
///
/// 座標(t, x)または(t, x, y)を入力とし、その点における場の値uを予測します。
#[derive(Module, Debug)]
pub struct Model<B: Backend> {
    hidden: Vec<Linear<B>>,
    output: Linear<B>,
    activation: Tanh,
}

impl<B: Backend> Model<B> {
    /// 新しいモデルを初期化します。
    ///
    /// `hidden_dims` は隠れ層の幅を入力側から順に並べたものです。
    pub fn new(n_in: usize, hidden_dims: &[usize], n_out: usize, device: &B::Device) -> Self {
        let mut hidden = Vec::with_capacity(hidden_dims.len());
        let mut width = n_in;
        for &dim in hidden_dims {
            hidden.push(LinearConfig::new(width, dim).init(device));
            width = dim;
        }
        Self {
            hidden,
            output: LinearConfig::new(width, n_out).init(device),
            activation: Tanh::new(),
        }
    }
}

impl<B: Backend> FunctionApproximator<B> for Model<B> {
    /// モデルの順伝播を実行します。
    fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let mut x = input;
        for linear in &self.hidden {
            x = self.activation.forward(linear.forward(x));
        }
        self.output.forward(x)
    }
}
