use thiserror::Error;

/// クレート全体で使う `Result` 型。
pub type SparseResult<T> = Result<T, SparseError>;

/// 疎回帰・学習・入出力で発生するエラー。
#[derive(Debug, Error)]
pub enum SparseError {
    /// 設定値が不正（呼び出し直後に検出され、処理は一切実行されません）
    #[error("設定エラー: {0}")]
    Configuration(String),

    /// ライブラリ行列とターゲットの行数が一致しない
    #[error("行数の不一致: ライブラリ {library} 行, ターゲット {target} 行")]
    RowMismatch { library: usize, target: usize },

    /// 回復不能な数値的不安定
    #[error("数値的不安定: {0}")]
    NumericalInstability(String),

    /// burn テンソルとの変換に失敗
    #[error("テンソル変換エラー: {0}")]
    Tensor(String),

    #[error("IO エラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON エラー: {0}")]
    Json(#[from] serde_json::Error),

    /// モデルの保存・読み込みに失敗
    #[error("モデルファイルのエラー: {0}")]
    Record(#[from] burn::record::RecorderError),

    #[error("描画エラー: {0}")]
    Plot(String),
}

impl SparseError {
    /// 設定エラーを作成します。
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// テンソル変換エラーを作成します。
    pub fn tensor(msg: impl std::fmt::Debug) -> Self {
        Self::Tensor(format!("{msg:?}"))
    }

    /// 描画エラーを作成します。
    pub fn plot(msg: impl std::fmt::Display) -> Self {
        Self::Plot(msg.to_string())
    }
}
