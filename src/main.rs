//! # 偏微分方程式の発見プログラム
//!
//! `clap` クレートを利用して、コマンドラインから`train`（学習）、`infer`（推論）、
//! `sweep`（ノイズ感度調査）を個別に実行できます。
//!
//! ## 使い方
//!
//! ### 学習
//! ```bash
//! cargo run --release -- train --dataset burgers --estimator sbl
//! ```
//!
//! ### 推論
//! ```bash
//! cargo run --release -- infer
//! ```
//!
//! ログの詳細度は `RUST_LOG` で変更できます（既定は `info`）。

use clap::Parser;
use pde_discovery::cli::{Cli, Commands};
use pde_discovery::error::SparseResult;
use pde_discovery::training::TrainOptions;
use pde_discovery::{inference, sweep, training};

/// コマンドライン引数を解析し、各サブコマンドの処理に振り分けます。
fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    if let Err(e) = dispatch(cli.command) {
        log::error!("{e}");
        std::process::exit(1);
    }
}

fn dispatch(command: Commands) -> SparseResult<()> {
    match command {
        Commands::Train(args) => training::run(TrainOptions {
            dataset: args.dataset,
            n_samples: args.samples,
            noise: args.noise,
            seed: args.seed,
            config: args.training_config()?,
        }),
        Commands::Infer => inference::run().map(|_| ()),
        Commands::Sweep(args) => sweep::run(args.dataset, args.samples, args.levels, args.seed),
    }
}
