//! 手書き文字アンサンブルのCLI

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use htr_ensemble_lib::logging::init_logging;
use htr_ensemble_lib::ml::{EnsembleEngine, EpochProgress};
use htr_ensemble_lib::ml_commands::{run_evaluation, run_training_pipeline};
use htr_ensemble_lib::model::{artifact_path, load_metadata, print_metadata_info, AppConfig, DeviceType, InferenceConfig};
use htr_ensemble_lib::{FoldStatus, LoadPolicy};

/// 手書き英大文字認識（CNNアンサンブル）
#[derive(Parser, Debug)]
#[command(name = "htr_ensemble")]
#[command(version)]
#[command(about = "Handwritten uppercase recognition with a soft-voting CNN ensemble", long_about = None)]
struct Cli {
    /// 設定ファイル
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// 詳細ログ
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// CPU (NdArray) バックエンドを強制
    #[arg(long, default_value = "false")]
    cpu: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 全フォールドを学習し、テストセットで評価
    Train {
        #[arg(short, long)]
        data_dir: Option<String>,

        #[arg(short, long)]
        model_dir: Option<String>,

        #[arg(short, long)]
        epochs: Option<usize>,

        #[arg(short, long)]
        folds: Option<usize>,

        #[arg(long)]
        seed: Option<u64>,

        /// 同時に学習するフォールド数
        #[arg(long)]
        parallel: Option<usize>,

        /// 学習後の評価を省略
        #[arg(long, default_value = "false")]
        skip_eval: bool,
    },

    /// 保存済みのテストセットで評価
    Evaluate {
        /// テストセットCSV（省略時は `<model_dir>/test_set.csv`）
        #[arg(short, long)]
        test_set: Option<PathBuf>,

        /// 混同行列の出力先
        #[arg(long)]
        confusion_csv: Option<PathBuf>,
    },

    /// 画像を分類
    Predict {
        /// 画像ファイル
        #[arg(required = true)]
        images: Vec<PathBuf>,

        /// 上位何クラスまで表示するか
        #[arg(short = 'k', long, default_value = "3")]
        top_k: usize,
    },

    /// 各フォールドの成果物のメタデータを表示
    Inspect,

    /// 現在の設定をファイルに書き出す
    InitConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let mut config = AppConfig::load_or_default(&cli.config);
    if cli.cpu {
        config.device_type = DeviceType::Cpu;
    }

    match config.device_type {
        DeviceType::Wgpu => {
            let device = burn_wgpu::WgpuDevice::DefaultDevice;
            run::<burn::backend::Wgpu>(cli, config, device)
        }
        DeviceType::Cpu => {
            let device = burn_ndarray::NdArrayDevice::Cpu;
            run::<burn_ndarray::NdArray>(cli, config, device)
        }
    }
}

fn run<B: Backend>(cli: Cli, mut config: AppConfig, device: B::Device) -> Result<()> {
    info!("計算デバイス: {}", config.device_type);

    match cli.command {
        Commands::Train {
            data_dir,
            model_dir,
            epochs,
            folds,
            seed,
            parallel,
            skip_eval,
        } => {
            if let Some(v) = data_dir {
                config.dataset.data_dir = v;
            }
            if let Some(v) = model_dir {
                config.model.model_dir = v;
            }
            if let Some(v) = epochs {
                config.training.num_epochs = v;
            }
            if let Some(v) = folds {
                config.model.num_folds = v;
            }
            if let Some(v) = seed {
                config.training.seed = v;
            }
            if let Some(v) = parallel {
                config.training.max_parallel_folds = v;
            }
            config.display();

            let summary = run_training_pipeline::<B>(&config, &device, &|p: EpochProgress| {
                info!(
                    "[fold {}] Epoch {}/{} - loss: {:.4}, acc: {:.4}, val_acc: {:.4} ({})",
                    p.fold, p.epoch, p.total_epochs, p.train_loss, p.train_accuracy, p.val_accuracy, p.state
                );
            })?;

            println!("\n=== 学習結果 ===");
            for fold in &summary.folds {
                let status = match fold.status {
                    FoldStatus::Completed => "ok",
                    FoldStatus::Degraded => "degraded",
                };
                println!(
                    "fold {}: val_acc {:.4} (best epoch {}/{}) [{}]",
                    fold.fold, fold.val_accuracy, fold.best_epoch, fold.epochs_run, status
                );
            }
            for failure in &summary.failures {
                println!("失敗: {}", failure);
            }

            if skip_eval {
                return Ok(());
            }
            if !summary.failures.is_empty() && config.load_policy() == LoadPolicy::Strict {
                warn!("失敗したフォールドがあるため評価を省略します");
                return Ok(());
            }
            let (report, codec) = run_evaluation::<B>(&config, &summary.test_set_path, &device)?;
            report.print_report();
            let csv_path = config.model_dir().join("confusion_matrix.csv");
            report.write_confusion_csv(&csv_path, &codec)?;
            info!("混同行列を保存しました: {}", csv_path.display());
        }

        Commands::Evaluate {
            test_set,
            confusion_csv,
        } => {
            let test_set = test_set.unwrap_or_else(|| config.test_set_path());
            let (report, codec) = run_evaluation::<B>(&config, &test_set, &device)?;
            report.print_report();
            if let Some(path) = confusion_csv {
                report.write_confusion_csv(&path, &codec)?;
                info!("混同行列を保存しました: {}", path.display());
            }
        }

        Commands::Predict { images, top_k } => {
            let engine = EnsembleEngine::<B>::load(&config.model_dir(), config.model.num_folds, config.load_policy(), &device)?;
            let results = engine.predict_paths(&images)?;
            for (path, result) in images.iter().zip(&results) {
                let top: Vec<String> = result
                    .top_k(top_k, engine.codec().table())
                    .into_iter()
                    .map(|(label, p)| format!("{}={:.3}", label, p))
                    .collect();
                println!(
                    "{}: {} ({} models) [{}]",
                    path.display(),
                    result.predicted_label,
                    result.source_models,
                    top.join(", ")
                );
            }
        }

        Commands::Inspect => {
            match InferenceConfig::load_from_model(&artifact_path(&config.model_dir(), 1)) {
                Ok(inference_config) => inference_config.print_info(),
                Err(e) => warn!("推論設定を読み込めません: {:#}", e),
            }
            for fold in 1..=config.model.num_folds {
                let path = artifact_path(&config.model_dir(), fold);
                match load_metadata(&path) {
                    Ok(metadata) => print_metadata_info(&metadata),
                    Err(e) => println!("fold {}: 読み込めません ({}): {:#}", fold, path.display(), e),
                }
            }
        }

        Commands::InitConfig => {
            config
                .save(&cli.config)
                .with_context(|| format!("設定ファイルを書き込めません: {}", cli.config.display()))?;
            println!("設定を保存しました: {}", cli.config.display());
        }
    }

    Ok(())
}
