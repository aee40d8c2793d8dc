//! 学習・評価・推論のパイプライン
//!
//! CLI やサービス層から呼ぶための入口です。重い処理は `spawn_blocking` で実行する
//! 非同期版も用意しています。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use serde::Serialize;
use tracing::info;

use crate::csv_loader::{load_manifest, load_samples, save_samples};
use crate::ml::{
    build_corpus, evaluate, partition, train_ensemble, EnsembleEngine, EpochProgress, EvaluationReport, LabelCodec,
    LoadPolicy, NUM_CLASSES,
};
use crate::error::HtrError;
use crate::model::AppConfig;
use crate::types::{FoldReport, PredictionResult};

/// 学習パイプラインの結果
#[derive(Debug, Serialize)]
pub struct TrainingSummary {
    pub folds: Vec<FoldReport>,
    /// 失敗したフォールドのエラーメッセージ
    pub failures: Vec<String>,
    pub test_set_path: PathBuf,
    pub test_samples: usize,
    pub class_labels: Vec<char>,
}

/// マニフェスト読み込みから全フォールドの保存までを実行
///
/// ホールドアウトしたテストセットは `test_set.csv` として保存し、後の評価で再利用します。
/// マニフェストが 26 文字すべてを含まない場合は学習を始めずにエラーにします。
pub fn run_training_pipeline<B: Backend>(
    config: &AppConfig,
    device: &B::Device,
    progress: &(dyn Fn(EpochProgress) + Sync),
) -> Result<TrainingSummary> {
    let samples = load_manifest(&config.data_dir(), &config.dataset.manifest).context("データセットの読み込みに失敗しました")?;
    let codec = LabelCodec::fit(samples.iter().map(|s| s.label_char))?;
    if codec.len() != NUM_CLASSES {
        let missing: String = LabelCodec::uppercase_alphabet()
            .table()
            .iter()
            .filter(|c| codec.encode(**c).is_err())
            .collect();
        return Err(HtrError::Dataset(format!(
            "マニフェストに含まれない文字があります: {} ({} / {} クラス)",
            missing,
            codec.len(),
            NUM_CLASSES
        ))
        .into());
    }
    let corpus = build_corpus(samples, &codec).context("前処理に失敗しました")?;

    let split = partition(&corpus.labels, &codec, &config.partition_config()).context("データ分割に失敗しました")?;

    let model_dir = config.model_dir();
    std::fs::create_dir_all(&model_dir).with_context(|| format!("Failed to create model directory: {:?}", model_dir))?;

    let test_samples: Vec<_> = split.test_indices.iter().map(|&i| corpus.samples[i].clone()).collect();
    let test_set_path = config.test_set_path();
    save_samples(&test_set_path, &test_samples).context("テストセットの保存に失敗しました")?;
    info!(samples = test_samples.len(), path = %test_set_path.display(), "テストセットを保存しました");

    let report = train_ensemble::<B>(
        &corpus,
        &split,
        &config.model_config(codec.len()),
        &config.trainer_config(),
        &model_dir,
        device,
        progress,
    );

    let failures = report.failed().map(|e| e.to_string()).collect();
    Ok(TrainingSummary {
        folds: report.succeeded().cloned().collect(),
        failures,
        test_set_path,
        test_samples: test_samples.len(),
        class_labels: codec.table().to_vec(),
    })
}

/// 保存済みのテストセットでアンサンブルを評価
pub fn run_evaluation<B: Backend>(
    config: &AppConfig,
    test_set_path: &Path,
    device: &B::Device,
) -> Result<(EvaluationReport, LabelCodec)> {
    let engine = EnsembleEngine::<B>::load(&config.model_dir(), config.model.num_folds, config.load_policy(), device)?;
    let samples = load_samples(test_set_path).with_context(|| format!("テストセットを読み込めません: {:?}", test_set_path))?;
    let codec = engine.codec().clone();
    let corpus = build_corpus(samples, &codec)?;
    let report = evaluate(&engine, &corpus.tensors, &corpus.labels)?;
    Ok((report, codec))
}

/// base64 画像をまとめて推論する（非同期）
///
/// モデルの読み込みから推論まで、ブロッキングスレッド内で完結させます。
pub async fn predict_encoded_batch<B: Backend>(
    model_dir: PathBuf,
    num_folds: usize,
    policy: LoadPolicy,
    payloads: Vec<String>,
    device: B::Device,
) -> Result<Vec<PredictionResult>> {
    let result = tokio::task::spawn_blocking(move || -> crate::error::Result<Vec<PredictionResult>> {
        let engine = EnsembleEngine::<B>::load(&model_dir, num_folds, policy, &device)?;
        engine.predict_encoded(&payloads)
    })
    .await
    .context("推論スレッドエラー")?;

    Ok(result?)
}

/// 学習パイプラインを実行する（非同期）
pub async fn train_ensemble_command<B: Backend>(
    config: AppConfig,
    device: B::Device,
    on_progress: Arc<dyn Fn(EpochProgress) + Send + Sync>,
) -> Result<TrainingSummary> {
    tokio::task::spawn_blocking(move || {
        let progress = |p: EpochProgress| on_progress(p);
        run_training_pipeline::<B>(&config, &device, &progress)
    })
    .await
    .context("学習スレッドエラー")?
}
