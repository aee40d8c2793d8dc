//! フォールドごとのモデル学習
//!
//! 各フォールドは独立に初期化したモデルを AdamW で学習し、検証精度を監視して早期終了します。
//! 保存するのは最後に改善したエポックの重みです（停止時点の重みではありません）。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::{
    data::dataloader::{batcher::Batcher, DataLoaderBuilder},
    module::{AutodiffModule, Module},
    optim::{AdamWConfig, GradientsParams, Optimizer},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::Backend, ElementConversion, Int, Tensor},
};
use burn_autodiff::Autodiff;
use burn_dataset::Dataset;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{HtrError, Result};
use crate::ml::label_codec::LabelCodec;
use crate::ml::ml_model::{CharClassifier, ModelConfig, IMAGE_SIZE};
use crate::ml::partition::{DatasetPartition, Fold};
use crate::ml::preprocess::{GlyphCorpus, GlyphTensor};
use crate::model::{artifact_path, save_model_with_metadata, ModelMetadata};
use crate::types::{FoldReport, FoldStatus};

/// 学習のハイパーパラメータ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    pub num_epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    /// AdamW の重み減衰（勾配とは切り離して適用）
    pub weight_decay: f32,
    /// 改善なしを何エポック許すか
    pub patience: usize,
    pub seed: u64,
    /// 同時に学習するフォールド数の上限
    pub max_parallel_folds: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            num_epochs: 30,
            batch_size: 32,
            learning_rate: 0.002,
            weight_decay: 0.004,
            patience: 3,
            seed: 42,
            max_parallel_folds: 1,
        }
    }
}

/// 学習データセット（コーパスを共有し、インデックスのみ保持）
pub struct GlyphDataset {
    tensors: Arc<Vec<GlyphTensor>>,
    labels: Arc<Vec<usize>>,
    indices: Vec<usize>,
}

impl GlyphDataset {
    pub fn new(tensors: Arc<Vec<GlyphTensor>>, labels: Arc<Vec<usize>>, indices: Vec<usize>) -> Self {
        Self {
            tensors,
            labels,
            indices,
        }
    }

    /// 多数派クラスの比率（常に多数派を答えた場合の精度）
    pub fn majority_baseline(&self) -> f64 {
        if self.indices.is_empty() {
            return 0.0;
        }
        let mut counts = std::collections::HashMap::new();
        for &i in &self.indices {
            *counts.entry(self.labels[i]).or_insert(0usize) += 1;
        }
        let max = counts.values().copied().max().unwrap_or(0);
        max as f64 / self.indices.len() as f64
    }
}

/// データセットアイテム
#[derive(Clone, Debug)]
pub struct GlyphItem {
    pub pixels: GlyphTensor,
    pub label: usize,
}

impl Dataset<GlyphItem> for GlyphDataset {
    fn get(&self, index: usize) -> Option<GlyphItem> {
        let actual_index = *self.indices.get(index)?;
        Some(GlyphItem {
            pixels: self.tensors.get(actual_index)?.clone(),
            label: *self.labels.get(actual_index)?,
        })
    }

    fn len(&self) -> usize {
        self.indices.len()
    }
}

/// バッチャー
#[derive(Clone)]
pub struct GlyphBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> GlyphBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct GlyphBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> Batcher<B, GlyphItem, GlyphBatch<B>> for GlyphBatcher<B> {
    fn batch(&self, items: Vec<GlyphItem>, _device: &B::Device) -> GlyphBatch<B> {
        let batch_size = items.len();
        let mut all_pixels = Vec::with_capacity(batch_size * GlyphTensor::LEN);
        let mut targets_vec = Vec::with_capacity(batch_size);

        for item in items {
            all_pixels.extend_from_slice(item.pixels.as_slice());
            targets_vec.push(item.label as i64);
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, 1, IMAGE_SIZE, IMAGE_SIZE]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), &self.device);

        GlyphBatch { images, targets }
    }
}

/// 早期終了の状態
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EarlyStoppingState {
    /// まだ1エポックも評価していない
    Training,
    /// 直近のエポックで検証精度が最高を更新した
    Improved { epoch: usize, accuracy: f64 },
    /// 最高値を更新できなかったエポックが `streak` 回続いている
    NoImprovement { streak: usize },
    /// 猶予を使い切った
    Stopped,
    /// 最良エポックの重みを保存した
    Persisted,
}

/// 検証精度を監視する早期終了の状態機械
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    state: EarlyStoppingState,
    best: Option<(usize, f64)>,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            state: EarlyStoppingState::Training,
            best: None,
        }
    }

    /// 1エポック分の検証精度を反映して次の状態を返す
    ///
    /// 改善は「これまでの最高値より厳密に大きい」場合のみです。
    pub fn observe(&mut self, epoch: usize, accuracy: f64) -> EarlyStoppingState {
        let improved = self.best.map_or(true, |(_, best)| accuracy > best);
        self.state = if improved {
            self.best = Some((epoch, accuracy));
            EarlyStoppingState::Improved { epoch, accuracy }
        } else {
            let streak = match self.state {
                EarlyStoppingState::NoImprovement { streak } => streak + 1,
                _ => 1,
            };
            if streak >= self.patience {
                EarlyStoppingState::Stopped
            } else {
                EarlyStoppingState::NoImprovement { streak }
            }
        };
        self.state
    }

    /// 保存完了を記録
    pub fn mark_persisted(&mut self) {
        self.state = EarlyStoppingState::Persisted;
    }

    pub fn state(&self) -> EarlyStoppingState {
        self.state
    }

    pub fn should_stop(&self) -> bool {
        self.state == EarlyStoppingState::Stopped
    }

    /// (最良エポック, 最良精度)
    pub fn best(&self) -> Option<(usize, f64)> {
        self.best
    }
}

/// エポックごとの進捗
#[derive(Debug, Clone, Serialize)]
pub struct EpochProgress {
    /// フォールド番号（1始まり）
    pub fold: usize,
    /// エポック番号（1始まり）
    pub epoch: usize,
    pub total_epochs: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_accuracy: f64,
    pub state: String,
}

/// バッチ内の正解数
fn count_correct<B: Backend>(output: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let [batch_size, _] = output.dims();
    let predictions = output.argmax(1).reshape([batch_size]);
    let correct: i64 = predictions.equal(targets).int().sum().into_scalar().elem();
    correct as usize
}

/// データセット全体の精度を評価（推論モード）
pub fn evaluate_accuracy<B: Backend>(
    model: &CharClassifier<B>,
    dataset: &GlyphDataset,
    batcher: &GlyphBatcher<B>,
    batch_size: usize,
    device: &B::Device,
) -> f64 {
    let len = dataset.len();
    let mut correct = 0usize;

    for start in (0..len).step_by(batch_size.max(1)) {
        let end = (start + batch_size).min(len);
        let items: Vec<_> = (start..end).filter_map(|i| dataset.get(i)).collect();
        if items.is_empty() {
            continue;
        }
        let batch = batcher.batch(items, device);
        let output = model.forward(batch.images);
        correct += count_correct(output, batch.targets);
    }

    if len == 0 {
        0.0
    } else {
        correct as f64 / len as f64
    }
}

/// 1フォールドを学習して成果物を保存する
///
/// 成果物は `model_dir/model_fold_{fold.index + 1}.tar.gz` に保存されます。
/// `run_id` は同じアンサンブルに属するフォールドの目印としてメタデータに記録します。
#[allow(clippy::too_many_arguments)]
pub fn train_fold<B: Backend>(
    run_id: &str,
    tensors: Arc<Vec<GlyphTensor>>,
    labels: Arc<Vec<usize>>,
    codec: &LabelCodec,
    partition: &DatasetPartition,
    fold: &Fold,
    model_config: &ModelConfig,
    config: &TrainerConfig,
    model_dir: &Path,
    device: &B::Device,
    progress: &(dyn Fn(EpochProgress) + Sync),
) -> Result<FoldReport> {
    let fold_no = fold.index + 1;
    let num_folds = partition.folds.len();
    let (train_indices, val_indices) = partition.resolve(fold);

    if train_indices.is_empty() || val_indices.is_empty() {
        return Err(HtrError::Training {
            fold: fold_no,
            message: "学習データまたは検証データが空です".to_string(),
        });
    }

    let dataset_train = GlyphDataset::new(tensors.clone(), labels.clone(), train_indices);
    let dataset_val = GlyphDataset::new(tensors, labels, val_indices);
    let baseline = dataset_val.majority_baseline();

    info!(
        fold = fold_no,
        train = dataset_train.len(),
        val = dataset_val.len(),
        "学習を開始します"
    );

    let batcher_train = GlyphBatcher::<Autodiff<B>>::new(device.clone());
    let batcher_val = GlyphBatcher::<B>::new(device.clone());

    // エポックごとにシャッフル（フォールドごとに異なるシード）
    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(config.batch_size)
        .shuffle(config.seed.wrapping_add(fold_no as u64))
        .build(dataset_train);

    let mut model: CharClassifier<Autodiff<B>> = model_config.init(device);
    let mut optimizer = AdamWConfig::new()
        .with_weight_decay(config.weight_decay)
        .init();

    let mut early_stopping = EarlyStopping::new(config.patience);
    let mut best_model: Option<CharClassifier<B>> = None;
    let mut epochs_run = 0usize;

    for epoch in 1..=config.num_epochs {
        let mut epoch_loss = 0.0f64;
        let mut num_batches = 0usize;
        let mut correct = 0usize;
        let mut seen = 0usize;

        for batch in dataloader_train.iter() {
            let batch_len = batch.targets.dims()[0];
            let item = model.forward_classification(batch.images, batch.targets);

            let loss_value: f64 = item.loss.clone().into_scalar().elem();
            if !loss_value.is_finite() {
                return Err(HtrError::Training {
                    fold: fold_no,
                    message: format!("epoch {} で損失が発散しました: {}", epoch, loss_value),
                });
            }
            epoch_loss += loss_value;
            num_batches += 1;
            correct += count_correct(item.output, item.targets);
            seen += batch_len;

            let grads = item.loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optimizer.step(config.learning_rate, model, grads);
        }

        let valid_model = model.valid();
        let val_accuracy = evaluate_accuracy(&valid_model, &dataset_val, &batcher_val, config.batch_size, device);
        let state = early_stopping.observe(epoch, val_accuracy);
        if matches!(state, EarlyStoppingState::Improved { .. }) {
            best_model = Some(valid_model);
        }
        epochs_run = epoch;

        let train_loss = epoch_loss / num_batches.max(1) as f64;
        let train_accuracy = correct as f64 / seen.max(1) as f64;
        debug!(
            fold = fold_no,
            epoch,
            train_loss,
            train_accuracy,
            val_accuracy,
            ?state,
            "エポック完了"
        );
        progress(EpochProgress {
            fold: fold_no,
            epoch,
            total_epochs: config.num_epochs,
            train_loss,
            train_accuracy,
            val_accuracy,
            state: format!("{:?}", state),
        });

        if early_stopping.should_stop() {
            info!(fold = fold_no, epoch, "検証精度が改善しないため早期終了します");
            break;
        }
    }

    let (Some(best_model), Some((best_epoch, _))) = (best_model, early_stopping.best()) else {
        return Err(HtrError::Training {
            fold: fold_no,
            message: "1エポックも学習していません（num_epochs = 0）".to_string(),
        });
    };

    // 最良エポックの重みで最終的な検証精度を測り直す
    let val_accuracy = evaluate_accuracy(&best_model, &dataset_val, &batcher_val, config.batch_size, device);
    let degraded = val_accuracy <= baseline;
    if degraded {
        warn!(
            fold = fold_no,
            val_accuracy, baseline, "検証精度がベースラインを超えませんでした（degraded として保存します）"
        );
    }

    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let model_binary = recorder
        .record(best_model.into_record(), ())
        .map_err(|e| HtrError::Training {
            fold: fold_no,
            message: format!("モデル重みのシリアライズエラー: {:?}", e),
        })?;

    let metadata = ModelMetadata {
        fold: fold_no,
        num_folds,
        run_id: run_id.to_string(),
        class_labels: codec.clone(),
        model_input_size: IMAGE_SIZE as u32,
        dropout: model_config.dropout,
        val_accuracy,
        baseline_accuracy: baseline,
        degraded,
        best_epoch: best_epoch as u32,
        epochs_run: epochs_run as u32,
        num_epochs: config.num_epochs as u32,
        learning_rate: config.learning_rate,
        seed: config.seed,
        trained_at: String::new(),
    }
    .stamp_now();

    let artifact = artifact_path(model_dir, fold_no);
    save_model_with_metadata(&artifact, &metadata, &model_binary).map_err(|e| HtrError::Training {
        fold: fold_no,
        message: format!("{:#}", e),
    })?;
    early_stopping.mark_persisted();

    info!(
        fold = fold_no,
        val_accuracy,
        best_epoch,
        epochs_run,
        "保存しました: {}",
        artifact.display()
    );

    Ok(FoldReport {
        fold: fold_no,
        status: if degraded { FoldStatus::Degraded } else { FoldStatus::Completed },
        val_accuracy,
        best_epoch,
        epochs_run,
        baseline_accuracy: baseline,
        artifact_path: artifact,
    })
}

/// アンサンブル全体の学習結果
#[derive(Debug)]
pub struct EnsembleTrainingReport {
    /// フォールド番号順の結果（失敗したフォールドは `Err`）
    pub folds: Vec<Result<FoldReport>>,
    pub model_dir: PathBuf,
}

impl EnsembleTrainingReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &FoldReport> {
        self.folds.iter().filter_map(|r| r.as_ref().ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = &HtrError> {
        self.folds.iter().filter_map(|r| r.as_ref().err())
    }

    /// 全フォールドが保存済みならアンサンブルとして使える
    pub fn is_complete(&self) -> bool {
        self.folds.iter().all(|r| r.is_ok())
    }

    /// 成功したフォールドの検証精度の平均
    pub fn mean_val_accuracy(&self) -> Option<f64> {
        let accs: Vec<f64> = self.succeeded().map(|r| r.val_accuracy).collect();
        if accs.is_empty() {
            None
        } else {
            Some(accs.iter().sum::<f64>() / accs.len() as f64)
        }
    }
}

/// 失敗したフォールドの古い成果物を取り除く
fn discard_stale_artifact(model_dir: &Path, fold_no: usize) {
    let stale = artifact_path(model_dir, fold_no);
    if stale.exists() {
        match std::fs::remove_file(&stale) {
            Ok(()) => warn!(fold = fold_no, "古い成果物を削除しました: {}", stale.display()),
            Err(e) => warn!(fold = fold_no, "古い成果物を削除できません ({}): {}", stale.display(), e),
        }
    }
}

/// 全フォールドを学習する
///
/// フォールド同士は状態を共有しないので、`max_parallel_folds` 個ずつ並列に学習します。
/// あるフォールドが失敗しても他のフォールドは続行し、結果は報告に残します。
/// 失敗したフォールドに以前の成果物が残っていれば削除します。
pub fn train_ensemble<B: Backend>(
    corpus: &GlyphCorpus,
    partition: &DatasetPartition,
    model_config: &ModelConfig,
    config: &TrainerConfig,
    model_dir: &Path,
    device: &B::Device,
    progress: &(dyn Fn(EpochProgress) + Sync),
) -> EnsembleTrainingReport {
    let tensors = Arc::new(corpus.tensors.clone());
    let labels = Arc::new(corpus.labels.clone());
    let parallel = config.max_parallel_folds.max(1);
    let run_id = ModelMetadata::new_run_id();

    info!(
        folds = partition.folds.len(),
        parallel,
        run_id = %run_id,
        "アンサンブルの学習を開始します"
    );

    let mut results = Vec::with_capacity(partition.folds.len());
    for chunk in partition.folds.chunks(parallel) {
        let chunk_results: Vec<Result<FoldReport>> = std::thread::scope(|scope| {
            let handles: Vec<_> = chunk
                .iter()
                .map(|fold| {
                    let tensors = tensors.clone();
                    let labels = labels.clone();
                    let device = device.clone();
                    let run_id = run_id.as_str();
                    let handle = scope.spawn(move || {
                        train_fold::<B>(
                            run_id,
                            tensors,
                            labels,
                            &corpus.codec,
                            partition,
                            fold,
                            model_config,
                            config,
                            model_dir,
                            &device,
                            progress,
                        )
                    });
                    (fold.index + 1, handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(fold_no, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        Err(HtrError::Training {
                            fold: fold_no,
                            message: "学習スレッドがパニックしました".to_string(),
                        })
                    })
                })
                .collect()
        });

        for (fold, result) in chunk.iter().zip(&chunk_results) {
            if let Err(e) = result {
                warn!("フォールドの学習に失敗しました: {}", e);
                discard_stale_artifact(model_dir, fold.index + 1);
            }
        }
        results.extend(chunk_results);
    }

    let report = EnsembleTrainingReport {
        folds: results,
        model_dir: model_dir.to_path_buf(),
    };
    if let Some(mean) = report.mean_val_accuracy() {
        info!(mean_val_accuracy = mean, complete = report.is_complete(), "アンサンブルの学習が完了しました");
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::partition::{partition, PartitionConfig};
    use crate::model::load_model_with_metadata;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_early_stopping_transitions() {
        let mut es = EarlyStopping::new(3);
        assert_eq!(es.state(), EarlyStoppingState::Training);
        assert!(matches!(es.observe(1, 0.5), EarlyStoppingState::Improved { epoch: 1, .. }));
        assert_eq!(es.observe(2, 0.5), EarlyStoppingState::NoImprovement { streak: 1 });
        assert_eq!(es.observe(3, 0.4), EarlyStoppingState::NoImprovement { streak: 2 });
        assert!(matches!(es.observe(4, 0.6), EarlyStoppingState::Improved { epoch: 4, .. }));
        assert_eq!(es.observe(5, 0.6), EarlyStoppingState::NoImprovement { streak: 1 });
        assert_eq!(es.observe(6, 0.1), EarlyStoppingState::NoImprovement { streak: 2 });
        assert_eq!(es.observe(7, 0.59), EarlyStoppingState::Stopped);
        assert!(es.should_stop());
        assert_eq!(es.best(), Some((4, 0.6)));

        es.mark_persisted();
        assert_eq!(es.state(), EarlyStoppingState::Persisted);
    }

    #[test]
    fn test_patience_one_stops_immediately() {
        let mut es = EarlyStopping::new(1);
        es.observe(1, 0.2);
        assert_eq!(es.observe(2, 0.1), EarlyStoppingState::Stopped);
    }

    #[test]
    fn test_majority_baseline() {
        let tensors = Arc::new(vec![GlyphTensor::from_pixels(vec![0.0; GlyphTensor::LEN]).unwrap(); 4]);
        let labels = Arc::new(vec![0, 0, 0, 1]);
        let dataset = GlyphDataset::new(tensors, labels, vec![0, 1, 2, 3]);
        assert!((dataset.majority_baseline() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_batcher_shapes() {
        let device = burn_ndarray::NdArrayDevice::Cpu;
        let batcher = GlyphBatcher::<TestBackend>::new(device.clone());
        let items = vec![
            GlyphItem {
                pixels: GlyphTensor::from_pixels(vec![0.5; GlyphTensor::LEN]).unwrap(),
                label: 3,
            };
            5
        ];
        let batch = batcher.batch(items, &device);
        assert_eq!(batch.images.dims(), [5, 1, IMAGE_SIZE, IMAGE_SIZE]);
        assert_eq!(batch.targets.dims(), [5]);
    }

    fn synthetic_corpus(per_class: usize, classes: &str) -> GlyphCorpus {
        let codec = LabelCodec::fit(classes.chars()).unwrap();
        let mut tensors = Vec::new();
        let mut labels = Vec::new();
        let mut samples = Vec::new();
        for (class_id, letter) in codec.table().iter().enumerate() {
            for i in 0..per_class {
                // クラスごとに明るさの違う縦縞
                let pixels = (0..GlyphTensor::LEN)
                    .map(|p| {
                        let col = p % IMAGE_SIZE;
                        if col % (class_id + 2) == 0 {
                            ((i % 3) as f32 * 0.1 + 0.7).min(1.0)
                        } else {
                            0.0
                        }
                    })
                    .collect();
                tensors.push(GlyphTensor::from_pixels(pixels).unwrap());
                labels.push(class_id);
                samples.push(crate::types::Sample::new(format!("{}_{}.png", letter, i), *letter));
            }
        }
        GlyphCorpus {
            samples,
            tensors,
            labels,
            codec,
        }
    }

    #[test]
    fn test_train_ensemble_persists_every_fold() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = synthetic_corpus(6, "ABC");
        let split = partition(
            &corpus.labels,
            &corpus.codec,
            &PartitionConfig {
                test_fraction: 0.0,
                num_folds: 2,
                seed: 42,
            },
        )
        .unwrap();
        let model_config = ModelConfig::new().with_num_classes(corpus.codec.len());
        let config = TrainerConfig {
            num_epochs: 2,
            batch_size: 4,
            max_parallel_folds: 2,
            ..TrainerConfig::default()
        };

        let epochs_seen = std::sync::Mutex::new(Vec::new());
        let report = train_ensemble::<TestBackend>(
            &corpus,
            &split,
            &model_config,
            &config,
            dir.path(),
            &Default::default(),
            &|p: EpochProgress| epochs_seen.lock().unwrap().push((p.fold, p.epoch)),
        );

        assert!(report.is_complete(), "{:?}", report.folds);
        assert_eq!(report.succeeded().count(), 2);
        for fold in 1..=2 {
            let (metadata, binary) = load_model_with_metadata(&artifact_path(dir.path(), fold)).unwrap();
            assert_eq!(metadata.fold, fold);
            assert_eq!(metadata.num_folds, 2);
            assert_eq!(metadata.class_labels, corpus.codec);
            assert!(metadata.best_epoch >= 1 && metadata.best_epoch <= metadata.epochs_run);
            assert!(!binary.is_empty());
        }
        let seen = epochs_seen.lock().unwrap();
        assert!(seen.iter().any(|&(f, _)| f == 1));
        assert!(seen.iter().any(|&(f, _)| f == 2));
    }

    #[test]
    fn test_zero_epochs_is_a_fold_error() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = synthetic_corpus(4, "AB");
        let split = partition(
            &corpus.labels,
            &corpus.codec,
            &PartitionConfig {
                test_fraction: 0.0,
                num_folds: 2,
                seed: 1,
            },
        )
        .unwrap();
        let config = TrainerConfig {
            num_epochs: 0,
            ..TrainerConfig::default()
        };
        let report = train_ensemble::<TestBackend>(
            &corpus,
            &split,
            &ModelConfig::new().with_num_classes(2),
            &config,
            dir.path(),
            &Default::default(),
            &|_| {},
        );
        assert!(!report.is_complete());
        assert_eq!(report.failed().count(), 2);
        assert!(matches!(report.folds[0], Err(HtrError::Training { fold: 1, .. })));
    }

    /// 全サンプルが同じ画像なので、どのクラスも見分けられない
    fn blank_corpus(per_class: usize) -> GlyphCorpus {
        let codec = LabelCodec::fit("AB".chars()).unwrap();
        let mut corpus = GlyphCorpus {
            samples: Vec::new(),
            tensors: Vec::new(),
            labels: Vec::new(),
            codec,
        };
        for (class_id, letter) in ['A', 'B'].into_iter().enumerate() {
            for i in 0..per_class {
                corpus.tensors.push(GlyphTensor::from_pixels(vec![0.0; GlyphTensor::LEN]).unwrap());
                corpus.labels.push(class_id);
                corpus
                    .samples
                    .push(crate::types::Sample::new(format!("{}_{}.png", letter, i), letter));
            }
        }
        corpus
    }

    fn two_folds(corpus: &GlyphCorpus) -> DatasetPartition {
        partition(
            &corpus.labels,
            &corpus.codec,
            &PartitionConfig {
                test_fraction: 0.0,
                num_folds: 2,
                seed: 7,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_unlearnable_fold_is_saved_as_degraded() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = blank_corpus(4);
        let split = two_folds(&corpus);
        let config = TrainerConfig {
            num_epochs: 2,
            batch_size: 4,
            ..TrainerConfig::default()
        };

        let report = train_ensemble::<TestBackend>(
            &corpus,
            &split,
            &ModelConfig::new().with_num_classes(2),
            &config,
            dir.path(),
            &Default::default(),
            &|_| {},
        );

        assert!(report.is_complete(), "{:?}", report.folds);
        for fold in report.succeeded() {
            assert_eq!(fold.status, FoldStatus::Degraded);
            assert!((fold.baseline_accuracy - 0.5).abs() < 1e-12);
            assert!(fold.val_accuracy <= fold.baseline_accuracy);

            let (metadata, _) = load_model_with_metadata(&fold.artifact_path).unwrap();
            assert!(metadata.degraded);
        }
    }

    #[test]
    fn test_best_epoch_is_persisted_after_early_stop() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = blank_corpus(4);
        let split = two_folds(&corpus);
        let config = TrainerConfig {
            num_epochs: 10,
            batch_size: 4,
            patience: 2,
            ..TrainerConfig::default()
        };

        // 検証精度は毎エポック同じなので、最初のエポックだけが改善になる
        let epochs = std::sync::Mutex::new(Vec::new());
        let report = train_fold::<TestBackend>(
            "run-best-epoch",
            Arc::new(corpus.tensors.clone()),
            Arc::new(corpus.labels.clone()),
            &corpus.codec,
            &split,
            &split.folds[0],
            &ModelConfig::new().with_num_classes(2),
            &config,
            dir.path(),
            &Default::default(),
            &|p: EpochProgress| epochs.lock().unwrap().push((p.epoch, p.val_accuracy)),
        )
        .unwrap();

        assert_eq!(report.best_epoch, 1);
        assert_eq!(report.epochs_run, 3);

        let (metadata, _) = load_model_with_metadata(&artifact_path(dir.path(), 1)).unwrap();
        assert_eq!(metadata.best_epoch, 1);
        assert_eq!(metadata.epochs_run, 3);
        assert!(metadata.best_epoch < metadata.epochs_run);
        assert_eq!(metadata.run_id, "run-best-epoch");

        let epochs = epochs.lock().unwrap();
        assert_eq!(epochs.len(), 3);
        assert!((metadata.val_accuracy - epochs[0].1).abs() < 1e-12);
    }

    #[test]
    fn test_failed_rerun_removes_previous_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = synthetic_corpus(4, "AB");
        let split = two_folds(&corpus);
        let model_config = ModelConfig::new().with_num_classes(2);
        let device = Default::default();

        let first = train_ensemble::<TestBackend>(
            &corpus,
            &split,
            &model_config,
            &TrainerConfig {
                num_epochs: 1,
                batch_size: 4,
                ..TrainerConfig::default()
            },
            dir.path(),
            &device,
            &|_| {},
        );
        assert!(first.is_complete(), "{:?}", first.folds);
        let run_ids: Vec<String> = (1..=2)
            .map(|fold| load_model_with_metadata(&artifact_path(dir.path(), fold)).unwrap().0.run_id)
            .collect();
        assert!(!run_ids[0].is_empty());
        assert_eq!(run_ids[0], run_ids[1]);

        let second = train_ensemble::<TestBackend>(
            &corpus,
            &split,
            &model_config,
            &TrainerConfig {
                num_epochs: 0,
                ..TrainerConfig::default()
            },
            dir.path(),
            &device,
            &|_| {},
        );
        assert_eq!(second.failed().count(), 2);
        assert!(!artifact_path(dir.path(), 1).exists());
        assert!(!artifact_path(dir.path(), 2).exists());

        let loaded = crate::ml::inference::EnsembleEngine::<TestBackend>::load(
            dir.path(),
            2,
            crate::ml::inference::LoadPolicy::Strict,
            &device,
        );
        assert!(matches!(loaded, Err(HtrError::ModelLoad { .. })));
    }
}
