//! アンサンブル推論
//!
//! K 個のフォールドモデルを読み込み、各モデルのクラス確率を平均（ソフト投票）して予測します。

use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::Backend, Tensor},
};
use tracing::{info, warn};

use crate::error::{ArtifactFailure, HtrError, Result};
use crate::ml::label_codec::LabelCodec;
use crate::ml::ml_model::{CharClassifier, ModelConfig, IMAGE_SIZE};
use crate::ml::preprocess::{preprocess_bytes, preprocess_path, GlyphTensor};
use crate::model::{artifact_path, load_model_with_metadata, InferenceConfig, ModelMetadata};
use crate::types::PredictionResult;

/// フォールドが欠けている場合の扱い
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadPolicy {
    /// K 個すべて揃っていなければエラー
    #[default]
    Strict,
    /// `min_models` 個以上読めれば、欠けたフォールドを警告した上で続行
    AllowDegraded { min_models: usize },
}

/// アンサンブル推論エンジン
pub struct EnsembleEngine<B: Backend> {
    models: Vec<CharClassifier<B>>,
    config: InferenceConfig,
    device: B::Device,
}

/// 1フォールド分を読み込む
fn load_member<B: Backend>(
    path: &Path,
    fold: usize,
    num_folds: usize,
    device: &B::Device,
) -> anyhow::Result<(ModelMetadata, CharClassifier<B>)> {
    if !path.exists() {
        anyhow::bail!("成果物が見つかりません");
    }
    let (metadata, model_binary) = load_model_with_metadata(path)?;
    if metadata.fold != fold {
        anyhow::bail!("メタデータのフォールド番号が一致しません: {}", metadata.fold);
    }
    if metadata.num_folds != num_folds {
        anyhow::bail!(
            "{} 分割で学習された成果物です（要求されたフォールド数: {}）",
            metadata.num_folds,
            num_folds
        );
    }
    // 推論時はドロップアウトなし
    let model = ModelConfig::new()
        .with_num_classes(metadata.class_labels.len())
        .with_dropout(0.0)
        .init::<B>(device);

    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let record = recorder
        .load(model_binary, device)
        .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;

    Ok((metadata, model.load_record(record)))
}

impl<B: Backend> EnsembleEngine<B> {
    /// `model_dir` から `model_fold_1..=num_folds` を読み込む
    ///
    /// 失敗したフォールドはすべて集めてから1つの `ModelLoad` エラーとして返します。
    /// 成果物に記録されたフォールド数や学習実行が揃わないものも失敗として扱います。
    pub fn load(model_dir: &Path, num_folds: usize, policy: LoadPolicy, device: &B::Device) -> Result<Self> {
        if num_folds == 0 {
            return Err(HtrError::Config("num_folds は1以上である必要があります".to_string()));
        }

        let mut models = Vec::with_capacity(num_folds);
        let mut config: Option<InferenceConfig> = None;
        let mut failures = Vec::new();

        for fold in 1..=num_folds {
            let path = artifact_path(model_dir, fold);
            let loaded = load_member::<B>(&path, fold, num_folds, device).and_then(|(metadata, model)| {
                if let Some(reference) = &config {
                    reference.check_compatible(&metadata)?;
                }
                Ok((metadata, model))
            });

            match loaded {
                Ok((metadata, model)) => {
                    if config.is_none() {
                        config = Some(InferenceConfig::from_metadata(&metadata));
                    }
                    models.push(model);
                }
                Err(e) => failures.push(ArtifactFailure {
                    fold,
                    path,
                    reason: format!("{:#}", e),
                }),
            }
        }

        let config = match config {
            Some(config) if failures.is_empty() => config,
            Some(config) => match policy {
                LoadPolicy::AllowDegraded { min_models } if models.len() >= min_models.max(1) => {
                    for failure in &failures {
                        warn!(fold = failure.fold, "フォールドを除外して推論します: {}", failure.reason);
                    }
                    warn!(
                        loaded = models.len(),
                        expected = num_folds,
                        "縮退したアンサンブルで推論します"
                    );
                    config
                }
                _ => return Err(HtrError::ModelLoad { failures }),
            },
            None => return Err(HtrError::ModelLoad { failures }),
        };

        info!(models = models.len(), dir = %model_dir.display(), "アンサンブルを読み込みました");

        Ok(Self {
            models,
            config,
            device: device.clone(),
        })
    }

    /// 読み込み済みのモデルから直接構築
    pub fn from_models(models: Vec<CharClassifier<B>>, codec: LabelCodec, device: B::Device) -> Result<Self> {
        if models.is_empty() {
            return Err(HtrError::InvalidInput("アンサンブルにモデルがありません".to_string()));
        }
        let num_folds = models.len();
        Ok(Self {
            models,
            config: InferenceConfig {
                codec,
                model_input_size: IMAGE_SIZE as u32,
                num_folds,
                run_id: "in-memory".to_string(),
                dropout: 0.0,
            },
            device,
        })
    }

    pub fn num_models(&self) -> usize {
        self.models.len()
    }

    pub fn codec(&self) -> &LabelCodec {
        &self.config.codec
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    /// 単一グリフを分類
    pub fn predict(&self, glyph: &GlyphTensor) -> Result<PredictionResult> {
        let mut results = self.predict_batch(std::slice::from_ref(glyph))?;
        results
            .pop()
            .ok_or_else(|| HtrError::InvalidInput("推論結果が空です".to_string()))
    }

    /// 複数グリフをまとめて分類（入力順を保持）
    pub fn predict_batch(&self, glyphs: &[GlyphTensor]) -> Result<Vec<PredictionResult>> {
        if glyphs.is_empty() {
            return Ok(Vec::new());
        }
        let batch_size = glyphs.len();
        let num_classes = self.config.num_total_classes();

        let mut all_pixels = Vec::with_capacity(batch_size * GlyphTensor::LEN);
        for glyph in glyphs {
            all_pixels.extend_from_slice(glyph.as_slice());
        }
        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, 1, IMAGE_SIZE, IMAGE_SIZE]);

        // 各モデルの確率を合計してから割る
        let mut summed = vec![0.0f64; batch_size * num_classes];
        for model in &self.models {
            let probabilities = model
                .forward_probabilities(images.clone())
                .into_data()
                .convert::<f32>()
                .to_vec::<f32>()
                .map_err(|e| HtrError::InvalidInput(format!("推論結果の取得エラー: {:?}", e)))?;
            if probabilities.len() != summed.len() {
                return Err(HtrError::InvalidInput(format!(
                    "モデル出力の大きさが不正です: {} (期待: {})",
                    probabilities.len(),
                    summed.len()
                )));
            }
            for (acc, p) in summed.iter_mut().zip(probabilities) {
                *acc += p as f64;
            }
        }

        let num_models = self.models.len() as f64;
        summed
            .chunks(num_classes)
            .map(|row| {
                let probabilities: Vec<f32> = row.iter().map(|s| (s / num_models) as f32).collect();
                let predicted = argmax_lowest(&probabilities);
                Ok(PredictionResult {
                    predicted_label: self.config.codec.decode(predicted)?,
                    probabilities,
                    source_models: self.models.len(),
                })
            })
            .collect()
    }

    /// 画像ファイルを前処理して分類
    pub fn predict_paths<P: AsRef<Path>>(&self, paths: &[P]) -> Result<Vec<PredictionResult>> {
        let glyphs = paths
            .iter()
            .map(|p| preprocess_path(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        self.predict_batch(&glyphs)
    }

    /// base64 エンコードされた画像を分類
    pub fn predict_encoded(&self, payloads: &[String]) -> Result<Vec<PredictionResult>> {
        let glyphs = payloads
            .iter()
            .enumerate()
            .map(|(i, payload)| {
                let name = format!("payload[{}]", i);
                let bytes = decode_base64_image(payload).map_err(|e| HtrError::image_load(&name, e))?;
                preprocess_bytes(&bytes, &name)
            })
            .collect::<Result<Vec<_>>>()?;
        self.predict_batch(&glyphs)
    }
}

/// 最大値のインデックス（同値なら小さい方）
pub fn argmax_lowest(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

/// `data:image/png;base64,` のような接頭辞を外してデコード
pub fn decode_base64_image(payload: &str) -> std::result::Result<Vec<u8>, String> {
    let encoded = match payload.split_once(',') {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => payload,
    };
    STANDARD
        .decode(encoded.trim())
        .map_err(|e| format!("base64 のデコードに失敗しました: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::save_model_with_metadata;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray;

    fn glyph(value: f32) -> GlyphTensor {
        GlyphTensor::from_pixels(vec![value; GlyphTensor::LEN]).unwrap()
    }

    fn save_fold(dir: &Path, fold: usize, num_folds: usize, model: &CharClassifier<TestBackend>) {
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let binary = recorder.record(model.clone().into_record(), ()).unwrap();
        let metadata = ModelMetadata {
            fold,
            num_folds,
            ..crate::model::model_metadata::sample_metadata(fold)
        };
        save_model_with_metadata(&artifact_path(dir, fold), &metadata, &binary).unwrap();
    }

    #[test]
    fn test_argmax_ties_pick_lowest_id() {
        assert_eq!(argmax_lowest(&[0.25, 0.5, 0.5, 0.1]), 1);
        assert_eq!(argmax_lowest(&[0.5, 0.5]), 0);
        assert_eq!(argmax_lowest(&[0.1, 0.2, 0.7]), 2);
    }

    #[test]
    fn test_averaged_probabilities_are_normalized() {
        let device = NdArrayDevice::Cpu;
        let models = (0..3)
            .map(|_| ModelConfig::new().init::<TestBackend>(&device))
            .collect();
        let engine = EnsembleEngine::from_models(models, LabelCodec::uppercase_alphabet(), device).unwrap();

        let results = engine.predict_batch(&[glyph(0.0), glyph(0.4), glyph(1.0)]).unwrap();
        assert_eq!(results.len(), 3);
        for result in results {
            assert_eq!(result.probabilities.len(), 26);
            assert_eq!(result.source_models, 3);
            let sum: f32 = result.probabilities.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5, "sum = {}", sum);
            assert!(result.probabilities.iter().all(|p| *p >= 0.0));
        }
    }

    #[test]
    fn test_identical_members_match_single_model() {
        let device = NdArrayDevice::Cpu;
        let model = ModelConfig::new().init::<TestBackend>(&device);
        let single =
            EnsembleEngine::from_models(vec![model.clone()], LabelCodec::uppercase_alphabet(), device.clone()).unwrap();
        let ensemble = EnsembleEngine::from_models(
            vec![model.clone(), model.clone(), model],
            LabelCodec::uppercase_alphabet(),
            device.clone(),
        )
        .unwrap();

        let inputs = [glyph(0.0), glyph(0.3), glyph(0.9)];
        let a = single.predict_batch(&inputs).unwrap();
        let b = ensemble.predict_batch(&inputs).unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.predicted_label, y.predicted_label);
        }
    }

    #[test]
    fn test_batch_preserves_order() {
        let device = NdArrayDevice::Cpu;
        let engine = EnsembleEngine::from_models(
            vec![ModelConfig::new().init::<TestBackend>(&device)],
            LabelCodec::uppercase_alphabet(),
            device,
        )
        .unwrap();
        let inputs = [glyph(0.1), glyph(0.8)];
        let batch = engine.predict_batch(&inputs).unwrap();
        for (input, expected) in inputs.iter().zip(&batch) {
            let single = engine.predict(input).unwrap();
            for (p, q) in single.probabilities.iter().zip(&expected.probabilities) {
                assert!((p - q).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_load_reports_every_missing_fold() {
        let dir = tempfile::tempdir().unwrap();
        let device = NdArrayDevice::Cpu;
        let model = ModelConfig::new().init::<TestBackend>(&device);
        save_fold(dir.path(), 2, 3, &model);

        let err = EnsembleEngine::<TestBackend>::load(dir.path(), 3, LoadPolicy::Strict, &device)
            .err()
            .unwrap();
        match err {
            HtrError::ModelLoad { failures } => {
                let folds: Vec<usize> = failures.iter().map(|f| f.fold).collect();
                assert_eq!(folds, vec![1, 3]);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_corrupt_artifact_is_named() {
        let dir = tempfile::tempdir().unwrap();
        let device = NdArrayDevice::Cpu;
        let model = ModelConfig::new().init::<TestBackend>(&device);
        save_fold(dir.path(), 1, 2, &model);
        std::fs::write(artifact_path(dir.path(), 2), b"garbage").unwrap();

        let err = EnsembleEngine::<TestBackend>::load(dir.path(), 2, LoadPolicy::Strict, &device)
            .err()
            .unwrap();
        assert!(err.to_string().contains("model_fold_2.tar.gz"), "{}", err);
    }

    #[test]
    fn test_fold_count_must_match_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let device = NdArrayDevice::Cpu;
        let model = ModelConfig::new().init::<TestBackend>(&device);
        for fold in 1..=5 {
            save_fold(dir.path(), fold, 5, &model);
        }

        let err = EnsembleEngine::<TestBackend>::load(dir.path(), 3, LoadPolicy::Strict, &device)
            .err()
            .unwrap();
        match err {
            HtrError::ModelLoad { failures } => assert_eq!(failures.len(), 3),
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(
            EnsembleEngine::<TestBackend>::load(dir.path(), 5, LoadPolicy::Strict, &device)
                .unwrap()
                .num_models(),
            5
        );
    }

    #[test]
    fn test_mixed_training_runs_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let device = NdArrayDevice::Cpu;
        let model = ModelConfig::new().init::<TestBackend>(&device);
        save_fold(dir.path(), 1, 2, &model);
        save_fold(dir.path(), 2, 2, &model);

        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let binary = recorder.record(model.into_record(), ()).unwrap();
        let stale = ModelMetadata {
            num_folds: 2,
            run_id: "run-older".to_string(),
            ..crate::model::model_metadata::sample_metadata(2)
        };
        save_model_with_metadata(&artifact_path(dir.path(), 2), &stale, &binary).unwrap();

        let err = EnsembleEngine::<TestBackend>::load(dir.path(), 2, LoadPolicy::Strict, &device)
            .err()
            .unwrap();
        match err {
            HtrError::ModelLoad { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].fold, 2);
                assert!(failures[0].reason.contains("run-older"), "{}", failures[0].reason);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_load_full_and_degraded_ensembles() {
        let dir = tempfile::tempdir().unwrap();
        let device = NdArrayDevice::Cpu;
        let model = ModelConfig::new().init::<TestBackend>(&device);
        save_fold(dir.path(), 1, 3, &model);
        save_fold(dir.path(), 2, 3, &model);

        let degraded = EnsembleEngine::<TestBackend>::load(
            dir.path(),
            3,
            LoadPolicy::AllowDegraded { min_models: 2 },
            &device,
        )
        .unwrap();
        assert_eq!(degraded.num_models(), 2);
        assert_eq!(degraded.predict(&glyph(0.5)).unwrap().source_models, 2);

        assert!(EnsembleEngine::<TestBackend>::load(
            dir.path(),
            3,
            LoadPolicy::AllowDegraded { min_models: 3 },
            &device,
        )
        .is_err());

        save_fold(dir.path(), 3, 3, &model);
        let full = EnsembleEngine::<TestBackend>::load(dir.path(), 3, LoadPolicy::Strict, &device).unwrap();
        assert_eq!(full.num_models(), 3);
        assert_eq!(full.codec().len(), 26);
    }

    #[test]
    fn test_decode_base64_with_data_url_prefix() {
        let encoded = STANDARD.encode(b"png-bytes");
        assert_eq!(decode_base64_image(&encoded).unwrap(), b"png-bytes".to_vec());
        assert_eq!(
            decode_base64_image(&format!("data:image/png;base64,{}", encoded)).unwrap(),
            b"png-bytes".to_vec()
        );
        assert!(decode_base64_image("***").is_err());
    }

    #[test]
    fn test_predict_encoded_rejects_non_image() {
        let device = NdArrayDevice::Cpu;
        let engine = EnsembleEngine::from_models(
            vec![ModelConfig::new().init::<TestBackend>(&device)],
            LabelCodec::uppercase_alphabet(),
            device,
        )
        .unwrap();
        let err = engine.predict_encoded(&[STANDARD.encode(b"not an image")]).unwrap_err();
        assert!(matches!(err, HtrError::ImageLoad { .. }));
    }
}
