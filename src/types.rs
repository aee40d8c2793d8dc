use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// データセットの1サンプル（マニフェストの1行）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub image_path: PathBuf,
    pub label_char: char,
}

impl Sample {
    pub fn new(image_path: impl Into<PathBuf>, label_char: char) -> Self {
        Self {
            image_path: image_path.into(),
            label_char,
        }
    }
}

/// アンサンブル推論の結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResult {
    pub predicted_label: char,
    /// クラスIDごとの平均確率（長さはラベル対応表のクラス数。学習パイプラインでは常に26）
    pub probabilities: Vec<f32>,
    /// 平均に使ったモデル数
    pub source_models: usize,
}

impl PredictionResult {
    /// 確率の高い順に上位k件を (ラベル, 確率) で返す
    ///
    /// 同率の場合はクラスIDの小さい方を先にします。
    pub fn top_k(&self, k: usize, class_labels: &[char]) -> Vec<(char, f32)> {
        let mut indexed: Vec<(usize, f32)> = self.probabilities.iter().copied().enumerate().collect();
        indexed.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        indexed
            .into_iter()
            .take(k)
            .filter_map(|(id, p)| class_labels.get(id).map(|&c| (c, p)))
            .collect()
    }
}

/// フォールド学習の終了状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FoldStatus {
    /// 検証精度がベースラインを上回った
    Completed,
    /// エポック上限まで学習してもベースライン以下だった
    Degraded,
}

/// 1フォールド分の学習結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoldReport {
    /// フォールド番号（1始まり）
    pub fold: usize,
    pub status: FoldStatus,
    pub val_accuracy: f64,
    /// 最良エポック（1始まり）
    pub best_epoch: usize,
    pub epochs_run: usize,
    /// 検証セットの多数派クラス比率
    pub baseline_accuracy: f64,
    pub artifact_path: PathBuf,
}
