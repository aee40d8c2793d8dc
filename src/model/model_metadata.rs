//! モデルメタデータの定義と永続化
//!
//! tar.gz形式でモデルと関連するメタデータを保存・読み込みします。
//!
//! ## ラベル対応表について
//! - `class_labels` は学習時に使ったラベルコーデックの表（ID順の文字）
//! - 推論時はこの表からコーデックを復元し、データセットから再フィットしない

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ml::label_codec::LabelCodec;

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// フォールド番号（1始まり）
    pub fold: usize,

    /// アンサンブル全体のフォールド数
    pub num_folds: usize,

    /// 学習実行の識別子（同じ `train_ensemble` 呼び出しのフォールドは同じ値）
    #[serde(default)]
    pub run_id: String,

    /// ラベル対応表（ID順）
    /// 例: ["A", "B", ..., "Z"]
    pub class_labels: LabelCodec,

    /// モデル入力サイズ（通常32x32）
    pub model_input_size: u32,

    /// ドロップアウト率（推論時は無効）
    pub dropout: f64,

    /// 最良エポックでの検証精度
    pub val_accuracy: f64,

    /// 検証セットの多数派クラス比率
    #[serde(default)]
    pub baseline_accuracy: f64,

    /// 検証精度がベースライン以下だった場合 true
    #[serde(default)]
    pub degraded: bool,

    /// 最良エポック（1始まり）
    pub best_epoch: u32,

    /// 実際に回したエポック数
    pub epochs_run: u32,

    /// エポック上限
    pub num_epochs: u32,

    /// 学習率
    pub learning_rate: f64,

    /// 分割に使ったシード
    pub seed: u64,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }

    /// 新しい学習実行の識別子を作る
    pub fn new_run_id() -> String {
        format!(
            "{}-{:08x}",
            chrono::Local::now().format("%Y%m%dT%H%M%S%.3f"),
            rand::random::<u32>()
        )
    }

    /// 現在時刻を学習時刻として記録
    pub fn stamp_now(mut self) -> Self {
        self.trained_at = chrono::Local::now().to_rfc3339();
        self
    }
}

#[cfg(test)]
pub(crate) fn sample_metadata(fold: usize) -> ModelMetadata {
    ModelMetadata {
        fold,
        num_folds: 5,
        run_id: "run-test".to_string(),
        class_labels: LabelCodec::uppercase_alphabet(),
        model_input_size: 32,
        dropout: 0.2,
        val_accuracy: 0.91,
        baseline_accuracy: 0.04,
        degraded: false,
        best_epoch: 7,
        epochs_run: 10,
        num_epochs: 30,
        learning_rate: 0.002,
        seed: 42,
        trained_at: String::new(),
    }
    .stamp_now()
}
