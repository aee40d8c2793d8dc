//! モデルメタデータを使用した推論設定
//!
//! 保存されたモデルメタデータを読み込んで推論に必要な情報を取得します。

use anyhow::{Context, Result};
use std::path::Path;

use crate::ml::label_codec::LabelCodec;
use crate::model::model_metadata::ModelMetadata;
use crate::model::model_storage;

/// モデルメタデータから推論用情報を取得
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceConfig {
    /// 学習時のラベル対応表
    pub codec: LabelCodec,

    /// モデル入力解像度
    pub model_input_size: u32,

    /// アンサンブルのフォールド数
    pub num_folds: usize,

    /// 学習実行の識別子
    pub run_id: String,

    /// 推論時は常に0
    pub dropout: f64,
}

impl InferenceConfig {
    /// メタデータからInferenceConfigを作成
    pub fn from_metadata(metadata: &ModelMetadata) -> Self {
        Self {
            codec: metadata.class_labels.clone(),
            model_input_size: metadata.model_input_size,
            num_folds: metadata.num_folds,
            run_id: metadata.run_id.clone(),
            dropout: 0.0,
        }
    }

    /// モデルファイルから推論設定を読み込む
    pub fn load_from_model(model_path: &Path) -> Result<Self> {
        let metadata = model_storage::load_metadata(model_path).context("Failed to load model metadata")?;
        Ok(Self::from_metadata(&metadata))
    }

    /// 別フォールドのメタデータがこの設定と同じ前提で学習されたか検証
    pub fn check_compatible(&self, metadata: &ModelMetadata) -> Result<()> {
        if metadata.class_labels != self.codec {
            anyhow::bail!(
                "ラベル対応表が他のフォールドと一致しません: {:?} (期待: {:?})",
                metadata.class_labels.table(),
                self.codec.table()
            );
        }
        if metadata.model_input_size != self.model_input_size {
            anyhow::bail!(
                "入力サイズが他のフォールドと一致しません: {} (期待: {})",
                metadata.model_input_size,
                self.model_input_size
            );
        }
        if metadata.run_id != self.run_id {
            anyhow::bail!(
                "別の学習実行の成果物です: {} (期待: {})",
                metadata.run_id,
                self.run_id
            );
        }
        if metadata.num_folds != self.num_folds {
            anyhow::bail!(
                "フォールド数が他のフォールドと一致しません: {} (期待: {})",
                metadata.num_folds,
                self.num_folds
            );
        }
        Ok(())
    }

    /// 総クラス数
    pub fn num_total_classes(&self) -> usize {
        self.codec.len()
    }

    /// 設定情報を表示
    pub fn print_info(&self) {
        let labels: String = self.codec.table().iter().collect();
        println!("\n=== 推論設定 ===");
        println!("ラベル: {}", labels);
        println!("総クラス数: {}", self.num_total_classes());
        println!("モデル入力サイズ: {}x{}", self.model_input_size, self.model_input_size);
        println!("フォールド数: {}", self.num_folds);
        println!("学習実行: {}", self.run_id);
        println!("==================");
    }
}
