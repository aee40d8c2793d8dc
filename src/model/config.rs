//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、データセット、学習・推論の設定をJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::ml::inference::LoadPolicy;
use crate::ml::ml_model::ModelConfig;
use crate::ml::partition::PartitionConfig;
use crate::ml::training::TrainerConfig;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// データセット設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSettings {
    /// データセットのルートディレクトリ
    pub data_dir: String,
    /// マニフェストCSVのファイル名（`image,label` 列）
    pub manifest: String,
}

impl Default for DatasetSettings {
    fn default() -> Self {
        Self {
            data_dir: "data/handwritten".to_string(),
            manifest: "english.csv".to_string(),
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// フォールド成果物の保存先
    pub model_dir: String,
    /// フォールド数（= アンサンブルのモデル数）
    pub num_folds: usize,
    /// ドロップアウト率
    pub dropout: f64,
    /// 畳み込みカーネルのL2正則化係数
    pub l2_penalty: f64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_dir: "models".to_string(),
            num_folds: 5,
            dropout: 0.2,
            l2_penalty: 0.001,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// エポック数の上限
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 学習率
    pub learning_rate: f64,
    /// AdamW の重み減衰
    pub weight_decay: f32,
    /// 早期終了の猶予エポック数
    pub patience: usize,
    /// ランダムシード
    pub seed: u64,
    /// テストセットの割合
    pub test_fraction: f64,
    /// 同時に学習するフォールド数
    pub max_parallel_folds: usize,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 30,
            batch_size: 32,
            learning_rate: 0.002,
            weight_decay: 0.004,
            patience: 3,
            seed: 42,
            test_fraction: 0.1,
            max_parallel_folds: 1,
        }
    }
}

/// 推論設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InferenceSettings {
    /// 欠けたフォールドがあっても推論を続けるか
    #[serde(default)]
    pub allow_degraded_ensemble: bool,
    /// 縮退時に最低限必要なモデル数
    #[serde(default)]
    pub min_models: Option<usize>,
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// データセット設定
    #[serde(default)]
    pub dataset: DatasetSettings,
    /// モデル設定
    pub model: ModelSettings,
    /// トレーニング設定
    pub training: TrainingSettings,
    /// 推論設定
    #[serde(default)]
    pub inference: InferenceSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 設定を読み込む、存在しない場合や壊れている場合はデフォルト設定を返す
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.dataset.data_dir)
    }

    pub fn model_dir(&self) -> PathBuf {
        PathBuf::from(&self.model.model_dir)
    }

    /// ホールドアウトしたテストセットの保存先
    pub fn test_set_path(&self) -> PathBuf {
        self.model_dir().join("test_set.csv")
    }

    pub fn partition_config(&self) -> PartitionConfig {
        PartitionConfig {
            test_fraction: self.training.test_fraction,
            num_folds: self.model.num_folds,
            seed: self.training.seed,
        }
    }

    pub fn model_config(&self, num_classes: usize) -> ModelConfig {
        ModelConfig::new()
            .with_num_classes(num_classes)
            .with_dropout(self.model.dropout)
            .with_l2_penalty(self.model.l2_penalty)
    }

    pub fn trainer_config(&self) -> TrainerConfig {
        TrainerConfig {
            num_epochs: self.training.num_epochs,
            batch_size: self.training.batch_size,
            learning_rate: self.training.learning_rate,
            weight_decay: self.training.weight_decay,
            patience: self.training.patience,
            seed: self.training.seed,
            max_parallel_folds: self.training.max_parallel_folds,
        }
    }

    pub fn load_policy(&self) -> LoadPolicy {
        if self.inference.allow_degraded_ensemble {
            LoadPolicy::AllowDegraded {
                min_models: self.inference.min_models.unwrap_or(1),
            }
        } else {
            LoadPolicy::Strict
        }
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== アプリケーション設定 ===");
        println!("計算デバイス: {}", self.device_type);
        println!("データセット: {} ({})", self.dataset.data_dir, self.dataset.manifest);
        println!("モデル保存先: {}", self.model.model_dir);
        println!("フォールド数: {}", self.model.num_folds);
        println!("ドロップアウト率: {}", self.model.dropout);
        println!("\n--- トレーニング設定 ---");
        println!("エポック数: {}", self.training.num_epochs);
        println!("バッチサイズ: {}", self.training.batch_size);
        println!("学習率: {}", self.training.learning_rate);
        println!("早期終了の猶予: {}", self.training.patience);
        println!("シード: {}", self.training.seed);
        println!("========================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.device_type, DeviceType::Wgpu);
        assert_eq!(config.model.num_folds, 5);
        assert_eq!(config.training.num_epochs, 30);
        assert_eq!(config.training.patience, 3);
        assert_eq!(config.load_policy(), LoadPolicy::Strict);
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: AppConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.device_type, deserialized.device_type);
        assert_eq!(config.model.num_folds, deserialized.model.num_folds);
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let json = r#"{
            "device_type": "Cpu",
            "model": {"model_dir": "m", "num_folds": 3, "dropout": 0.2, "l2_penalty": 0.001},
            "training": {"num_epochs": 2, "batch_size": 8, "learning_rate": 0.002, "weight_decay": 0.004,
                         "patience": 3, "seed": 1, "test_fraction": 0.1, "max_parallel_folds": 1}
        }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.dataset.manifest, "english.csv");
        assert!(!config.inference.allow_degraded_ensemble);
        assert_eq!(config.partition_config().num_folds, 3);
    }

    #[test]
    fn test_degraded_policy() {
        let mut config = AppConfig::default();
        config.inference.allow_degraded_ensemble = true;
        config.inference.min_models = Some(3);
        assert_eq!(config.load_policy(), LoadPolicy::AllowDegraded { min_models: 3 });
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }

    #[test]
    fn test_load_or_default_with_broken_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        let config = AppConfig::load_or_default(&path);
        assert_eq!(config.model.num_folds, 5);
    }
}
