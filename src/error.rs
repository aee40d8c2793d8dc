//! エラー型の定義
//!
//! 前処理・分割・学習・推論の各段階で発生するエラーを一つの列挙型にまとめます。

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// 推論時に読み込めなかったフォールド成果物
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactFailure {
    /// フォールド番号（1始まり）
    pub fold: usize,
    /// 成果物のパス
    pub path: PathBuf,
    /// 失敗理由
    pub reason: String,
}

impl fmt::Display for ArtifactFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fold {} ({}): {}", self.fold, self.path.display(), self.reason)
    }
}

/// ライブラリ全体のエラー型
#[derive(Error, Debug)]
pub enum HtrError {
    /// 画像が読めない、またはデコードできない
    #[error("画像の読み込みに失敗しました '{source_name}': {message}")]
    ImageLoad { source_name: String, message: String },

    /// コーデックに登録されていないラベル
    #[error("未知のラベルです: '{0}'")]
    UnknownLabel(char),

    /// 範囲外のクラスID
    #[error("クラスID {id} は範囲外です (クラス数: {num_classes})")]
    InvalidClassId { id: usize, num_classes: usize },

    /// K分割に必要なサンプル数が足りないクラスがある
    #[error("クラス '{label}' のサンプル数 {count} は分割数 {required} 未満です")]
    InsufficientSamples {
        label: char,
        count: usize,
        required: usize,
    },

    /// フォールド成果物の欠損・破損
    #[error("モデルの読み込みに失敗しました: {}", format_failures(.failures))]
    ModelLoad { failures: Vec<ArtifactFailure> },

    /// 1フォールドの学習失敗
    #[error("fold {fold} の学習に失敗しました: {message}")]
    Training { fold: usize, message: String },

    #[error("データセットエラー: {0}")]
    Dataset(String),

    #[error("設定エラー: {0}")]
    Config(String),

    #[error("IOエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("シリアライズエラー: {0}")]
    Serialization(String),

    #[error("不正な入力です: {0}")]
    InvalidInput(String),
}

fn format_failures(failures: &[ArtifactFailure]) -> String {
    failures
        .iter()
        .map(ArtifactFailure::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl HtrError {
    pub fn image_load(source_name: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::ImageLoad {
            source_name: source_name.into(),
            message: message.to_string(),
        }
    }

}

impl From<serde_json::Error> for HtrError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<csv::Error> for HtrError {
    fn from(e: csv::Error) -> Self {
        Self::Dataset(format!("CSVエラー: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, HtrError>;
