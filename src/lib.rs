//! 手書き英大文字の認識パイプライン
//!
//! 32x32 のグレースケール画像を K 分割交差検証で学習した CNN のアンサンブルで分類します。

pub mod error;
pub mod types;
pub mod csv_loader;
pub mod logging;
pub mod ml;
pub mod model;
pub mod ml_commands;

pub use error::{ArtifactFailure, HtrError, Result};
pub use types::{FoldReport, FoldStatus, PredictionResult, Sample};
pub use ml::{EnsembleEngine, EvaluationReport, LabelCodec, LoadPolicy};
pub use model::AppConfig;
