//! テストセットでの評価
//!
//! 精度、マクロ平均の適合率・再現率・F1、混同行列を計算します。

use std::path::Path;

use burn::tensor::backend::Backend;
use serde::Serialize;
use tracing::info;

use crate::error::{HtrError, Result};
use crate::ml::inference::EnsembleEngine;
use crate::ml::label_codec::LabelCodec;
use crate::ml::preprocess::GlyphTensor;

/// 推論時のバッチサイズ
const EVAL_BATCH_SIZE: usize = 64;

/// クラスごとの指標
#[derive(Debug, Clone, Serialize)]
pub struct ClassMetrics {
    pub label: char,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// 正解がこのクラスであるサンプル数
    pub support: usize,
}

/// 評価結果
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub accuracy: f64,
    pub macro_precision: f64,
    pub macro_recall: f64,
    pub macro_f1: f64,
    /// `confusion_matrix[true_id][pred_id]`
    pub confusion_matrix: Vec<Vec<usize>>,
    pub per_class: Vec<ClassMetrics>,
    pub total_samples: usize,
}

/// 分母が0なら0
fn safe_div(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

impl EvaluationReport {
    /// 正解と予測のクラスIDから指標を計算
    ///
    /// マクロ平均は正解または予測に1度でも現れたクラスの単純平均です。
    pub fn from_predictions(y_true: &[usize], y_pred: &[usize], codec: &LabelCodec) -> Result<Self> {
        if y_true.len() != y_pred.len() {
            return Err(HtrError::InvalidInput(format!(
                "正解と予測の数が一致しません: {} != {}",
                y_true.len(),
                y_pred.len()
            )));
        }
        let num_classes = codec.len();
        let mut matrix = vec![vec![0usize; num_classes]; num_classes];
        for (&t, &p) in y_true.iter().zip(y_pred) {
            for id in [t, p] {
                if id >= num_classes {
                    return Err(HtrError::InvalidClassId { id, num_classes });
                }
            }
            matrix[t][p] += 1;
        }

        let total = y_true.len();
        let correct: usize = (0..num_classes).map(|i| matrix[i][i]).sum();

        let mut per_class = Vec::with_capacity(num_classes);
        let mut present = 0usize;
        let (mut sum_p, mut sum_r, mut sum_f1) = (0.0, 0.0, 0.0);

        for (class_id, &label) in codec.table().iter().enumerate() {
            let tp = matrix[class_id][class_id] as f64;
            let support: usize = matrix[class_id].iter().sum();
            let predicted: usize = matrix.iter().map(|row| row[class_id]).sum();

            let precision = safe_div(tp, predicted as f64);
            let recall = safe_div(tp, support as f64);
            let f1 = safe_div(2.0 * precision * recall, precision + recall);

            if support > 0 || predicted > 0 {
                present += 1;
                sum_p += precision;
                sum_r += recall;
                sum_f1 += f1;
            }
            per_class.push(ClassMetrics {
                label,
                precision,
                recall,
                f1,
                support,
            });
        }

        let present = present as f64;
        Ok(Self {
            accuracy: safe_div(correct as f64, total as f64),
            macro_precision: safe_div(sum_p, present),
            macro_recall: safe_div(sum_r, present),
            macro_f1: safe_div(sum_f1, present),
            confusion_matrix: matrix,
            per_class,
            total_samples: total,
        })
    }

    /// 混同行列をCSVに書き出す（行: 正解, 列: 予測）
    pub fn write_confusion_csv(&self, path: &Path, codec: &LabelCodec) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path)?;

        let mut header = vec!["true\\pred".to_string()];
        header.extend(codec.table().iter().map(|c| c.to_string()));
        writer.write_record(&header)?;

        for (label, row) in codec.table().iter().zip(&self.confusion_matrix) {
            let mut record = vec![label.to_string()];
            record.extend(row.iter().map(|count| count.to_string()));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// 分類レポートを表示
    pub fn print_report(&self) {
        println!("\n=== 評価結果 ({} サンプル) ===", self.total_samples);
        println!("{:>6} {:>9} {:>9} {:>9} {:>8}", "label", "precision", "recall", "f1", "support");
        for m in &self.per_class {
            println!(
                "{:>6} {:>9.4} {:>9.4} {:>9.4} {:>8}",
                m.label, m.precision, m.recall, m.f1, m.support
            );
        }
        println!("\naccuracy:        {:.4}", self.accuracy);
        println!("macro precision: {:.4}", self.macro_precision);
        println!("macro recall:    {:.4}", self.macro_recall);
        println!("macro f1:        {:.4}", self.macro_f1);
        println!("========================");
    }
}

/// アンサンブルでテストセットを推論して評価する
pub fn evaluate<B: Backend>(
    engine: &EnsembleEngine<B>,
    tensors: &[GlyphTensor],
    labels: &[usize],
) -> Result<EvaluationReport> {
    if tensors.len() != labels.len() {
        return Err(HtrError::InvalidInput(format!(
            "テンソルとラベルの数が一致しません: {} != {}",
            tensors.len(),
            labels.len()
        )));
    }

    let codec = engine.codec();
    let mut y_pred = Vec::with_capacity(tensors.len());
    for chunk in tensors.chunks(EVAL_BATCH_SIZE) {
        for result in engine.predict_batch(chunk)? {
            y_pred.push(codec.encode(result.predicted_label)?);
        }
    }

    let report = EvaluationReport::from_predictions(labels, &y_pred, codec)?;
    info!(
        samples = report.total_samples,
        accuracy = report.accuracy,
        macro_f1 = report.macro_f1,
        "評価が完了しました"
    );
    Ok(report)
}
