//! データセットのマニフェスト（CSV）の読み書き
//!
//! マニフェストは `image,label` の2列で、`image` はデータディレクトリからの相対パスです。

use std::collections::BTreeMap;
use std::path::Path;

use csv::{ReaderBuilder, WriterBuilder};
use tracing::{info, warn};

use crate::error::{HtrError, Result};
use crate::types::Sample;

/// 1文字の英大文字ラベルだけを受け付ける
fn parse_uppercase_label(raw: &str) -> Option<char> {
    let mut chars = raw.trim().chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_uppercase() => Some(c),
        _ => None,
    }
}

/// マニフェストを読み込み、英大文字のサンプルのみを返す
///
/// 画像ファイルが存在しない行があればエラーにします（前処理の前に検出するため）。
pub fn load_manifest(data_dir: &Path, manifest_name: &str) -> Result<Vec<Sample>> {
    let manifest_path = data_dir.join(manifest_name);
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_path(&manifest_path)?;

    let headers = reader.headers()?.clone();
    let image_col = headers
        .iter()
        .position(|h| h.trim() == "image")
        .ok_or_else(|| HtrError::Dataset(format!("'image' 列がありません: {}", manifest_path.display())))?;
    let label_col = headers
        .iter()
        .position(|h| h.trim() == "label")
        .ok_or_else(|| HtrError::Dataset(format!("'label' 列がありません: {}", manifest_path.display())))?;

    let mut samples = Vec::new();
    let mut skipped = 0usize;
    let mut missing = Vec::new();

    for result in reader.records() {
        let record = result?;
        let image = record
            .get(image_col)
            .ok_or_else(|| HtrError::Dataset("image 列が欠けた行があります".to_string()))?;
        let label = record
            .get(label_col)
            .ok_or_else(|| HtrError::Dataset("label 列が欠けた行があります".to_string()))?;

        let Some(label_char) = parse_uppercase_label(label) else {
            skipped += 1;
            continue;
        };

        let image_path = data_dir.join(image.trim());
        if !image_path.exists() {
            missing.push(image_path.display().to_string());
            continue;
        }
        samples.push(Sample::new(image_path, label_char));
    }

    if !missing.is_empty() {
        return Err(HtrError::Dataset(format!(
            "画像ファイルが見つかりません ({}件): {}",
            missing.len(),
            missing.join(", ")
        )));
    }
    if samples.is_empty() {
        return Err(HtrError::Dataset(format!(
            "英大文字のサンプルがありません: {}",
            manifest_path.display()
        )));
    }

    info!(
        samples = samples.len(),
        skipped, "マニフェストを読み込みました: {}", manifest_path.display()
    );
    log_class_balance(&samples);

    Ok(samples)
}

/// クラスごとのサンプル数を集計する
pub fn class_histogram(samples: &[Sample]) -> BTreeMap<char, usize> {
    let mut counts = BTreeMap::new();
    for sample in samples {
        *counts.entry(sample.label_char).or_insert(0) += 1;
    }
    counts
}

fn log_class_balance(samples: &[Sample]) {
    let counts = class_histogram(samples);
    let min = counts.values().copied().min().unwrap_or(0);
    let max = counts.values().copied().max().unwrap_or(0);
    for (label, count) in &counts {
        info!("  クラス '{}': {} 枚", label, count);
    }
    if min != max {
        warn!(min, max, "クラス間のサンプル数に偏りがあります");
    }
}

/// ホールドアウトしたテストセットを保存する
///
/// パスはそのまま（絶対パスのまま）書き出します。
pub fn save_samples(path: &Path, samples: &[Sample]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = WriterBuilder::new().from_path(path)?;
    writer.write_record(["image", "label"])?;
    for sample in samples {
        let image = sample.image_path.to_string_lossy().into_owned();
        let label = sample.label_char.to_string();
        writer.write_record([image.as_str(), label.as_str()])?;
    }
    writer.flush()?;
    Ok(())
}

/// `save_samples` で書き出したサンプル一覧を読み込む
pub fn load_samples(path: &Path) -> Result<Vec<Sample>> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;
    let mut samples = Vec::new();
    for result in reader.records() {
        let record = result?;
        let image = record
            .get(0)
            .ok_or_else(|| HtrError::Dataset("image 列が欠けた行があります".to_string()))?;
        let label = record
            .get(1)
            .and_then(parse_uppercase_label)
            .ok_or_else(|| HtrError::Dataset(format!("不正なラベルの行があります: {}", image)))?;
        samples.push(Sample::new(image, label));
    }
    Ok(samples)
}
