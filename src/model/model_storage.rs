//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（フォールド番号、ラベル対応表など）
//! - model.bin       - モデルの重み（バイナリ）
//!
//! 保存は `<name>.partial` に書き切ってから rename するので、途中で落ちても
//! 壊れた成果物が正式なファイル名で残ることはありません。

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};

use crate::model::model_metadata::ModelMetadata;

/// フォールド番号（1始まり）に対応する成果物のパス
pub fn artifact_path(model_dir: &Path, fold: usize) -> PathBuf {
    model_dir.join(format!("model_fold_{}.tar.gz", fold))
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, bytes)
        .with_context(|| format!("Failed to add {} to tar", name))
}

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 1つのtar.gzファイルに以下を含む：
/// - metadata.json : メタデータ
/// - model.bin : モデルの重み
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<()> {
    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create parent directory: {:?}", parent))?;
    }

    let mut partial_name = output_path.as_os_str().to_owned();
    partial_name.push(".partial");
    let partial_path = PathBuf::from(partial_name);

    let file = File::create(&partial_path)
        .with_context(|| format!("Failed to create tar.gz file: {:?}", partial_path))?;

    let encoder = GzEncoder::new(file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let json_str = metadata.to_json_string()?;
    append_entry(&mut tar_builder, "metadata.json", json_str.as_bytes())?;
    append_entry(&mut tar_builder, "model.bin", model_binary)?;

    // tar と gzip の終端を書き切ってからディスクに同期
    let encoder = tar_builder
        .into_inner()
        .context("Failed to finalize tar archive")?;
    let file = encoder.finish().context("Failed to finalize gzip stream")?;
    file.sync_all().context("Failed to sync model file")?;
    drop(file);

    std::fs::rename(&partial_path, output_path)
        .with_context(|| format!("Failed to move {:?} to {:?}", partial_path, output_path))?;

    Ok(())
}

/// Tar.gzからメタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    let tar_gz_file = File::open(tar_gz_path)
        .with_context(|| format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;

    let decoder = GzDecoder::new(tar_gz_file);
    let mut archive = Archive::new(decoder);

    let mut metadata_opt: Option<ModelMetadata> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;

    for entry in archive.entries().context("Failed to read tar.gz archive")? {
        let mut entry = entry.context("Corrupt tar.gz entry")?;
        let path = entry.path()?.to_path_buf();

        match path.to_str() {
            Some("metadata.json") => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                metadata_opt = Some(ModelMetadata::from_json_string(&json_str)?);
            }
            Some("model.bin") => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                model_binary_opt = Some(buffer);
            }
            _ => {}
        }
    }

    match (metadata_opt, model_binary_opt) {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(anyhow::anyhow!("metadata.json not found in tar.gz archive")),
        (_, None) => Err(anyhow::anyhow!("model.bin not found in tar.gz archive")),
    }
}

/// Tar.gzからモデルメタデータのみ読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let tar_gz_file = File::open(tar_gz_path)
        .with_context(|| format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;

    let decoder = GzDecoder::new(tar_gz_file);
    let mut archive = Archive::new(decoder);

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_str() == Some("metadata.json") {
            let mut json_str = String::new();
            entry.read_to_string(&mut json_str)?;
            return ModelMetadata::from_json_string(&json_str);
        }
    }

    Err(anyhow::anyhow!("metadata.json not found in tar.gz archive"))
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &ModelMetadata) {
    let labels: String = metadata.class_labels.table().iter().collect();
    println!("\n=== モデルメタデータ (fold {}/{}) ===", metadata.fold, metadata.num_folds);
    println!("ラベル対応表: {}", labels);
    println!("モデル入力サイズ: {}x{}", metadata.model_input_size, metadata.model_input_size);
    println!(
        "検証精度: {:.4} (ベースライン {:.4}){}",
        metadata.val_accuracy,
        metadata.baseline_accuracy,
        if metadata.degraded { " [degraded]" } else { "" }
    );
    println!(
        "最良エポック: {} / 実施 {} / 上限 {}",
        metadata.best_epoch, metadata.epochs_run, metadata.num_epochs
    );
    println!("学習率: {}", metadata.learning_rate);
    println!("学習実行: {}", metadata.run_id);
    println!("学習日時: {}", metadata.trained_at);
    println!("========================");
}
