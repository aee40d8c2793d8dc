//! 画像の前処理
//!
//! どの入力画像も「輝度1チャネル・32x32・[0, 1] の f32」に変換します。
//! 学習時と推論時で同じ `RESIZE_FILTER` を使うこと（フィルタが違うと精度が静かに落ちます）。

use std::path::Path;

use image::{imageops::FilterType, DynamicImage};
use rayon::prelude::*;
use tracing::info;

use crate::error::{HtrError, Result};
use crate::ml::label_codec::LabelCodec;
use crate::ml::ml_model::IMAGE_SIZE;
use crate::types::Sample;

/// リサイズフィルタ（学習・推論共通）
pub const RESIZE_FILTER: FilterType = FilterType::Lanczos3;

/// 前処理済みの 32x32x1 テンソル（行優先で平坦化）
#[derive(Debug, Clone, PartialEq)]
pub struct GlyphTensor(Vec<f32>);

impl GlyphTensor {
    /// 要素数
    pub const LEN: usize = IMAGE_SIZE * IMAGE_SIZE;

    /// 平坦化済みの画素から作成（長さと値域を検証）
    pub fn from_pixels(pixels: Vec<f32>) -> Result<Self> {
        if pixels.len() != Self::LEN {
            return Err(HtrError::InvalidInput(format!(
                "画素数が不正です: {} (期待: {})",
                pixels.len(),
                Self::LEN
            )));
        }
        if pixels.iter().any(|v| !(0.0..=1.0).contains(v)) {
            return Err(HtrError::InvalidInput("画素値が [0, 1] の範囲外です".to_string()));
        }
        Ok(Self(pixels))
    }

    /// (高さ, 幅, チャネル)
    pub fn shape(&self) -> [usize; 3] {
        [IMAGE_SIZE, IMAGE_SIZE, 1]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

/// デコード済み画像を正規化テンソルに変換
pub fn preprocess_image(img: &DynamicImage) -> GlyphTensor {
    let gray = img.to_luma8();
    let size = IMAGE_SIZE as u32;
    let resized = image::imageops::resize(&gray, size, size, RESIZE_FILTER);
    let pixels = resized.as_raw().iter().map(|&p| p as f32 / 255.0).collect();
    GlyphTensor(pixels)
}

/// 画像ファイルを読み込んで前処理
pub fn preprocess_path(path: &Path) -> Result<GlyphTensor> {
    let img = image::open(path).map_err(|e| HtrError::image_load(path.display().to_string(), e))?;
    Ok(preprocess_image(&img))
}

/// エンコード済みバイト列（PNG等）を前処理
///
/// `source_name` はエラーメッセージ用の識別子です。
pub fn preprocess_bytes(bytes: &[u8], source_name: &str) -> Result<GlyphTensor> {
    let img = image::load_from_memory(bytes).map_err(|e| HtrError::image_load(source_name, e))?;
    Ok(preprocess_image(&img))
}

/// 前処理済みのコーパス
#[derive(Debug, Clone)]
pub struct GlyphCorpus {
    pub samples: Vec<Sample>,
    pub tensors: Vec<GlyphTensor>,
    /// コーデックでエンコードしたクラスID
    pub labels: Vec<usize>,
    pub codec: LabelCodec,
}

impl GlyphCorpus {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// 全サンプルを並列に前処理する
///
/// 1枚でも失敗したらコーパス全体をエラーにします。
pub fn build_corpus(samples: Vec<Sample>, codec: &LabelCodec) -> Result<GlyphCorpus> {
    let labels = samples
        .iter()
        .map(|s| codec.encode(s.label_char))
        .collect::<Result<Vec<_>>>()?;

    let tensors = samples
        .par_iter()
        .map(|s| preprocess_path(&s.image_path))
        .collect::<Result<Vec<_>>>()?;

    info!(samples = tensors.len(), classes = codec.len(), "前処理が完了しました");

    Ok(GlyphCorpus {
        samples,
        tensors,
        labels,
        codec: codec.clone(),
    })
}
