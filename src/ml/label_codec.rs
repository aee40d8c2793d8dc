//! ラベル（英大文字）とクラスIDの相互変換

use serde::{Deserialize, Serialize};

use crate::error::{HtrError, Result};

/// 文字 ↔ クラスID の全単射
///
/// IDは文字のソート順に 0 から連番で振られます。推論時に再フィットせず、
/// 学習時の `table()` をモデル成果物に保存して `from_table` で復元してください。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<char>", into = "Vec<char>")]
pub struct LabelCodec {
    letters: Vec<char>,
}

impl LabelCodec {
    /// 観測されたラベル集合からコーデックを作成
    pub fn fit(labels: impl IntoIterator<Item = char>) -> Result<Self> {
        let mut letters: Vec<char> = labels.into_iter().collect();
        letters.sort_unstable();
        letters.dedup();
        if letters.is_empty() {
            return Err(HtrError::InvalidInput("ラベルが1つもありません".to_string()));
        }
        Ok(Self { letters })
    }

    /// A〜Z の26文字
    pub fn uppercase_alphabet() -> Self {
        Self {
            letters: ('A'..='Z').collect(),
        }
    }

    /// 保存済みの対応表から復元
    ///
    /// 表はソート済みかつ重複なしでなければなりません。
    pub fn from_table(letters: Vec<char>) -> Result<Self> {
        if letters.is_empty() {
            return Err(HtrError::InvalidInput("ラベル対応表が空です".to_string()));
        }
        if letters.windows(2).any(|w| w[0] >= w[1]) {
            return Err(HtrError::InvalidInput(format!(
                "ラベル対応表がソートされていないか重複があります: {:?}",
                letters
            )));
        }
        Ok(Self { letters })
    }

    pub fn encode(&self, letter: char) -> Result<usize> {
        self.letters
            .binary_search(&letter)
            .map_err(|_| HtrError::UnknownLabel(letter))
    }

    pub fn decode(&self, id: usize) -> Result<char> {
        self.letters.get(id).copied().ok_or(HtrError::InvalidClassId {
            id,
            num_classes: self.letters.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.letters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.letters.is_empty()
    }

    /// ID順の文字表
    pub fn table(&self) -> &[char] {
        &self.letters
    }
}

impl TryFrom<Vec<char>> for LabelCodec {
    type Error = HtrError;

    fn try_from(letters: Vec<char>) -> Result<Self> {
        Self::from_table(letters)
    }
}

impl From<LabelCodec> for Vec<char> {
    fn from(codec: LabelCodec) -> Self {
        codec.letters
    }
}
