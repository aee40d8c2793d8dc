//! 層化ホールドアウト分割と層化K分割
//!
//! 1. 全サンプルの `test_fraction` をクラス比を保ったままテストセットに取り分ける
//! 2. 残り（学習プール）をクラスごとに K 個のフォールドへ順番に配る
//!
//! どちらも固定シードの `StdRng` でシャッフルするので、同じ入力なら同じ分割になります。

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{HtrError, Result};
use crate::ml::label_codec::LabelCodec;

/// 分割設定
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub test_fraction: f64,
    pub num_folds: usize,
    pub seed: u64,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            test_fraction: 0.1,
            num_folds: 5,
            seed: 42,
        }
    }
}

/// 1フォールド分の学習・検証インデックス（学習プール内の位置）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fold {
    /// 0始まりのフォールド番号
    pub index: usize,
    pub train_indices: Vec<usize>,
    pub val_indices: Vec<usize>,
}

/// 分割結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetPartition {
    /// テストセット（元データのインデックス）
    pub test_indices: Vec<usize>,
    /// 学習プール（元データのインデックス）
    pub pool_indices: Vec<usize>,
    pub folds: Vec<Fold>,
}

impl DatasetPartition {
    /// フォールドの学習・検証インデックスを元データのインデックスに変換
    pub fn resolve(&self, fold: &Fold) -> (Vec<usize>, Vec<usize>) {
        let train = fold.train_indices.iter().map(|&i| self.pool_indices[i]).collect();
        let val = fold.val_indices.iter().map(|&i| self.pool_indices[i]).collect();
        (train, val)
    }
}

fn group_by_class(indices: impl IntoIterator<Item = usize>, labels: &[usize]) -> BTreeMap<usize, Vec<usize>> {
    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for idx in indices {
        groups.entry(labels[idx]).or_default().push(idx);
    }
    groups
}

/// 層化分割を実行
///
/// `labels` はコーデックでエンコード済みのクラスIDです。学習プール内で K 件未満の
/// クラスがあれば、学習を始める前に `InsufficientSamples` を返します。
pub fn partition(labels: &[usize], codec: &LabelCodec, config: &PartitionConfig) -> Result<DatasetPartition> {
    if config.num_folds < 2 {
        return Err(HtrError::Config(format!(
            "分割数は2以上が必要です: {}",
            config.num_folds
        )));
    }
    if !(0.0..1.0).contains(&config.test_fraction) {
        return Err(HtrError::Config(format!(
            "テスト比率は [0, 1) の範囲で指定してください: {}",
            config.test_fraction
        )));
    }
    if labels.is_empty() {
        return Err(HtrError::Dataset("分割するサンプルがありません".to_string()));
    }

    let mut rng = StdRng::seed_from_u64(config.seed);

    // 1. ホールドアウト
    let mut test_indices = Vec::new();
    let mut pool_by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (class_id, mut members) in group_by_class(0..labels.len(), labels) {
        members.shuffle(&mut rng);
        let n_test = (members.len() as f64 * config.test_fraction).round() as usize;
        let pool = members.split_off(n_test.min(members.len()));
        test_indices.extend(members);
        pool_by_class.insert(class_id, pool);
    }

    for (&class_id, members) in &pool_by_class {
        if members.len() < config.num_folds {
            return Err(HtrError::InsufficientSamples {
                label: codec.decode(class_id)?,
                count: members.len(),
                required: config.num_folds,
            });
        }
    }

    let pool_indices: Vec<usize> = pool_by_class.values().flatten().copied().collect();
    let position: BTreeMap<usize, usize> = pool_indices
        .iter()
        .enumerate()
        .map(|(pos, &idx)| (idx, pos))
        .collect();

    // 2. 層化K分割: クラスごとに順番に配り、開始位置をずらしてフォールドの大きさを揃える
    let k = config.num_folds;
    let mut val_sets: Vec<Vec<usize>> = vec![Vec::new(); k];
    let mut offset = 0usize;
    for members in pool_by_class.values() {
        let mut members = members.clone();
        members.shuffle(&mut rng);
        for (j, idx) in members.iter().enumerate() {
            val_sets[(offset + j) % k].push(position[idx]);
        }
        offset = (offset + members.len()) % k;
    }

    let folds = val_sets
        .into_iter()
        .enumerate()
        .map(|(index, mut val_indices)| {
            val_indices.sort_unstable();
            let train_indices = (0..pool_indices.len())
                .filter(|i| val_indices.binary_search(i).is_err())
                .collect();
            Fold {
                index,
                train_indices,
                val_indices,
            }
        })
        .collect();

    test_indices.sort_unstable();

    Ok(DatasetPartition {
        test_indices,
        pool_indices,
        folds,
    })
}
