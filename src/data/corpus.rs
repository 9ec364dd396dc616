// ============================================================
// Layer 4 — Corpus Layout
// ============================================================
// Shard sets are enumerated statically by naming convention, per
// dataset and (optionally) generalization split. Pretraining
// groups are disjoint: within each group the first k-1 shards
// train and the last shard validates, so every ensemble member
// sees its own held-out data.

use std::path::{Path, PathBuf};

use crate::domain::DatasetKind;

/// All shard paths a run can touch, resolved up front.
pub struct Corpus {
    /// Disjoint shard groups for listener pretraining.
    pub pretrain_groups: Vec<Vec<PathBuf>>,
    /// Speaker-phase training shards.
    pub train: Vec<PathBuf>,
    /// Validation shards.
    pub val: Vec<PathBuf>,
}

impl Corpus {
    pub fn new(
        data_root: &Path,
        dataset: DatasetKind,
        generalization: Option<&str>,
    ) -> Self {
        match dataset {
            DatasetKind::Shapeworld => {
                let dir = match generalization {
                    Some(g) => data_root.join("shapeworld").join("generalization").join(g),
                    None => data_root.join("shapeworld"),
                };
                let shard = |i: usize| dir.join(format!("reference-1000-{i}.npz"));
                let group = |start: usize| (start..start + 5).map(shard).collect::<Vec<_>>();
                let pretrain_groups: Vec<Vec<PathBuf>> = if generalization.is_some() {
                    vec![group(0), group(5)]
                } else {
                    (0..11).map(|g| group(g * 5)).collect()
                };
                Corpus {
                    pretrain_groups,
                    train: (0..30).map(shard).collect(),
                    val: (65..70).map(shard).collect(),
                }
            }
            DatasetKind::Colors => {
                let dir = data_root.join("colors");
                let shard = |i: usize| dir.join(format!("data_1000_{i}.npz"));
                let group = |start: usize| (start..start + 15).map(shard).collect::<Vec<_>>();
                Corpus {
                    pretrain_groups: (0..3).map(|g| group(g * 15)).collect(),
                    train: (0..15).map(shard).collect(),
                    val: (15..30).map(shard).collect(),
                }
            }
        }
    }

    /// Split one pretraining group into its (train, val) shards:
    /// everything but the last shard trains, the last validates.
    pub fn split_group(group: &[PathBuf]) -> (&[PathBuf], &[PathBuf]) {
        let k = group.len();
        (&group[..k - 1], &group[k - 1..])
    }
}

/// Directory where a run's models and vocabulary live.
pub fn model_dir(
    model_root: &Path,
    dataset: DatasetKind,
    generalization: Option<&str>,
) -> PathBuf {
    match generalization {
        // Generalization splits exist for shapeworld only and are keyed
        // under the shapeworld model directory.
        Some(g) => model_root.join("shapeworld").join("generalization").join(g),
        None => model_root.join(dataset.dir_name()),
    }
}
