// ============================================================
// Layer 4 — Reference-Game Dataset
// ============================================================
// One fully encoded training sample plus the burn Dataset
// wrapper the DataLoader pulls from. Samples are produced from a
// shard by pairing each image set with its target index and the
// gold utterance encoded through the shared vocabulary.

use anyhow::Result;
use burn::data::dataset::Dataset;
use serde::{Deserialize, Serialize};

use crate::data::shard::ShardData;
use crate::infra::vocab::Vocab;

/// One (image-set, target, utterance) tuple, encoded and ready to
/// batch. Image data stays flattened row-major; the batcher gives
/// it back its [n_img, channels, h, w] shape on the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceSample {
    pub imgs: Vec<f32>,
    pub img_dims: [usize; 4],
    pub target: i64,
    /// `<sos> w1 .. wn <eos>` token ids.
    pub tokens: Vec<i32>,
    /// The raw gold utterance, kept for debug output.
    pub lang: String,
}

pub struct ReferenceDataset {
    samples: Vec<ReferenceSample>,
}

impl ReferenceDataset {
    pub fn new(samples: Vec<ReferenceSample>) -> Self {
        Self { samples }
    }

    /// Encode every sample of a shard through the vocabulary.
    pub fn from_shard(shard: &ShardData, vocab: &Vocab) -> Result<Self> {
        let mut samples = Vec::with_capacity(shard.len());
        for i in 0..shard.len() {
            let (imgs, img_dims) = shard.image_block(i);
            let lang = shard.langs[i].clone();
            let tokens = vocab.encode(&lang)?;
            samples.push(ReferenceSample {
                imgs,
                img_dims,
                target: shard.labels[i],
                tokens,
                lang,
            });
        }
        Ok(Self { samples })
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

impl Dataset<ReferenceSample> for ReferenceDataset {
    fn get(&self, index: usize) -> Option<ReferenceSample> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}
