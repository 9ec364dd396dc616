// ============================================================
// Layer 4 — Reference-Game Batcher
// ============================================================
// Implements burn's Batcher trait: stacks a Vec of encoded
// samples into device tensors. All image blocks in a shard share
// their dims, so images flatten-and-reshape directly; utterances
// are padded to the longest sequence in the batch.
//
// Reference: Burn Book §4 (Batcher)

use burn::{data::dataloader::batcher::Batcher, prelude::*};

use crate::data::dataset::ReferenceSample;
use crate::infra::vocab;

// ─── ReferenceBatch ───────────────────────────────────────────────────────────
/// A batch ready for a model forward pass.
#[derive(Debug, Clone)]
pub struct ReferenceBatch<B: Backend> {
    /// Image sets — [batch, n_img, channels, height, width].
    pub imgs: Tensor<B, 5>,
    /// Target image index per sample — [batch].
    pub targets: Tensor<B, 1, Int>,
    /// Gold utterances, `<sos> .. <eos>` then `<pad>` — [batch, seq].
    pub utterances: Tensor<B, 2, Int>,
    /// True utterance lengths (incl. <sos>/<eos>), one per sample.
    pub lengths: Vec<usize>,
    /// Raw gold utterances for qualitative output.
    pub langs: Vec<String>,
}

impl<B: Backend> ReferenceBatch<B> {
    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    pub fn n_imgs(&self) -> usize {
        self.imgs.dims()[1]
    }
}

// ─── ReferenceBatcher ─────────────────────────────────────────────────────────
/// Holds the target device so tensors land on the right backend.
#[derive(Clone, Debug)]
pub struct ReferenceBatcher<B: Backend> {
    pub device: B::Device,
}

impl<B: Backend> ReferenceBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

impl<B: Backend> Batcher<ReferenceSample, ReferenceBatch<B>> for ReferenceBatcher<B> {
    fn batch(&self, items: Vec<ReferenceSample>) -> ReferenceBatch<B> {
        let batch_size = items.len();
        let [n, c, h, w] = items[0].img_dims;

        // ── Images: flatten across the batch, reshape once ────────────────────
        let img_flat: Vec<f32> = items.iter().flat_map(|s| s.imgs.iter().copied()).collect();
        let imgs = Tensor::<B, 1>::from_floats(img_flat.as_slice(), &self.device)
            .reshape([batch_size, n, c, h, w]);

        // ── Targets ───────────────────────────────────────────────────────────
        let targets: Vec<i32> = items.iter().map(|s| s.target as i32).collect();
        let targets = Tensor::<B, 1, Int>::from_ints(targets.as_slice(), &self.device);

        // ── Utterances: pad to the longest sequence in the batch ──────────────
        let lengths: Vec<usize> = items.iter().map(|s| s.tokens.len()).collect();
        let max_len = lengths.iter().copied().max().unwrap_or(2);
        let mut utt_flat: Vec<i32> = Vec::with_capacity(batch_size * max_len);
        for item in &items {
            utt_flat.extend_from_slice(&item.tokens);
            utt_flat.extend(std::iter::repeat(vocab::PAD).take(max_len - item.tokens.len()));
        }
        let utterances = Tensor::<B, 1, Int>::from_ints(utt_flat.as_slice(), &self.device)
            .reshape([batch_size, max_len]);

        let langs = items.into_iter().map(|s| s.lang).collect();

        ReferenceBatch { imgs, targets, utterances, lengths, langs }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::vocab;

    type TestBackend = burn::backend::NdArray;

    fn sample(target: i64, tokens: Vec<i32>) -> ReferenceSample {
        ReferenceSample {
            imgs: vec![0.0; 3 * 3 * 4 * 4],
            img_dims: [3, 3, 4, 4],
            target,
            tokens,
            lang: String::new(),
        }
    }

    #[test]
    fn test_batch_shapes_and_padding() {
        let device = Default::default();
        let batcher = ReferenceBatcher::<TestBackend>::new(device);
        let batch = batcher.batch(vec![
            sample(0, vec![vocab::SOS, 4, vocab::EOS]),
            sample(2, vec![vocab::SOS, 4, 5, 6, vocab::EOS]),
        ]);

        assert_eq!(batch.imgs.dims(), [2, 3, 3, 4, 4]);
        assert_eq!(batch.utterances.dims(), [2, 5]);
        assert_eq!(batch.lengths, vec![3, 5]);

        // The short utterance is padded with <pad> = 0
        let ids: Vec<i64> = batch.utterances.into_data().convert::<i64>().value;
        assert_eq!(&ids[..5], &[1, 4, 2, 0, 0]);
    }
}
