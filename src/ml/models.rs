// ============================================================
// Layer 5 — Model Registry
// ============================================================
// The four model roles of the Rational Speech Acts setup, plus
// the utterance-prior language model used by the Bayes/MAP
// penalties and the language-model scoring policy.
//
// Shared pattern: every role owns a token embedding table
// (dim 50), speakers and listeners also own a Conv4 vision
// encoder and a GRU-cell recurrent head. Roles never share
// parameters — the registry builds each instance from scratch.
//
// Speaker conditioning is selected by two flags {contextual,
// marginal}: the contextual literal speaker sees the target
// image's features only, the marginal conditional speaker sees
// the context mean without target indexing, and the amortized
// speaker sees both.
//
// Reference: Frank & Goodman (2012); Monroe et al. (2017);
//            White et al. (2020), amortized pragmatic reasoning

use anyhow::Result;
use burn::{
    nn::{Embedding, EmbeddingConfig, Linear, LinearConfig},
    prelude::*,
    tensor::activation::{log_softmax, softmax},
};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use crate::domain::{Activation, ModelRole};
use crate::infra::vocab;
use crate::ml::rnn::{GruCell, GruCellConfig};
use crate::ml::vision::{Conv4, Conv4Config};

// ─── Registry ─────────────────────────────────────────────────────────────────

/// Factory for model roles. Embeddings are 50-wide; the hidden
/// width is shared by every recurrent head.
pub struct ModelRegistry {
    pub vocab_size: usize,
    pub embed_dim: usize,
    pub hidden_dim: usize,
}

impl ModelRegistry {
    pub fn new(vocab_size: usize) -> Self {
        Self { vocab_size, embed_dim: 50, hidden_dim: 100 }
    }

    pub fn listener<B: Backend>(&self, device: &B::Device) -> Listener<B> {
        ListenerConfig::new(self.vocab_size, self.embed_dim, self.hidden_dim)
            .init(Conv4Config::new().init(device), device)
    }

    /// One speaker architecture serves all three speaker roles; the
    /// conditioning flags differ per role at the call boundary.
    pub fn speaker<B: Backend>(&self, device: &B::Device) -> SpeakerModel<B> {
        SpeakerConfig::new(self.vocab_size, self.embed_dim, self.hidden_dim)
            .init(Conv4Config::new().init(device), device)
    }

    pub fn language_model<B: Backend>(&self, device: &B::Device) -> LanguageModel<B> {
        LanguageModelConfig::new(self.vocab_size, self.embed_dim, self.hidden_dim)
            .init(device)
    }

    /// Conditioning flags for a speaker role.
    pub fn variant(role: ModelRole) -> SpeakerVariant {
        match role {
            ModelRole::LiteralSpeaker => SpeakerVariant { contextual: true, marginal: false },
            ModelRole::ConditionalSpeaker => SpeakerVariant { contextual: false, marginal: true },
            ModelRole::AmortizedSpeaker => SpeakerVariant { contextual: true, marginal: true },
            ModelRole::Listener => SpeakerVariant { contextual: false, marginal: false },
        }
    }
}

/// Speaker conditioning flags: `contextual` gates the
/// target-feature slot, `marginal` gates the context-mean slot.
#[derive(Debug, Clone, Copy)]
pub struct SpeakerVariant {
    pub contextual: bool,
    pub marginal: bool,
}

// ─── Listener ─────────────────────────────────────────────────────────────────

#[derive(Config, Debug)]
pub struct ListenerConfig {
    pub vocab_size: usize,
    pub embed_dim: usize,
    pub hidden_dim: usize,
}

impl ListenerConfig {
    pub fn init<B: Backend>(&self, vision: Conv4<B>, device: &B::Device) -> Listener<B> {
        let feat = vision.feat_size();
        Listener {
            vision,
            embedding: EmbeddingConfig::new(self.vocab_size, self.embed_dim).init(device),
            cell: GruCellConfig::new(self.embed_dim, self.hidden_dim).init(device),
            project: LinearConfig::new(self.hidden_dim, feat).init(device),
            embed_dim: self.embed_dim,
            hidden_dim: self.hidden_dim,
        }
    }
}

/// (image-set, utterance) -> selection logits over the images.
#[derive(Module, Debug)]
pub struct Listener<B: Backend> {
    pub vision: Conv4<B>,
    pub embedding: Embedding<B>,
    pub cell: GruCell<B>,
    pub project: Linear<B>,
    pub embed_dim: usize,
    pub hidden_dim: usize,
}

impl<B: Backend> Listener<B> {
    /// [batch, n, c, h, w] -> per-image features [batch, n, feat].
    pub fn features(&self, imgs: Tensor<B, 5>) -> Tensor<B, 3> {
        let [b, n, c, h, w] = imgs.dims();
        let feats = self.vision.forward(imgs.reshape([b * n, c, h, w]));
        feats.reshape([b, n, self.vision.feat_size()])
    }

    /// Run the utterance GRU, freezing each row's state once its
    /// true length is passed, and return the final hidden state.
    pub fn encode(&self, utt: Tensor<B, 2, Int>, lengths: &[usize]) -> Tensor<B, 2> {
        let [b, seq] = utt.dims();
        let emb = self.embedding.forward(utt);
        let device = emb.device();

        let mut hidden = Tensor::<B, 2>::zeros([b, self.hidden_dim], &device);
        for t in 0..seq {
            let x = emb
                .clone()
                .slice([0..b, t..t + 1, 0..self.embed_dim])
                .reshape([b, self.embed_dim]);
            let next = self.cell.step(x, hidden.clone());
            let alive = step_mask::<B>(lengths, t, &device);
            hidden = next * alive.clone() + hidden * alive.neg().add_scalar(1.0);
        }
        hidden
    }

    /// Soft-utterance variant: each step consumes a distribution
    /// over the vocabulary, embedded as probs @ embedding table.
    /// Keeps the path from speaker output to listener choice
    /// differentiable.
    pub fn encode_soft(&self, probs: Tensor<B, 3>, lengths: &[usize]) -> Tensor<B, 2> {
        let [b, seq, v] = probs.dims();
        let device = probs.device();
        let table = self.embedding.weight.val();

        let mut hidden = Tensor::<B, 2>::zeros([b, self.hidden_dim], &device);
        for t in 0..seq {
            let dist = probs.clone().slice([0..b, t..t + 1, 0..v]).reshape([b, v]);
            let x = dist.matmul(table.clone());
            let next = self.cell.step(x, hidden.clone());
            let alive = step_mask::<B>(lengths, t, &device);
            hidden = next * alive.clone() + hidden * alive.neg().add_scalar(1.0);
        }
        hidden
    }

    fn score(&self, feats: Tensor<B, 3>, utt_hidden: Tensor<B, 2>) -> Tensor<B, 2> {
        let [b, n, _f] = feats.dims();
        let query = self.project.forward(utt_hidden).unsqueeze_dim(2);
        feats.matmul(query).reshape([b, n])
    }

    /// Selection logits [batch, n_img] for hard token utterances.
    pub fn forward(
        &self,
        imgs: Tensor<B, 5>,
        utt: Tensor<B, 2, Int>,
        lengths: &[usize],
    ) -> Tensor<B, 2> {
        let feats = self.features(imgs);
        self.forward_from_feats(feats, utt, lengths)
    }

    /// Same, reusing precomputed image features.
    pub fn forward_from_feats(
        &self,
        feats: Tensor<B, 3>,
        utt: Tensor<B, 2, Int>,
        lengths: &[usize],
    ) -> Tensor<B, 2> {
        let hidden = self.encode(utt, lengths);
        self.score(feats, hidden)
    }

    /// Selection logits for soft (distribution-valued) utterances.
    pub fn forward_soft(
        &self,
        feats: Tensor<B, 3>,
        probs: Tensor<B, 3>,
        lengths: &[usize],
    ) -> Tensor<B, 2> {
        let hidden = self.encode_soft(probs, lengths);
        self.score(feats, hidden)
    }
}

// ─── Speaker ──────────────────────────────────────────────────────────────────

#[derive(Config, Debug)]
pub struct SpeakerConfig {
    pub vocab_size: usize,
    pub embed_dim: usize,
    pub hidden_dim: usize,
}

impl SpeakerConfig {
    pub fn init<B: Backend>(&self, vision: Conv4<B>, device: &B::Device) -> SpeakerModel<B> {
        let feat = vision.feat_size();
        SpeakerModel {
            vision,
            embedding: EmbeddingConfig::new(self.vocab_size, self.embed_dim).init(device),
            // [target slot ++ context slot] -> initial hidden state
            init: LinearConfig::new(2 * feat, self.hidden_dim).init(device),
            cell: GruCellConfig::new(self.embed_dim, self.hidden_dim).init(device),
            head: LinearConfig::new(self.hidden_dim, self.vocab_size).init(device),
            embed_dim: self.embed_dim,
            hidden_dim: self.hidden_dim,
            vocab_size: self.vocab_size,
        }
    }
}

/// (image-set[, target]) -> token sequence distribution. Serves
/// the literal, conditional and amortized roles; the conditioning
/// flags decide which feature slots are populated.
#[derive(Module, Debug)]
pub struct SpeakerModel<B: Backend> {
    pub vision: Conv4<B>,
    pub embedding: Embedding<B>,
    pub init: Linear<B>,
    pub cell: GruCell<B>,
    pub head: Linear<B>,
    pub embed_dim: usize,
    pub hidden_dim: usize,
    pub vocab_size: usize,
}

/// Rollout controls for free-running generation.
pub struct GenOptions {
    pub max_len: usize,
    pub tau: f64,
    pub strategy: Strategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Greedy,
    Multinomial,
}

impl From<Option<Activation>> for Strategy {
    fn from(activation: Option<Activation>) -> Self {
        match activation {
            Some(Activation::Multinomial) => Strategy::Multinomial,
            None => Strategy::Greedy,
        }
    }
}

/// Everything a policy needs from one rollout.
pub struct Generation<B: Backend> {
    /// Chosen token ids, `<pad>` after `<eos>` — [batch, steps].
    pub tokens: Tensor<B, 2, Int>,
    /// Host copy of `tokens`, row per sample.
    pub token_ids: Vec<Vec<i64>>,
    /// Emitted length per sample (incl. `<eos>` when produced).
    pub lengths: Vec<usize>,
    /// Per-step output distributions — [batch, steps, vocab].
    pub probs: Tensor<B, 3>,
    /// Masked sum of chosen-token log-probabilities — [batch].
    pub log_prob_sum: Tensor<B, 1>,
    /// Alive mask (step < length) — [batch, steps].
    pub mask: Tensor<B, 2>,
}

impl<B: Backend> SpeakerModel<B> {
    pub fn features(&self, imgs: Tensor<B, 5>) -> Tensor<B, 3> {
        let [b, n, c, h, w] = imgs.dims();
        let feats = self.vision.forward(imgs.reshape([b * n, c, h, w]));
        feats.reshape([b, n, self.vision.feat_size()])
    }

    /// Build the conditioning vector [batch, 2*feat]: target slot
    /// (contextual roles) and context-mean slot (marginal roles);
    /// unused slots stay zero so the architecture is uniform.
    fn context(
        &self,
        feats: Tensor<B, 3>,
        targets: Tensor<B, 1, Int>,
        variant: SpeakerVariant,
    ) -> Tensor<B, 2> {
        let [b, _n, f] = feats.dims();
        let device = feats.device();

        let target_slot = if variant.contextual {
            let index = targets.reshape([b, 1, 1]).expand([b, 1, f]);
            feats.clone().gather(1, index).reshape([b, f])
        } else {
            Tensor::zeros([b, f], &device)
        };
        let context_slot = if variant.marginal {
            feats.mean_dim(1).reshape([b, f])
        } else {
            Tensor::zeros([b, f], &device)
        };
        Tensor::cat(vec![target_slot, context_slot], 1)
    }

    fn initial_state(
        &self,
        imgs: Tensor<B, 5>,
        targets: Tensor<B, 1, Int>,
        variant: SpeakerVariant,
    ) -> Tensor<B, 2> {
        let feats = self.features(imgs);
        self.init.forward(self.context(feats, targets, variant)).tanh()
    }

    fn embed_step(&self, tokens: Tensor<B, 2, Int>) -> Tensor<B, 2> {
        let b = tokens.dims()[0];
        self.embedding.forward(tokens).reshape([b, self.embed_dim])
    }

    /// Teacher-forced pass over the gold utterance: logits for
    /// positions 1..L given positions 0..L-1 — [batch, L-1, vocab].
    pub fn forward_teacher(
        &self,
        imgs: Tensor<B, 5>,
        targets: Tensor<B, 1, Int>,
        variant: SpeakerVariant,
        utt: Tensor<B, 2, Int>,
    ) -> Tensor<B, 3> {
        let [b, seq] = utt.dims();
        let mut hidden = self.initial_state(imgs, targets, variant);

        let mut steps: Vec<Tensor<B, 3>> = Vec::with_capacity(seq - 1);
        for t in 0..seq - 1 {
            let x = self.embed_step(utt.clone().slice([0..b, t..t + 1]));
            hidden = self.cell.step(x, hidden);
            steps.push(self.head.forward(hidden.clone()).unsqueeze_dim::<3>(1));
        }
        Tensor::cat(steps, 1)
    }

    /// Free-running rollout from `<sos>`: greedy or multinomial
    /// token choice per step, distributions and chosen-token
    /// log-probabilities collected for the policy losses.
    pub fn generate(
        &self,
        imgs: Tensor<B, 5>,
        targets: Tensor<B, 1, Int>,
        variant: SpeakerVariant,
        opts: &GenOptions,
        rng: &mut impl Rng,
    ) -> Result<Generation<B>> {
        let b = imgs.dims()[0];
        let device = imgs.device();
        let v = self.vocab_size;

        let mut hidden = self.initial_state(imgs, targets, variant);
        let mut prev = filled_int::<B>(vocab::SOS, b, &device);
        let mut done = vec![false; b];
        let mut lengths = vec![0usize; b];
        let mut token_ids: Vec<Vec<i64>> = vec![Vec::with_capacity(opts.max_len); b];
        let mut chosen_cols: Vec<Tensor<B, 2, Int>> = Vec::with_capacity(opts.max_len);
        let mut prob_steps: Vec<Tensor<B, 3>> = Vec::with_capacity(opts.max_len);
        let mut log_prob_sum = Tensor::<B, 1>::zeros([b], &device);

        for t in 0..opts.max_len {
            let x = self.embed_step(prev.clone());
            hidden = self.cell.step(x, hidden);
            let logits = self.head.forward(hidden.clone()) / opts.tau;
            let probs = softmax(logits.clone(), 1);

            // Token choice happens on the host; gradients flow through
            // the log-probabilities gathered below, not the choice.
            let host: Vec<f32> = probs.clone().into_data().convert::<f32>().value;
            let mut chosen: Vec<i32> = Vec::with_capacity(b);
            for i in 0..b {
                if done[i] {
                    chosen.push(vocab::PAD);
                    continue;
                }
                let row = &host[i * v..(i + 1) * v];
                let id = match opts.strategy {
                    Strategy::Greedy => argmax_row(row),
                    Strategy::Multinomial => {
                        let dist = WeightedIndex::new(row.iter()).map_err(|e| {
                            anyhow::anyhow!("Degenerate speaker distribution at step {t}: {e}")
                        })?;
                        dist.sample(rng)
                    }
                };
                chosen.push(id as i32);
            }

            let alive: Vec<f32> = done.iter().map(|&d| if d { 0.0 } else { 1.0 }).collect();
            let alive = Tensor::<B, 1>::from_floats(alive.as_slice(), &device);
            let chosen_col = Tensor::<B, 1, Int>::from_ints(chosen.as_slice(), &device)
                .reshape([b, 1]);
            let step_lp = log_softmax(logits, 1)
                .gather(1, chosen_col.clone())
                .reshape([b]);
            log_prob_sum = log_prob_sum + step_lp * alive;

            for i in 0..b {
                token_ids[i].push(chosen[i] as i64);
                if !done[i] && chosen[i] == vocab::EOS {
                    done[i] = true;
                    lengths[i] = t + 1;
                }
            }
            prob_steps.push(probs.unsqueeze_dim::<3>(1));
            chosen_cols.push(chosen_col.clone());
            prev = chosen_col;
            if done.iter().all(|&d| d) {
                break;
            }
        }

        let steps = prob_steps.len();
        for length in lengths.iter_mut() {
            if *length == 0 {
                *length = steps;
            }
        }
        let mut mask_flat: Vec<f32> = Vec::with_capacity(b * steps);
        for length in &lengths {
            for t in 0..steps {
                mask_flat.push(if t < *length { 1.0 } else { 0.0 });
            }
        }
        let mask = Tensor::<B, 1>::from_floats(mask_flat.as_slice(), &device)
            .reshape([b, steps]);

        Ok(Generation {
            tokens: Tensor::cat(chosen_cols, 1),
            token_ids,
            lengths,
            probs: Tensor::cat(prob_steps, 1),
            log_prob_sum,
            mask,
        })
    }
}

// ─── Language model ───────────────────────────────────────────────────────────

#[derive(Config, Debug)]
pub struct LanguageModelConfig {
    pub vocab_size: usize,
    pub embed_dim: usize,
    pub hidden_dim: usize,
}

impl LanguageModelConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> LanguageModel<B> {
        LanguageModel {
            embedding: EmbeddingConfig::new(self.vocab_size, self.embed_dim).init(device),
            cell: GruCellConfig::new(self.embed_dim, self.hidden_dim).init(device),
            head: LinearConfig::new(self.hidden_dim, self.vocab_size).init(device),
            embed_dim: self.embed_dim,
            hidden_dim: self.hidden_dim,
        }
    }
}

/// Utterance prior p(u): a recurrent LM over tokens alone. Frozen
/// in every phase that consumes it; pretrained externally.
#[derive(Module, Debug)]
pub struct LanguageModel<B: Backend> {
    pub embedding: Embedding<B>,
    pub cell: GruCell<B>,
    pub head: Linear<B>,
    pub embed_dim: usize,
    pub hidden_dim: usize,
}

impl<B: Backend> LanguageModel<B> {
    fn embed_step(&self, tokens: Tensor<B, 2, Int>) -> Tensor<B, 2> {
        let b = tokens.dims()[0];
        self.embedding.forward(tokens).reshape([b, self.embed_dim])
    }

    /// Teacher-forced logits for positions 1..L — [batch, L-1, vocab].
    pub fn forward_teacher(&self, utt: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let [b, seq] = utt.dims();
        let device = utt.device();
        let mut hidden = Tensor::<B, 2>::zeros([b, self.hidden_dim], &device);

        let mut steps: Vec<Tensor<B, 3>> = Vec::with_capacity(seq - 1);
        for t in 0..seq - 1 {
            let x = self.embed_step(utt.clone().slice([0..b, t..t + 1]));
            hidden = self.cell.step(x, hidden);
            steps.push(self.head.forward(hidden.clone()).unsqueeze_dim::<3>(1));
        }
        Tensor::cat(steps, 1)
    }

    /// Predictive log-probabilities along a rollout prefix
    /// (`<sos>` then `tokens[..-1]`) — [batch, steps, vocab].
    pub fn step_log_probs(&self, tokens: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let [b, steps] = tokens.dims();
        let device = tokens.device();
        let mut hidden = Tensor::<B, 2>::zeros([b, self.hidden_dim], &device);
        let mut prev = filled_int::<B>(vocab::SOS, b, &device);

        let mut rows: Vec<Tensor<B, 3>> = Vec::with_capacity(steps);
        for t in 0..steps {
            let x = self.embed_step(prev);
            hidden = self.cell.step(x, hidden);
            let log_probs = log_softmax(self.head.forward(hidden.clone()), 1);
            rows.push(log_probs.unsqueeze_dim::<3>(1));
            prev = tokens.clone().slice([0..b, t..t + 1]);
        }
        Tensor::cat(rows, 1)
    }

    /// Per-step negative log-likelihood of `tokens` (a rollout
    /// without `<sos>`) under the prior — [batch, steps].
    pub fn step_nll(&self, tokens: Tensor<B, 2, Int>) -> Tensor<B, 2> {
        let [b, steps] = tokens.dims();
        let index = tokens.clone().reshape([b, steps, 1]);
        self.step_log_probs(tokens)
            .gather(2, index)
            .reshape([b, steps])
            .neg()
    }

    /// Masked total NLL per sequence — [batch].
    pub fn sequence_nll(&self, tokens: Tensor<B, 2, Int>, mask: Tensor<B, 2>) -> Tensor<B, 1> {
        let b = mask.dims()[0];
        (self.step_nll(tokens) * mask).sum_dim(1).reshape([b])
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn filled_int<B: Backend>(value: i32, len: usize, device: &B::Device) -> Tensor<B, 2, Int> {
    let ids = vec![value; len];
    Tensor::<B, 1, Int>::from_ints(ids.as_slice(), device).reshape([len, 1])
}

fn step_mask<B: Backend>(lengths: &[usize], t: usize, device: &B::Device) -> Tensor<B, 2> {
    let mask: Vec<f32> = lengths
        .iter()
        .map(|&len| if t < len { 1.0 } else { 0.0 })
        .collect();
    Tensor::<B, 1>::from_floats(mask.as_slice(), device).reshape([mask.len(), 1])
}

fn argmax_row(row: &[f32]) -> usize {
    let mut best = 0usize;
    let mut best_val = f32::MIN;
    for (i, &p) in row.iter().enumerate() {
        if p > best_val {
            best_val = p;
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    type TestBackend = burn::backend::NdArray;

    fn tiny_registry() -> ModelRegistry {
        ModelRegistry { vocab_size: 8, embed_dim: 4, hidden_dim: 6 }
    }

    fn tiny_imgs(device: &<TestBackend as Backend>::Device) -> Tensor<TestBackend, 5> {
        Tensor::zeros([2, 3, 3, 64, 64], device)
    }

    #[test]
    fn test_listener_logits_shape() {
        let device = Default::default();
        let listener = tiny_registry().listener::<TestBackend>(&device);
        let utt = Tensor::<TestBackend, 1, Int>::from_ints(
            [1, 4, 2, 0, 1, 5, 6, 2].as_slice(),
            &device,
        )
        .reshape([2, 4]);
        let logits = listener.forward(tiny_imgs(&device), utt, &[3, 4]);
        assert_eq!(logits.dims(), [2, 3]);
    }

    #[test]
    fn test_teacher_forced_speaker_shape() {
        let device = Default::default();
        let registry = tiny_registry();
        let speaker = registry.speaker::<TestBackend>(&device);
        let targets = Tensor::<TestBackend, 1, Int>::from_ints([0, 2].as_slice(), &device);
        let utt = Tensor::<TestBackend, 1, Int>::from_ints(
            [1, 4, 2, 0, 1, 5, 6, 2].as_slice(),
            &device,
        )
        .reshape([2, 4]);
        let variant = ModelRegistry::variant(ModelRole::LiteralSpeaker);
        let logits = speaker.forward_teacher(tiny_imgs(&device), targets, variant, utt);
        assert_eq!(logits.dims(), [2, 3, 8]);
    }

    #[test]
    fn test_generation_respects_max_len_and_masks() {
        let device = Default::default();
        let registry = tiny_registry();
        let speaker = registry.speaker::<TestBackend>(&device);
        let targets = Tensor::<TestBackend, 1, Int>::from_ints([1, 0].as_slice(), &device);
        let variant = ModelRegistry::variant(ModelRole::AmortizedSpeaker);
        let opts = GenOptions { max_len: 5, tau: 1.0, strategy: Strategy::Greedy };
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);

        let generation = speaker
            .generate(tiny_imgs(&device), targets, variant, &opts, &mut rng)
            .unwrap();
        let steps = generation.probs.dims()[1];
        assert!(steps <= 5);
        assert_eq!(generation.tokens.dims(), [2, steps]);
        assert_eq!(generation.mask.dims(), [2, steps]);
        assert!(generation.lengths.iter().all(|&l| l >= 1 && l <= steps));
        assert_eq!(generation.token_ids.len(), 2);
    }

    #[test]
    fn test_language_model_nll_is_positive() {
        let device = Default::default();
        let lm = tiny_registry().language_model::<TestBackend>(&device);
        let tokens = Tensor::<TestBackend, 1, Int>::from_ints(
            [4, 5, 2, 6, 7, 2].as_slice(),
            &device,
        )
        .reshape([2, 3]);
        let mask = Tensor::<TestBackend, 1>::from_floats(
            [1.0, 1.0, 1.0, 1.0, 1.0, 0.0].as_slice(),
            &device,
        )
        .reshape([2, 3]);
        let nll: Vec<f32> = lm
            .sequence_nll(tokens, mask)
            .into_data()
            .convert::<f32>()
            .value;
        assert!(nll.iter().all(|&x| x > 0.0));
    }
}
