// ============================================================
// Layer 5 — Epoch Runner
// ============================================================
// Executes one pass (train or eval) over a list of shard files
// for a given policy. The policy is a closed enum carrying only
// the options that policy needs; the models travel in an
// EpochModels bundle that is moved in and returned, so a
// training step can consume-and-replace the trainable module the
// way burn's functional optimizers expect.
//
// Train split: forward -> loss -> backward -> optimizer step.
// Val/Test splits: the autodiff-free `valid()` modules run the
// same math and never touch a parameter.
//
// Reference: Burn Book §5; Williams (1992), REINFORCE

use anyhow::{bail, Context, Result};
use burn::{
    data::dataloader::DataLoaderBuilder,
    module::AutodiffModule,
    nn::loss::CrossEntropyLossConfig,
    optim::{GradientsParams, Optimizer},
    prelude::*,
    tensor::activation::softmax,
    tensor::backend::AutodiffBackend,
};
use rand::Rng;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::data::{
    batcher::{ReferenceBatch, ReferenceBatcher},
    dataset::ReferenceDataset,
    shard::ShardData,
};
use crate::domain::{Activation, Penalty, Split};
use crate::infra::vocab::{self, Vocab};
use crate::ml::models::{
    GenOptions, LanguageModel, Listener, SpeakerModel, SpeakerVariant, Strategy,
};

/// Seed for the training loader's reshuffle; validation loaders
/// keep file order so repeated passes are bit-identical.
const SHUFFLE_SEED: u64 = 42;

// ─── Policy ───────────────────────────────────────────────────────────────────

/// Which forward/loss computation an epoch runs. Each variant
/// carries exactly the configuration it needs.
#[derive(Debug, Clone)]
pub enum Policy {
    /// Listener cross-entropy over image selection.
    L0,
    /// Teacher-forced speaker training, listener-scored accuracy.
    S0 { lmbd: f64 },
    /// Amortized speaker: listener task loss plus a prior penalty,
    /// trained by REINFORCE (multinomial) or a soft relaxation.
    Amortized {
        penalty: Option<Penalty>,
        activation: Option<Activation>,
        tau: f64,
        lmbd: f64,
    },
    /// Sample-and-rerank evaluation of a trained speaker.
    Sample { num_samples: usize, lmbd: f64 },
    /// Score gold utterances under the pretrained prior.
    LanguageModel { lmbd: f64 },
}

impl Policy {
    fn name(&self) -> &'static str {
        match self {
            Policy::L0 => "l0",
            Policy::S0 { .. } => "s0",
            Policy::Amortized { .. } => "amortized",
            Policy::Sample { .. } => "sample",
            Policy::LanguageModel { .. } => "language_model",
        }
    }

    fn eval_only(&self) -> bool {
        matches!(self, Policy::Sample { .. } | Policy::LanguageModel { .. })
    }
}

/// The models a pass may touch. Exactly which ones are consulted
/// depends on the policy; the bundle is returned so a train pass
/// can hand back the stepped module.
pub struct EpochModels<B: AutodiffBackend> {
    pub speaker: Option<SpeakerModel<B>>,
    /// Conditioning flags for the speaker (ignored without one).
    pub variant: SpeakerVariant,
    pub listener: Listener<B>,
    pub prior: Option<LanguageModel<B>>,
}

/// Knobs shared by every policy.
pub struct RunOptions {
    pub batch_size: usize,
    pub lr: f64,
    pub max_len: usize,
    pub debug: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self { batch_size: 32, lr: 0.001, max_len: 12, debug: false }
    }
}

/// Aggregated metrics plus per-batch qualitative outputs.
pub struct EpochOutcome {
    pub metrics: BTreeMap<String, f64>,
    pub aux: Vec<BatchAux>,
}

/// Qualitative per-batch output for inspection: what the speaker
/// said and what the listener picked.
#[derive(Debug, Clone, Default)]
pub struct BatchAux {
    pub utterances: Vec<String>,
    pub predictions: Vec<i64>,
    pub targets: Vec<i64>,
}

// ─── Entry point ──────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
pub fn run<B: AutodiffBackend>(
    files: &[PathBuf],
    split: Split,
    policy: &Policy,
    models: EpochModels<B>,
    speaker_optim: &mut impl Optimizer<SpeakerModel<B>, B>,
    listener_optim: &mut impl Optimizer<Listener<B>, B>,
    vocab: &Vocab,
    opts: &RunOptions,
    device: &B::Device,
) -> Result<(EpochModels<B>, EpochOutcome)> {
    if split.is_train() && policy.eval_only() {
        bail!("Policy '{}' cannot run under the train split", policy.name());
    }
    match policy {
        Policy::S0 { .. } | Policy::Amortized { .. } | Policy::Sample { .. }
            if models.speaker.is_none() =>
        {
            bail!("Policy '{}' requires a speaker model", policy.name())
        }
        Policy::LanguageModel { .. } if models.prior.is_none() => {
            bail!("Policy 'language_model' requires a language-model checkpoint")
        }
        Policy::Amortized { penalty: Some(Penalty::Bayes | Penalty::Map), .. }
            if models.prior.is_none() =>
        {
            bail!("Bayes/MAP penalties require a language-model checkpoint")
        }
        _ => {}
    }

    if split.is_train() {
        run_train(files, policy, models, speaker_optim, listener_optim, vocab, opts, device)
    } else {
        run_eval(files, policy, models, vocab, opts, device)
    }
}

// ─── Train pass ───────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn run_train<B: AutodiffBackend>(
    files: &[PathBuf],
    policy: &Policy,
    models: EpochModels<B>,
    speaker_optim: &mut impl Optimizer<SpeakerModel<B>, B>,
    listener_optim: &mut impl Optimizer<Listener<B>, B>,
    vocab: &Vocab,
    opts: &RunOptions,
    device: &B::Device,
) -> Result<(EpochModels<B>, EpochOutcome)> {
    let EpochModels { speaker, variant, listener, prior } = models;
    let mut speaker = speaker;
    let mut listener = listener;
    let mut agg = MetricAgg::default();
    let mut aux = Vec::new();
    let mut rng = rand::thread_rng();

    for file in files {
        let shard = ShardData::read(file)?;
        let dataset = ReferenceDataset::from_shard(&shard, vocab)?;
        let batcher = ReferenceBatcher::<B>::new(device.clone());
        let loader = DataLoaderBuilder::new(batcher)
            .batch_size(opts.batch_size)
            .shuffle(SHUFFLE_SEED)
            .num_workers(1)
            .build(dataset);

        for batch in loader.iter() {
            match policy {
                Policy::L0 => {
                    let (loss, step) = l0_step(&listener, &batch);
                    agg.add(&step);
                    let grads = GradientsParams::from_grads(loss.backward(), &listener);
                    listener = listener_optim.step(opts.lr, listener, grads);
                }
                Policy::S0 { lmbd } => {
                    let current = speaker.take().expect("speaker checked above");
                    let (loss, step, batch_aux) = s0_step(
                        &current, variant, &listener, &batch, vocab, opts, *lmbd, &mut rng,
                    )?;
                    agg.add(&step);
                    aux.push(batch_aux);
                    let grads = GradientsParams::from_grads(loss.backward(), &current);
                    speaker = Some(speaker_optim.step(opts.lr, current, grads));
                }
                Policy::Amortized { penalty, activation, tau, lmbd } => {
                    let current = speaker.take().expect("speaker checked above");
                    let (loss, step, batch_aux) = amortized_step(
                        &current,
                        variant,
                        &listener,
                        prior.as_ref(),
                        &batch,
                        vocab,
                        opts,
                        *penalty,
                        *activation,
                        *tau,
                        *lmbd,
                        &mut rng,
                    )?;
                    agg.add(&step);
                    aux.push(batch_aux);
                    let grads = GradientsParams::from_grads(loss.backward(), &current);
                    speaker = Some(speaker_optim.step(opts.lr, current, grads));
                }
                Policy::Sample { .. } | Policy::LanguageModel { .. } => {
                    unreachable!("rejected before the pass starts")
                }
            }
            if opts.debug {
                tracing::debug!("train batch metrics: {:?}", agg.latest());
            }
        }
    }

    let outcome = EpochOutcome { metrics: agg.finish(), aux };
    Ok((EpochModels { speaker, variant, listener, prior }, outcome))
}

// ─── Eval pass ────────────────────────────────────────────────────────────────

fn run_eval<B: AutodiffBackend>(
    files: &[PathBuf],
    policy: &Policy,
    models: EpochModels<B>,
    vocab: &Vocab,
    opts: &RunOptions,
    device: &B::Device,
) -> Result<(EpochModels<B>, EpochOutcome)> {
    // Autodiff-free copies: no gradient tape, no parameter updates.
    let listener_v = models.listener.valid();
    let speaker_v = models.speaker.as_ref().map(|s| s.valid());
    let prior_v = models.prior.as_ref().map(|p| p.valid());
    let variant = models.variant;

    let mut agg = MetricAgg::default();
    let mut aux = Vec::new();
    let mut rng = rand::thread_rng();

    for file in files {
        let shard = ShardData::read(file)?;
        let dataset = ReferenceDataset::from_shard(&shard, vocab)?;
        let batcher = ReferenceBatcher::<B::InnerBackend>::new(device.clone());
        let loader = DataLoaderBuilder::new(batcher)
            .batch_size(opts.batch_size)
            .num_workers(1)
            .build(dataset);

        for batch in loader.iter() {
            match policy {
                Policy::L0 => {
                    let (_, step) = l0_step(&listener_v, &batch);
                    agg.add(&step);
                }
                Policy::S0 { lmbd } => {
                    let speaker = speaker_v.as_ref().expect("speaker checked above");
                    let (_, step, batch_aux) = s0_step(
                        speaker, variant, &listener_v, &batch, vocab, opts, *lmbd, &mut rng,
                    )?;
                    agg.add(&step);
                    aux.push(batch_aux);
                }
                Policy::Amortized { penalty, activation, tau, lmbd } => {
                    let speaker = speaker_v.as_ref().expect("speaker checked above");
                    let (_, step, batch_aux) = amortized_step(
                        speaker,
                        variant,
                        &listener_v,
                        prior_v.as_ref(),
                        &batch,
                        vocab,
                        opts,
                        *penalty,
                        *activation,
                        *tau,
                        *lmbd,
                        &mut rng,
                    )?;
                    agg.add(&step);
                    aux.push(batch_aux);
                }
                Policy::Sample { num_samples, lmbd } => {
                    let speaker = speaker_v.as_ref().expect("speaker checked above");
                    let (step, batch_aux) = sample_step(
                        speaker, variant, &listener_v, &batch, vocab, opts, *num_samples,
                        *lmbd, &mut rng,
                    )?;
                    agg.add(&step);
                    aux.push(batch_aux);
                }
                Policy::LanguageModel { lmbd } => {
                    let prior = prior_v.as_ref().expect("prior checked above");
                    let (step, batch_aux) =
                        lm_step(prior, &listener_v, &batch, *lmbd);
                    agg.add(&step);
                    aux.push(batch_aux);
                }
            }
            if opts.debug {
                tracing::debug!("eval batch metrics: {:?}", agg.latest());
            }
        }
    }

    let outcome = EpochOutcome { metrics: agg.finish(), aux };
    Ok((models, outcome))
}

// ─── Per-policy batch computations (backend-generic) ──────────────────────────

type StepMetrics = BTreeMap<String, f64>;

/// Listener selection cross-entropy and accuracy.
fn l0_step<Bx: Backend>(
    listener: &Listener<Bx>,
    batch: &ReferenceBatch<Bx>,
) -> (Tensor<Bx, 1>, StepMetrics) {
    let logits = listener.forward(
        batch.imgs.clone(),
        batch.utterances.clone(),
        &batch.lengths,
    );
    let device = logits.device();
    let loss = CrossEntropyLossConfig::new()
        .init(&device)
        .forward(logits.clone(), batch.targets.clone());

    let (acc, _) = selection_accuracy(logits, &batch.targets);
    let mut step = StepMetrics::new();
    step.insert("loss".into(), scalar(&loss));
    step.insert("acc".into(), acc);
    (loss, step)
}

/// Teacher-forced cross-entropy against the gold tokens; accuracy
/// re-derives listener comprehension of the greedy utterance.
#[allow(clippy::too_many_arguments)]
fn s0_step<Bx: Backend>(
    speaker: &SpeakerModel<Bx>,
    variant: SpeakerVariant,
    listener: &Listener<Bx>,
    batch: &ReferenceBatch<Bx>,
    vocab: &Vocab,
    opts: &RunOptions,
    lmbd: f64,
    rng: &mut impl Rng,
) -> Result<(Tensor<Bx, 1>, StepMetrics, BatchAux)> {
    let [b, seq] = batch.utterances.dims();
    let device = batch.imgs.device();

    // Token cross-entropy, teacher forced, padding ignored.
    let logits = speaker.forward_teacher(
        batch.imgs.clone(),
        batch.targets.clone(),
        variant,
        batch.utterances.clone(),
    );
    let v = logits.dims()[2];
    let flat_logits = logits.reshape([b * (seq - 1), v]);
    let flat_targets = batch
        .utterances
        .clone()
        .slice([0..b, 1..seq])
        .reshape([b * (seq - 1)]);
    let xent = CrossEntropyLossConfig::new()
        .with_pad_tokens(Some(vec![vocab::PAD as usize]))
        .init(&device)
        .forward(flat_logits, flat_targets);

    // Greedy rollout scored by the paired listener.
    let gen_opts = GenOptions { max_len: opts.max_len, tau: 1.0, strategy: Strategy::Greedy };
    let generation = speaker.generate(
        batch.imgs.clone(),
        batch.targets.clone(),
        variant,
        &gen_opts,
        rng,
    )?;
    let (sos_tokens, sos_lengths) = prepend_sos(&generation.tokens, &generation.lengths);
    let sel_logits = listener.forward(batch.imgs.clone(), sos_tokens, &sos_lengths);
    let (acc, preds) = selection_accuracy(sel_logits.clone(), &batch.targets);

    let mean_len = mean_f64(&generation.lengths);
    let p_target = target_probability(sel_logits, &batch.targets);
    let score = mean_f64_vec(&p_target) - lmbd * mean_len;

    let mut step = StepMetrics::new();
    step.insert("loss".into(), scalar(&xent));
    step.insert("xent".into(), scalar(&xent));
    step.insert("acc".into(), acc);
    step.insert("length".into(), mean_len);
    step.insert("score".into(), score);

    let batch_aux = BatchAux {
        utterances: generation.token_ids.iter().map(|ids| vocab.decode(ids)).collect(),
        predictions: preds,
        targets: batch.targets.clone().into_data().convert::<i64>().value,
    };
    Ok((xent, step, batch_aux))
}

/// Amortized objective: listener task loss plus the selected
/// prior penalty, under either gradient estimator.
#[allow(clippy::too_many_arguments)]
fn amortized_step<Bx: Backend>(
    speaker: &SpeakerModel<Bx>,
    variant: SpeakerVariant,
    listener: &Listener<Bx>,
    prior: Option<&LanguageModel<Bx>>,
    batch: &ReferenceBatch<Bx>,
    vocab: &Vocab,
    opts: &RunOptions,
    penalty: Option<Penalty>,
    activation: Option<Activation>,
    tau: f64,
    lmbd: f64,
    rng: &mut impl Rng,
) -> Result<(Tensor<Bx, 1>, StepMetrics, BatchAux)> {
    let b = batch.batch_size();
    let device = batch.imgs.device();
    let gen_opts = GenOptions { max_len: opts.max_len, tau, strategy: activation.into() };
    let generation = speaker.generate(
        batch.imgs.clone(),
        batch.targets.clone(),
        variant,
        &gen_opts,
        rng,
    )?;
    let feats = listener.features(batch.imgs.clone());
    let mean_len = mean_f64(&generation.lengths);

    let (loss, acc, preds, prior_nll) = match activation {
        // ── Score-function estimator over sampled tokens ──────────────────────
        Some(Activation::Multinomial) => {
            let (sos_tokens, sos_lengths) =
                prepend_sos(&generation.tokens, &generation.lengths);
            let sel_logits = listener
                .forward_from_feats(feats, sos_tokens, &sos_lengths)
                .detach();
            let (acc, preds) = selection_accuracy(sel_logits.clone(), &batch.targets);

            let mut reward = probability_tensor(sel_logits, &batch.targets);
            let mut prior_nll = 0.0;
            match penalty {
                Some(Penalty::Length) => {
                    let lens: Vec<f32> =
                        generation.lengths.iter().map(|&l| l as f32).collect();
                    let lens = Tensor::<Bx, 1>::from_floats(lens.as_slice(), &device);
                    reward = reward - lens * lmbd;
                }
                // With host-sampled tokens the Bayes and MAP costs both
                // score the produced sequence under the prior.
                Some(Penalty::Bayes) | Some(Penalty::Map) => {
                    let prior = prior.expect("prior checked before the pass");
                    let nll = prior
                        .sequence_nll(generation.tokens.clone(), generation.mask.clone())
                        .detach();
                    prior_nll = scalar(&nll.clone().mean());
                    reward = reward - nll * lmbd;
                }
                None => {}
            }
            let baseline = reward.clone().mean().into_scalar().elem::<f64>();
            let advantage = reward.sub_scalar(baseline).detach();
            let loss = (advantage * generation.log_prob_sum.clone()).mean().neg();
            (loss, acc, preds, prior_nll)
        }
        // ── Differentiable relaxation through soft embeddings ─────────────────
        None => {
            let sel_logits =
                listener.forward_soft(feats, generation.probs.clone(), &generation.lengths);
            let (acc, preds) = selection_accuracy(sel_logits.clone(), &batch.targets);
            let task = CrossEntropyLossConfig::new()
                .init(&device)
                .forward(sel_logits, batch.targets.clone());

            let steps = generation.probs.dims()[1];
            let mut prior_nll = 0.0;
            let loss = match penalty {
                Some(Penalty::Length) => {
                    // Expected non-<eos> mass per alive step.
                    let eos = vocab::EOS as usize;
                    let p_eos = generation
                        .probs
                        .clone()
                        .slice([0..b, 0..steps, eos..eos + 1])
                        .reshape([b, steps]);
                    let soft_len = ((p_eos.neg().add_scalar(1.0)) * generation.mask.clone())
                        .sum_dim(1)
                        .reshape([b])
                        .mean();
                    task + soft_len * lmbd
                }
                Some(Penalty::Bayes) => {
                    // Expected prior NLL of the speaker's distribution.
                    let prior = prior.expect("prior checked before the pass");
                    let lm_log_probs = prior.step_log_probs(generation.tokens.clone());
                    let expected = (generation.probs.clone() * lm_log_probs)
                        .sum_dim(2)
                        .reshape([b, steps])
                        .neg();
                    let cost = (expected * generation.mask.clone())
                        .sum_dim(1)
                        .reshape([b])
                        .mean();
                    prior_nll = scalar(&cost);
                    task + cost * lmbd
                }
                Some(Penalty::Map) => {
                    // Prior NLL of the greedy tokens, weighted by the
                    // probability the speaker assigned them.
                    let prior = prior.expect("prior checked before the pass");
                    let index = generation.tokens.clone().reshape([b, steps, 1]);
                    let p_chosen = generation
                        .probs
                        .clone()
                        .gather(2, index)
                        .reshape([b, steps]);
                    let nll = prior.step_nll(generation.tokens.clone());
                    let cost = (p_chosen * nll * generation.mask.clone())
                        .sum_dim(1)
                        .reshape([b])
                        .mean();
                    prior_nll = scalar(&cost);
                    task + cost * lmbd
                }
                None => task,
            };
            (loss, acc, preds, prior_nll)
        }
    };

    let mut step = StepMetrics::new();
    step.insert("loss".into(), scalar(&loss));
    step.insert("acc".into(), acc);
    step.insert("length".into(), mean_len);
    if prior.is_some() {
        step.insert("prior_nll".into(), prior_nll);
    }

    let batch_aux = BatchAux {
        utterances: generation.token_ids.iter().map(|ids| vocab.decode(ids)).collect(),
        predictions: preds,
        targets: batch.targets.clone().into_data().convert::<i64>().value,
    };
    Ok((loss, step, batch_aux))
}

/// Draw `num_samples` candidates per input and keep the one the
/// listener understands best (minus the length cost).
#[allow(clippy::too_many_arguments)]
fn sample_step<Bx: Backend>(
    speaker: &SpeakerModel<Bx>,
    variant: SpeakerVariant,
    listener: &Listener<Bx>,
    batch: &ReferenceBatch<Bx>,
    vocab: &Vocab,
    opts: &RunOptions,
    num_samples: usize,
    lmbd: f64,
    rng: &mut impl Rng,
) -> Result<(StepMetrics, BatchAux)> {
    let b = batch.batch_size();
    let feats = listener.features(batch.imgs.clone());
    let targets_host: Vec<i64> = batch.targets.clone().into_data().convert::<i64>().value;

    let mut best_score = vec![f64::NEG_INFINITY; b];
    let mut best_nll = vec![0.0f64; b];
    let mut best_correct = vec![false; b];
    let mut best_pred = vec![0i64; b];
    let mut best_utt = vec![String::new(); b];
    let mut best_len = vec![0usize; b];

    let gen_opts =
        GenOptions { max_len: opts.max_len, tau: 1.0, strategy: Strategy::Multinomial };
    for _ in 0..num_samples.max(1) {
        let generation = speaker.generate(
            batch.imgs.clone(),
            batch.targets.clone(),
            variant,
            &gen_opts,
            rng,
        )?;
        let (sos_tokens, sos_lengths) = prepend_sos(&generation.tokens, &generation.lengths);
        let sel_logits = listener.forward_from_feats(feats.clone(), sos_tokens, &sos_lengths);
        let probs = softmax(sel_logits.clone(), 1);
        let host: Vec<f32> = probs.into_data().convert::<f32>().value;
        let preds: Vec<i64> = sel_logits
            .argmax(1)
            .flatten::<1>(0, 1)
            .into_data()
            .convert::<i64>()
            .value;

        let n = batch.n_imgs();
        for i in 0..b {
            let p = host[i * n + targets_host[i] as usize] as f64;
            let score = p - lmbd * generation.lengths[i] as f64;
            if score > best_score[i] {
                best_score[i] = score;
                best_nll[i] = -(p.max(f64::MIN_POSITIVE)).ln();
                best_correct[i] = preds[i] == targets_host[i];
                best_pred[i] = preds[i];
                best_utt[i] = vocab.decode(&generation.token_ids[i]);
                best_len[i] = generation.lengths[i];
            }
        }
    }

    let mut step = StepMetrics::new();
    step.insert("loss".into(), best_nll.iter().sum::<f64>() / b as f64);
    step.insert(
        "acc".into(),
        best_correct.iter().filter(|&&c| c).count() as f64 / b as f64,
    );
    step.insert("length".into(), mean_f64(&best_len));

    let batch_aux =
        BatchAux { utterances: best_utt, predictions: best_pred, targets: targets_host };
    Ok((step, batch_aux))
}

/// Score gold utterances under the prior; accuracy is listener
/// comprehension of the same gold utterances.
fn lm_step<Bx: Backend>(
    prior: &LanguageModel<Bx>,
    listener: &Listener<Bx>,
    batch: &ReferenceBatch<Bx>,
    _lmbd: f64,
) -> (StepMetrics, BatchAux) {
    let [b, seq] = batch.utterances.dims();
    let device = batch.imgs.device();

    let logits = prior.forward_teacher(batch.utterances.clone());
    let v = logits.dims()[2];
    let flat_logits = logits.reshape([b * (seq - 1), v]);
    let flat_targets = batch
        .utterances
        .clone()
        .slice([0..b, 1..seq])
        .reshape([b * (seq - 1)]);
    let nll = CrossEntropyLossConfig::new()
        .with_pad_tokens(Some(vec![vocab::PAD as usize]))
        .init(&device)
        .forward(flat_logits, flat_targets);

    let sel_logits = listener.forward(
        batch.imgs.clone(),
        batch.utterances.clone(),
        &batch.lengths,
    );
    let (acc, preds) = selection_accuracy(sel_logits, &batch.targets);

    let mut step = StepMetrics::new();
    step.insert("loss".into(), scalar(&nll));
    step.insert("lm_nll".into(), scalar(&nll));
    step.insert("acc".into(), acc);

    let batch_aux = BatchAux {
        utterances: batch.langs.clone(),
        predictions: preds,
        targets: batch.targets.clone().into_data().convert::<i64>().value,
    };
    (step, batch_aux)
}

// ─── Shared helpers ───────────────────────────────────────────────────────────

/// Argmax accuracy plus host-side predictions.
fn selection_accuracy<Bx: Backend>(
    logits: Tensor<Bx, 2>,
    targets: &Tensor<Bx, 1, Int>,
) -> (f64, Vec<i64>) {
    let b = logits.dims()[0];
    // argmax(1) returns [batch, 1] — flatten before comparing
    let preds = logits.argmax(1).flatten::<1>(0, 1);
    let correct: i64 = preds
        .clone()
        .equal(targets.clone())
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>();
    let host = preds.into_data().convert::<i64>().value;
    (correct as f64 / b as f64, host)
}

/// softmax probability assigned to each sample's target — [batch].
fn probability_tensor<Bx: Backend>(
    logits: Tensor<Bx, 2>,
    targets: &Tensor<Bx, 1, Int>,
) -> Tensor<Bx, 1> {
    let b = logits.dims()[0];
    softmax(logits, 1)
        .gather(1, targets.clone().reshape([b, 1]))
        .reshape([b])
}

fn target_probability<Bx: Backend>(
    logits: Tensor<Bx, 2>,
    targets: &Tensor<Bx, 1, Int>,
) -> Vec<f64> {
    probability_tensor(logits, targets)
        .into_data()
        .convert::<f32>()
        .value
        .into_iter()
        .map(|p| p as f64)
        .collect()
}

/// Rollouts start at the first content token; the listener's
/// encoder expects `<sos>`-prefixed sequences like the gold data.
fn prepend_sos<Bx: Backend>(
    tokens: &Tensor<Bx, 2, Int>,
    lengths: &[usize],
) -> (Tensor<Bx, 2, Int>, Vec<usize>) {
    let [b, _steps] = tokens.dims();
    let device = tokens.device();
    let sos = vec![vocab::SOS; b];
    let sos = Tensor::<Bx, 1, Int>::from_ints(sos.as_slice(), &device).reshape([b, 1]);
    let with_sos = Tensor::cat(vec![sos, tokens.clone()], 1);
    (with_sos, lengths.iter().map(|&l| l + 1).collect())
}

fn scalar<Bx: Backend>(loss: &Tensor<Bx, 1>) -> f64 {
    loss.clone().into_scalar().elem::<f64>()
}

fn mean_f64(lengths: &[usize]) -> f64 {
    if lengths.is_empty() {
        return 0.0;
    }
    lengths.iter().sum::<usize>() as f64 / lengths.len() as f64
}

fn mean_f64_vec(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Running per-key sums, averaged over all batches at the end.
#[derive(Default)]
struct MetricAgg {
    sums: BTreeMap<String, f64>,
    last: BTreeMap<String, f64>,
    batches: usize,
}

impl MetricAgg {
    fn add(&mut self, step: &StepMetrics) {
        for (key, value) in step {
            *self.sums.entry(key.clone()).or_insert(0.0) += value;
        }
        self.last = step.clone();
        self.batches += 1;
    }

    fn latest(&self) -> &BTreeMap<String, f64> {
        &self.last
    }

    fn finish(self) -> BTreeMap<String, f64> {
        let n = self.batches.max(1) as f64;
        self.sums.into_iter().map(|(k, v)| (k, v / n)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::shard::ShardData;
    use crate::domain::ModelRole;
    use crate::ml::models::ModelRegistry;
    use burn::optim::AdamConfig;
    use ndarray::{Array1, Array5};
    use std::path::Path;

    type B = burn::backend::Autodiff<burn::backend::NdArray>;

    fn write_toy_shard(path: &Path, n: usize) -> Vocab {
        let words = ["red", "green", "blue", "gray"];
        let mut imgs = Array5::<f32>::zeros((n, 3, 3, 64, 64));
        let mut labels = Array1::<i64>::zeros(n);
        let mut langs = Vec::with_capacity(n);
        for i in 0..n {
            labels[i] = (i % 3) as i64;
            langs.push(format!("{} shape", words[i % 4]));
            for img in 0..3 {
                for c in 0..3 {
                    for y in 0..64 {
                        for x in 0..64 {
                            imgs[[i, img, c, y, x]] =
                                ((i * 7 + img * 3 + c) as f32 * 0.11).sin();
                        }
                    }
                }
            }
        }
        let shard = ShardData { imgs, labels, langs };
        shard.write(path).unwrap();
        Vocab::build(shard.langs.iter().map(|s| s.as_str())).unwrap()
    }

    fn listener_models(
        registry: &ModelRegistry,
        device: &<B as Backend>::Device,
    ) -> EpochModels<B> {
        EpochModels {
            speaker: None,
            variant: ModelRegistry::variant(ModelRole::Listener),
            listener: registry.listener::<B>(device),
            prior: None,
        }
    }

    /// Val/Test passes never touch a parameter: running the same
    /// evaluation twice must produce identical numbers.
    #[test]
    fn test_val_split_never_mutates_the_model() {
        <B as Backend>::seed(5);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard.npz");
        let vocab = write_toy_shard(&path, 6);
        let registry = ModelRegistry { vocab_size: vocab.len(), embed_dim: 4, hidden_dim: 6 };
        let device = Default::default();
        let opts = RunOptions { batch_size: 3, ..RunOptions::default() };
        let files = vec![path];

        let mut speaker_optim = AdamConfig::new().init();
        let mut listener_optim = AdamConfig::new().init();

        let models = listener_models(&registry, &device);
        let (models, first) = run(
            &files, Split::Val, &Policy::L0, models,
            &mut speaker_optim, &mut listener_optim, &vocab, &opts, &device,
        )
        .unwrap();
        let (_, second) = run(
            &files, Split::Val, &Policy::L0, models,
            &mut speaker_optim, &mut listener_optim, &vocab, &opts, &device,
        )
        .unwrap();

        assert_eq!(first.metrics, second.metrics);
        assert!(first.metrics.contains_key("loss"));
        assert!(first.metrics.contains_key("acc"));
    }

    /// Evaluation-only policies are rejected under the train split
    /// before any data is touched.
    #[test]
    fn test_eval_only_policies_fail_fast_in_train() {
        <B as Backend>::seed(6);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard.npz");
        let vocab = write_toy_shard(&path, 4);
        let registry = ModelRegistry { vocab_size: vocab.len(), embed_dim: 4, hidden_dim: 6 };
        let device = Default::default();
        let opts = RunOptions { batch_size: 2, ..RunOptions::default() };

        let mut speaker_optim = AdamConfig::new().init();
        let mut listener_optim = AdamConfig::new().init();
        let models = EpochModels {
            speaker: Some(registry.speaker::<B>(&device)),
            variant: ModelRegistry::variant(ModelRole::LiteralSpeaker),
            listener: registry.listener::<B>(&device),
            prior: None,
        };
        let result = run(
            &[dir.path().join("shard.npz")],
            Split::Train,
            &Policy::Sample { num_samples: 2, lmbd: 0.01 },
            models,
            &mut speaker_optim,
            &mut listener_optim,
            &vocab,
            &opts,
            &device,
        );
        assert!(result.is_err());
    }

    /// A speaker policy without a speaker is a configuration error.
    #[test]
    fn test_missing_speaker_is_rejected() {
        <B as Backend>::seed(8);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard.npz");
        let vocab = write_toy_shard(&path, 4);
        let registry = ModelRegistry { vocab_size: vocab.len(), embed_dim: 4, hidden_dim: 6 };
        let device = Default::default();
        let opts = RunOptions { batch_size: 2, ..RunOptions::default() };

        let mut speaker_optim = AdamConfig::new().init();
        let mut listener_optim = AdamConfig::new().init();
        let result = run(
            &[path],
            Split::Val,
            &Policy::S0 { lmbd: 0.01 },
            listener_models(&registry, &device),
            &mut speaker_optim,
            &mut listener_optim,
            &vocab,
            &opts,
            &device,
        );
        assert!(result.is_err());
    }

    /// One training step under the teacher-forced speaker policy
    /// actually changes the speaker's parameters.
    #[test]
    fn test_train_split_updates_the_speaker() {
        <B as Backend>::seed(9);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard.npz");
        let vocab = write_toy_shard(&path, 4);
        let registry = ModelRegistry { vocab_size: vocab.len(), embed_dim: 4, hidden_dim: 6 };
        let device = Default::default();
        let opts = RunOptions { batch_size: 2, lr: 0.01, ..RunOptions::default() };

        let speaker = registry.speaker::<B>(&device);
        let before: Vec<f32> = speaker.head.weight.val().into_data().convert::<f32>().value;

        let mut speaker_optim = AdamConfig::new().init();
        let mut listener_optim = AdamConfig::new().init();
        let models = EpochModels {
            speaker: Some(speaker),
            variant: ModelRegistry::variant(ModelRole::LiteralSpeaker),
            listener: registry.listener::<B>(&device),
            prior: None,
        };
        let (models, outcome) = run(
            &[path],
            Split::Train,
            &Policy::S0 { lmbd: 0.01 },
            models,
            &mut speaker_optim,
            &mut listener_optim,
            &vocab,
            &opts,
            &device,
        )
        .unwrap();

        let after: Vec<f32> = models
            .speaker
            .unwrap()
            .head
            .weight
            .val()
            .into_data()
            .convert::<f32>()
            .value;
        assert_ne!(before, after);
        assert!(outcome.metrics.contains_key("loss"));
        assert!(!outcome.aux.is_empty());
    }
}
