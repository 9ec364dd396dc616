// ============================================================
// Layer 2 — Evaluation Harness
// ============================================================
// Loads a battery of trained checkpoints and runs each against
// held-out data under the test split. Battery entries are
// independent: a checkpoint that fails to load is reported as an
// error for that entry and the remaining entries still run.
//
// The default battery mirrors the published comparison: literal
// listener, language model, literal speaker (sample-and-rerank),
// and the amortized variants by penalty.

use anyhow::{Context, Result};
use burn::{optim::AdamConfig, tensor::backend::AutodiffBackend};
use std::collections::BTreeMap;

use crate::application::train_use_case::TrainConfig;
use crate::data::corpus::Corpus;
use crate::domain::{ModelRole, Penalty, Split};
use crate::infra::checkpoint::{
    listener_stem, CheckpointManager, LANGUAGE_MODEL, LITERAL_SPEAKER,
};
use crate::infra::vocab::{Vocab, VocabStore};
use crate::ml::models::ModelRegistry;
use crate::ml::runner::{run, EpochModels, Policy, RunOptions};

/// What to evaluate and how.
#[derive(Debug, Clone)]
pub enum EvalKind {
    /// Listener comprehension of gold utterances (`l0`).
    Listener { stem: String },
    /// Gold utterances scored under the prior (`language_model`).
    LanguageModel,
    /// Speaker sample-and-rerank through the val listener.
    SampleSpeaker { stem: String, num_samples: usize },
    /// Amortized speaker rollout under a penalty.
    AmortizedSpeaker { stem: String, penalty: Option<Penalty> },
}

#[derive(Debug, Clone)]
pub struct EvalTarget {
    pub name: String,
    pub kind: EvalKind,
}

/// Per-entry outcome: metrics, or the load/run error.
pub struct EvalReport {
    pub name: String,
    pub result: Result<BTreeMap<String, f64>, String>,
}

pub struct EvalUseCase {
    config: TrainConfig,
}

impl EvalUseCase {
    pub fn new(config: TrainConfig) -> Self {
        Self { config }
    }

    /// The standard comparison battery.
    pub fn default_battery() -> Vec<EvalTarget> {
        let target = |name: &str, kind: EvalKind| EvalTarget { name: name.into(), kind };
        vec![
            target("literal_listener", EvalKind::Listener { stem: listener_stem(0) }),
            target("language_model", EvalKind::LanguageModel),
            target(
                "literal_speaker",
                EvalKind::SampleSpeaker { stem: LITERAL_SPEAKER.into(), num_samples: 1 },
            ),
            target(
                "amortized_speaker_length",
                EvalKind::AmortizedSpeaker {
                    stem: "amortized_speaker_length".into(),
                    penalty: Some(Penalty::Length),
                },
            ),
            target(
                "amortized_speaker_bayes",
                EvalKind::AmortizedSpeaker {
                    stem: "amortized_speaker_bayes".into(),
                    penalty: Some(Penalty::Bayes),
                },
            ),
            target(
                "amortized_speaker_map",
                EvalKind::AmortizedSpeaker {
                    stem: "amortized_speaker_map".into(),
                    penalty: Some(Penalty::Map),
                },
            ),
        ]
    }

    pub fn execute<B: AutodiffBackend>(&self, device: B::Device) -> Result<Vec<EvalReport>> {
        self.execute_battery::<B>(&Self::default_battery(), device)
    }

    pub fn execute_battery<B: AutodiffBackend>(
        &self,
        battery: &[EvalTarget],
        device: B::Device,
    ) -> Result<Vec<EvalReport>> {
        let cfg = &self.config;
        let corpus = Corpus::new(&cfg.data_root, cfg.dataset, cfg.generalization.as_deref());
        let ckpt = CheckpointManager::new(
            &cfg.model_root,
            cfg.dataset,
            cfg.generalization.as_deref(),
        );
        let vocab = VocabStore::new(cfg.model_root.join(cfg.dataset.dir_name()))
            .load()
            .context("Evaluation requires the persisted vocabulary")?;
        let registry = ModelRegistry::new(vocab.len());
        let opts = RunOptions {
            batch_size: cfg.batch_size,
            lr: cfg.lr,
            debug: cfg.debug,
            ..RunOptions::default()
        };

        let mut reports = Vec::with_capacity(battery.len());
        for target in battery {
            let result = self
                .eval_target::<B>(target, &corpus, &ckpt, &registry, &vocab, &opts, &device);
            match &result {
                Ok(metrics) => {
                    println!("{}", target.name);
                    println!("{metrics:?}");
                }
                Err(err) => {
                    tracing::warn!("Skipping '{}': {err:#}", target.name);
                }
            }
            reports.push(EvalReport {
                name: target.name.clone(),
                result: result.map_err(|e| format!("{e:#}")),
            });
        }
        Ok(reports)
    }

    #[allow(clippy::too_many_arguments)]
    fn eval_target<B: AutodiffBackend>(
        &self,
        target: &EvalTarget,
        corpus: &Corpus,
        ckpt: &CheckpointManager,
        registry: &ModelRegistry,
        vocab: &Vocab,
        opts: &RunOptions,
        device: &B::Device,
    ) -> Result<BTreeMap<String, f64>> {
        let cfg = &self.config;
        // Speaker-scoring entries use the second ensemble member so
        // evaluation never shares a listener with training.
        let val_listener = || ckpt.load(registry.listener::<B>(device), &listener_stem(1), device);

        let (models, policy) = match &target.kind {
            EvalKind::Listener { stem } => {
                let listener = ckpt.load(registry.listener::<B>(device), stem, device)?;
                let models = EpochModels {
                    speaker: None,
                    variant: ModelRegistry::variant(ModelRole::Listener),
                    listener,
                    prior: None,
                };
                (models, Policy::L0)
            }
            EvalKind::LanguageModel => {
                let base = CheckpointManager::new(&cfg.model_root, cfg.dataset, None);
                let prior =
                    base.load(registry.language_model::<B>(device), LANGUAGE_MODEL, device)?;
                let models = EpochModels {
                    speaker: None,
                    variant: ModelRegistry::variant(ModelRole::Listener),
                    listener: val_listener()?,
                    prior: Some(prior),
                };
                (models, Policy::LanguageModel { lmbd: cfg.lmbd })
            }
            EvalKind::SampleSpeaker { stem, num_samples } => {
                let speaker = ckpt.load(registry.speaker::<B>(device), stem, device)?;
                let models = EpochModels {
                    speaker: Some(speaker),
                    variant: ModelRegistry::variant(ModelRole::LiteralSpeaker),
                    listener: val_listener()?,
                    prior: None,
                };
                (models, Policy::Sample { num_samples: *num_samples, lmbd: cfg.lmbd })
            }
            EvalKind::AmortizedSpeaker { stem, penalty } => {
                let speaker = ckpt.load(registry.speaker::<B>(device), stem, device)?;
                let prior = match penalty {
                    Some(Penalty::Bayes) | Some(Penalty::Map) => {
                        let base = CheckpointManager::new(&cfg.model_root, cfg.dataset, None);
                        Some(base.load(
                            registry.language_model::<B>(device),
                            LANGUAGE_MODEL,
                            device,
                        )?)
                    }
                    _ => None,
                };
                let models = EpochModels {
                    speaker: Some(speaker),
                    variant: ModelRegistry::variant(ModelRole::AmortizedSpeaker),
                    listener: val_listener()?,
                    prior,
                };
                let policy = Policy::Amortized {
                    penalty: *penalty,
                    activation: cfg.activation,
                    tau: cfg.tau,
                    lmbd: cfg.lmbd,
                };
                (models, policy)
            }
        };

        // Dummy optimizers: the test split never steps them.
        let mut speaker_optim = AdamConfig::new().init();
        let mut listener_optim = AdamConfig::new().init();
        let (_, outcome) = run(
            &corpus.val,
            Split::Test,
            &policy,
            models,
            &mut speaker_optim,
            &mut listener_optim,
            vocab,
            opts,
            device,
        )?;
        Ok(outcome.metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::shard::ShardData;
    use crate::domain::DatasetKind;
    use burn::prelude::*;
    use ndarray::{Array1, Array5};

    type B = burn::backend::Autodiff<burn::backend::NdArray>;

    fn toy_shard(n: usize) -> ShardData {
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
                                ((i + img) as f32 * 0.2 + (c as f32) * 0.05).cos();
                        }
                    }
                }
            }
        }
        ShardData { imgs, labels, langs }
    }

    /// Five stub checkpoints in, five metric reports out — each
    /// with `loss` and `acc`, none crashing the harness.
    #[test]
    fn test_eval_battery_over_stub_checkpoints() {
        <B as Backend>::seed(11);
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();

        // Held-out shard where the corpus layout expects it.
        let data_root = dir.path().join("data");
        for i in 65..70 {
            toy_shard(6)
                .write(&data_root.join("shapeworld").join(format!("reference-1000-{i}.npz")))
                .unwrap();
        }

        // Vocabulary + five stub checkpoints.
        let model_root = dir.path().join("models");
        let vocab = Vocab::build(["red green blue gray shape"].iter().copied()).unwrap();
        VocabStore::new(model_root.join("shapeworld")).save(&vocab).unwrap();
        let registry = ModelRegistry::new(vocab.len());
        let ckpt = CheckpointManager::new(&model_root, DatasetKind::Shapeworld, None);
        ckpt.save(&registry.listener::<B>(&device), &listener_stem(0)).unwrap();
        ckpt.save(&registry.listener::<B>(&device), &listener_stem(1)).unwrap();
        ckpt.save(&registry.language_model::<B>(&device), LANGUAGE_MODEL).unwrap();
        ckpt.save(&registry.speaker::<B>(&device), LITERAL_SPEAKER).unwrap();
        ckpt.save(&registry.speaker::<B>(&device), "amortized_speaker_length").unwrap();

        let config = TrainConfig {
            batch_size: 3,
            data_root,
            model_root,
            ..TrainConfig::default()
        };
        let battery = vec![
            EvalTarget {
                name: "literal_listener_0".into(),
                kind: EvalKind::Listener { stem: listener_stem(0) },
            },
            EvalTarget {
                name: "literal_listener_1".into(),
                kind: EvalKind::Listener { stem: listener_stem(1) },
            },
            EvalTarget { name: "language_model".into(), kind: EvalKind::LanguageModel },
            EvalTarget {
                name: "literal_speaker".into(),
                kind: EvalKind::SampleSpeaker {
                    stem: LITERAL_SPEAKER.into(),
                    num_samples: 1,
                },
            },
            EvalTarget {
                name: "amortized_speaker_length".into(),
                kind: EvalKind::AmortizedSpeaker {
                    stem: "amortized_speaker_length".into(),
                    penalty: Some(Penalty::Length),
                },
            },
        ];

        let reports = EvalUseCase::new(config)
            .execute_battery::<B>(&battery, device)
            .unwrap();
        assert_eq!(reports.len(), 5);
        for report in &reports {
            let metrics = report.result.as_ref().unwrap_or_else(|e| {
                panic!("entry '{}' failed: {e}", report.name);
            });
            assert!(metrics.contains_key("loss"), "'{}' lacks loss", report.name);
            assert!(metrics.contains_key("acc"), "'{}' lacks acc", report.name);
        }
    }

    /// One broken entry must not block the rest of the battery.
    #[test]
    fn test_missing_checkpoint_does_not_block_battery() {
        <B as Backend>::seed(13);
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();

        let data_root = dir.path().join("data");
        for i in 65..70 {
            toy_shard(4)
                .write(&data_root.join("shapeworld").join(format!("reference-1000-{i}.npz")))
                .unwrap();
        }
        let model_root = dir.path().join("models");
        let vocab = Vocab::build(["red green blue gray shape"].iter().copied()).unwrap();
        VocabStore::new(model_root.join("shapeworld")).save(&vocab).unwrap();
        let registry = ModelRegistry::new(vocab.len());
        let ckpt = CheckpointManager::new(&model_root, DatasetKind::Shapeworld, None);
        ckpt.save(&registry.listener::<B>(&device), &listener_stem(0)).unwrap();

        let config = TrainConfig {
            batch_size: 2,
            data_root,
            model_root,
            ..TrainConfig::default()
        };
        let battery = vec![
            EvalTarget {
                name: "missing_speaker".into(),
                kind: EvalKind::SampleSpeaker { stem: "never_trained".into(), num_samples: 1 },
            },
            EvalTarget {
                name: "literal_listener".into(),
                kind: EvalKind::Listener { stem: listener_stem(0) },
            },
        ];

        let reports = EvalUseCase::new(config)
            .execute_battery::<B>(&battery, device)
            .unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports[0].result.is_err());
        assert!(reports[1].result.is_ok());
    }
}
