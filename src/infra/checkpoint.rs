// ============================================================
// Layer 6 — Checkpoint Manager
// ============================================================
// Saves and restores model records with burn's CompactRecorder
// (MessagePack + gzip; the recorder owns the file extension).
// Checkpoint path stems encode role and training configuration:
//
//   models/<dataset>[/generalization/<g>]/
//     literal_listener_0 .. literal_listener_N   pretraining ensemble
//     literal_speaker / conditional_speaker      frozen-listener phases
//     reinforce_speaker                          multinomial activation
//     amortized_speaker_{length,bayes,map,noprior}
//     language_model                             external prior
//     train_config.json                          run configuration
//
// A stem is written by exactly one phase and read-only afterward.
//
// Reference: Burn Book §5 (Records and Checkpointing)

use anyhow::{Context, Result};
use burn::{
    module::Module,
    prelude::*,
    record::{CompactRecorder, Recorder},
};
use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::data::corpus::model_dir;
use crate::domain::{Activation, DatasetKind, Penalty};

pub const LITERAL_SPEAKER: &str = "literal_speaker";
pub const CONDITIONAL_SPEAKER: &str = "conditional_speaker";
pub const LANGUAGE_MODEL: &str = "language_model";

/// Stem for ensemble member `i` of the pretrained listeners.
pub fn listener_stem(i: usize) -> String {
    format!("literal_listener_{i}")
}

/// Output stem for the amortized phase, priority ordered: the
/// reinforcement-trained variant wins over penalty-keyed ones.
pub fn amortized_stem(activation: Option<Activation>, penalty: Option<Penalty>) -> &'static str {
    match (activation, penalty) {
        (Some(Activation::Multinomial), _) => "reinforce_speaker",
        (None, Some(Penalty::Length)) => "amortized_speaker_length",
        (None, Some(Penalty::Bayes)) => "amortized_speaker_bayes",
        (None, Some(Penalty::Map)) => "amortized_speaker_map",
        (None, None) => "amortized_speaker_noprior",
    }
}

/// Manages every persisted model of one (dataset, generalization)
/// configuration.
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(
        model_root: &Path,
        dataset: DatasetKind,
        generalization: Option<&str>,
    ) -> Self {
        let dir = model_dir(model_root, dataset, generalization);
        fs::create_dir_all(&dir).ok();
        Self { dir }
    }

    /// Directory-only constructor for tests and tooling.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        fs::create_dir_all(&dir).ok();
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn stem_path(&self, stem: &str) -> PathBuf {
        self.dir.join(stem)
    }

    /// Persist a model record under `stem`.
    pub fn save<B: Backend, M: Module<B>>(&self, model: &M, stem: &str) -> Result<()> {
        let path = self.stem_path(stem);
        CompactRecorder::new()
            .record(model.clone().into_record(), path.clone())
            .with_context(|| format!("Failed to save checkpoint '{}'", path.display()))?;
        tracing::debug!("Saved checkpoint '{}'", path.display());
        Ok(())
    }

    /// Load the record saved under `stem` into `model`. The model
    /// must have the architecture the checkpoint was saved with.
    pub fn load<B: Backend, M: Module<B>>(
        &self,
        model: M,
        stem: &str,
        device: &B::Device,
    ) -> Result<M> {
        let path = self.stem_path(stem);
        let record = CompactRecorder::new()
            .load(path.clone(), device)
            .with_context(|| {
                format!(
                    "Cannot load checkpoint '{}'. Has the producing phase been run?",
                    path.display()
                )
            })?;
        Ok(model.load_record(record))
    }

    /// Persist under `stem`, falling back to a randomized numeric
    /// stem if the first attempt fails — a trained model is never
    /// discarded over one bad write. Returns the stem actually used.
    pub fn save_with_fallback<B: Backend, M: Module<B>>(
        &self,
        model: &M,
        stem: &str,
    ) -> Result<String> {
        match self.save(model, stem) {
            Ok(()) => Ok(stem.to_string()),
            Err(err) => {
                let fallback = rand::thread_rng().gen_range(0..1000).to_string();
                tracing::warn!(
                    "Saving checkpoint '{stem}' failed ({err:#}); retrying as '{fallback}'"
                );
                self.save(model, &fallback)?;
                Ok(fallback)
            }
        }
    }

    /// Persist the run configuration beside the checkpoints so a
    /// run is reproducible from its artifacts.
    pub fn save_config<C: Serialize>(&self, config: &C) -> Result<()> {
        let path = self.dir.join("train_config.json");
        let json = serde_json::to_string_pretty(config)?;
        fs::write(&path, json)
            .with_context(|| format!("Cannot write config to '{}'", path.display()))?;
        Ok(())
    }

    pub fn load_config<C: DeserializeOwned>(&self) -> Result<C> {
        let path = self.dir.join("train_config.json");
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Cannot read config from '{}'", path.display()))?;
        Ok(serde_json::from_str(&json)?)
    }
}
