// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// Flag surface of the trainer. Exactly one training mode must be
// selected per invocation:
//
//   --l0         pretrain the literal-listener ensemble
//   --s0         train the literal speaker
//   --sc         train the conditional speaker
//   --amortized  train the amortized speaker
//   --eval_only  evaluate the checkpoint battery
//
// The CLI only parses and routes: it resolves the mode, applies
// the learning-rate defaulting rule, picks the backend (--cuda
// selects Wgpu, NdArray otherwise), and hands a TrainConfig to
// Layer 2.

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;

use crate::application::eval_use_case::EvalUseCase;
use crate::application::train_use_case::{TrainConfig, TrainUseCase};
use crate::domain::{Activation, DatasetKind, Penalty, TrainMode};

/// Learning-rate defaults: listener pretraining converges best an
/// order of magnitude slower than the speaker phases.
const DEFAULT_LISTENER_LR: f64 = 0.0001;
const DEFAULT_LR: f64 = 0.001;

#[derive(Parser, Debug)]
#[command(
    name = "refgame-rsa",
    version = "0.1.0",
    about = "Train and evaluate pragmatic speaker/listener models on reference games."
)]
pub struct Cli {
    /// Which dataset to use
    #[arg(long, value_enum, default_value = "shapeworld")]
    pub dataset: DatasetKind,

    /// Pretrain the literal-listener ensemble
    #[arg(long)]
    pub l0: bool,

    /// Train the literal speaker
    #[arg(long)]
    pub s0: bool,

    /// Train the conditional speaker
    #[arg(long)]
    pub sc: bool,

    /// Train the amortized speaker
    #[arg(long)]
    pub amortized: bool,

    /// Evaluate all trained models
    #[arg(long = "eval_only")]
    pub eval_only: bool,

    /// Learning rate (defaults to 0.0001 for --l0, 0.001 otherwise)
    #[arg(long)]
    pub lr: Option<f64>,

    #[arg(long, default_value_t = 100)]
    pub epochs: usize,

    #[arg(long = "batch_size", default_value_t = 32)]
    pub batch_size: usize,

    /// Softmax temperature for speaker rollouts
    #[arg(long, default_value_t = 1.0)]
    pub tau: f64,

    /// Cost-function weight
    #[arg(long, default_value_t = 0.01)]
    pub lmbd: f64,

    /// Sampling activation for the amortized speaker
    #[arg(long, value_enum)]
    pub activation: Option<Activation>,

    /// Cost function (length, bayes, map)
    #[arg(long, value_enum)]
    pub penalty: Option<Penalty>,

    /// Generalization split selector (shapeworld only)
    #[arg(long)]
    pub generalization: Option<String>,

    /// Generate a new vocab file
    #[arg(long)]
    pub vocab: bool,

    /// Run on the accelerated (Wgpu) backend
    #[arg(long)]
    pub cuda: bool,

    /// Print metrics on every epoch
    #[arg(long)]
    pub debug: bool,

    /// Where to save metrics
    #[arg(long, default_value = "metrics.csv")]
    pub save: PathBuf,

    /// Root directory of the shard files
    #[arg(long = "data_root", default_value = "./data")]
    pub data_root: PathBuf,

    /// Root directory for checkpoints and the vocabulary
    #[arg(long = "model_root", default_value = "./models")]
    pub model_root: PathBuf,
}

impl Cli {
    pub fn run(self) -> Result<()> {
        let cuda = self.cuda;
        let config = self.into_config()?;
        tracing::info!(
            "mode {} on dataset {} (epochs {}, lr {})",
            config.mode,
            config.dataset,
            config.epochs,
            config.lr
        );

        if config.mode == TrainMode::EvalOnly {
            if cuda {
                let device = burn::backend::wgpu::WgpuDevice::default();
                EvalUseCase::new(config)
                    .execute::<burn::backend::Autodiff<burn::backend::Wgpu>>(device)?;
            } else {
                let device = burn::backend::ndarray::NdArrayDevice::default();
                EvalUseCase::new(config)
                    .execute::<burn::backend::Autodiff<burn::backend::NdArray>>(device)?;
            }
            return Ok(());
        }

        let save = config.save.clone();
        if cuda {
            let device = burn::backend::wgpu::WgpuDevice::default();
            TrainUseCase::new(config)
                .execute::<burn::backend::Autodiff<burn::backend::Wgpu>>(device)?;
        } else {
            let device = burn::backend::ndarray::NdArrayDevice::default();
            TrainUseCase::new(config)
                .execute::<burn::backend::Autodiff<burn::backend::NdArray>>(device)?;
        }
        println!("Training complete. Metrics written to '{}'.", save.display());
        Ok(())
    }

    /// Resolve the exactly-one-mode rule and the lr default, then
    /// build the application-layer config. The application layer
    /// never sees clap types.
    pub fn into_config(self) -> Result<TrainConfig> {
        let mode = self.mode()?;
        let lr = self.lr.unwrap_or(match mode {
            TrainMode::Listener => DEFAULT_LISTENER_LR,
            _ => DEFAULT_LR,
        });
        Ok(TrainConfig {
            dataset: self.dataset,
            mode,
            epochs: self.epochs,
            batch_size: self.batch_size,
            lr,
            tau: self.tau,
            lmbd: self.lmbd,
            activation: self.activation,
            penalty: self.penalty,
            generalization: self.generalization,
            rebuild_vocab: self.vocab,
            debug: self.debug,
            save: self.save,
            data_root: self.data_root,
            model_root: self.model_root,
        })
    }

    fn mode(&self) -> Result<TrainMode> {
        let selected: Vec<TrainMode> = [
            (self.l0, TrainMode::Listener),
            (self.s0, TrainMode::LiteralSpeaker),
            (self.sc, TrainMode::ConditionalSpeaker),
            (self.amortized, TrainMode::AmortizedSpeaker),
            (self.eval_only, TrainMode::EvalOnly),
        ]
        .into_iter()
        .filter_map(|(flag, mode)| flag.then_some(mode))
        .collect();

        match selected.as_slice() {
            [mode] => Ok(*mode),
            [] => bail!(
                "No training mode selected; pass exactly one of \
                 --l0, --s0, --sc, --amortized, --eval_only"
            ),
            _ => bail!("Multiple training modes selected; pass exactly one"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("refgame-rsa").chain(args.iter().copied()))
    }

    #[test]
    fn test_exactly_one_mode_is_required() {
        assert!(parse(&[]).into_config().is_err());
        assert!(parse(&["--l0", "--s0"]).into_config().is_err());
        let config = parse(&["--s0"]).into_config().unwrap();
        assert_eq!(config.mode, TrainMode::LiteralSpeaker);
    }

    #[test]
    fn test_lr_defaulting_rule() {
        let l0 = parse(&["--l0"]).into_config().unwrap();
        assert_eq!(l0.lr, 0.0001);
        let s0 = parse(&["--s0"]).into_config().unwrap();
        assert_eq!(s0.lr, 0.001);
        let explicit = parse(&["--l0", "--lr", "0.05"]).into_config().unwrap();
        assert_eq!(explicit.lr, 0.05);
    }

    #[test]
    fn test_amortized_options_parse() {
        let config = parse(&[
            "--amortized",
            "--penalty", "length",
            "--activation", "multinomial",
            "--tau", "2.0",
        ])
        .into_config()
        .unwrap();
        assert_eq!(config.penalty, Some(Penalty::Length));
        assert_eq!(config.activation, Some(Activation::Multinomial));
        assert_eq!(config.tau, 2.0);
    }

    #[test]
    fn test_underscore_flag_spellings() {
        let config = parse(&["--eval_only", "--batch_size", "16"])
            .into_config()
            .unwrap();
        assert_eq!(config.mode, TrainMode::EvalOnly);
        assert_eq!(config.batch_size, 16);
    }

    #[test]
    fn test_unknown_dataset_is_rejected() {
        let result = Cli::try_parse_from(["refgame-rsa", "--l0", "--dataset", "birds"]);
        assert!(result.is_err());
    }
}
