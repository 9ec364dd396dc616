// ============================================================
// Layer 3 — Run Options
// ============================================================
// Every selectable knob of a training or evaluation run, as a
// closed enum. clap's ValueEnum derive handles the CLI string
// forms; serde handles the persisted train_config.json.
//
// Reference: Frank & Goodman (2012), Rational Speech Acts

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which reference-game corpus to train on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Shapeworld,
    Colors,
}

impl DatasetKind {
    /// Directory name under the data and model roots.
    pub fn dir_name(&self) -> &'static str {
        match self {
            DatasetKind::Shapeworld => "shapeworld",
            DatasetKind::Colors     => "colors",
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Exactly one of these is selected per invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainMode {
    /// Pretrain the literal-listener ensemble (`--l0`).
    Listener,
    /// Train the literal speaker against a frozen listener (`--s0`).
    LiteralSpeaker,
    /// Train the conditional (marginal) speaker (`--sc`).
    ConditionalSpeaker,
    /// Refine the amortized speaker from a literal warm start (`--amortized`).
    AmortizedSpeaker,
    /// Evaluate the full checkpoint battery (`--eval_only`).
    EvalOnly,
}

impl fmt::Display for TrainMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrainMode::Listener           => "l0",
            TrainMode::LiteralSpeaker     => "s0",
            TrainMode::ConditionalSpeaker => "sc",
            TrainMode::AmortizedSpeaker   => "amortized",
            TrainMode::EvalOnly           => "eval_only",
        };
        f.write_str(name)
    }
}

/// Data split a pass runs over. Gradients flow in `Train` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub fn is_train(&self) -> bool {
        matches!(self, Split::Train)
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Split::Train => "train",
            Split::Val   => "val",
            Split::Test  => "test",
        };
        f.write_str(name)
    }
}

/// Regularizer added to the amortized speaker's task loss.
/// `None` (the absent case) trains on listener success alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Penalty {
    /// Utterance-length cost: shorter messages are cheaper.
    Length,
    /// Full posterior cost: prior NLL of the produced utterance.
    Bayes,
    /// MAP cost: prior NLL of the greedy (argmax) utterance.
    Map,
}

impl fmt::Display for Penalty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Penalty::Length => "length",
            Penalty::Bayes  => "bayes",
            Penalty::Map    => "map",
        };
        f.write_str(name)
    }
}

/// Sampling strategy for the amortized speaker's rollout.
/// `Multinomial` switches the gradient to a score-function
/// (REINFORCE) estimator; without it the rollout is greedy and
/// the loss flows through a differentiable relaxation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Multinomial,
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("multinomial")
    }
}

/// The four model roles the registry can construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelRole {
    Listener,
    LiteralSpeaker,
    ConditionalSpeaker,
    AmortizedSpeaker,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_dir_names() {
        assert_eq!(DatasetKind::Shapeworld.dir_name(), "shapeworld");
        assert_eq!(DatasetKind::Colors.dir_name(), "colors");
    }

    #[test]
    fn test_split_train_flag() {
        assert!(Split::Train.is_train());
        assert!(!Split::Val.is_train());
        assert!(!Split::Test.is_train());
    }
}
