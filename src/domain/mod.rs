// ============================================================
// Layer 3 — Domain Types
// ============================================================
// Closed vocabularies for every run-level choice: datasets,
// training modes, policies, penalties, sampling activations.
// Keeping these as enums means an invalid combination is
// unrepresentable instead of being a typo discovered three
// epochs into a run.

pub mod options;

pub use options::{Activation, DatasetKind, ModelRole, Penalty, Split, TrainMode};
