// ============================================================
// Layer 5 — Machine Learning
// ============================================================
// Model roles, the vision/recurrent building blocks they share,
// and the epoch runner that drives them.

pub mod models;
pub mod rnn;
pub mod runner;
pub mod vision;
