// ============================================================
// Layer 4 — Data Access
// ============================================================
// Everything between shard files on disk and tensors on the
// device: archive parsing, corpus layout, dataset and batcher.

pub mod batcher;
pub mod corpus;
pub mod dataset;
pub mod shard;
