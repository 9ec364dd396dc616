// ============================================================
// Layer 2 — Application Use Cases
// ============================================================
// The training orchestrator and the evaluation harness. The CLI
// routes here; everything below this layer is policy-free
// machinery.

pub mod eval_use_case;
pub mod phase;
pub mod train_use_case;
