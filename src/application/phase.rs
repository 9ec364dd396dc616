// ============================================================
// Layer 2 — Training Phase Record
// ============================================================
// Per-phase mutable bookkeeping: the ordered metric history
// (train_*/val_* series), the best-so-far scalars, and the
// flattened snapshot row the metrics CSV consumes each epoch.
//
// The best-model snapshot itself is NOT held here — the phase
// loop keeps it in an `Option<M>` slot and replaces the value
// whenever `record_epoch` reports an improvement, so the
// snapshot stays an immutable value rather than a mutated
// global.
//
// Best rule: strictly greater validation accuracy wins, so on a
// tie the earlier epoch's snapshot is kept.

use std::collections::BTreeMap;

use crate::infra::metrics::MetricRow;

pub struct PhaseRecord {
    history: BTreeMap<String, Vec<f64>>,
    pub best_acc: f64,
    pub best_loss: f64,
    pub best_epoch: usize,
    pub current_epoch: usize,
}

impl PhaseRecord {
    pub fn new() -> Self {
        Self {
            history: BTreeMap::new(),
            best_acc: 0.0,
            best_loss: f64::INFINITY,
            best_epoch: 0,
            current_epoch: 0,
        }
    }

    /// Fold one epoch's train and validation metrics into the
    /// history. Returns true when this epoch is a new best.
    pub fn record_epoch(
        &mut self,
        epoch: usize,
        train: &BTreeMap<String, f64>,
        val: &BTreeMap<String, f64>,
    ) -> bool {
        for (key, value) in train {
            self.history.entry(format!("train_{key}")).or_default().push(*value);
        }
        for (key, value) in val {
            self.history.entry(format!("val_{key}")).or_default().push(*value);
        }
        self.current_epoch = epoch;

        let val_acc = val.get("acc").copied().unwrap_or(0.0);
        let is_best = val_acc > self.best_acc;
        if is_best {
            self.best_acc = val_acc;
            self.best_loss = val.get("loss").copied().unwrap_or(f64::INFINITY);
            self.best_epoch = epoch;
        }
        is_best
    }

    /// Flattened snapshot: last value of each series plus the
    /// best_*/current_epoch scalars. One of these per epoch is
    /// what lands in the metrics CSV.
    pub fn flattened(&self) -> MetricRow {
        let mut row: MetricRow = self
            .history
            .iter()
            .filter_map(|(key, series)| series.last().map(|v| (key.clone(), *v)))
            .collect();
        row.insert("best_acc".into(), self.best_acc);
        row.insert("best_loss".into(), self.best_loss);
        row.insert("best_epoch".into(), self.best_epoch as f64);
        row.insert("current_epoch".into(), self.current_epoch as f64);
        row
    }
}

impl Default for PhaseRecord {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(loss: f64, acc: f64) -> BTreeMap<String, f64> {
        BTreeMap::from([("loss".to_string(), loss), ("acc".to_string(), acc)])
    }

    #[test]
    fn test_best_is_max_of_val_acc() {
        let mut record = PhaseRecord::new();
        let accs = [0.2, 0.6, 0.4, 0.9, 0.7];
        for (epoch, &acc) in accs.iter().enumerate() {
            record.record_epoch(epoch, &metrics(1.0, 0.0), &metrics(1.0, acc));
        }
        assert_eq!(record.best_acc, 0.9);
        assert_eq!(record.best_epoch, 3);
    }

    #[test]
    fn test_tie_keeps_earlier_epoch() {
        let mut record = PhaseRecord::new();
        assert!(record.record_epoch(0, &metrics(1.0, 0.0), &metrics(0.8, 0.5)));
        // same accuracy, strictly-greater rule: no replacement
        assert!(!record.record_epoch(1, &metrics(1.0, 0.0), &metrics(0.2, 0.5)));
        assert_eq!(record.best_epoch, 0);
        assert_eq!(record.best_loss, 0.8);
    }

    #[test]
    fn test_flattened_has_last_values_and_best() {
        let mut record = PhaseRecord::new();
        record.record_epoch(0, &metrics(2.0, 0.1), &metrics(1.5, 0.3));
        record.record_epoch(1, &metrics(1.0, 0.2), &metrics(1.2, 0.6));

        let row = record.flattened();
        assert_eq!(row["train_loss"], 1.0);
        assert_eq!(row["val_acc"], 0.6);
        assert_eq!(row["best_acc"], 0.6);
        assert_eq!(row["best_epoch"], 1.0);
        assert_eq!(row["current_epoch"], 1.0);
    }
}
