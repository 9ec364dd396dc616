// ============================================================
// Layer 6 — Metrics Logger
// ============================================================
// One flattened row per completed epoch, rewritten to the CSV in
// full after every append. The rewrite is what makes training
// crash-safe: whatever epoch the run died in, every completed
// epoch is already on disk.
//
// Columns are the sorted union of all metric keys seen so far;
// rows missing a key leave the cell blank. Phases contribute
// different key sets (train_*/val_* series plus the best_*
// scalars), so the union grows as training proceeds.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

pub type MetricRow = BTreeMap<String, f64>;

pub struct MetricsLogger {
    path: PathBuf,
    rows: Vec<MetricRow>,
}

impl MetricsLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), rows: Vec::new() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Append one epoch's flattened snapshot and rewrite the file.
    pub fn append(&mut self, row: MetricRow) -> Result<()> {
        self.rows.push(row);
        self.flush()
    }

    /// Serialize the whole table — fresh overwrite, not append.
    pub fn flush(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).ok();
            }
        }

        let columns: BTreeSet<&String> = self.rows.iter().flat_map(|r| r.keys()).collect();
        let mut out = String::new();
        out.push_str(
            &columns.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(","),
        );
        out.push('\n');
        for row in &self.rows {
            let cells: Vec<String> = columns
                .iter()
                .map(|&col| match row.get(col) {
                    Some(value) => format!("{value:.6}"),
                    None => String::new(),
                })
                .collect();
            out.push_str(&cells.join(","));
            out.push('\n');
        }

        fs::write(&self.path, out)
            .with_context(|| format!("Cannot write metrics to '{}'", self.path.display()))?;
        tracing::debug!(
            "Flushed {} metric rows to '{}'",
            self.rows.len(),
            self.path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, f64)]) -> MetricRow {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_one_row_per_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.csv");
        let mut logger = MetricsLogger::new(&path);

        for epoch in 0..3 {
            logger
                .append(row(&[("current_epoch", epoch as f64), ("val_acc", 0.5)]))
                .unwrap();
        }

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        // header + one row per completed epoch
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "current_epoch,val_acc");
    }

    #[test]
    fn test_columns_are_the_union_of_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.csv");
        let mut logger = MetricsLogger::new(&path);

        logger.append(row(&[("train_loss", 1.0)])).unwrap();
        logger.append(row(&[("train_loss", 0.5), ("val_acc", 0.25)])).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "train_loss,val_acc");
        // first row has no val_acc — blank cell, not a stale value
        assert_eq!(lines[1], "1.000000,");
        assert_eq!(lines[2], "0.500000,0.250000");
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.csv");
        let mut logger = MetricsLogger::new(&path);
        logger.append(row(&[("val_acc", 0.1)])).unwrap();
        let first = fs::read_to_string(&path).unwrap();
        logger.flush().unwrap();
        let second = fs::read_to_string(&path).unwrap();
        assert_eq!(first, second);
    }
}
