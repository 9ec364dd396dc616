// ============================================================
// Layer 4 — Shard Archives
// ============================================================
// One shard = one file-backed unit of a dataset split, stored as
// a zip archive in the `.npz` layout:
//
//   reference-1000-0.npz
//     ├── imgs.npy    f32 [N, n_img, 3, 64, 64]  image sets
//     ├── labels.npy  i64 [N]                    target indices
//     └── langs.json  [String; N]                gold utterances
//
// Numeric entries are plain `.npy` arrays (ndarray-npy); the
// utterance entry rides as JSON because the npy format has no
// portable string dtype.
//
// Malformed shards (missing entries, mismatched lengths) are not
// recovered here — the error propagates to the caller.

use anyhow::{bail, Context, Result};
use ndarray::{Array1, Array5, Axis};
use ndarray_npy::{ReadNpyExt, WriteNpyExt};
use std::fs;
use std::path::Path;
use zip::write::FileOptions;

/// In-memory contents of one shard archive.
pub struct ShardData {
    /// Image sets — [N, n_img, channels, height, width].
    pub imgs: Array5<f32>,
    /// Target image index per sample — [N].
    pub labels: Array1<i64>,
    /// Raw gold utterance per sample — length N.
    pub langs: Vec<String>,
}

impl ShardData {
    /// Number of samples in the shard.
    pub fn len(&self) -> usize {
        self.imgs.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of images per context.
    pub fn n_imgs(&self) -> usize {
        self.imgs.shape()[1]
    }

    /// Flattened image block for sample `i` (row-major), plus its
    /// [n_img, channels, height, width] dims — the exact layout the
    /// batcher reshapes into a tensor.
    pub fn image_block(&self, i: usize) -> (Vec<f32>, [usize; 4]) {
        let view = self.imgs.index_axis(Axis(0), i);
        let dims = [
            self.imgs.shape()[1],
            self.imgs.shape()[2],
            self.imgs.shape()[3],
            self.imgs.shape()[4],
        ];
        (view.to_owned().into_raw_vec(), dims)
    }

    /// Read a shard archive from disk.
    pub fn read(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)
            .with_context(|| format!("Cannot open shard '{}'", path.display()))?;
        let mut archive = zip::ZipArchive::new(file)
            .with_context(|| format!("Shard '{}' is not a zip archive", path.display()))?;

        let imgs = {
            let entry = archive
                .by_name("imgs.npy")
                .with_context(|| format!("Shard '{}' is missing 'imgs.npy'", path.display()))?;
            Array5::<f32>::read_npy(entry)
                .with_context(|| format!("Bad 'imgs.npy' in '{}'", path.display()))?
        };
        let labels = {
            let entry = archive
                .by_name("labels.npy")
                .with_context(|| format!("Shard '{}' is missing 'labels.npy'", path.display()))?;
            Array1::<i64>::read_npy(entry)
                .with_context(|| format!("Bad 'labels.npy' in '{}'", path.display()))?
        };
        let langs: Vec<String> = {
            let entry = archive
                .by_name("langs.json")
                .with_context(|| format!("Shard '{}' is missing 'langs.json'", path.display()))?;
            serde_json::from_reader(entry)
                .with_context(|| format!("Bad 'langs.json' in '{}'", path.display()))?
        };

        let shard = Self { imgs, labels, langs };
        if shard.labels.len() != shard.len() || shard.langs.len() != shard.len() {
            bail!(
                "Shard '{}' is inconsistent: {} image sets, {} labels, {} utterances",
                path.display(),
                shard.len(),
                shard.labels.len(),
                shard.langs.len(),
            );
        }
        tracing::debug!("Loaded shard '{}' ({} samples)", path.display(), shard.len());
        Ok(shard)
    }

    /// Write a shard archive. Used by fixture generation and tests;
    /// training itself never writes shards.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).ok();
        }
        let file = fs::File::create(path)
            .with_context(|| format!("Cannot create shard '{}'", path.display()))?;
        let mut zip = zip::ZipWriter::new(file);
        let options =
            FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        zip.start_file("imgs.npy", options)?;
        self.imgs
            .write_npy(&mut zip)
            .with_context(|| "Cannot write 'imgs.npy'")?;
        zip.start_file("labels.npy", options)?;
        self.labels
            .write_npy(&mut zip)
            .with_context(|| "Cannot write 'labels.npy'")?;
        zip.start_file("langs.json", options)?;
        serde_json::to_writer(&mut zip, &self.langs)
            .with_context(|| "Cannot write 'langs.json'")?;

        zip.finish()?;
        Ok(())
    }
}

/// Read only the utterance strings from a shard — the vocabulary
/// builder scans every pretraining shard and has no use for the
/// image payload.
pub fn read_langs(path: &Path) -> Result<Vec<String>> {
    let file = fs::File::open(path)
        .with_context(|| format!("Cannot open shard '{}'", path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("Shard '{}' is not a zip archive", path.display()))?;
    let entry = archive
        .by_name("langs.json")
        .with_context(|| format!("Shard '{}' is missing 'langs.json'", path.display()))?;
    let langs = serde_json::from_reader(entry)
        .with_context(|| format!("Bad 'langs.json' in '{}'", path.display()))?;
    Ok(langs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn tiny_shard(n: usize) -> ShardData {
        let imgs = Array::from_elem((n, 3, 3, 64, 64), 0.5f32);
        let labels = Array1::from_vec((0..n as i64).map(|i| i % 3).collect());
        let langs = (0..n).map(|i| format!("red shape {i}")).collect();
        ShardData { imgs, labels, langs }
    }

    #[test]
    fn test_shard_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reference-1000-0.npz");
        let shard = tiny_shard(4);
        shard.write(&path).unwrap();

        let loaded = ShardData::read(&path).unwrap();
        assert_eq!(loaded.len(), 4);
        assert_eq!(loaded.n_imgs(), 3);
        assert_eq!(loaded.langs, shard.langs);
        assert_eq!(loaded.labels, shard.labels);
        assert_eq!(loaded.imgs.shape(), shard.imgs.shape());
    }

    #[test]
    fn test_langs_only_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard.npz");
        tiny_shard(2).write(&path).unwrap();
        let langs = read_langs(&path).unwrap();
        assert_eq!(langs.len(), 2);
    }

    #[test]
    fn test_missing_shard_is_an_error() {
        let err = ShardData::read(Path::new("/nonexistent/shard.npz"));
        assert!(err.is_err());
    }
}
