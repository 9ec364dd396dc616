// ============================================================
// Layer 6 — Vocabulary
// ============================================================
// Builds the word-level vocabulary every embedding model shares.
// Tokens are whitespace-separated words from the pretraining
// shards' utterances; each distinct word gets the next free id in
// order of first appearance, after four reserved slots.
//
// The vocabulary is realised as a `tokenizers` WordLevel model:
// we assemble the tokenizer JSON ourselves and load it back, so
// the persisted artifact (`vocab.json`) is a standard HuggingFace
// tokenizer file. Construction is pure — persistence belongs to
// the VocabStore below.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use tokenizers::Tokenizer;

/// Reserved token ids. Every model that embeds tokens assumes
/// this layout, so they are fixed rather than configurable.
pub const PAD: i32 = 0;
pub const SOS: i32 = 1;
pub const EOS: i32 = 2;
pub const UNK: i32 = 3;

const PAD_TOKEN: &str = "<pad>";
const SOS_TOKEN: &str = "<sos>";
const EOS_TOKEN: &str = "<eos>";
const UNK_TOKEN: &str = "<unk>";

/// Immutable word <-> id mapping.
pub struct Vocab {
    tokenizer: Tokenizer,
}

impl Vocab {
    /// Build a vocabulary from raw utterances. Deterministic for a
    /// given utterance order; fails if the corpus holds no tokens.
    pub fn build<'a>(langs: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let mut seen: HashMap<String, u32> = HashMap::new();
        let mut words: Vec<String> = Vec::new();
        let mut next_id = 4u32;

        for lang in langs {
            for word in lang.split_whitespace() {
                if !seen.contains_key(word) {
                    seen.insert(word.to_string(), next_id);
                    words.push(word.to_string());
                    next_id += 1;
                }
            }
        }
        if words.is_empty() {
            bail!("Cannot build a vocabulary: no tokens found in the corpus");
        }

        // ── Assemble the tokenizer JSON ───────────────────────────────────────
        // Writing the WordLevel model directly sidesteps the trainer
        // plumbing entirely; Tokenizer::from_bytes gives us a fully
        // functional tokenizer without touching the filesystem.
        let mut vocab_map = serde_json::Map::new();
        vocab_map.insert(PAD_TOKEN.into(), serde_json::json!(PAD));
        vocab_map.insert(SOS_TOKEN.into(), serde_json::json!(SOS));
        vocab_map.insert(EOS_TOKEN.into(), serde_json::json!(EOS));
        vocab_map.insert(UNK_TOKEN.into(), serde_json::json!(UNK));
        for word in &words {
            vocab_map.insert(word.clone(), serde_json::json!(seen[word]));
        }

        let special = |id: i32, content: &str| {
            serde_json::json!({
                "id": id, "content": content,
                "single_word": false, "lstrip": false, "rstrip": false,
                "normalized": false, "special": true,
            })
        };
        let tokenizer_json = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [
                special(PAD, PAD_TOKEN),
                special(SOS, SOS_TOKEN),
                special(EOS, EOS_TOKEN),
                special(UNK, UNK_TOKEN),
            ],
            "normalizer": null,
            "pre_tokenizer": { "type": "WhitespaceSplit" },
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": serde_json::Value::Object(vocab_map),
                "unk_token": UNK_TOKEN,
            },
        });

        let tokenizer = Tokenizer::from_bytes(serde_json::to_vec(&tokenizer_json)?)
            .map_err(|e| anyhow::anyhow!("Cannot assemble vocabulary tokenizer: {e}"))?;
        Ok(Self { tokenizer })
    }

    /// Embedding table row count (specials included).
    pub fn len(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encode one utterance as `<sos> w1 .. wn <eos>`. Unknown words
    /// map to `<unk>`.
    pub fn encode(&self, lang: &str) -> Result<Vec<i32>> {
        let enc = self
            .tokenizer
            .encode(lang, false)
            .map_err(|e| anyhow::anyhow!("Cannot tokenize '{lang}': {e}"))?;
        let mut ids = Vec::with_capacity(enc.get_ids().len() + 2);
        ids.push(SOS);
        ids.extend(enc.get_ids().iter().map(|&id| id as i32));
        ids.push(EOS);
        Ok(ids)
    }

    /// Decode ids back to words, dropping special tokens. For debug
    /// output and qualitative inspection only.
    pub fn decode(&self, ids: &[i64]) -> String {
        let words: Vec<String> = ids
            .iter()
            .filter(|&&id| id > UNK as i64)
            .filter_map(|&id| self.tokenizer.id_to_token(id as u32))
            .collect();
        words.join(" ")
    }

    pub fn token_to_id(&self, word: &str) -> Option<u32> {
        self.tokenizer.token_to_id(word)
    }

    fn from_tokenizer(tokenizer: Tokenizer) -> Self {
        Self { tokenizer }
    }
}

// ─── VocabStore ───────────────────────────────────────────────────────────────
/// Owns persistence of the vocabulary artifact (`vocab.json`).
pub struct VocabStore {
    dir: PathBuf,
}

impl VocabStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self) -> PathBuf {
        self.dir.join("vocab.json")
    }

    /// Rebuild from `langs` when `rebuild` is set (saving the result),
    /// otherwise load the persisted artifact. The corpus closure is
    /// only invoked when a rebuild actually happens.
    pub fn load_or_build(
        &self,
        rebuild: bool,
        langs: impl FnOnce() -> Result<Vec<String>>,
    ) -> Result<Vocab> {
        if rebuild {
            let langs = langs()?;
            tracing::info!("Building vocabulary from {} utterances", langs.len());
            let vocab = Vocab::build(langs.iter().map(|s| s.as_str()))?;
            self.save(&vocab)?;
            Ok(vocab)
        } else {
            self.load()
        }
    }

    pub fn load(&self) -> Result<Vocab> {
        let path = self.path();
        let tokenizer = Tokenizer::from_file(&path).map_err(|e| {
            anyhow::anyhow!(
                "Cannot load vocabulary from '{}': {e}. Run once with --vocab to build it.",
                path.display()
            )
        })?;
        Ok(Vocab::from_tokenizer(tokenizer))
    }

    pub fn save(&self, vocab: &Vocab) -> Result<()> {
        std::fs::create_dir_all(&self.dir).ok();
        let path = self.path();
        let json = serde_json::to_string_pretty(&vocab.tokenizer)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Cannot write vocabulary to '{}'", path.display()))?;
        tracing::info!("Saved vocabulary ({} words) to '{}'", vocab.len(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_occurrence_ids() {
        let langs = ["red circle", "blue circle", "red square"];
        let vocab = Vocab::build(langs.iter().copied()).unwrap();
        // 4 specials + {red, circle, blue, square}
        assert_eq!(vocab.len(), 8);
        assert_eq!(vocab.token_to_id("red"), Some(4));
        assert_eq!(vocab.token_to_id("circle"), Some(5));
        assert_eq!(vocab.token_to_id("blue"), Some(6));
        assert_eq!(vocab.token_to_id("square"), Some(7));
    }

    #[test]
    fn test_build_is_deterministic() {
        let langs = ["green triangle above", "white shape", "green shape"];
        let a = Vocab::build(langs.iter().copied()).unwrap();
        let b = Vocab::build(langs.iter().copied()).unwrap();
        assert_eq!(a.len(), b.len());
        for lang in &langs {
            for word in lang.split_whitespace() {
                assert_eq!(a.token_to_id(word), b.token_to_id(word));
            }
        }
    }

    #[test]
    fn test_empty_corpus_fails() {
        assert!(Vocab::build(std::iter::empty::<&str>()).is_err());
        assert!(Vocab::build(["   "].iter().copied()).is_err());
    }

    #[test]
    fn test_encode_decode() {
        let vocab = Vocab::build(["red circle"].iter().copied()).unwrap();
        let ids = vocab.encode("red circle").unwrap();
        assert_eq!(ids, vec![SOS, 4, 5, EOS]);
        // Unknown words map to <unk>
        let ids = vocab.encode("red hexagon").unwrap();
        assert_eq!(ids, vec![SOS, 4, UNK, EOS]);
        let decoded = vocab.decode(&[1, 4, 5, 2, 0, 0]);
        assert_eq!(decoded, "red circle");
    }

    #[test]
    fn test_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = VocabStore::new(dir.path());
        let built = store
            .load_or_build(true, || Ok(vec!["red circle".to_string()]))
            .unwrap();
        let loaded = store.load_or_build(false, || unreachable!()).unwrap();
        assert_eq!(built.len(), loaded.len());
        assert_eq!(loaded.token_to_id("circle"), Some(5));
    }
}
