//! Persisted patch embeddings.
//!
//! The upstream embedding stage writes a mapping from document id (usually
//! the page image filename) to that document's patch vectors. Two encodings
//! are accepted, chosen by file extension:
//!
//! | Extension | Encoding |
//! |-----------|----------|
//! | `.json` | `{"page_1.png": [[0.1, ...], ...], ...}` |
//! | `.bin` | bincode of the same map |
//!
//! Loading validates the whole corpus up front; a single malformed document
//! aborts the run.

use crate::{DocumentEmbeddings, Error, Result};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// Every document's patch vectors, iterated in id order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbeddingCorpus {
    docs: BTreeMap<String, Vec<Vec<f32>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Bincode,
}

impl Format {
    fn of(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(Self::Json),
            Some("bin") => Ok(Self::Bincode),
            _ => Err(Error::Data(format!(
                "{}: expected a .json or .bin embeddings file",
                path.display()
            ))),
        }
    }
}

impl EmbeddingCorpus {
    /// Build and validate a corpus from an in-memory map.
    ///
    /// # Errors
    ///
    /// See [`EmbeddingCorpus::validate`].
    pub fn from_map(docs: BTreeMap<String, Vec<Vec<f32>>>) -> Result<Self> {
        let corpus = Self { docs };
        corpus.validate()?;
        Ok(corpus)
    }

    /// Read a corpus from disk.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the file cannot be read, [`Error::Decode`] if it is
    /// not a valid encoding, [`Error::Data`] if validation fails.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let format = Format::of(path)?;
        let raw = std::fs::read(path)?;
        let docs: BTreeMap<String, Vec<Vec<f32>>> = match format {
            Format::Json => serde_json::from_slice(&raw)?,
            Format::Bincode => bincode::deserialize(&raw)?,
        };
        let corpus = Self::from_map(docs)?;
        info!(
            path = %path.display(),
            docs = corpus.len(),
            patches = corpus.total_patches(),
            dim = corpus.dim(),
            "loaded embeddings"
        );
        Ok(corpus)
    }

    /// Write the corpus in the format implied by the extension.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] or [`Error::Decode`] on failure.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = match Format::of(path)? {
            Format::Json => serde_json::to_vec(&self.docs)?,
            Format::Bincode => bincode::serialize(&self.docs)?,
        };
        std::fs::write(path, bytes)?;
        debug!(path = %path.display(), docs = self.len(), "saved embeddings");
        Ok(())
    }

    /// Check the invariants every downstream stage relies on.
    ///
    /// # Errors
    ///
    /// [`Error::Data`] if the corpus is empty, a document has no patches,
    /// dimensions disagree, or a component is not finite.
    pub fn validate(&self) -> Result<()> {
        if self.docs.is_empty() {
            return Err(Error::Data("embedding corpus is empty".into()));
        }
        let mut dim = None;
        for (id, patches) in &self.docs {
            if id.is_empty() {
                return Err(Error::Data("document with empty id".into()));
            }
            if patches.is_empty() {
                return Err(Error::Data(format!("document '{id}' has no patches")));
            }
            for (p, v) in patches.iter().enumerate() {
                let expected = *dim.get_or_insert(v.len());
                if v.len() != expected || expected == 0 {
                    return Err(Error::Data(format!(
                        "document '{id}' patch {p} has {} dims, expected {expected}",
                        v.len()
                    )));
                }
                if let Some(c) = v.iter().position(|x| !x.is_finite()) {
                    return Err(Error::Data(format!(
                        "document '{id}' patch {p} component {c} is not finite"
                    )));
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Shared patch dimension.
    #[must_use]
    pub fn dim(&self) -> usize {
        self.docs
            .values()
            .next()
            .and_then(|p| p.first())
            .map_or(0, Vec::len)
    }

    #[must_use]
    pub fn total_patches(&self) -> usize {
        self.docs.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&[Vec<f32>]> {
        self.docs.get(id).map(Vec::as_slice)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.docs.keys().map(String::as_str)
    }

    /// Owned documents in id order.
    pub fn documents(&self) -> impl Iterator<Item = DocumentEmbeddings> + '_ {
        self.docs
            .iter()
            .map(|(id, patches)| DocumentEmbeddings::new(id.clone(), patches.clone()))
    }
}

/// Deterministic synthetic corpus for offline runs and benches.
///
/// Each document gets `patches` vectors of `dim` components drawn from an
/// LCG seeded by the document index, named `page_{i}.png`.
///
/// # Errors
///
/// [`Error::Data`] if any of the three counts is zero.
pub fn synthetic(docs: usize, patches: usize, dim: usize) -> Result<EmbeddingCorpus> {
    let map = (0..docs)
        .map(|d| {
            let mut x = d as u64 + 1;
            let vectors = (0..patches)
                .map(|_| {
                    (0..dim)
                        .map(|_| {
                            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                            ((x >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
                        })
                        .collect()
                })
                .collect();
            (format!("page_{d}.png"), vectors)
        })
        .collect();
    EmbeddingCorpus::from_map(map)
}
