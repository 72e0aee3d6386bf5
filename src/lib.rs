//! # rank-pool
//!
//! Token pooling and bit-packed late-interaction indexing for multi-vector
//! (ColBERT / ColPali style) embeddings.
//!
//! ## Modules
//!
//! | Module | Purpose | Notes |
//! |--------|---------|-------|
//! | [`store`] | Load persisted patch embeddings | JSON or bincode |
//! | [`pool`] | Hierarchical token pooling | Ward linkage, deterministic |
//! | [`binarize`] | Sign bits packed into hex | 1 bit per dim |
//! | [`index`] | Search engine backends | In-process + HTTP |
//! | [`indexer`] | Idempotent upserts with retry | Bounded worker pool |
//! | [`encoder`] | Query embedding | Trait-based, BYOM |
//! | [`search`] | MaxSim queries and galleries | No retry |
//! | [`simd`] | Vector ops (AVX2/NEON) | Auto-dispatch |
//!
//! ## Pipeline
//!
//! ```text
//! patches → pool (÷ factor) → binarize → upsert (skip existing)
//! query text → encode → MaxSim over unpacked bits → top-K
//! ```
//!
//! ## Quick Example
//!
//! ```rust
//! use rank_pool::pool::{HierarchicalPooler, Pooler};
//! use rank_pool::binarize::binarize_all;
//!
//! let patches = vec![
//!     vec![0.9, -0.1, 0.3, -0.4],
//!     vec![0.8, -0.2, 0.2, -0.5],
//!     vec![-0.7, 0.6, -0.1, 0.2],
//!     vec![-0.6, 0.5, -0.2, 0.1],
//! ];
//!
//! let pooled = HierarchicalPooler.pool_by_factor(&patches, 2);
//! assert_eq!(pooled.len(), 2);
//!
//! let hex = binarize_all(&pooled).unwrap();
//! assert_eq!(hex, vec!["a0", "50"]);
//! ```

pub mod binarize;
pub mod config;
pub mod encoder;
pub mod index;
pub mod indexer;
pub mod pipeline;
pub mod pool;
pub mod search;
pub mod simd;
pub mod store;

pub use config::Config;

use std::fmt;

/// Errors raised anywhere in the pooling, indexing or query path.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or missing input data. Always fatal.
    #[error("invalid data: {0}")]
    Data(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The persisted corpus could not be decoded.
    #[error("failed to decode embeddings: {0}")]
    Decode(String),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// Non-success response from the search engine or encoder service.
    #[error("backend returned {status}: {message}")]
    Backend { status: u16, message: String },
    /// Every write attempt for a document failed.
    #[error("giving up on '{id}' after {attempts} attempts: {last}")]
    RetriesExhausted {
        id: String,
        attempts: usize,
        last: Box<Error>,
    },
    #[error("search failed: {0}")]
    Search(String),
    #[error("query encoding failed: {0}")]
    Encoder(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A worker task panicked or was cancelled.
    #[error("task failed: {0}")]
    Task(String),
}

impl Error {
    /// Whether retrying the same request may succeed.
    ///
    /// Transport failures, rate limiting (429) and server errors (5xx) are
    /// transient. Everything else is permanent.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Backend { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Borrow owned token vectors as slices.
#[inline]
#[must_use]
pub fn as_slices(tokens: &[Vec<f32>]) -> Vec<&[f32]> {
    tokens.iter().map(Vec::as_slice).collect()
}

/// A document's patch embeddings, one vector per visual patch.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentEmbeddings {
    pub id: String,
    pub patches: Vec<Vec<f32>>,
}

impl DocumentEmbeddings {
    pub fn new(id: impl Into<String>, patches: Vec<Vec<f32>>) -> Self {
        Self {
            id: id.into(),
            patches,
        }
    }

    /// Dimension of the patch vectors (0 when there are none).
    #[must_use]
    pub fn dim(&self) -> usize {
        self.patches.first().map_or(0, Vec::len)
    }
}

/// A query embedding: one or more float vectors at full precision.
///
/// Text encoders usually return a single vector; multi-vector encoders
/// return one per query token. Both are scored the same way.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryEmbedding {
    pub tokens: Vec<Vec<f32>>,
}

impl QueryEmbedding {
    pub fn single(vector: Vec<f32>) -> Self {
        Self {
            tokens: vec![vector],
        }
    }

    pub fn multi(tokens: Vec<Vec<f32>>) -> Self {
        Self { tokens }
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        self.tokens.first().map_or(0, Vec::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// One ranked search result.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub id: String,
    pub relevance: f32,
}

impl fmt::Display for Hit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:.4})", self.id, self.relevance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let rate_limited = Error::Backend {
            status: 429,
            message: "slow down".into(),
        };
        let unavailable = Error::Backend {
            status: 503,
            message: "unavailable".into(),
        };
        let bad_request = Error::Backend {
            status: 400,
            message: "bad field".into(),
        };

        assert!(rate_limited.is_transient());
        assert!(unavailable.is_transient());
        assert!(!bad_request.is_transient());
        assert!(!Error::Data("x".into()).is_transient());
        assert!(!Error::Search("x".into()).is_transient());
    }

    #[test]
    fn exhausted_message_carries_last_error() {
        let err = Error::RetriesExhausted {
            id: "page_1.png".into(),
            attempts: 3,
            last: Box::new(Error::Backend {
                status: 503,
                message: "busy".into(),
            }),
        };
        let msg = err.to_string();
        assert!(msg.contains("page_1.png"));
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("503"));
    }

    #[test]
    fn query_embedding_dims() {
        let q = QueryEmbedding::single(vec![0.1, 0.2, 0.3]);
        assert_eq!(q.dim(), 3);
        assert!(!q.is_empty());
        assert!(QueryEmbedding::multi(vec![]).is_empty());
    }
}
