//! Search engine backends.
//!
//! The engine is an external service; this module only defines what the
//! pipeline needs from it:
//!
//! - existence check by document id (for skip-if-exists upserts)
//! - write of one document holding its bit-packed vectors in one field
//! - a late-interaction query: float query tokens against stored bits
//!
//! [`MemoryIndex`] evaluates queries in-process; [`HttpIndex`] talks to a
//! Vespa-style document and query API.

mod http;
mod memory;

pub use http::HttpIndex;
pub use memory::MemoryIndex;

use crate::{Hit, Result};
use async_trait::async_trait;

/// Name of the field holding the bit-packed vectors.
pub const EMBEDDING_FIELD: &str = "embedding";

/// One document as written to the index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDocument {
    pub id: String,
    /// One lowercase hex string per pooled vector.
    pub embedding: Vec<String>,
}

/// A late-interaction query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    /// Rank profile (scoring function) to evaluate.
    pub profile: String,
    /// Full-precision query tokens.
    pub tokens: Vec<Vec<f32>>,
    pub hits: usize,
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Whether a document with this id is already stored.
    async fn exists(&self, id: &str) -> Result<bool>;

    /// Store a document. Writing an existing id replaces it.
    async fn put(&self, doc: &IndexDocument) -> Result<()>;

    /// Rank stored documents, best first, at most `request.hits` of them.
    async fn query(&self, request: &QueryRequest) -> Result<Vec<Hit>>;
}

#[async_trait]
impl<B: SearchBackend + ?Sized> SearchBackend for std::sync::Arc<B> {
    async fn exists(&self, id: &str) -> Result<bool> {
        (**self).exists(id).await
    }

    async fn put(&self, doc: &IndexDocument) -> Result<()> {
        (**self).put(doc).await
    }

    async fn query(&self, request: &QueryRequest) -> Result<Vec<Hit>> {
        (**self).query(request).await
    }
}

/// Index layout: one document type with one multi-vector bit field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSchema {
    pub document_type: String,
    /// Float dimension of the pooled vectors (bits per stored vector).
    pub dim: usize,
    pub rank_profile: String,
}

impl IndexSchema {
    pub fn new(document_type: impl Into<String>, dim: usize, rank_profile: impl Into<String>) -> Self {
        Self {
            document_type: document_type.into(),
            dim,
            rank_profile: rank_profile.into(),
        }
    }

    /// Bytes per stored vector.
    #[must_use]
    pub fn packed_dim(&self) -> usize {
        crate::binarize::packed_len(self.dim)
    }

    /// Tensor type of the stored field: mapped patch dim, dense packed bytes.
    #[must_use]
    pub fn field_type(&self) -> String {
        format!("tensor<int8>(patch{{}}, v[{}])", self.packed_dim())
    }

    /// Bits per stored vector once unpacked: `dim` rounded up to a whole byte.
    #[must_use]
    pub fn unpacked_dim(&self) -> usize {
        self.packed_dim() * 8
    }

    /// Tensor type of the query input. Its width matches `unpack_bits` of the
    /// stored field, so query tokens are zero padded to [`Self::unpacked_dim`].
    #[must_use]
    pub fn query_type(&self) -> String {
        format!("tensor<float>(querytoken{{}}, v[{}])", self.unpacked_dim())
    }

    /// Schema definition text for deploying the document type.
    #[must_use]
    pub fn to_sd(&self) -> String {
        let doc = &self.document_type;
        let field_type = self.field_type();
        let query_type = self.query_type();
        let profile = &self.rank_profile;
        format!(
            r#"schema {doc} {{
    document {doc} {{
        field id type string {{
            indexing: summary | attribute
        }}
        field {EMBEDDING_FIELD} type {field_type} {{
            indexing: attribute
        }}
    }}
    rank-profile {profile} {{
        inputs {{
            query(qt) {query_type}
        }}
        function max_sim() {{
            expression {{
                sum(
                    reduce(
                        sum(
                            query(qt) * unpack_bits(attribute({EMBEDDING_FIELD})), v
                        ),
                        max, patch
                    ),
                    querytoken
                )
            }}
        }}
        first-phase {{
            expression: max_sim
        }}
    }}
}}
"#
        )
    }
}

/// Sort hits by descending relevance (ties by id) and keep the top `k`.
pub(crate) fn top_k(mut hits: Vec<Hit>, k: usize) -> Vec<Hit> {
    hits.sort_by(|a, b| b.relevance.total_cmp(&a.relevance).then_with(|| a.id.cmp(&b.id)));
    hits.truncate(k);
    hits
}
