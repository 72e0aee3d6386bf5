use super::{top_k, IndexDocument, IndexSchema, QueryRequest, SearchBackend};
use crate::binarize::BitVector;
use crate::{simd, Error, Hit, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// In-process index evaluating the MaxSim rank profile over unpacked bits.
///
/// Nothing is persisted. Relevance matches what the deployed schema computes:
/// `Σ_q max_p dot(q, unpack_bits(p))`.
#[derive(Debug)]
pub struct MemoryIndex {
    schema: IndexSchema,
    docs: RwLock<HashMap<String, Vec<BitVector>>>,
    writes: AtomicUsize,
}

impl MemoryIndex {
    #[must_use]
    pub fn new(schema: IndexSchema) -> Self {
        Self {
            schema,
            docs: RwLock::new(HashMap::new()),
            writes: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn schema(&self) -> &IndexSchema {
        &self.schema
    }

    /// Number of successful `put` calls since creation.
    #[must_use]
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }

    /// Stored hex strings for a document, in write order.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Vec<String>> {
        self.docs
            .read()
            .get(id)
            .map(|vs| vs.iter().map(BitVector::to_hex).collect())
    }
}

#[async_trait]
impl SearchBackend for MemoryIndex {
    async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.docs.read().contains_key(id))
    }

    async fn put(&self, doc: &IndexDocument) -> Result<()> {
        let vectors = doc
            .embedding
            .iter()
            .map(|h| BitVector::from_hex(self.schema.dim, h))
            .collect::<Result<Vec<_>>>()?;
        self.docs.write().insert(doc.id.clone(), vectors);
        self.writes.fetch_add(1, Ordering::SeqCst);
        debug!(id = %doc.id, vectors = doc.embedding.len(), "stored document");
        Ok(())
    }

    async fn query(&self, request: &QueryRequest) -> Result<Vec<Hit>> {
        if request.profile != self.schema.rank_profile {
            return Err(Error::Search(format!(
                "unknown rank profile '{}'",
                request.profile
            )));
        }
        if let Some(bad) = request.tokens.iter().find(|t| t.len() != self.schema.dim) {
            return Err(Error::Search(format!(
                "query token has {} dims, index expects {}",
                bad.len(),
                self.schema.dim
            )));
        }

        let query = crate::as_slices(&request.tokens);
        let hits = self
            .docs
            .read()
            .iter()
            .map(|(id, vectors)| {
                let bits: Vec<&[u8]> = vectors.iter().map(BitVector::as_bytes).collect();
                Hit {
                    id: id.clone(),
                    relevance: simd::maxsim_bits(&query, &bits),
                }
            })
            .collect();
        Ok(top_k(hits, request.hits))
    }
}
