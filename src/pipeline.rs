//! Index and query phases wired from one [`Config`].
//!
//! ```text
//! Pipeline::index(path)   load → pool → binarize → upsert
//! Pipeline::search(text)  encode → query → hits
//! ```
//!
//! The encoder session is opened with the pipeline and released when it is
//! dropped or [`Pipeline::finish`] is called.

use crate::encoder::{ModelSession, QueryEncoder};
use crate::index::SearchBackend;
use crate::indexer::{IndexReport, Indexer};
use crate::search::Searcher;
use crate::store::EmbeddingCorpus;
use crate::{Config, Hit, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub struct Pipeline<B: ?Sized, E> {
    config: Config,
    indexer: Indexer<B>,
    searcher: Searcher<B, ModelSession<E>>,
}

impl<B, E> Pipeline<B, E>
where
    B: SearchBackend + ?Sized + 'static,
    E: QueryEncoder,
{
    /// # Errors
    ///
    /// [`crate::Error::InvalidConfig`] if the configuration fails validation.
    pub fn new(config: Config, backend: Arc<B>, encoder: E) -> Result<Self> {
        config.validate()?;
        let indexer = Indexer::from_config(Arc::clone(&backend), &config);
        let session = Arc::new(ModelSession::open(encoder));
        let searcher = Searcher::new(backend, session, config.rank_profile.clone());
        Ok(Self {
            config,
            indexer,
            searcher,
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn indexer(&self) -> &Indexer<B> {
        &self.indexer
    }

    /// Load an embeddings file and index every document in it.
    ///
    /// # Errors
    ///
    /// Load and data errors. Per-document write failures are in the report.
    pub async fn index(&self, path: impl AsRef<Path>) -> Result<IndexReport> {
        let corpus = EmbeddingCorpus::load(path)?;
        self.index_corpus(&corpus).await
    }

    /// # Errors
    ///
    /// [`crate::Error::Data`] if the corpus fails validation.
    pub async fn index_corpus(&self, corpus: &EmbeddingCorpus) -> Result<IndexReport> {
        info!(
            docs = corpus.len(),
            patches = corpus.total_patches(),
            pool_factor = self.config.pool_factor,
            pool_method = ?self.config.pool_method,
            "index phase"
        );
        self.indexer.index_corpus(corpus).await
    }

    /// Top hits for `text`, using the configured hit count.
    ///
    /// # Errors
    ///
    /// Encoder and backend errors, never retried.
    pub async fn search(&self, text: &str) -> Result<Vec<Hit>> {
        self.search_k(text, self.config.hits).await
    }

    /// # Errors
    ///
    /// Encoder and backend errors, never retried.
    pub async fn search_k(&self, text: &str, k: usize) -> Result<Vec<Hit>> {
        self.searcher.search(text, k).await
    }

    /// End the query phase, releasing the encoder.
    pub fn finish(self) {
        info!("pipeline finished");
    }
}
