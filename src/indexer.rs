//! Idempotent, retrying, bounded-concurrency indexing.
//!
//! For each document:
//!
//! ```text
//! exists? ──yes──▶ skip
//!    └─no──▶ pool ──▶ binarize ──▶ put (retry transient, backoff ×2)
//! ```
//!
//! Documents run on at most `workers` tasks at once. A task sleeping through
//! backoff keeps its permit, so it only delays its own document. A task that
//! panics is reported as a failure of its document.

use crate::binarize::binarize_all;
use crate::index::{IndexDocument, SearchBackend};
use crate::pool::Pooler;
use crate::store::EmbeddingCorpus;
use crate::{Config, DocumentEmbeddings, Error, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

// ─────────────────────────────────────────────────────────────────────────────
// Retry policy
// ─────────────────────────────────────────────────────────────────────────────

/// Exponential backoff for transient write failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, first try included. At least 1.
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::config::DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(crate::config::DEFAULT_INITIAL_BACKOFF_MS),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: usize, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            multiplier: 2,
        }
    }

    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sleep before retry number `retry` (1-based): `initial × multiplier^(retry-1)`.
    #[must_use]
    pub fn delay_for_retry(&self, retry: usize) -> Duration {
        let exponent = u32::try_from(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        let factor = self.multiplier.saturating_pow(exponent);
        self.initial_backoff.saturating_mul(factor)
    }

    /// Every delay a fully failing document sleeps through.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..self.max_attempts).map(|r| self.delay_for_retry(r))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outcomes
// ─────────────────────────────────────────────────────────────────────────────

/// What happened to one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    /// Already present; nothing written.
    Skipped,
    /// Written after `attempts` tries.
    Written { attempts: usize },
}

/// Summary of an indexing run.
#[derive(Debug, Default)]
pub struct IndexReport {
    pub written: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, Error)>,
}

impl IndexReport {
    #[must_use]
    pub fn total(&self) -> usize {
        self.written.len() + self.skipped.len() + self.failed.len()
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Indexer
// ─────────────────────────────────────────────────────────────────────────────

pub struct Indexer<B: ?Sized> {
    backend: Arc<B>,
    pooler: Arc<dyn Pooler>,
    pool_factor: usize,
    retry: RetryPolicy,
    workers: usize,
}

impl<B> Indexer<B>
where
    B: SearchBackend + ?Sized + 'static,
{
    pub fn new(backend: Arc<B>, pooler: Arc<dyn Pooler>, pool_factor: usize) -> Self {
        Self {
            backend,
            pooler,
            pool_factor,
            retry: RetryPolicy::default(),
            workers: crate::config::DEFAULT_WORKERS,
        }
    }

    /// Indexer wired from the run configuration.
    pub fn from_config(backend: Arc<B>, config: &Config) -> Self {
        Self::new(backend, Arc::from(config.pool_method.pooler()), config.pool_factor)
            .with_retry(RetryPolicy::new(config.max_attempts, config.initial_backoff()))
            .with_workers(config.workers)
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Pool and binarize one document.
    ///
    /// # Errors
    ///
    /// [`Error::Data`] if a pooled vector is not finite.
    pub fn prepare(&self, doc: &DocumentEmbeddings) -> Result<IndexDocument> {
        prepare_with(self.pooler.as_ref(), self.pool_factor, doc)
    }

    /// Write one prepared document unless it already exists.
    ///
    /// # Errors
    ///
    /// Permanent backend errors are returned as-is after one attempt.
    /// [`Error::RetriesExhausted`] once every attempt failed transiently.
    pub async fn index_document(&self, doc: &IndexDocument) -> Result<IndexOutcome> {
        write_with_retry(self.backend.as_ref(), doc, &self.retry).await
    }

    /// Index every document of the corpus.
    ///
    /// Existence is checked before a document is pooled, so documents already
    /// in the index cost one lookup and no pooling. Pooling runs on the
    /// blocking pool inside the worker that owns the document.
    ///
    /// # Errors
    ///
    /// [`Error::Data`] if the corpus fails validation. Nothing is written then.
    /// Per-document failures land in the report.
    pub async fn index_corpus(&self, corpus: &EmbeddingCorpus) -> Result<IndexReport> {
        corpus.validate()?;
        info!(docs = corpus.len(), workers = self.workers, "indexing");
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        let mut ids = HashMap::with_capacity(corpus.len());

        for doc in corpus.documents() {
            let id = doc.id.clone();
            let permits = Arc::clone(&permits);
            let backend = Arc::clone(&self.backend);
            let pooler = Arc::clone(&self.pooler);
            let (factor, retry) = (self.pool_factor, self.retry);
            let handle = tasks.spawn(async move {
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return Err(Error::Task(format!("worker pool closed: {e}"))),
                };
                let id = doc.id.clone();
                let prepare = || prepare_blocking(pooler, factor, doc);
                upsert(backend.as_ref(), &id, prepare, &retry).await
            });
            ids.insert(handle.id(), id);
        }

        let mut report = IndexReport::default();
        while let Some(joined) = tasks.join_next_with_id().await {
            let (task, outcome) = match joined {
                Ok((task, outcome)) => (task, outcome),
                Err(e) => (e.id(), Err(Error::Task(e.to_string()))),
            };
            let id = ids.remove(&task).unwrap_or_else(|| format!("task {task}"));
            match outcome {
                Ok(IndexOutcome::Skipped) => report.skipped.push(id),
                Ok(IndexOutcome::Written { .. }) => report.written.push(id),
                Err(e) => {
                    error!(id = %id, error = %e, "indexing failed");
                    report.failed.push((id, e));
                }
            }
        }
        report.written.sort();
        report.skipped.sort();
        report.failed.sort_by(|a, b| a.0.cmp(&b.0));

        info!(
            written = report.written.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "indexing finished"
        );
        Ok(report)
    }
}

fn prepare_with(pooler: &dyn Pooler, factor: usize, doc: &DocumentEmbeddings) -> Result<IndexDocument> {
    let pooled = pooler.pool_by_factor(&doc.patches, factor);
    let embedding =
        binarize_all(&pooled).map_err(|e| Error::Data(format!("document '{}': {e}", doc.id)))?;
    debug!(
        id = %doc.id,
        patches = doc.patches.len(),
        pooled = embedding.len(),
        "prepared document"
    );
    Ok(IndexDocument {
        id: doc.id.clone(),
        embedding,
    })
}

/// Pooling is O(n²·d); keep it off the async workers.
async fn prepare_blocking(
    pooler: Arc<dyn Pooler>,
    factor: usize,
    doc: DocumentEmbeddings,
) -> Result<IndexDocument> {
    tokio::task::spawn_blocking(move || prepare_with(pooler.as_ref(), factor, &doc))
        .await
        .map_err(|e| Error::Task(format!("pooling task failed: {e}")))?
}

/// Existence check then write, retrying transient failures of either step.
///
/// # Errors
///
/// See [`Indexer::index_document`].
pub async fn write_with_retry<B>(
    backend: &B,
    doc: &IndexDocument,
    policy: &RetryPolicy,
) -> Result<IndexOutcome>
where
    B: SearchBackend + ?Sized,
{
    upsert(backend, &doc.id, || std::future::ready(Ok(doc.clone())), policy).await
}

/// Retry loop behind every write. `prepare` runs at most once, on the first
/// attempt that finds the document missing.
async fn upsert<B, F, Fut>(
    backend: &B,
    id: &str,
    prepare: F,
    policy: &RetryPolicy,
) -> Result<IndexOutcome>
where
    B: SearchBackend + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<IndexDocument>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut prepare = Some(prepare);
    let mut ready: Option<IndexDocument> = None;
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match backend.exists(id).await {
            Ok(true) => {
                debug!(id, "already indexed, skipping");
                return Ok(IndexOutcome::Skipped);
            }
            Ok(false) => {
                if let Some(prepare) = prepare.take() {
                    ready = Some(prepare().await?);
                }
                match &ready {
                    Some(doc) => backend.put(doc).await,
                    None => Err(Error::Task(format!("document '{id}' was never prepared"))),
                }
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                debug!(id, attempt, "indexed");
                return Ok(IndexOutcome::Written { attempts: attempt });
            }
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if attempt >= max_attempts => {
                return Err(Error::RetriesExhausted {
                    id: id.to_string(),
                    attempts: attempt,
                    last: Box::new(e),
                });
            }
            Err(e) => {
                let delay = policy.delay_for_retry(attempt);
                warn!(id, attempt, ?delay, error = %e, "transient failure, backing off");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_geometrically() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        let delays: Vec<_> = policy.delays().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
            ]
        );
    }

    #[test]
    fn test_delay_saturates() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(200), Duration::MAX);
    }

    #[test]
    fn test_multiplier() {
        let policy = RetryPolicy::new(4, Duration::from_millis(10)).with_multiplier(3);
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(90));
    }

    #[test]
    fn test_zero_attempts_clamped() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
        assert_eq!(RetryPolicy::new(1, Duration::ZERO).delays().count(), 0);
    }

    #[test]
    fn test_report_totals() {
        let report = IndexReport {
            written: vec!["a".into()],
            skipped: vec!["b".into(), "c".into()],
            failed: vec![("d".into(), Error::Search("x".into()))],
        };
        assert_eq!(report.total(), 4);
        assert!(!report.is_success());
    }
}
