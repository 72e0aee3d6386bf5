//! Query-time embedding.
//!
//! Bring your own model: anything implementing [`QueryEncoder`] can feed the
//! searcher. [`HttpEncoder`] covers OpenAI-compatible embedding servers;
//! [`FnEncoder`] wraps a closure for in-process models and tests.
//!
//! The model is held by a [`ModelSession`] for the query phase. Access is
//! serialized and release happens when the session drops.

use crate::{Config, Error, QueryEmbedding, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

#[async_trait]
pub trait QueryEncoder: Send + Sync {
    /// Embed query text into one or more full-precision vectors.
    async fn encode(&self, text: &str) -> Result<QueryEmbedding>;

    /// Model name, for logs.
    fn name(&self) -> &str;
}

#[async_trait]
impl<E: QueryEncoder + ?Sized> QueryEncoder for Box<E> {
    async fn encode(&self, text: &str) -> Result<QueryEmbedding> {
        (**self).encode(text).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

fn check_text(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(Error::Encoder("query text is empty".into()));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP encoder
// ─────────────────────────────────────────────────────────────────────────────

/// Client for an OpenAI-compatible `/embeddings` endpoint.
#[derive(Debug, Clone)]
pub struct HttpEncoder {
    client: Client,
    url: String,
    model: String,
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: [&'a str; 1],
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: EmbeddingValue,
}

/// Single-vector models return `[f32]`, multi-vector ones `[[f32]]`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EmbeddingValue {
    Single(Vec<f32>),
    Multi(Vec<Vec<f32>>),
}

impl From<EmbeddingValue> for QueryEmbedding {
    fn from(value: EmbeddingValue) -> Self {
        match value {
            EmbeddingValue::Single(v) => Self::single(v),
            EmbeddingValue::Multi(tokens) => Self::multi(tokens),
        }
    }
}

impl HttpEncoder {
    /// # Errors
    ///
    /// [`Error::Transport`] if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder().timeout(config.request_timeout()).build()?;
        Ok(Self {
            client,
            url: config.encoder_url.clone(),
            model: config.encoder_model.clone(),
            token: config.encoder_token.clone(),
        })
    }
}

#[async_trait]
impl QueryEncoder for HttpEncoder {
    async fn encode(&self, text: &str) -> Result<QueryEmbedding> {
        check_text(text)?;
        let mut req = self.client.post(&self.url).json(&EmbeddingsRequest {
            model: &self.model,
            input: [text],
        });
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Backend {
                status: status.as_u16(),
                message,
            });
        }

        let body: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| Error::Encoder(format!("malformed embeddings response: {e}")))?;
        let embedding: QueryEmbedding = body
            .data
            .into_iter()
            .next()
            .ok_or_else(|| Error::Encoder("embeddings response has no data".into()))?
            .embedding
            .into();
        validate(&embedding)?;
        debug!(model = %self.model, tokens = embedding.tokens.len(), dim = embedding.dim(), "encoded query");
        Ok(embedding)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

fn validate(embedding: &QueryEmbedding) -> Result<()> {
    let dim = embedding.dim();
    if embedding.is_empty() || dim == 0 {
        return Err(Error::Encoder("encoder returned an empty embedding".into()));
    }
    if embedding.tokens.iter().any(|t| t.len() != dim) {
        return Err(Error::Encoder("query tokens have mixed dimensions".into()));
    }
    if embedding.tokens.iter().flatten().any(|x| !x.is_finite()) {
        return Err(Error::Encoder("query embedding is not finite".into()));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Closure encoder
// ─────────────────────────────────────────────────────────────────────────────

/// Encoder backed by a closure.
pub struct FnEncoder<F> {
    name: String,
    f: F,
}

impl<F> FnEncoder<F>
where
    F: Fn(&str) -> Result<QueryEmbedding> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> QueryEncoder for FnEncoder<F>
where
    F: Fn(&str) -> Result<QueryEmbedding> + Send + Sync,
{
    async fn encode(&self, text: &str) -> Result<QueryEmbedding> {
        check_text(text)?;
        let embedding = (self.f)(text)?;
        validate(&embedding)?;
        Ok(embedding)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// Exclusive ownership of an encoder for the query phase.
///
/// Calls are serialized: the wrapped model is not assumed reentrant.
pub struct ModelSession<E> {
    name: String,
    encoder: Mutex<E>,
}

impl<E: QueryEncoder> ModelSession<E> {
    pub fn open(encoder: E) -> Self {
        let name = encoder.name().to_string();
        info!(model = %name, "encoder session opened");
        Self {
            name,
            encoder: Mutex::new(encoder),
        }
    }

    /// Release the model now instead of at scope end.
    pub fn close(self) {}
}

impl<E> Drop for ModelSession<E> {
    fn drop(&mut self) {
        info!(model = %self.name, "encoder session released");
    }
}

#[async_trait]
impl<E: QueryEncoder> QueryEncoder for ModelSession<E> {
    async fn encode(&self, text: &str) -> Result<QueryEmbedding> {
        self.encoder.lock().await.encode(text).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
