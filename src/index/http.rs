use super::{IndexDocument, QueryRequest, SearchBackend, EMBEDDING_FIELD};
use crate::binarize::packed_len;
use crate::{Config, Error, Hit, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, instrument};

/// Client for a Vespa-style HTTP document and query API.
///
/// - `GET  /document/v1/{namespace}/{type}/docid/{id}` existence check
/// - `POST /document/v1/{namespace}/{type}/docid/{id}` write
/// - `POST /search/` ranked query
#[derive(Debug, Clone)]
pub struct HttpIndex {
    client: Client,
    endpoint: Url,
    namespace: String,
    document_type: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    root: SearchRoot,
}

#[derive(Debug, Deserialize)]
struct SearchRoot {
    #[serde(default)]
    children: Vec<SearchChild>,
    #[serde(default)]
    errors: Vec<SearchError>,
}

#[derive(Debug, Deserialize)]
struct SearchChild {
    id: Option<String>,
    relevance: f32,
    #[serde(default)]
    fields: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct SearchError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

impl HttpIndex {
    /// Build a client from the run configuration.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] if the endpoint is not a valid base URL,
    /// [`Error::Transport`] if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self> {
        let endpoint = Url::parse(&config.endpoint)
            .map_err(|e| Error::InvalidConfig(format!("endpoint '{}': {e}", config.endpoint)))?;
        if endpoint.cannot_be_a_base() {
            return Err(Error::InvalidConfig(format!(
                "endpoint '{}' cannot be a base URL",
                config.endpoint
            )));
        }
        let client = Client::builder().timeout(config.request_timeout()).build()?;
        Ok(Self {
            client,
            endpoint,
            namespace: config.namespace.clone(),
            document_type: config.document_type.clone(),
            token: config.token.clone(),
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.endpoint.clone();
        // checked in `new`
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// URL of one document in the document API.
    #[must_use]
    pub fn document_url(&self, id: &str) -> Url {
        self.url(&[
            "document",
            "v1",
            self.namespace.as_str(),
            self.document_type.as_str(),
            "docid",
            id,
        ])
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// Feed body for a document: hex strings keyed by patch index.
    #[must_use]
    pub fn document_body(doc: &IndexDocument) -> Value {
        let blocks: Map<String, Value> = doc
            .embedding
            .iter()
            .enumerate()
            .map(|(i, hex)| (i.to_string(), Value::String(hex.clone())))
            .collect();
        json!({
            "fields": {
                "id": doc.id,
                EMBEDDING_FIELD: { "blocks": blocks },
            }
        })
    }

    /// Query body: query tokens keyed by token index, each zero padded to a
    /// whole number of bytes to match the unpacked field width.
    #[must_use]
    pub fn query_body(&self, request: &QueryRequest) -> Value {
        let tokens: Map<String, Value> = request
            .tokens
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let mut padded = t.clone();
                padded.resize(packed_len(t.len()) * 8, 0.0);
                (i.to_string(), json!(padded))
            })
            .collect();
        json!({
            "yql": format!("select id from {} where true", self.document_type),
            "ranking.profile": request.profile,
            "hits": request.hits,
            "input.query(qt)": tokens,
        })
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(Error::Backend {
            status: status.as_u16(),
            message,
        })
    }
}

/// Document id from a hit: the `id` summary field, else the docid suffix of
/// `id:namespace:type::docid`.
fn hit_id(child: &SearchChild) -> Option<String> {
    if let Some(Value::String(id)) = child.fields.get("id") {
        return Some(id.clone());
    }
    let full = child.id.as_deref()?;
    Some(full.split_once("::").map_or(full, |(_, docid)| docid).to_string())
}

#[async_trait]
impl SearchBackend for HttpIndex {
    #[instrument(skip(self), level = "debug")]
    async fn exists(&self, id: &str) -> Result<bool> {
        let req = self.client.get(self.document_url(id));
        let response = self.authorize(req).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check(response).await?;
        Ok(true)
    }

    #[instrument(skip(self, doc), fields(id = %doc.id), level = "debug")]
    async fn put(&self, doc: &IndexDocument) -> Result<()> {
        let mut url = self.document_url(&doc.id);
        url.query_pairs_mut().append_pair("create", "true");
        let req = self.client.post(url).json(&Self::document_body(doc));
        Self::check(self.authorize(req).send().await?).await?;
        debug!(vectors = doc.embedding.len(), "fed document");
        Ok(())
    }

    async fn query(&self, request: &QueryRequest) -> Result<Vec<Hit>> {
        let req = self
            .client
            .post(self.url(&["search", ""]))
            .json(&self.query_body(request));
        let response = Self::check(self.authorize(req).send().await?).await?;
        let body: SearchResponse = response.json().await?;

        if let Some(err) = body.root.errors.first() {
            return Err(Error::Search(format!("{} (code {})", err.message, err.code)));
        }
        body.root
            .children
            .iter()
            .map(|child| {
                let id = hit_id(child)
                    .ok_or_else(|| Error::Search("hit without an id".into()))?;
                Ok(Hit {
                    id,
                    relevance: child.relevance,
                })
            })
            .collect()
    }
}
