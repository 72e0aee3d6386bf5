//! Query path: encode → MaxSim query → ranked hits → optional gallery.
//!
//! Queries are not retried. A failed query is surfaced to the caller as-is.

use crate::encoder::QueryEncoder;
use crate::index::{QueryRequest, SearchBackend};
use crate::{Error, Hit, Result};
use minijinja::{context, Environment};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub struct Searcher<B: ?Sized, E: ?Sized> {
    backend: Arc<B>,
    encoder: Arc<E>,
    profile: String,
}

impl<B, E> Searcher<B, E>
where
    B: SearchBackend + ?Sized,
    E: QueryEncoder + ?Sized,
{
    pub fn new(backend: Arc<B>, encoder: Arc<E>, profile: impl Into<String>) -> Self {
        Self {
            backend,
            encoder,
            profile: profile.into(),
        }
    }

    /// Top `k` documents for `text`, best first.
    ///
    /// # Errors
    ///
    /// Encoder and backend errors unchanged.
    pub async fn search(&self, text: &str, k: usize) -> Result<Vec<Hit>> {
        let embedding = self.encoder.encode(text).await?;
        let request = QueryRequest {
            profile: self.profile.clone(),
            tokens: embedding.tokens,
            hits: k,
        };
        let hits = self.backend.query(&request).await?;
        info!(
            query = %text,
            encoder = self.encoder.name(),
            hits = hits.len(),
            top = hits.first().map(|h| h.id.as_str()),
            "search finished"
        );
        Ok(hits)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Gallery
// ─────────────────────────────────────────────────────────────────────────────

const GALLERY_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>{{ title }}</title>
<style>
  body { font-family: sans-serif; display: flex; flex-wrap: wrap; gap: 1rem; }
  figure { margin: 0; width: 240px; }
  img { width: 100%; border: 1px solid #ccc; }
</style>
</head>
<body>
{%- for hit in hits %}
<figure>
  <img src="{{ hit.src }}" alt="{{ hit.id }}">
  <figcaption>{{ loop.index }}. {{ hit.id }} ({{ hit.relevance }})</figcaption>
</figure>
{%- endfor %}
</body>
</html>
"#;

#[derive(Serialize)]
struct Figure<'a> {
    id: &'a str,
    src: String,
    relevance: String,
}

/// Render hits as an HTML page of figures, one per hit, in rank order.
///
/// Images are referenced as `image_root/<id>`.
///
/// # Errors
///
/// [`Error::Data`] if the template fails to render.
pub fn render_gallery(title: &str, hits: &[Hit], image_root: &Path) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("gallery.html", GALLERY_TEMPLATE)
        .map_err(template_error)?;
    let template = env.get_template("gallery.html").map_err(template_error)?;

    let figures: Vec<Figure<'_>> = hits
        .iter()
        .map(|hit| Figure {
            id: &hit.id,
            src: image_root.join(&hit.id).display().to_string(),
            relevance: format!("{:.4}", hit.relevance),
        })
        .collect();

    template
        .render(context! { title => title, hits => figures })
        .map_err(template_error)
}

fn template_error(e: minijinja::Error) -> Error {
    Error::Data(format!("gallery template: {e}"))
}
