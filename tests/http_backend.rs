//! HTTP clients against a fake search engine and embedding server.
//!
//! The fake speaks just enough of the document, query and embeddings APIs to
//! check request shapes and error mapping.

use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use rank_pool::encoder::{HttpEncoder, QueryEncoder};
use rank_pool::index::{HttpIndex, IndexDocument, QueryRequest, SearchBackend};
use rank_pool::indexer::{Indexer, RetryPolicy};
use rank_pool::pool::HierarchicalPooler;
use rank_pool::{store, Config, Error};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const FEED_TOKEN: &str = "feed-secret";
const ENCODER_TOKEN: &str = "enc-secret";

// ─────────────────────────────────────────────────────────────────────────────
// Fake engine
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Engine {
    docs: Mutex<BTreeMap<String, Value>>,
    posts: AtomicUsize,
    /// Next N document writes answer 503.
    fail_posts: AtomicUsize,
    last_post_query: Mutex<Option<String>>,
    last_search: Mutex<Option<Value>>,
}

fn authorized(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {token}"))
}

async fn get_doc(
    State(engine): State<Arc<Engine>>,
    Path((_namespace, _doctype, id)): Path<(String, String, String)>,
) -> Response {
    match engine.docs.lock().get(&id) {
        Some(fields) => Json(json!({ "fields": fields })).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn post_doc(
    State(engine): State<Arc<Engine>>,
    Path((_namespace, _doctype, id)): Path<(String, String, String)>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    engine.posts.fetch_add(1, Ordering::SeqCst);
    if !authorized(&headers, FEED_TOKEN) {
        return StatusCode::UNAUTHORIZED;
    }
    let failing = engine
        .fail_posts
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failing {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    if id == "rejected.png" || !body["fields"]["embedding"]["blocks"].is_object() {
        return StatusCode::BAD_REQUEST;
    }
    *engine.last_post_query.lock() = query;
    engine.docs.lock().insert(id, body["fields"].clone());
    StatusCode::OK
}

async fn search(State(engine): State<Arc<Engine>>, Json(body): Json<Value>) -> Json<Value> {
    *engine.last_search.lock() = Some(body.clone());
    if body["ranking.profile"] != "maxsim" {
        return Json(json!({
            "root": { "errors": [{ "code": 4, "message": "unknown rank profile" }] }
        }));
    }
    let hits = body["hits"].as_u64().unwrap_or(10) as usize;
    // relevance: number of stored vectors
    let mut children: Vec<Value> = engine
        .docs
        .lock()
        .iter()
        .map(|(id, fields)| {
            let n = fields["embedding"]["blocks"].as_object().map_or(0, |b| b.len());
            json!({
                "id": format!("id:rank_pool:pdf_page::{id}"),
                "relevance": n as f64,
                "fields": { "id": id },
            })
        })
        .collect();
    children.sort_by(|a, b| {
        b["relevance"]
            .as_f64()
            .unwrap_or(0.0)
            .total_cmp(&a["relevance"].as_f64().unwrap_or(0.0))
    });
    children.truncate(hits);
    Json(json!({ "root": { "children": children } }))
}

async fn embeddings(headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if !authorized(&headers, ENCODER_TOKEN) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let embedding = match body["input"][0].as_str() {
        Some("multi") => json!([[0.5, -0.5], [0.25, 0.75]]),
        Some("broken") => return (StatusCode::INTERNAL_SERVER_ERROR, "model crashed").into_response(),
        Some("garbage") => return Json(json!({ "unexpected": true })).into_response(),
        _ => json!([0.5, -0.5]),
    };
    Json(json!({
        "object": "list",
        "model": body["model"],
        "data": [{ "object": "embedding", "index": 0, "embedding": embedding }],
    }))
    .into_response()
}

async fn serve(engine: Arc<Engine>) -> Config {
    let app = Router::new()
        .route(
            "/document/v1/{namespace}/{doctype}/docid/{id}",
            get(get_doc).post(post_doc),
        )
        .route("/search/", post(search))
        .route("/v1/embeddings", post(embeddings))
        .with_state(engine);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Config {
        endpoint: format!("http://{addr}"),
        token: Some(FEED_TOKEN.into()),
        encoder_url: format!("http://{addr}/v1/embeddings"),
        encoder_model: "test-model".into(),
        encoder_token: Some(ENCODER_TOKEN.into()),
        initial_backoff_ms: 1,
        request_timeout_secs: 5,
        ..Config::default()
    }
}

fn doc(id: &str, blocks: usize) -> IndexDocument {
    IndexDocument {
        id: id.into(),
        embedding: vec!["0f".into(); blocks],
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Document API
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn exists_then_put_then_exists() {
    let engine = Arc::new(Engine::default());
    let index = HttpIndex::new(&serve(Arc::clone(&engine)).await).unwrap();

    assert!(!index.exists("page 1.png").await.unwrap());
    index.put(&doc("page 1.png", 2)).await.unwrap();
    assert!(index.exists("page 1.png").await.unwrap());

    let stored = engine.docs.lock().get("page 1.png").cloned().unwrap();
    assert_eq!(stored["id"], "page 1.png");
    assert_eq!(stored["embedding"]["blocks"]["1"], "0f");
    assert_eq!(engine.last_post_query.lock().as_deref(), Some("create=true"));
}

#[tokio::test]
async fn missing_token_is_a_permanent_error() {
    let engine = Arc::new(Engine::default());
    let config = Config {
        token: None,
        ..serve(Arc::clone(&engine)).await
    };
    let err = HttpIndex::new(&config).unwrap().put(&doc("a", 1)).await.unwrap_err();
    assert!(matches!(err, Error::Backend { status: 401, .. }));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn indexing_over_http_is_idempotent() {
    let engine = Arc::new(Engine::default());
    let config = serve(Arc::clone(&engine)).await;
    let index = Arc::new(HttpIndex::new(&config).unwrap());
    let indexer = Indexer::from_config(index, &config);
    let corpus = store::synthetic(4, 9, 16).unwrap();

    let first = indexer.index_corpus(&corpus).await.unwrap();
    assert_eq!(first.written.len(), 4);
    assert_eq!(engine.posts.load(Ordering::SeqCst), 4);

    let second = indexer.index_corpus(&corpus).await.unwrap();
    assert_eq!(second.skipped.len(), 4);
    assert_eq!(engine.posts.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn service_unavailable_is_retried() {
    let engine = Arc::new(Engine::default());
    engine.fail_posts.store(2, Ordering::SeqCst);
    let config = serve(Arc::clone(&engine)).await;
    let indexer = Indexer::new(
        Arc::new(HttpIndex::new(&config).unwrap()),
        Arc::new(HierarchicalPooler),
        3,
    )
    .with_retry(RetryPolicy::new(4, Duration::from_millis(1)));

    let outcome = indexer.index_document(&doc("a", 1)).await.unwrap();
    assert_eq!(outcome, rank_pool::indexer::IndexOutcome::Written { attempts: 3 });
    assert_eq!(engine.posts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn bad_request_is_not_retried() {
    let engine = Arc::new(Engine::default());
    let config = serve(Arc::clone(&engine)).await;
    let indexer = Indexer::from_config(Arc::new(HttpIndex::new(&config).unwrap()), &config);

    let err = indexer.index_document(&doc("rejected.png", 1)).await.unwrap_err();
    assert!(matches!(err, Error::Backend { status: 400, .. }));
    assert_eq!(engine.posts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unreachable_engine_exhausts_retries() {
    let config = Config {
        endpoint: "http://127.0.0.1:9".into(),
        initial_backoff_ms: 1,
        max_attempts: 2,
        ..Config::default()
    };
    let indexer = Indexer::from_config(Arc::new(HttpIndex::new(&config).unwrap()), &config);
    let err = indexer.index_document(&doc("a", 1)).await.unwrap_err();
    match err {
        Error::RetriesExhausted { attempts, last, .. } => {
            assert_eq!(attempts, 2);
            assert!(matches!(*last, Error::Transport(_)));
        }
        other => panic!("expected RetriesExhausted, got {other}"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Query API
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn query_sends_tokens_and_parses_hits() {
    let engine = Arc::new(Engine::default());
    let index = HttpIndex::new(&serve(Arc::clone(&engine)).await).unwrap();
    index.put(&doc("small.png", 1)).await.unwrap();
    index.put(&doc("large.png", 3)).await.unwrap();
    index.put(&doc("medium.png", 2)).await.unwrap();

    let hits = index
        .query(&QueryRequest {
            profile: "maxsim".into(),
            tokens: vec![vec![0.5, -0.5], vec![1.0, 0.0]],
            hits: 2,
        })
        .await
        .unwrap();

    let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
    assert_eq!(ids, vec!["large.png", "medium.png"]);
    assert!((hits[0].relevance - 3.0).abs() < 1e-6);

    let sent = engine.last_search.lock().clone().unwrap();
    assert_eq!(sent["hits"], 2);
    // padded to one byte's worth of bits
    assert_eq!(
        sent["input.query(qt)"]["1"],
        json!([1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])
    );
}

#[tokio::test]
async fn query_errors_surface_as_search_errors() {
    let engine = Arc::new(Engine::default());
    let index = HttpIndex::new(&serve(engine).await).unwrap();
    let err = index
        .query(&QueryRequest {
            profile: "bm25".into(),
            tokens: vec![vec![1.0]],
            hits: 1,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Search(ref m) if m.contains("unknown rank profile")));
}

// ─────────────────────────────────────────────────────────────────────────────
// Embeddings API
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn encoder_accepts_single_and_multi_vectors() {
    let config = serve(Arc::new(Engine::default())).await;
    let encoder = HttpEncoder::new(&config).unwrap();
    assert_eq!(encoder.name(), "test-model");

    let single = encoder.encode("a query").await.unwrap();
    assert_eq!(single.tokens, vec![vec![0.5, -0.5]]);

    let multi = encoder.encode("multi").await.unwrap();
    assert_eq!(multi.tokens.len(), 2);
    assert_eq!(multi.dim(), 2);
}

#[tokio::test]
async fn encoder_errors() {
    let config = serve(Arc::new(Engine::default())).await;
    let encoder = HttpEncoder::new(&config).unwrap();

    assert!(matches!(encoder.encode("").await, Err(Error::Encoder(_))));
    assert!(matches!(
        encoder.encode("broken").await,
        Err(Error::Backend { status: 500, .. })
    ));
    assert!(matches!(encoder.encode("garbage").await, Err(Error::Encoder(_))));

    let anonymous = HttpEncoder::new(&Config {
        encoder_token: None,
        ..config
    })
    .unwrap();
    assert!(matches!(
        anonymous.encode("q").await,
        Err(Error::Backend { status: 401, .. })
    ));
}
