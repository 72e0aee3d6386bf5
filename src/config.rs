//! Run configuration.
//!
//! Every knob is fixed for the lifetime of a run. Values come from defaults,
//! overlaid by `RANK_POOL_*` environment variables, overlaid by CLI flags.

use crate::pool::PoolMethod;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

pub const DEFAULT_POOL_FACTOR: usize = 3;
pub const DEFAULT_MAX_ATTEMPTS: usize = 5;
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_WORKERS: usize = 8;
pub const DEFAULT_HITS: usize = 5;
pub const DEFAULT_RANK_PROFILE: &str = "maxsim";

const ENV_PREFIX: &str = "RANK_POOL_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Search engine base URL.
    pub endpoint: String,
    /// Bearer token for the search engine, if it requires one.
    pub token: Option<String>,
    pub namespace: String,
    pub document_type: String,
    /// OpenAI-compatible embeddings endpoint used for queries.
    pub encoder_url: String,
    pub encoder_model: String,
    pub encoder_token: Option<String>,
    pub pool_factor: usize,
    pub pool_method: PoolMethod,
    /// Total write attempts per document, first try included.
    pub max_attempts: usize,
    pub initial_backoff_ms: u64,
    pub workers: usize,
    pub hits: usize,
    pub rank_profile: String,
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080".into(),
            token: None,
            namespace: "rank_pool".into(),
            document_type: "pdf_page".into(),
            encoder_url: "http://localhost:7997/v1/embeddings".into(),
            encoder_model: "vidore/colpali-v1.2".into(),
            encoder_token: None,
            pool_factor: DEFAULT_POOL_FACTOR,
            pool_method: PoolMethod::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            workers: DEFAULT_WORKERS,
            hits: DEFAULT_HITS,
            rank_profile: DEFAULT_RANK_PROFILE.into(),
            request_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Defaults overlaid with `RANK_POOL_*` environment variables.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] if a numeric variable does not parse or the
    /// result fails [`Config::validate`].
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`Config::from_env`] with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.is_empty());
        let mut cfg = Self::default();

        if let Some(v) = var("ENDPOINT") {
            cfg.endpoint = v;
        }
        cfg.token = var("TOKEN").or(cfg.token);
        if let Some(v) = var("NAMESPACE") {
            cfg.namespace = v;
        }
        if let Some(v) = var("DOCTYPE") {
            cfg.document_type = v;
        }
        if let Some(v) = var("ENCODER_URL") {
            cfg.encoder_url = v;
        }
        if let Some(v) = var("ENCODER_MODEL") {
            cfg.encoder_model = v;
        }
        cfg.encoder_token = var("ENCODER_TOKEN").or(cfg.encoder_token);
        if let Some(v) = var("POOL_FACTOR") {
            cfg.pool_factor = parse("POOL_FACTOR", &v)?;
        }
        if let Some(v) = var("POOL_METHOD") {
            cfg.pool_method = v.parse()?;
        }
        if let Some(v) = var("MAX_ATTEMPTS") {
            cfg.max_attempts = parse("MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = var("INITIAL_BACKOFF_MS") {
            cfg.initial_backoff_ms = parse("INITIAL_BACKOFF_MS", &v)?;
        }
        if let Some(v) = var("WORKERS") {
            cfg.workers = parse("WORKERS", &v)?;
        }
        if let Some(v) = var("HITS") {
            cfg.hits = parse("HITS", &v)?;
        }
        if let Some(v) = var("RANK_PROFILE") {
            cfg.rank_profile = v;
        }
        if let Some(v) = var("TIMEOUT_SECS") {
            cfg.request_timeout_secs = parse("TIMEOUT_SECS", &v)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values that would make a run meaningless.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("pool_factor", self.pool_factor),
            ("max_attempts", self.max_attempts),
            ("workers", self.workers),
            ("hits", self.hits),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{name} must be at least 1")));
            }
        }
        if self.endpoint.trim().is_empty() {
            return Err(Error::InvalidConfig("endpoint is empty".into()));
        }
        if self.rank_profile.trim().is_empty() {
            return Err(Error::InvalidConfig("rank_profile is empty".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn parse<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::InvalidConfig(format!("{ENV_PREFIX}{name}='{value}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.pool_factor, 3);
        assert_eq!(cfg.initial_backoff(), Duration::from_secs(1));
    }

    #[test]
    fn test_env_overlay() {
        let cfg = Config::from_lookup(lookup(&[
            ("RANK_POOL_ENDPOINT", "https://search.example.com"),
            ("RANK_POOL_TOKEN", "secret"),
            ("RANK_POOL_POOL_FACTOR", "2"),
            ("RANK_POOL_POOL_METHOD", "sequential"),
            ("RANK_POOL_WORKERS", " 16 "),
            ("RANK_POOL_HITS", ""),
        ]))
        .unwrap();
        assert_eq!(cfg.endpoint, "https://search.example.com");
        assert_eq!(cfg.token.as_deref(), Some("secret"));
        assert_eq!(cfg.pool_factor, 2);
        assert_eq!(cfg.pool_method, PoolMethod::Sequential);
        assert_eq!(cfg.workers, 16);
        // empty values fall back to defaults
        assert_eq!(cfg.hits, DEFAULT_HITS);
    }

    #[test]
    fn test_bad_values() {
        let err = Config::from_lookup(lookup(&[("RANK_POOL_WORKERS", "many")])).unwrap_err();
        assert!(err.to_string().contains("RANK_POOL_WORKERS"));

        let err = Config::from_lookup(lookup(&[("RANK_POOL_MAX_ATTEMPTS", "0")])).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_deserialize_partial() {
        let cfg: Config = serde_json::from_str(r#"{"workers": 2, "pool_method": "hierarchical"}"#).unwrap();
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.hits, DEFAULT_HITS);
    }
}
