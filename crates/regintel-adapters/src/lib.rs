//! Source adapter contracts and the configurable fetch strategies.

use std::collections::BTreeSet;

use async_trait::async_trait;
use regintel_core::{RawUpdate, UpdateType};
use regintel_storage::{FetchError, HttpFetcher};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod html;
mod normalize;
mod rest;
mod rss;

pub use html::{HtmlAdapter, HtmlConfig};
pub use normalize::{clean_text, normalize, parse_date, resolve_url, RawRecord};
pub use rest::{Annotation, HttpMethod, RestJsonAdapter, RestJsonConfig};
pub use rss::RssAdapter;

pub const CRATE_NAME: &str = "regintel-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    RestJson,
    RssXml,
    Html,
}

impl AdapterKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RestJson => "rest_json",
            Self::RssXml => "rss_xml",
            Self::Html => "html",
        }
    }
}

/// How a source is fetched and parsed, tagged by `kind` in YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchStrategy {
    RestJson(RestJsonConfig),
    RssXml,
    Html(HtmlConfig),
}

impl FetchStrategy {
    pub fn kind(&self) -> AdapterKind {
        match self {
            Self::RestJson(_) => AdapterKind::RestJson,
            Self::RssXml => AdapterKind::RssXml,
            Self::Html(_) => AdapterKind::Html,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub url: String,
    #[serde(default)]
    pub update_type: UpdateType,
    #[serde(default)]
    pub jurisdiction: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    #[serde(default)]
    pub max_title_chars: Option<usize>,
    pub strategy: FetchStrategy,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_max_items() -> usize {
    25
}

#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub run_id: Uuid,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid configuration for source {source_id}: {message}")]
    Config { source_id: String, message: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl AdapterError {
    pub(crate) fn config(source_id: &str, message: impl Into<String>) -> Self {
        Self::Config {
            source_id: source_id.to_string(),
            message: message.into(),
        }
    }
}

/// One upstream publisher. `fetch` returns already-normalized updates,
/// capped at the source's `max_items`.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> AdapterKind;

    /// Per-source cap re-applied by the orchestrator; `None` means uncapped.
    fn max_items(&self) -> Option<usize> {
        None
    }

    async fn fetch(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<Vec<RawUpdate>, AdapterError>;
}

/// Builds the adapter for a configured source, rejecting bad URLs,
/// selectors and patterns up front.
pub fn adapter_for_source(source: &SourceConfig) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    Url::parse(&source.url)
        .map_err(|e| AdapterError::config(&source.source_id, format!("invalid url `{}`: {e}", source.url)))?;

    Ok(match &source.strategy {
        FetchStrategy::RestJson(config) => Box::new(RestJsonAdapter::new(source.clone(), config.clone())?),
        FetchStrategy::RssXml => Box::new(RssAdapter::new(source.clone())),
        FetchStrategy::Html(config) => Box::new(HtmlAdapter::new(source.clone(), config.clone())?),
    })
}

/// Unique, non-empty source ids in declaration order; duplicates are errors.
pub fn validate_source_ids(sources: &[SourceConfig]) -> Result<(), AdapterError> {
    let mut seen = BTreeSet::new();
    for source in sources {
        if source.source_id.trim().is_empty() {
            return Err(AdapterError::config("<unnamed>", "source_id must not be empty"));
        }
        if !seen.insert(source.source_id.as_str()) {
            return Err(AdapterError::config(&source.source_id, "duplicate source_id"));
        }
    }
    Ok(())
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
