use std::collections::BTreeMap;

use async_trait::async_trait;
use regintel_core::RawUpdate;
use regintel_storage::{FetchRequest, HttpFetcher};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{normalize, AdapterContext, AdapterError, AdapterKind, RawRecord, SourceAdapter, SourceConfig};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

/// Appends `"{label}: {value}"` to the description when `field` is present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub label: String,
    pub field: String,
}

/// Field paths are dot-separated; numeric segments index into arrays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestJsonConfig {
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<JsonValue>,
    #[serde(default)]
    pub data_path: Option<String>,
    #[serde(default = "default_title_fields")]
    pub title_fields: Vec<String>,
    #[serde(default = "default_description_fields")]
    pub description_fields: Vec<String>,
    #[serde(default = "default_date_fields")]
    pub date_fields: Vec<String>,
    #[serde(default = "default_url_fields")]
    pub url_fields: Vec<String>,
    #[serde(default)]
    pub jurisdiction_fields: Vec<String>,
    #[serde(default)]
    pub annotate: Vec<Annotation>,
}

impl Default for RestJsonConfig {
    fn default() -> Self {
        Self {
            method: HttpMethod::Get,
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: None,
            data_path: None,
            title_fields: default_title_fields(),
            description_fields: default_description_fields(),
            date_fields: default_date_fields(),
            url_fields: default_url_fields(),
            jurisdiction_fields: Vec::new(),
            annotate: Vec::new(),
        }
    }
}

fn fields(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn default_title_fields() -> Vec<String> {
    fields(&["title", "name", "subject"])
}

fn default_description_fields() -> Vec<String> {
    fields(&["description", "abstract", "summary", "content"])
}

fn default_date_fields() -> Vec<String> {
    fields(&["published_date", "date", "created_at", "publication_date"])
}

fn default_url_fields() -> Vec<String> {
    fields(&["url", "link", "href"])
}

pub struct RestJsonAdapter {
    source: SourceConfig,
    config: RestJsonConfig,
}

impl RestJsonAdapter {
    pub fn new(source: SourceConfig, config: RestJsonConfig) -> Result<Self, AdapterError> {
        if config.title_fields.is_empty() {
            return Err(AdapterError::config(&source.source_id, "title_fields must not be empty"));
        }
        if config.body.is_some() && config.method == HttpMethod::Get {
            return Err(AdapterError::config(&source.source_id, "a request body requires method POST"));
        }
        Ok(Self { source, config })
    }

    pub fn request(&self) -> FetchRequest {
        FetchRequest {
            method: match self.config.method {
                HttpMethod::Get => Method::GET,
                HttpMethod::Post => Method::POST,
            },
            url: self.source.url.clone(),
            headers: self.config.headers.clone().into_iter().collect(),
            query: self.config.query.clone().into_iter().collect(),
            json_body: self.config.body.clone(),
        }
    }

    pub fn parse(&self, body: &[u8], base_url: &str) -> Result<Vec<RawUpdate>, AdapterError> {
        let value: JsonValue =
            serde_json::from_slice(body).map_err(|e| AdapterError::Malformed(format!("invalid JSON: {e}")))?;

        let items = match &self.config.data_path {
            Some(path) => json_lookup(&value, path),
            None => Some(&value),
        };
        let Some(items) = items.and_then(JsonValue::as_array) else {
            return Err(AdapterError::Malformed(format!(
                "no record array at `{}`",
                self.config.data_path.as_deref().unwrap_or("$")
            )));
        };

        Ok(items
            .iter()
            .filter_map(|item| normalize(self.record(item), &self.source, base_url))
            .take(self.source.max_items)
            .collect())
    }

    fn record(&self, item: &JsonValue) -> RawRecord {
        let mut description: Vec<String> = first_text(item, &self.config.description_fields)
            .into_iter()
            .collect();
        for annotation in &self.config.annotate {
            if let Some(value) = json_lookup(item, &annotation.field).and_then(json_text) {
                description.push(format!("{}: {value}", annotation.label));
            }
        }

        RawRecord {
            title: first_text(item, &self.config.title_fields),
            description: (!description.is_empty()).then(|| description.join(" - ")),
            link: first_text(item, &self.config.url_fields),
            date_text: first_text(item, &self.config.date_fields),
            published: None,
            jurisdiction: first_text(item, &self.config.jurisdiction_fields),
            tags: Vec::new(),
        }
    }
}

#[async_trait]
impl SourceAdapter for RestJsonAdapter {
    fn source_id(&self) -> &str {
        &self.source.source_id
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::RestJson
    }

    fn max_items(&self) -> Option<usize> {
        Some(self.source.max_items)
    }

    async fn fetch(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<Vec<RawUpdate>, AdapterError> {
        let response = http.fetch(ctx.run_id, &self.source.source_id, &self.request()).await?;
        let updates = self.parse(&response.body, &response.final_url)?;
        debug!(
            source_id = %self.source.source_id,
            count = updates.len(),
            attempts = response.attempts,
            "parsed json records"
        );
        Ok(updates)
    }
}

fn json_lookup<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    path.split('.').try_fold(value, |cur, segment| match cur {
        JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|idx| items.get(idx)),
        _ => cur.get(segment),
    })
}

fn json_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => crate::text_or_none(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Array(items) => {
            let parts = items.iter().filter_map(json_text).collect::<Vec<_>>();
            (!parts.is_empty()).then(|| parts.join(", "))
        }
        _ => None,
    }
}

fn first_text(item: &JsonValue, paths: &[String]) -> Option<String> {
    paths
        .iter()
        .find_map(|path| json_lookup(item, path).and_then(json_text))
}
