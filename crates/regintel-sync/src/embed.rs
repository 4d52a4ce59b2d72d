//! Best-effort text embeddings over an OpenAI-compatible API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use regintel_core::RawUpdate;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

pub const DEFAULT_EMBED_MODEL: &str = "text-embedding-3-small";
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

#[async_trait::async_trait]
pub trait TextEmbedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: None,
            model: DEFAULT_EMBED_MODEL.to_string(),
            base_url: None,
        }
    }
}

/// OpenRouter keys carry an `sk-or-v1-` prefix; everything else goes to OpenAI.
pub fn base_url_for_key(api_key: &str) -> &'static str {
    if api_key.starts_with("sk-or-v1-") {
        OPENROUTER_BASE_URL
    } else {
        OPENAI_BASE_URL
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiEmbedder {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Result<Self> {
        let api_key = api_key.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building embedding client")?;
        Ok(Self {
            client,
            base_url: base_url_for_key(&api_key).to_string(),
            api_key,
            model: model.into(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait::async_trait]
impl TextEmbedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": self.model, "input": text }))
            .send()
            .await
            .with_context(|| format!("sending embedding request to {url}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("embedding provider returned {status}: {body}");
        }

        let parsed: EmbeddingResponse = response.json().await.context("decoding embedding response")?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .filter(|v| !v.is_empty())
            .context("embedding response contained no vector")
    }
}

/// Pipeline-facing wrapper: absent provider or any failure yields `None`.
#[derive(Clone, Default)]
pub struct Embedder {
    inner: Option<Arc<dyn TextEmbedder>>,
}

impl Embedder {
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn new(inner: Arc<dyn TextEmbedder>) -> Self {
        Self { inner: Some(inner) }
    }

    pub fn from_config(config: &EmbeddingConfig, timeout: Duration) -> Result<Self> {
        let api_key = match (&config.api_key, config.enabled) {
            (Some(key), true) => key,
            (None, true) => {
                warn!("embeddings enabled but no API key configured; continuing without embeddings");
                return Ok(Self::disabled());
            }
            (_, false) => return Ok(Self::disabled()),
        };

        let mut embedder = OpenAiEmbedder::new(api_key.clone(), config.model.clone(), timeout)?;
        if let Some(base_url) = &config.base_url {
            embedder = embedder.with_base_url(base_url.clone());
        }
        info!(model = %config.model, base_url = %embedder.base_url(), "embeddings enabled");
        Ok(Self::new(Arc::new(embedder)))
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub async fn embed_update(&self, update: &RawUpdate) -> Option<Vec<f32>> {
        let inner = self.inner.as_ref()?;
        let input = format!("{}\n\n{}", update.title, update.description.as_deref().unwrap_or_default());
        match inner.embed(&input).await {
            Ok(vector) => {
                debug!(source_id = %update.source_id, dims = vector.len(), "embedded update");
                Some(vector)
            }
            Err(err) => {
                warn!(source_id = %update.source_id, error = %err, "embedding failed, storing without vector");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use serde_json::Value;
    use std::sync::Mutex;

    struct RecordingEmbedder {
        inputs: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl TextEmbedder for RecordingEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.inputs.lock().expect("lock").push(text.to_string());
            Ok(vec![1.0, 2.0])
        }
    }

    struct BrokenEmbedder;

    #[async_trait::async_trait]
    impl TextEmbedder for BrokenEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            bail!("quota exceeded")
        }
    }

    async fn spawn_server(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        format!("http://{addr}/v1")
    }

    #[test]
    fn key_prefix_selects_provider() {
        assert_eq!(base_url_for_key("sk-or-v1-abc"), OPENROUTER_BASE_URL);
        assert_eq!(base_url_for_key("sk-proj-abc"), OPENAI_BASE_URL);
    }

    #[test]
    fn from_config_requires_flag_and_key() {
        let timeout = Duration::from_secs(1);
        let off = EmbeddingConfig {
            api_key: Some("sk-test".into()),
            ..Default::default()
        };
        let no_key = EmbeddingConfig {
            enabled: true,
            ..Default::default()
        };
        let on = EmbeddingConfig {
            enabled: true,
            api_key: Some("sk-test".into()),
            ..Default::default()
        };

        assert!(!Embedder::from_config(&off, timeout).expect("config").is_enabled());
        assert!(!Embedder::from_config(&no_key, timeout).expect("config").is_enabled());
        assert!(Embedder::from_config(&on, timeout).expect("config").is_enabled());
    }

    #[tokio::test]
    async fn embed_update_joins_title_and_description() {
        let recorder = Arc::new(RecordingEmbedder {
            inputs: Mutex::new(Vec::new()),
        });
        let embedder = Embedder::new(recorder.clone());
        let mut update = RawUpdate::new("ema_news", "Title");
        update.description = Some("Body".into());

        assert_eq!(embedder.embed_update(&update).await, Some(vec![1.0, 2.0]));
        assert_eq!(recorder.inputs.lock().expect("lock").as_slice(), ["Title\n\nBody"]);
    }

    #[tokio::test]
    async fn failures_and_disabled_provider_yield_none() {
        let update = RawUpdate::new("ema_news", "Title");
        assert_eq!(Embedder::new(Arc::new(BrokenEmbedder)).embed_update(&update).await, None);
        assert_eq!(Embedder::disabled().embed_update(&update).await, None);
    }

    #[tokio::test]
    async fn openai_embedder_posts_model_and_input() {
        let router = Router::new().route(
            "/v1/embeddings",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["model"], "text-embedding-3-small");
                assert_eq!(body["input"], "hello");
                Json(serde_json::json!({ "data": [{ "embedding": [0.1, 0.2, 0.3] }] }))
            }),
        );
        let base = spawn_server(router).await;
        let embedder = OpenAiEmbedder::new("sk-test", DEFAULT_EMBED_MODEL, Duration::from_secs(5))
            .expect("embedder")
            .with_base_url(base);

        assert_eq!(embedder.embed("hello").await.expect("vector"), vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn openai_embedder_surfaces_provider_errors() {
        let router = Router::new().route(
            "/v1/embeddings",
            post(|| async { (StatusCode::UNAUTHORIZED, "bad key") }),
        );
        let base = spawn_server(router).await;
        let embedder = OpenAiEmbedder::new("sk-test", DEFAULT_EMBED_MODEL, Duration::from_secs(5))
            .expect("embedder")
            .with_base_url(base);

        let err = embedder.embed("hello").await.expect_err("401");
        assert!(err.to_string().contains("401"));
    }
}
