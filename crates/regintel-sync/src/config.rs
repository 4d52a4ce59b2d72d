use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use regintel_adapters::{validate_source_ids, SourceConfig};
use regintel_storage::HttpClientConfig;
use serde::Deserialize;

use crate::dedup::LookupFailurePolicy;
use crate::embed::{EmbeddingConfig, DEFAULT_EMBED_MODEL};
use crate::worker::WorkerConfig;

pub const DEFAULT_MAX_ITEMS: usize = 50;
pub const DEFAULT_SYNC_CRON: &str = "0 0 6 * * *";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing source registry")?;
        validate_source_ids(&registry.sources)?;
        Ok(registry)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Enabled sources in declared order, minus any listed in `disabled`.
    pub fn enabled_sources<'a>(&'a self, disabled: &BTreeSet<String>) -> Vec<&'a SourceConfig> {
        self.sources
            .iter()
            .filter(|s| s.enabled && !disabled.contains(&s.source_id))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct IngestionConfig {
    pub database_url: Option<String>,
    pub auto_enabled: bool,
    pub max_items_global: usize,
    pub embedding: EmbeddingConfig,
    pub sync_cron: String,
    pub sync_on_start: bool,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub dedup_policy: LookupFailurePolicy,
    pub disabled_sources: BTreeSet<String>,
    pub sources_file: PathBuf,
    pub rules_file: PathBuf,
    pub web_port: u16,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl IngestionConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let flag = |key: &str, default: bool| var(key).map(|v| parse_flag(&v)).unwrap_or(default);

        Self {
            database_url: var("DATABASE_URL"),
            auto_enabled: flag("REG_AUTO_ENABLED", false),
            max_items_global: var("REG_MAX_ITEMS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_ITEMS),
            embedding: EmbeddingConfig {
                enabled: flag("REG_EMBED_ENABLED", false),
                api_key: var("OPENAI_API_KEY").or_else(|| var("OPENROUTER_API_KEY")),
                model: var("REG_EMBED_MODEL").unwrap_or_else(|| DEFAULT_EMBED_MODEL.to_string()),
                base_url: var("REG_EMBED_BASE_URL"),
            },
            sync_cron: var("REG_SYNC_CRON").unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string()),
            sync_on_start: flag("REG_SYNC_ON_START", true),
            user_agent: var("REG_USER_AGENT").unwrap_or_else(|| "regintel-bot/0.1".to_string()),
            http_timeout_secs: var("REG_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(15),
            dedup_policy: if flag("REG_DEDUP_FAIL_CLOSED", false) {
                LookupFailurePolicy::FailClosed
            } else {
                LookupFailurePolicy::FailOpen
            },
            disabled_sources: var("REG_DISABLED_SOURCES")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            sources_file: var("REG_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sources.yaml")),
            rules_file: var("REG_RULES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("rules/risk.yaml")),
            web_port: var("REG_WEB_PORT").and_then(|v| v.parse().ok()).unwrap_or(8000),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout(),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            cron: self.sync_cron.clone(),
            scheduler_enabled: self.auto_enabled,
            run_on_start: self.auto_enabled && self.sync_on_start,
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    use regintel_adapters::{adapter_for_source, AdapterKind, FetchStrategy};

    fn config(pairs: &[(&str, &str)]) -> IngestionConfig {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        IngestionConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_without_environment() {
        let config = config(&[]);
        assert_eq!(config.database_url, None);
        assert!(!config.auto_enabled);
        assert_eq!(config.max_items_global, 50);
        assert_eq!(config.sync_cron, DEFAULT_SYNC_CRON);
        assert!(config.sync_on_start);
        assert_eq!(config.user_agent, "regintel-bot/0.1");
        assert_eq!(config.http_timeout_secs, 15);
        assert_eq!(config.dedup_policy, LookupFailurePolicy::FailOpen);
        assert!(config.disabled_sources.is_empty());
        assert_eq!(config.sources_file, PathBuf::from("sources.yaml"));
        assert_eq!(config.rules_file, PathBuf::from("rules/risk.yaml"));
        assert_eq!(config.web_port, 8000);
        assert!(!config.embedding.enabled);
        assert_eq!(config.embedding.model, DEFAULT_EMBED_MODEL);
        assert!(!config.worker_config().scheduler_enabled);
        assert!(!config.worker_config().run_on_start);
    }

    #[test]
    fn environment_overrides_are_parsed() {
        let config = config(&[
            ("DATABASE_URL", "postgres://regintel@localhost/regintel"),
            ("REG_AUTO_ENABLED", "TRUE"),
            ("REG_MAX_ITEMS", "10"),
            ("REG_EMBED_ENABLED", "1"),
            ("OPENROUTER_API_KEY", "sk-or-v1-xyz"),
            ("REG_SYNC_ON_START", "false"),
            ("REG_HTTP_TIMEOUT_SECS", "not-a-number"),
            ("REG_DEDUP_FAIL_CLOSED", "yes"),
            ("REG_DISABLED_SOURCES", " mhra_alerts, ,fda_510k "),
        ]);

        assert!(config.auto_enabled);
        assert_eq!(config.max_items_global, 10);
        assert!(config.embedding.enabled);
        assert_eq!(config.embedding.api_key.as_deref(), Some("sk-or-v1-xyz"));
        assert_eq!(config.http_timeout_secs, 15);
        assert_eq!(config.dedup_policy, LookupFailurePolicy::FailClosed);
        assert_eq!(
            config.disabled_sources,
            BTreeSet::from(["fda_510k".to_string(), "mhra_alerts".to_string()])
        );
        let worker = config.worker_config();
        assert!(worker.scheduler_enabled);
        assert!(!worker.run_on_start);
    }

    #[test]
    fn registry_loads_from_yaml_and_filters_disabled_sources() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"
sources:
  - source_id: ema_news
    display_name: EMA News
    url: https://www.ema.europa.eu/en/news.xml
    strategy:
      kind: rss_xml
  - source_id: mhra_alerts
    display_name: MHRA Alerts
    url: https://www.gov.uk/drug-device-alerts
    strategy:
      kind: html
      container: li
  - source_id: paused
    display_name: Paused
    enabled: false
    url: https://example.org/feed
    strategy:
      kind: rss_xml
"#
        )
        .expect("write yaml");

        let registry = SourceRegistry::load(file.path()).expect("registry");
        let disabled = BTreeSet::from(["mhra_alerts".to_string()]);
        let enabled = registry.enabled_sources(&disabled);

        assert_eq!(registry.sources.len(), 3);
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].source_id, "ema_news");
        assert!(matches!(registry.sources[1].strategy, FetchStrategy::Html(_)));
    }

    #[test]
    fn duplicate_ids_and_unknown_strategies_fail_to_load() {
        let duplicate = r#"
sources:
  - { source_id: a, display_name: A, url: "https://example.org/a", strategy: { kind: rss_xml } }
  - { source_id: a, display_name: B, url: "https://example.org/b", strategy: { kind: rss_xml } }
"#;
        let unknown = r#"
sources:
  - { source_id: a, display_name: A, url: "https://example.org/a", strategy: { kind: ftp } }
"#;
        assert!(SourceRegistry::from_yaml_str(duplicate).is_err());
        assert!(SourceRegistry::from_yaml_str(unknown).is_err());
    }

    #[test]
    fn shipped_registry_builds_an_adapter_per_source() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../sources.yaml");
        let registry = SourceRegistry::load(&path).expect("sources.yaml");
        let kinds = registry
            .sources
            .iter()
            .map(|source| adapter_for_source(source).map(|a| a.kind()))
            .collect::<Result<Vec<_>, _>>()
            .expect("every shipped source builds");

        assert!(kinds.contains(&AdapterKind::RestJson));
        assert!(kinds.contains(&AdapterKind::RssXml));
        assert!(kinds.contains(&AdapterKind::Html));
    }
}
