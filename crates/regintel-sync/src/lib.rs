//! Ingestion orchestration: fetch, dedup, classify, embed and persist
//! regulatory updates, with a single-flight run guard and a cron worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use regintel_adapters::{adapter_for_source, AdapterContext, SourceAdapter};
use regintel_core::{IngestionStatus, RawUpdate, RunReport};
use regintel_storage::{HttpFetcher, UpdateStore};
use tokio::sync::RwLock;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

pub mod classify;
pub mod config;
pub mod dedup;
pub mod embed;
pub mod persist;
pub mod worker;

pub use classify::{Classification, Classifier, RiskRuleSpec};
pub use config::{IngestionConfig, SourceRegistry};
pub use dedup::{Deduplicator, LookupFailurePolicy};
pub use embed::{Embedder, EmbeddingConfig, OpenAiEmbedder, TextEmbedder};
pub use persist::Persister;
pub use worker::{IngestionWorker, TriggerResult, WorkerConfig, WorkerHandle};

pub const CRATE_NAME: &str = "regintel-sync";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(RunReport),
    AlreadyRunning,
}

/// Running flag plus the last finished report, shared with the status surface.
#[derive(Debug, Default)]
pub struct RunState {
    running: AtomicBool,
    last_report: RwLock<Option<RunReport>>,
}

struct RunGuard<'a> {
    state: &'a RunState,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.state.running.store(false, Ordering::SeqCst);
    }
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn try_begin(&self) -> Option<RunGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunGuard { state: self })
    }

    pub async fn last_report(&self) -> Option<RunReport> {
        self.last_report.read().await.clone()
    }

    async fn record(&self, report: RunReport) {
        *self.last_report.write().await = Some(report);
    }

    pub async fn snapshot(&self) -> IngestionStatus {
        let report = self.last_report.read().await;
        IngestionStatus::from_report(self.is_running(), report.as_ref())
    }
}

pub struct IngestionPipeline {
    sources: Vec<Box<dyn SourceAdapter>>,
    http: HttpFetcher,
    store: Arc<dyn UpdateStore>,
    dedup: Deduplicator,
    classifier: Classifier,
    embedder: Embedder,
    persister: Persister,
    max_items_global: usize,
    state: Arc<RunState>,
}

impl IngestionPipeline {
    pub fn new(store: Arc<dyn UpdateStore>, http: HttpFetcher, classifier: Classifier) -> Self {
        Self {
            sources: Vec::new(),
            http,
            dedup: Deduplicator::new(store.clone(), LookupFailurePolicy::default()),
            persister: Persister::new(store.clone()),
            store,
            classifier,
            embedder: Embedder::disabled(),
            max_items_global: config::DEFAULT_MAX_ITEMS,
            state: Arc::new(RunState::new()),
        }
    }

    /// Loads the source registry and rules named by `config` and wires every
    /// stage; bad selectors, patterns or rules fail here rather than mid-run.
    pub fn from_config(config: &IngestionConfig, store: Arc<dyn UpdateStore>) -> Result<Self> {
        let registry = SourceRegistry::load(&config.sources_file)?;
        let sources = registry
            .enabled_sources(&config.disabled_sources)
            .into_iter()
            .map(adapter_for_source)
            .collect::<Result<Vec<_>, _>>()
            .context("building source adapters")?;
        let http = HttpFetcher::new(config.http_client_config())?;
        let classifier = Classifier::from_file_or_standard(&config.rules_file)?;
        let embedder = Embedder::from_config(&config.embedding, config.http_timeout())?;

        info!(
            sources = sources.len(),
            disabled = config.disabled_sources.len(),
            max_items_global = config.max_items_global,
            embeddings = embedder.is_enabled(),
            "ingestion pipeline configured"
        );

        Ok(Self::new(store, http, classifier)
            .with_sources(sources)
            .with_embedder(embedder)
            .with_dedup_policy(config.dedup_policy)
            .with_max_items_global(config.max_items_global))
    }

    pub fn with_sources(mut self, sources: Vec<Box<dyn SourceAdapter>>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_embedder(mut self, embedder: Embedder) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn with_dedup_policy(mut self, policy: LookupFailurePolicy) -> Self {
        self.dedup = Deduplicator::new(self.store.clone(), policy);
        self
    }

    pub fn with_max_items_global(mut self, max_items: usize) -> Self {
        self.max_items_global = max_items;
        self
    }

    pub fn state(&self) -> Arc<RunState> {
        self.state.clone()
    }

    /// Executes one ingestion cycle, or returns `AlreadyRunning` at once when
    /// another cycle holds the run flag.
    pub async fn run_cycle(&self, options: RunOptions) -> RunOutcome {
        let Some(_guard) = self.state.try_begin() else {
            info!("ingestion run already in progress, skipping");
            return RunOutcome::AlreadyRunning;
        };

        let run_id = Uuid::new_v4();
        let span = info_span!("ingestion_run", %run_id, dry_run = options.dry_run);
        let report = self.execute(run_id, options).instrument(span).await;
        self.state.record(report.clone()).await;
        RunOutcome::Completed(report)
    }

    async fn execute(&self, run_id: Uuid, options: RunOptions) -> RunReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        let ctx = AdapterContext { run_id };

        let (mut collected, errors) = self.collect(&ctx).await;
        collected.truncate(self.max_items_global);
        let total_collected = collected.len();

        let mut total_duplicates = 0usize;
        let mut total_stored = 0usize;
        for mut update in collected {
            // The lookup must see the day the row would be stored under.
            self.classifier.fill_published_date(&mut update);
            update.published_date.get_or_insert(started_at);
            if self.dedup.is_duplicate(&update).await {
                total_duplicates += 1;
                continue;
            }
            self.classifier.apply(&mut update);
            if options.dry_run {
                debug!(
                    source_id = %update.source_id,
                    title = %update.title,
                    risk_score = update.risk_score,
                    "dry run, not persisting"
                );
                continue;
            }
            let embedding = self.embedder.embed_update(&update).await;
            if self.persister.persist(&update, embedding).await.is_some() {
                total_stored += 1;
            }
        }

        let finished_at = Utc::now();
        let duration_seconds = clock.elapsed().as_secs_f64();
        info!(
            collected = total_collected,
            duplicates = total_duplicates,
            stored = total_stored,
            errors = errors.len(),
            duration_seconds,
            "ingestion run complete"
        );

        RunReport {
            run_id,
            started_at,
            finished_at,
            duration_seconds,
            dry_run: options.dry_run,
            total_collected,
            total_duplicates,
            total_stored,
            errors,
        }
    }

    /// Sources in declared order; a failing source becomes one error entry.
    async fn collect(&self, ctx: &AdapterContext) -> (Vec<RawUpdate>, Vec<String>) {
        let mut collected = Vec::new();
        let mut errors = Vec::new();

        for adapter in &self.sources {
            let source_id = adapter.source_id();
            let span = info_span!("source", source_id, kind = adapter.kind().as_str());
            match adapter.fetch(&self.http, ctx).instrument(span).await {
                Ok(mut updates) => {
                    if let Some(max) = adapter.max_items() {
                        updates.truncate(max);
                    }
                    info!(source_id, count = updates.len(), "source fetched");
                    collected.append(&mut updates);
                }
                Err(err) => {
                    error!(source_id, error = %err, "source failed");
                    errors.push(format!("{source_id}: {err}"));
                }
            }
        }
        (collected, errors)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    use chrono::NaiveDate;
    use regintel_core::{hashed_title, NewRegulatoryUpdate, UpdateType};
    use regintel_storage::MemoryUpdateStore;

    async fn run(pipeline: &IngestionPipeline, dry_run: bool) -> RunReport {
        match pipeline.run_cycle(RunOptions { dry_run }).await {
            RunOutcome::Completed(report) => report,
            RunOutcome::AlreadyRunning => panic!("unexpected concurrent run"),
        }
    }

    #[tokio::test]
    async fn failing_source_is_isolated_from_healthy_ones() {
        let store = Arc::new(MemoryUpdateStore::new());
        let pipeline = pipeline(
            store.clone(),
            vec![
                Box::new(FailingSource {
                    id: "fda_enforcement".into(),
                }),
                static_source("ema_news", 5),
            ],
        );

        let report = run(&pipeline, false).await;

        assert_eq!(report.total_collected, 5);
        assert_eq!(report.total_stored, 5);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("fda_enforcement: "), "{:?}", report.errors);
        assert_eq!(store.rows().await.len(), 5);
    }

    #[tokio::test]
    async fn global_cap_keeps_first_items_in_source_order() {
        let store = Arc::new(MemoryUpdateStore::new());
        let pipeline = pipeline(
            store.clone(),
            vec![
                static_source("src_a", 8),
                static_source("src_b", 8),
                static_source("src_c", 8),
            ],
        )
        .with_max_items_global(10);

        let report = run(&pipeline, false).await;

        assert_eq!(report.total_collected, 10);
        assert_eq!(report.total_stored, 10);
        let titles = store
            .rows()
            .await
            .into_iter()
            .map(|row| row.record.title)
            .collect::<Vec<_>>();
        let expected = (0..8)
            .map(|n| format!("src_a update {n}"))
            .chain((0..2).map(|n| format!("src_b update {n}")))
            .collect::<Vec<_>>();
        assert_eq!(titles, expected);
    }

    #[tokio::test]
    async fn per_source_cap_is_enforced_by_the_orchestrator() {
        let store = Arc::new(MemoryUpdateStore::new());
        let pipeline = pipeline(
            store.clone(),
            vec![Box::new(StaticSource {
                id: "mdcg_guidance".into(),
                updates: updates("mdcg_guidance", 8),
                max_items: Some(3),
            })],
        );

        let report = run(&pipeline, false).await;
        assert_eq!(report.total_collected, 3);
    }

    #[tokio::test]
    async fn dry_run_classifies_but_never_inserts() {
        let store = Arc::new(MemoryUpdateStore::new());
        let pipeline = pipeline(store.clone(), vec![static_source("ema_news", 4)]);

        let report = run(&pipeline, true).await;

        assert!(report.dry_run);
        assert_eq!(report.total_collected, 4);
        assert_eq!(report.total_stored, 0);
        assert_eq!(store.insert_calls(), 0);
        assert_eq!(store.lookup_calls(), 4);
    }

    #[tokio::test]
    async fn duplicates_are_counted_and_skipped() {
        let store = Arc::new(MemoryUpdateStore::new());
        let title = "ema_news update 0";
        store
            .seed(NewRegulatoryUpdate {
                source_id: "ema_news".into(),
                title: title.into(),
                hashed_title: hashed_title(title),
                description: None,
                document_url: None,
                source_url: None,
                update_type: UpdateType::Guidance,
                jurisdiction: None,
                tags: Vec::new(),
                published_date: NaiveDate::from_ymd_opt(2024, 3, 1).expect("date"),
                risk_score: 10,
                key_points: Vec::new(),
                embedding: None,
            })
            .await;
        let pipeline = pipeline(store.clone(), vec![static_source("ema_news", 3)]);

        let report = run(&pipeline, false).await;

        assert_eq!(report.total_collected, 3);
        assert_eq!(report.total_duplicates, 1);
        assert_eq!(report.total_stored, 2);
        assert_eq!(store.insert_calls(), 2);
    }

    #[tokio::test]
    async fn second_run_of_same_items_stores_nothing() {
        let store = Arc::new(MemoryUpdateStore::new());
        let pipeline = pipeline(store.clone(), vec![static_source("ema_news", 3)]);

        assert_eq!(run(&pipeline, false).await.total_stored, 3);
        let second = run(&pipeline, false).await;

        assert_eq!(second.total_stored, 0);
        assert_eq!(second.total_duplicates, 3);
        assert_eq!(store.rows().await.len(), 3);
    }

    #[tokio::test]
    async fn rerun_of_title_dated_item_is_a_duplicate() {
        let store = Arc::new(MemoryUpdateStore::new());
        let source = || -> Box<dyn SourceAdapter> {
            Box::new(StaticSource {
                id: "mdcg_guidance".into(),
                updates: vec![RawUpdate::new(
                    "mdcg_guidance",
                    "MDCG 2024-1 vigilance guidance, March 2024",
                )],
                max_items: None,
            })
        };
        let pipeline = pipeline(store.clone(), vec![source()]);

        let first = run(&pipeline, false).await;
        assert_eq!(first.total_stored, 1);
        assert_eq!(first.total_duplicates, 0);
        assert_eq!(store.insert_calls(), 1);

        let second = run(&pipeline, false).await;
        assert_eq!(second.total_stored, 0);
        assert_eq!(second.total_duplicates, 1);
        assert_eq!(store.insert_calls(), 1);

        let dry = run(&pipeline, true).await;
        assert_eq!(dry.total_duplicates, 1);
        assert_eq!(store.insert_calls(), 1);
    }

    #[tokio::test]
    async fn fail_closed_policy_skips_records_when_lookups_fail() {
        let store = Arc::new(MemoryUpdateStore::new());
        store.set_fail_lookups(true);

        let closed = pipeline(store.clone(), vec![static_source("ema_news", 2)])
            .with_dedup_policy(LookupFailurePolicy::FailClosed);
        let report = run(&closed, false).await;
        assert_eq!(report.total_stored, 0);
        assert_eq!(report.total_duplicates, 2);

        let open = pipeline(store.clone(), vec![static_source("ema_news", 2)]);
        let report = run(&open, false).await;
        assert_eq!(report.total_stored, 2);
    }

    #[tokio::test]
    async fn stored_rows_carry_classification_inferred_dates_and_embeddings() {
        struct FixedEmbedder;

        #[async_trait::async_trait]
        impl TextEmbedder for FixedEmbedder {
            async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
                Ok(vec![0.5; 4])
            }
        }

        let mut recall = RawUpdate::new("fda_enforcement", "FDA Class I Recall: CardioMonitor 3000");
        recall.description = Some("cybersecurity vulnerability identified".into());
        let undated = RawUpdate::new("mdcg_guidance", "MDCG 2024-1 vigilance guidance, March 2024");

        let store = Arc::new(MemoryUpdateStore::new());
        let pipeline = pipeline(
            store.clone(),
            vec![Box::new(StaticSource {
                id: "mixed".into(),
                updates: vec![recall, undated],
                max_items: None,
            })],
        )
        .with_embedder(Embedder::new(Arc::new(FixedEmbedder)));

        let report = run(&pipeline, false).await;
        assert_eq!(report.total_stored, 2);

        let rows = store.rows().await;
        assert_eq!(rows[0].record.risk_score, 85);
        assert_eq!(
            rows[0].record.key_points,
            vec!["Critical Recall", "Field Safety / Enforcement", "Cybersecurity Risk"]
        );
        assert_eq!(rows[0].record.embedding, Some(vec![0.5; 4]));
        assert_eq!(
            rows[1].record.published_date,
            NaiveDate::from_ymd_opt(2024, 3, 1).expect("date")
        );
    }

    #[tokio::test]
    async fn concurrent_run_is_rejected_and_flag_is_released() {
        let store = Arc::new(MemoryUpdateStore::new());
        let (source, gate) = gated_source("slow_source", 2);
        let pipeline = Arc::new(pipeline(store.clone(), vec![source]));
        let state = pipeline.state();

        let first = tokio::spawn({
            let pipeline = pipeline.clone();
            async move { pipeline.run_cycle(RunOptions::default()).await }
        });
        while !state.is_running() {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            pipeline.run_cycle(RunOptions::default()).await,
            RunOutcome::AlreadyRunning
        );
        assert!(state.snapshot().await.running);

        gate.notify_one();
        let outcome = first.await.expect("join");
        assert!(matches!(outcome, RunOutcome::Completed(ref r) if r.total_stored == 2));
        assert!(!state.is_running());

        let status = state.snapshot().await;
        assert!(!status.running);
        assert_eq!(status.collected, Some(2));
        assert_eq!(status.stored, Some(2));
        assert!(status.last_run_at.is_some());
    }
}
