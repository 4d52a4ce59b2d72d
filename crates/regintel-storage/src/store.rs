use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use regintel_core::NewRegulatoryUpdate;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence boundary consumed by the deduplicator and persister.
#[async_trait]
pub trait UpdateStore: Send + Sync {
    /// True when a row exists for `source_id` whose title equals `title` or
    /// whose hashed title equals `hashed_title`, published on `day`.
    /// A `None` day only matches rows without a publication date.
    async fn exists_by_hash(
        &self,
        source_id: &str,
        title: &str,
        hashed_title: &str,
        day: Option<NaiveDate>,
    ) -> Result<bool, StoreError>;

    /// Inserts one row. `Ok(None)` means the (source, hash, day) key was
    /// already taken and nothing was written.
    async fn insert(&self, record: &NewRegulatoryUpdate) -> Result<Option<Uuid>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgUpdateStore {
    pool: PgPool,
}

impl PgUpdateStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("regulatory_updates schema is up to date");
        Ok(())
    }
}

#[async_trait]
impl UpdateStore for PgUpdateStore {
    async fn exists_by_hash(
        &self,
        source_id: &str,
        title: &str,
        hashed_title: &str,
        day: Option<NaiveDate>,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1
                  FROM regulatory_updates
                 WHERE source_id = $1
                   AND (title = $2 OR hashed_title = $3)
                   AND published_date IS NOT DISTINCT FROM $4
            ) AS found
            "#,
        )
        .bind(source_id)
        .bind(title)
        .bind(hashed_title)
        .bind(day)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("found")?)
    }

    async fn insert(&self, record: &NewRegulatoryUpdate) -> Result<Option<Uuid>, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO regulatory_updates (
                source_id, title, hashed_title, description, document_url, source_url,
                type, jurisdiction, tags, published_date, risk_score, key_points, embedding
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (source_id, hashed_title, published_date) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&record.source_id)
        .bind(&record.title)
        .bind(&record.hashed_title)
        .bind(&record.description)
        .bind(&record.document_url)
        .bind(&record.source_url)
        .bind(record.update_type.as_str())
        .bind(&record.jurisdiction)
        .bind(&record.tags)
        .bind(record.published_date)
        .bind(record.risk_score)
        .bind(&record.key_points)
        .bind(&record.embedding)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.try_get::<Uuid, _>("id")).transpose()?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredUpdate {
    pub id: Uuid,
    pub record: NewRegulatoryUpdate,
}

/// In-process store with call counters and switchable failures.
#[derive(Debug, Default)]
pub struct MemoryUpdateStore {
    rows: Mutex<Vec<StoredUpdate>>,
    lookup_calls: AtomicUsize,
    insert_calls: AtomicUsize,
    fail_lookups: AtomicBool,
    fail_inserts: AtomicBool,
}

impl MemoryUpdateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, record: NewRegulatoryUpdate) -> Uuid {
        let id = Uuid::new_v4();
        self.rows.lock().await.push(StoredUpdate { id, record });
        id
    }

    pub async fn rows(&self) -> Vec<StoredUpdate> {
        self.rows.lock().await.clone()
    }

    pub fn lookup_calls(&self) -> usize {
        self.lookup_calls.load(Ordering::SeqCst)
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn set_fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl UpdateStore for MemoryUpdateStore {
    async fn exists_by_hash(
        &self,
        source_id: &str,
        title: &str,
        hashed_title: &str,
        day: Option<NaiveDate>,
    ) -> Result<bool, StoreError> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("lookup failure injected".into()));
        }
        let rows = self.rows.lock().await;
        Ok(rows.iter().any(|row| {
            row.record.source_id == source_id
                && (row.record.title == title || row.record.hashed_title == hashed_title)
                && Some(row.record.published_date) == day
        }))
    }

    async fn insert(&self, record: &NewRegulatoryUpdate) -> Result<Option<Uuid>, StoreError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("insert failure injected".into()));
        }
        let mut rows = self.rows.lock().await;
        let conflict = rows.iter().any(|row| {
            row.record.source_id == record.source_id
                && row.record.hashed_title == record.hashed_title
                && row.record.published_date == record.published_date
        });
        if conflict {
            return Ok(None);
        }
        let id = Uuid::new_v4();
        rows.push(StoredUpdate {
            id,
            record: record.clone(),
        });
        Ok(Some(id))
    }
}
