use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use regintel_core::{NewRegulatoryUpdate, RawUpdate};
use regintel_storage::UpdateStore;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub struct Persister {
    store: Arc<dyn UpdateStore>,
}

impl Persister {
    pub fn new(store: Arc<dyn UpdateStore>) -> Self {
        Self { store }
    }

    /// Inserts one classified update. `None` covers rejected input, a key
    /// conflict and database errors alike; only the latter is logged as an error.
    pub async fn persist(&self, update: &RawUpdate, embedding: Option<Vec<f32>>) -> Option<Uuid> {
        if update.source_id.trim().is_empty() || update.title.trim().is_empty() {
            warn!(source_id = %update.source_id, "rejecting update without source id or title");
            return None;
        }

        let record = build_record(update, embedding, Utc::now().date_naive());
        match self.store.insert(&record).await {
            Ok(Some(id)) => {
                debug!(source_id = %record.source_id, %id, "stored update");
                Some(id)
            }
            Ok(None) => {
                debug!(
                    source_id = %record.source_id,
                    hashed_title = %record.hashed_title,
                    "insert conflicted with an existing row"
                );
                None
            }
            Err(err) => {
                error!(source_id = %record.source_id, title = %record.title, error = %err, "insert failed");
                None
            }
        }
    }
}

/// Missing publication dates fall back to `today`; a missing score to 0.
pub fn build_record(update: &RawUpdate, embedding: Option<Vec<f32>>, today: NaiveDate) -> NewRegulatoryUpdate {
    NewRegulatoryUpdate {
        source_id: update.source_id.clone(),
        title: update.title.clone(),
        hashed_title: update.hashed_title(),
        description: update.description.clone(),
        document_url: update.document_url.clone(),
        source_url: update.source_url.clone(),
        update_type: update.update_type,
        jurisdiction: update.jurisdiction.clone(),
        tags: update.tags.iter().cloned().collect(),
        published_date: update.published_day().unwrap_or(today),
        risk_score: update.risk_score.map(i32::from).unwrap_or(0),
        key_points: update.key_points.clone().unwrap_or_default(),
        embedding,
    }
}
