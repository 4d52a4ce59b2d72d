use std::sync::Arc;

use regintel_core::RawUpdate;
use regintel_storage::UpdateStore;
use tracing::{debug, warn};

/// What to conclude when the duplicate lookup itself fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LookupFailurePolicy {
    /// Treat as new; the unique index still blocks exact re-inserts.
    #[default]
    FailOpen,
    /// Treat as duplicate and skip the record for this run.
    FailClosed,
}

pub struct Deduplicator {
    store: Arc<dyn UpdateStore>,
    policy: LookupFailurePolicy,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn UpdateStore>, policy: LookupFailurePolicy) -> Self {
        Self { store, policy }
    }

    /// Same source, same title or normalized title, same publication day.
    pub async fn is_duplicate(&self, update: &RawUpdate) -> bool {
        let hashed = update.hashed_title();
        let lookup = self
            .store
            .exists_by_hash(&update.source_id, &update.title, &hashed, update.published_day())
            .await;

        match lookup {
            Ok(found) => {
                if found {
                    debug!(source_id = %update.source_id, hashed_title = %hashed, "duplicate skipped");
                }
                found
            }
            Err(err) => {
                warn!(
                    source_id = %update.source_id,
                    title = %update.title,
                    error = %err,
                    policy = ?self.policy,
                    "duplicate lookup failed"
                );
                self.policy == LookupFailurePolicy::FailClosed
            }
        }
    }
}
