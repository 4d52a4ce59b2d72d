use async_trait::async_trait;
use feed_rs::model::Entry;
use regintel_core::RawUpdate;
use regintel_storage::{FetchRequest, HttpFetcher};
use tracing::debug;

use crate::{normalize, AdapterContext, AdapterError, AdapterKind, RawRecord, SourceAdapter, SourceConfig};

/// RSS 2.0 and Atom feeds.
pub struct RssAdapter {
    source: SourceConfig,
}

impl RssAdapter {
    pub fn new(source: SourceConfig) -> Self {
        Self { source }
    }

    pub fn parse(&self, body: &[u8], base_url: &str) -> Result<Vec<RawUpdate>, AdapterError> {
        let feed = feed_rs::parser::parse(body).map_err(|e| AdapterError::Malformed(format!("invalid feed: {e}")))?;

        Ok(feed
            .entries
            .into_iter()
            .filter_map(|entry| normalize(entry_record(entry), &self.source, base_url))
            .take(self.source.max_items)
            .collect())
    }
}

fn entry_record(entry: Entry) -> RawRecord {
    RawRecord {
        title: entry.title.map(|t| t.content),
        description: entry
            .summary
            .map(|t| t.content)
            .or_else(|| entry.content.and_then(|c| c.body)),
        link: entry.links.into_iter().next().map(|l| l.href),
        date_text: None,
        published: entry.published.or(entry.updated),
        jurisdiction: None,
        tags: Vec::new(),
    }
}

#[async_trait]
impl SourceAdapter for RssAdapter {
    fn source_id(&self) -> &str {
        &self.source.source_id
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::RssXml
    }

    fn max_items(&self) -> Option<usize> {
        Some(self.source.max_items)
    }

    async fn fetch(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<Vec<RawUpdate>, AdapterError> {
        let request = FetchRequest::get(self.source.url.clone());
        let response = http.fetch(ctx.run_id, &self.source.source_id, &request).await?;
        let updates = self.parse(&response.body, &response.final_url)?;
        debug!(source_id = %self.source.source_id, count = updates.len(), "parsed feed entries");
        Ok(updates)
    }
}
