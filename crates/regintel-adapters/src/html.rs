use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use regintel_core::RawUpdate;
use regintel_storage::{FetchRequest, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    clean_text, normalize, text_or_none, AdapterContext, AdapterError, AdapterKind, RawRecord, SourceAdapter,
    SourceConfig,
};

const GENERIC_CONTAINER: &str = "article, .news-item, .update-item, li";
const GENERIC_TITLE: &str = "h1, h2, h3, h4, .title, .heading";
const GENERIC_DATE: &str = "time, .date, .published";

/// Selector-driven listing page. With no `container`, generic article-ish
/// blocks are scanned; with a `container` but no `title`, the container's
/// own text is the title.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HtmlConfig {
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    /// Case-insensitive regex a title must match to be kept.
    #[serde(default)]
    pub title_pattern: Option<String>,
    #[serde(default)]
    pub min_title_len: usize,
}

pub struct HtmlAdapter {
    source: SourceConfig,
    config: HtmlConfig,
    title_pattern: Option<Regex>,
}

struct Selectors {
    container: Selector,
    title: Option<Selector>,
    description: Option<Selector>,
    date: Option<Selector>,
    link: Option<Selector>,
    anchor: Selector,
}

impl HtmlAdapter {
    pub fn new(source: SourceConfig, config: HtmlConfig) -> Result<Self, AdapterError> {
        let title_pattern = config
            .title_pattern
            .as_deref()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| AdapterError::config(&source.source_id, format!("invalid title_pattern: {e}")))
            })
            .transpose()?;

        let adapter = Self {
            source,
            config,
            title_pattern,
        };
        adapter.selectors()?;
        Ok(adapter)
    }

    fn selectors(&self) -> Result<Selectors, AdapterError> {
        let generic = self.config.container.is_none();
        let parse = |selector: Option<&str>| selector.map(|s| parse_selector(&self.source.source_id, s)).transpose();

        Ok(Selectors {
            container: parse_selector(
                &self.source.source_id,
                self.config.container.as_deref().unwrap_or(GENERIC_CONTAINER),
            )?,
            title: parse(self.config.title.as_deref().or(generic.then_some(GENERIC_TITLE)))?,
            description: parse(self.config.description.as_deref())?,
            date: parse(self.config.date.as_deref().or(generic.then_some(GENERIC_DATE)))?,
            link: parse(self.config.link.as_deref())?,
            anchor: parse_selector(&self.source.source_id, "a[href]")?,
        })
    }

    pub fn parse(&self, body: &str, base_url: &str) -> Result<Vec<RawUpdate>, AdapterError> {
        let selectors = self.selectors()?;
        let document = Html::parse_document(body);
        let mut updates = Vec::new();

        for element in document.select(&selectors.container) {
            if updates.len() >= self.source.max_items {
                break;
            }
            let Some(record) = self.record(element, &selectors) else {
                continue;
            };
            if let Some(update) = normalize(record, &self.source, base_url) {
                updates.push(update);
            }
        }
        Ok(updates)
    }

    fn record(&self, element: ElementRef<'_>, selectors: &Selectors) -> Option<RawRecord> {
        let title = match &selectors.title {
            Some(sel) => first_text(element, sel),
            None => text_or_none(element.text().collect()),
        }
        .map(|t| clean_text(&t))?;

        if title.chars().count() < self.config.min_title_len {
            return None;
        }
        if let Some(pattern) = &self.title_pattern {
            if !pattern.is_match(&title) {
                return None;
            }
        }

        let link = match &selectors.link {
            Some(sel) => first_attr(element, sel, "href"),
            None => element
                .value()
                .attr("href")
                .and_then(|href| text_or_none(href.to_string()))
                .or_else(|| first_attr(element, &selectors.anchor, "href")),
        };
        let date_text = selectors
            .date
            .as_ref()
            .and_then(|sel| element.select(sel).next())
            .and_then(|node| {
                node.value()
                    .attr("datetime")
                    .and_then(|dt| text_or_none(dt.to_string()))
                    .or_else(|| text_or_none(node.text().collect()))
            });
        let tags = if link.as_deref().is_some_and(is_pdf) {
            vec!["pdf".to_string()]
        } else {
            Vec::new()
        };

        Some(RawRecord {
            title: Some(title),
            description: selectors.description.as_ref().and_then(|sel| first_text(element, sel)),
            link,
            date_text,
            published: None,
            jurisdiction: None,
            tags,
        })
    }
}

#[async_trait]
impl SourceAdapter for HtmlAdapter {
    fn source_id(&self) -> &str {
        &self.source.source_id
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Html
    }

    fn max_items(&self) -> Option<usize> {
        Some(self.source.max_items)
    }

    async fn fetch(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<Vec<RawUpdate>, AdapterError> {
        let request = FetchRequest::get(self.source.url.clone());
        let response = http.fetch(ctx.run_id, &self.source.source_id, &request).await?;
        let body = String::from_utf8_lossy(&response.body);
        let updates = self.parse(&body, &response.final_url)?;
        debug!(source_id = %self.source.source_id, count = updates.len(), "parsed html listing");
        Ok(updates)
    }
}

fn parse_selector(source_id: &str, selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector)
        .map_err(|e| AdapterError::config(source_id, format!("invalid selector `{selector}`: {e}")))
}

fn first_text(element: ElementRef<'_>, selector: &Selector) -> Option<String> {
    element
        .select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn first_attr(element: ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
    element
        .select(selector)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

fn is_pdf(link: &str) -> bool {
    let path = link.split(['?', '#']).next().unwrap_or(link);
    path.to_ascii_lowercase().ends_with(".pdf")
}
