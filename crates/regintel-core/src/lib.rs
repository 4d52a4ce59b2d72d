//! Core domain model for the regulatory-update ingestion pipeline.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "regintel-core";

/// Kind of regulatory document an update describes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    #[default]
    Regulation,
    Guidance,
    Standard,
    Approval,
    Alert,
}

impl UpdateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Regulation => "regulation",
            Self::Guidance => "guidance",
            Self::Standard => "standard",
            Self::Approval => "approval",
            Self::Alert => "alert",
        }
    }
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical in-memory update handed from adapters through the pipeline.
///
/// `title` and `source_id` are always populated; every other field may be
/// absent. `risk_score` and `key_points` stay `None` until classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawUpdate {
    pub title: String,
    pub description: Option<String>,
    pub document_url: Option<String>,
    pub source_url: Option<String>,
    pub published_date: Option<DateTime<Utc>>,
    #[serde(rename = "type", default)]
    pub update_type: UpdateType,
    pub jurisdiction: Option<String>,
    pub source_id: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub risk_score: Option<u8>,
    pub key_points: Option<Vec<String>>,
}

impl RawUpdate {
    pub fn new(source_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
            document_url: None,
            source_url: None,
            published_date: None,
            update_type: UpdateType::default(),
            jurisdiction: None,
            source_id: source_id.into(),
            tags: BTreeSet::new(),
            risk_score: None,
            key_points: None,
        }
    }

    /// Calendar day used as the third component of the duplicate key.
    pub fn published_day(&self) -> Option<NaiveDate> {
        self.published_date.map(|d| d.date_naive())
    }

    pub fn hashed_title(&self) -> String {
        hashed_title(&self.title)
    }
}

/// Near-duplicate key for a title: ASCII lower-case, every run of
/// non-alphanumeric characters collapsed to one space, trimmed.
pub fn hashed_title(title: &str) -> String {
    title
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Row shape written to `regulatory_updates`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRegulatoryUpdate {
    pub source_id: String,
    pub title: String,
    pub hashed_title: String,
    pub description: Option<String>,
    pub document_url: Option<String>,
    pub source_url: Option<String>,
    pub update_type: UpdateType,
    pub jurisdiction: Option<String>,
    pub tags: Vec<String>,
    pub published_date: NaiveDate,
    pub risk_score: i32,
    pub key_points: Vec<String>,
    pub embedding: Option<Vec<f32>>,
}

/// Summary of one orchestrator invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub dry_run: bool,
    pub total_collected: usize,
    pub total_duplicates: usize,
    pub total_stored: usize,
    pub errors: Vec<String>,
}

/// Read-only snapshot served by the status endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestionStatus {
    pub running: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub collected: Option<usize>,
    pub stored: Option<usize>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl IngestionStatus {
    pub fn from_report(running: bool, report: Option<&RunReport>) -> Self {
        match report {
            Some(report) => Self {
                running,
                last_run_at: Some(report.finished_at),
                duration_seconds: Some(report.duration_seconds),
                collected: Some(report.total_collected),
                stored: Some(report.total_stored),
                errors: report.errors.clone(),
            },
            None => Self {
                running,
                ..Default::default()
            },
        }
    }
}
