//! Keyword risk scoring and title-based date inference.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use regex::{Regex, RegexBuilder};
use regintel_core::RawUpdate;
use serde::{Deserialize, Serialize};
use tracing::info;

pub const BASELINE_SCORE: i32 = 10;

const DEFAULT_RULES: &[(&str, i32, &str)] = &[
    ("class i", 30, "Critical Recall"),
    ("recall|enforcement|field safety", 25, "Field Safety / Enforcement"),
    ("guidance|mdcg|update", 15, "Guidance Impact"),
    ("software|algorithm|ml|sa md", 12, "Software/Algorithm"),
    ("cyber|security|vulnerability", 20, "Cybersecurity Risk"),
    ("clinical|evaluation|evidence", 10, "Clinical Impact"),
    ("risk|hazard|serious", 18, "Risk Signal"),
];

const MONTH_PATTERN: &str =
    r"\b(jan(uary)?|feb(ruary)?|mar(ch)?|apr(il)?|may|june?|july?|aug(ust)?|sep(t(ember)?)?|oct(ober)?|nov(ember)?|dec(ember)?)\b";

/// One `(pattern, delta, label)` entry as written in `rules/risk.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskRuleSpec {
    pub pattern: String,
    pub delta: i32,
    pub label: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RiskRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<RiskRuleSpec>,
}

#[derive(Debug, Clone)]
struct RiskRule {
    pattern: Regex,
    delta: i32,
    label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub risk_score: u8,
    pub key_points: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<RiskRule>,
    year: Regex,
    month: Regex,
}

pub fn default_rule_specs() -> Vec<RiskRuleSpec> {
    DEFAULT_RULES
        .iter()
        .map(|(pattern, delta, label)| RiskRuleSpec {
            pattern: pattern.to_string(),
            delta: *delta,
            label: label.to_string(),
        })
        .collect()
}

impl Classifier {
    pub fn new(specs: &[RiskRuleSpec]) -> Result<Self> {
        let rules = specs
            .iter()
            .map(|spec| {
                let pattern = RegexBuilder::new(&spec.pattern)
                    .case_insensitive(true)
                    .build()
                    .with_context(|| format!("compiling risk rule `{}`", spec.label))?;
                Ok(RiskRule {
                    pattern,
                    delta: spec.delta,
                    label: spec.label.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            rules,
            year: Regex::new(r"20\d{2}").context("compiling year pattern")?,
            month: RegexBuilder::new(MONTH_PATTERN)
                .case_insensitive(true)
                .build()
                .context("compiling month pattern")?,
        })
    }

    pub fn standard() -> Result<Self> {
        Self::new(&default_rule_specs())
    }

    /// Loads rules from `path` when it exists, otherwise the built-in set.
    pub fn from_file_or_standard(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "no rules file, using built-in risk rules");
            return Self::standard();
        }
        let text =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let file: RiskRulesFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        info!(path = %path.display(), rules = file.rules.len(), "loaded risk rules");
        Self::new(&file.rules)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Score starts at the baseline, each matching rule adds its delta and
    /// contributes its label once; the result is clamped to `0..=100`.
    pub fn classify(&self, title: &str, description: Option<&str>) -> Classification {
        let text = format!("{title} {}", description.unwrap_or_default()).to_lowercase();
        let mut score = BASELINE_SCORE;
        let mut key_points: Vec<String> = Vec::new();

        for rule in &self.rules {
            if rule.pattern.is_match(&text) {
                score = score.saturating_add(rule.delta);
                if !key_points.contains(&rule.label) {
                    key_points.push(rule.label.clone());
                }
            }
        }

        Classification {
            risk_score: score.clamp(0, 100) as u8,
            key_points,
        }
    }

    /// Sets score and key points, and fills a missing publication date
    /// from the title.
    pub fn apply(&self, update: &mut RawUpdate) {
        let Classification { risk_score, key_points } =
            self.classify(&update.title, update.description.as_deref());
        update.risk_score = Some(risk_score);
        update.key_points = Some(key_points);
        self.fill_published_date(update);
    }

    /// Infers a missing publication date from the title; a no-op when the
    /// source supplied one.
    pub fn fill_published_date(&self, update: &mut RawUpdate) {
        if update.published_date.is_none() {
            update.published_date = self.infer_date_from_title(&update.title);
        }
    }

    /// First `20xx` year plus the first month name (January when absent),
    /// as the first day of that month.
    pub fn infer_date_from_title(&self, title: &str) -> Option<DateTime<Utc>> {
        let year: i32 = self.year.find(title)?.as_str().parse().ok()?;
        let month = self
            .month
            .find(title)
            .and_then(|m| month_number(m.as_str()))
            .unwrap_or(1);
        NaiveDate::from_ymd_opt(year, month, 1)?
            .and_hms_opt(0, 0, 0)
            .map(|naive| naive.and_utc())
    }
}

fn month_number(name: &str) -> Option<u32> {
    let prefix: String = name.chars().take(3).collect::<String>().to_ascii_lowercase();
    let month = match prefix.as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}
