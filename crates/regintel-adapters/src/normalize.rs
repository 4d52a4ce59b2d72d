//! Pure mapping from adapter-specific records into [`RawUpdate`].

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regintel_core::RawUpdate;
use reqwest::Url;
use scraper::{ElementRef, Html};

use crate::SourceConfig;

/// Loosely-typed record extracted by an adapter before normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRecord {
    pub title: Option<String>,
    pub description: Option<String>,
    pub link: Option<String>,
    pub date_text: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub jurisdiction: Option<String>,
    pub tags: Vec<String>,
}

/// Maps one record to a [`RawUpdate`]; `None` when no usable title remains.
///
/// Relative links resolve against `base_url`. Unparseable dates become
/// `None` rather than an error.
pub fn normalize(record: RawRecord, source: &SourceConfig, base_url: &str) -> Option<RawUpdate> {
    let mut title = clean_text(record.title.as_deref()?);
    if title.is_empty() {
        return None;
    }
    if let Some(max) = source.max_title_chars {
        title = truncate_chars(&title, max);
    }

    let mut update = RawUpdate::new(source.source_id.clone(), title);
    update.description = record.description.as_deref().map(clean_text).filter(|d| !d.is_empty());
    update.document_url = record.link.as_deref().and_then(|link| resolve_url(base_url, link));
    update.source_url = Some(source.url.clone());
    update.published_date = record
        .published
        .or_else(|| record.date_text.as_deref().and_then(parse_date));
    update.update_type = source.update_type;
    update.jurisdiction = record
        .jurisdiction
        .as_deref()
        .map(clean_text)
        .filter(|j| !j.is_empty())
        .or_else(|| source.jurisdiction.clone());
    update.tags = source
        .tags
        .iter()
        .chain(record.tags.iter())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    Some(update)
}

/// Text content of an HTML fragment with entities decoded, `script` and
/// `style` bodies dropped, control characters removed and whitespace
/// collapsed.
pub fn clean_text(input: &str) -> String {
    let fragment = Html::parse_fragment(input);
    let mut text = String::with_capacity(input.len());
    collect_text(fragment.root_element(), &mut text);
    text.chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "noscript", "template"];

const INLINE_ELEMENTS: &[&str] = &[
    "a", "abbr", "b", "code", "em", "i", "mark", "small", "span", "strong", "sub", "sup", "u",
];

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
        } else if let Some(child) = ElementRef::wrap(child) {
            let name = child.value().name();
            if SKIPPED_ELEMENTS.contains(&name) {
                continue;
            }
            // Block-level boundaries separate words.
            let block = !INLINE_ELEMENTS.contains(&name);
            if block {
                out.push(' ');
            }
            collect_text(child, out);
            if block {
                out.push(' ');
            }
        }
    }
}

fn truncate_chars(input: &str, max: usize) -> String {
    match input.char_indices().nth(max) {
        Some((idx, _)) => input[..idx].trim_end().to_string(),
        None => input.to_string(),
    }
}

/// Parses the date shapes regulatory sources publish; `None` for anything else.
pub fn parse_date(input: &str) -> Option<DateTime<Utc>> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    if s.len() == 8 && s.bytes().all(|b| b.is_ascii_digit()) {
        let year = s[0..4].parse().ok()?;
        let month = s[4..6].parse().ok()?;
        let day = s[6..8].parse().ok()?;
        return midnight(NaiveDate::from_ymd_opt(year, month, day)?);
    }
    for fmt in ["%Y-%m-%d", "%d.%m.%Y", "%d/%m/%Y", "%B %d, %Y", "%d %B %Y", "%b %d, %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return midnight(date);
        }
    }
    None
}

fn midnight(date: NaiveDate) -> Option<DateTime<Utc>> {
    date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc())
}

/// Absolute URL for `href`; fragment-only, `javascript:` and `mailto:`
/// links resolve to `None`.
pub fn resolve_url(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    let lower = href.to_ascii_lowercase();
    if href.is_empty()
        || href.starts_with('#')
        || lower.starts_with("javascript:")
        || lower.starts_with("mailto:")
    {
        return None;
    }
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Some(href.to_string());
    }
    Url::parse(base).ok()?.join(href).ok().map(|u| u.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FetchStrategy, SourceConfig};
    use chrono::TimeZone;
    use regintel_core::UpdateType;

    fn source() -> SourceConfig {
        SourceConfig {
            source_id: "mhra_alerts".into(),
            display_name: "MHRA Alerts".into(),
            enabled: true,
            url: "https://www.gov.uk/government/collections/device-alerts".into(),
            update_type: UpdateType::Alert,
            jurisdiction: Some("UK".into()),
            tags: vec!["mhra".into(), "alert".into()],
            max_items: 5,
            max_title_chars: Some(24),
            strategy: FetchStrategy::RssXml,
            notes: None,
        }
    }

    #[test]
    fn clean_text_strips_markup_entities_and_whitespace() {
        assert_eq!(
            clean_text("  <p>Field&nbsp;Safety <b>Notice</b></p>\n\t&amp; Recall&#33; &#x41; "),
            "Field Safety Notice & Recall! A"
        );
        assert_eq!(clean_text("<li>First</li><li>Second</li>"), "First Second");
        assert_eq!(clean_text("\u{7}bell"), "bell");
    }

    #[test]
    fn clean_text_decodes_named_entities() {
        let title = clean_text("MDCG&rsquo;s guidance &ndash; Conformit&eacute; assessment&hellip;");
        assert_eq!(title, "MDCG\u{2019}s guidance \u{2013} Conformit\u{e9} assessment\u{2026}");
        assert_eq!(
            regintel_core::hashed_title(&title),
            "mdcg s guidance conformit assessment"
        );
    }

    #[test]
    fn clean_text_drops_script_and_style_bodies() {
        assert_eq!(clean_text("<script>var x = 1;</script>Recall notice"), "Recall notice");
        assert_eq!(clean_text("<style>p { color: red }</style><p>Alert</p>"), "Alert");
    }

    #[test]
    fn clean_text_keeps_bare_angle_brackets_in_text() {
        assert_eq!(clean_text("Dose < 5 mg and > 2 mg recall"), "Dose < 5 mg and > 2 mg recall");
        assert_eq!(clean_text("a < b"), "a < b");
    }

    #[test]
    fn parse_date_accepts_source_formats_and_rejects_garbage() {
        let march_first = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).single();
        assert_eq!(parse_date("20240301"), march_first);
        assert_eq!(parse_date("2024-03-01"), march_first);
        assert_eq!(parse_date("01.03.2024"), march_first);
        assert_eq!(parse_date("01/03/2024"), march_first);
        assert_eq!(parse_date("March 1, 2024"), march_first);
        assert_eq!(parse_date("2024-03-01T00:00:00Z"), march_first);
        assert_eq!(parse_date("Fri, 01 Mar 2024 00:00:00 +0000"), march_first);
        assert_eq!(parse_date("20241399"), None);
        assert_eq!(parse_date("soon"), None);
        assert_eq!(parse_date(""), None);
    }

    #[test]
    fn resolve_url_handles_relative_and_ignored_links() {
        let base = "https://health.ec.europa.eu/medical-devices/mdcg_en";
        assert_eq!(
            resolve_url(base, "/docs/mdcg_2024-1.pdf").as_deref(),
            Some("https://health.ec.europa.eu/docs/mdcg_2024-1.pdf")
        );
        assert_eq!(
            resolve_url(base, "https://example.org/a").as_deref(),
            Some("https://example.org/a")
        );
        assert_eq!(resolve_url(base, "#top"), None);
        assert_eq!(resolve_url(base, "mailto:x@example.org"), None);
        assert_eq!(resolve_url(base, "   "), None);
    }

    #[test]
    fn normalize_fills_defaults_and_is_deterministic() {
        let record = RawRecord {
            title: Some("<a>Device&nbsp;Safety Alert: infusion pumps and more</a>".into()),
            description: Some("   ".into()),
            link: Some("/drug-device-alerts/pumps".into()),
            date_text: Some("not a date".into()),
            tags: vec![" pumps ".into(), "".into()],
            ..Default::default()
        };
        let first = normalize(record.clone(), &source(), &source().url).expect("title present");
        let second = normalize(record, &source(), &source().url).expect("title present");

        assert_eq!(first, second);
        assert_eq!(first.title, "Device Safety Alert: inf");
        assert_eq!(first.description, None);
        assert_eq!(first.published_date, None);
        assert_eq!(first.jurisdiction.as_deref(), Some("UK"));
        assert_eq!(first.update_type, UpdateType::Alert);
        assert_eq!(
            first.document_url.as_deref(),
            Some("https://www.gov.uk/drug-device-alerts/pumps")
        );
        assert_eq!(
            first.tags.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["alert", "mhra", "pumps"]
        );
    }

    #[test]
    fn normalize_drops_records_without_a_title() {
        let blank = RawRecord {
            title: Some("<br/> &nbsp; ".into()),
            ..Default::default()
        };
        assert!(normalize(blank, &source(), &source().url).is_none());
        assert!(normalize(RawRecord::default(), &source(), &source().url).is_none());
    }
}
