//! Site adapter contract + the Opportunity Desk listing/detail extractors.
//!
//! Everything that depends on the target site's markup lives here. The
//! selectors and phrases are plain data in [`SiteRules`] so a markup change is
//! a rules change, not a code change.

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use oppdesk_core::{DetailFields, ListingEntry, ListingPage, ScrapeDate, SkippedBlock};
use oppdesk_storage::{DelayRange, FetchError, PageFetcher, Sleeper};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

pub const CRATE_NAME: &str = "oppdesk-adapters";

pub const DEFAULT_BASE_URL: &str = "https://opportunitydesk.org";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector {selector:?}: {message}")]
    Selector { selector: String, message: String },
    #[error("deadline label must not be empty")]
    EmptyDeadlineLabel,
    #[error("invalid deadline label {label:?}: {source}")]
    Pattern {
        label: String,
        #[source]
        source: regex::Error,
    },
    #[error("listing page {url} unavailable: {source}")]
    ListingUnavailable {
        url: String,
        #[source]
        source: FetchError,
    },
}

/// Markup assumptions for one site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteRules {
    pub source_id: String,
    pub base_url: String,
    pub article_selector: String,
    pub title_link_selector: String,
    pub paragraph_selector: String,
    pub link_selector: String,
    /// Lower-case phrases that mark the paragraph holding the apply link.
    pub apply_link_phrases: Vec<String>,
    pub emphasis_selector: String,
    pub deadline_label: String,
    pub thumbnail_selector: String,
    pub content_selector: String,
    pub description_paragraphs: usize,
    pub tag_selector: String,
    pub resolve_relative_links: bool,
}

impl Default for SiteRules {
    fn default() -> Self {
        Self {
            source_id: "opportunitydesk".to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            article_selector: "article".to_string(),
            title_link_selector: "a[href]".to_string(),
            paragraph_selector: "p".to_string(),
            link_selector: "a[href]".to_string(),
            apply_link_phrases: vec!["for more information".to_string()],
            emphasis_selector: "strong, b, em".to_string(),
            deadline_label: "deadline:".to_string(),
            thumbnail_selector: "figure.image-link img".to_string(),
            content_selector: "div.entry-content".to_string(),
            description_paragraphs: 2,
            tag_selector: r#"a[rel="category tag"]"#.to_string(),
            resolve_relative_links: true,
        }
    }
}

impl SiteRules {
    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(text).context("parsing site rules")
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// What one detail-page visit produced.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DetailReport {
    pub fields: DetailFields,
    /// Set when the page could not be fetched; the fields are then all absent.
    pub fetch_error: Option<String>,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    fn listing_url(&self, date: ScrapeDate) -> String;

    /// Article blocks of a listing page, hrefs exactly as written.
    fn parse_listing(&self, html: &str) -> ListingPage;

    fn parse_detail(&self, html: &str, detail_url: &str) -> DetailFields;

    /// Turn a listing href into something fetchable, relative to the page it came from.
    fn resolve_link(&self, page_url: &str, href: &str) -> String;

    fn politeness(&self) -> DelayRange;

    /// Fetch and parse the listing for `date`. A failed fetch is the one
    /// condition that ends a run early.
    async fn list_for_date(
        &self,
        http: &dyn PageFetcher,
        date: ScrapeDate,
    ) -> Result<ListingPage, AdapterError> {
        let url = self.listing_url(date);
        info!(source_id = self.source_id(), %url, "fetching listing");
        let resp = http
            .fetch_page(&url)
            .await
            .map_err(|source| AdapterError::ListingUnavailable {
                url: url.clone(),
                source,
            })?;

        let mut page = self.parse_listing(&resp.body);
        for entry in &mut page.entries {
            entry.detail_url = self.resolve_link(&resp.final_url, &entry.detail_url);
        }
        page.url = url;
        info!(
            articles = page.article_count,
            entries = page.entries.len(),
            skipped = page.skipped.len(),
            "listing parsed"
        );
        Ok(page)
    }

    /// Fetch one detail page and extract its fields, then pause politely.
    /// Never fails: an unreachable page yields absent fields.
    async fn fetch_detail(
        &self,
        http: &dyn PageFetcher,
        sleeper: &dyn Sleeper,
        detail_url: &str,
    ) -> DetailReport {
        let report = match http.fetch_page(detail_url).await {
            Ok(resp) => DetailReport {
                fields: self.parse_detail(&resp.body, detail_url),
                fetch_error: None,
            },
            Err(err) => {
                warn!(detail_url, error = %err, "detail page unavailable");
                DetailReport {
                    fields: DetailFields::default(),
                    fetch_error: Some(err.to_string()),
                }
            }
        };

        let pause = self.politeness().sample();
        debug!(pause_ms = pause.as_millis() as u64, "politeness pause");
        sleeper.sleep(pause).await;
        report
    }
}

#[derive(Debug, Clone)]
struct CompiledRules {
    article: Selector,
    title_link: Selector,
    paragraph: Selector,
    link: Selector,
    emphasis: Selector,
    thumbnail: Selector,
    content: Selector,
    tag: Selector,
    deadline: Regex,
    deadline_prefix: Regex,
}

fn compile_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn compile_pattern(label: &str, pattern: String) -> Result<Regex, AdapterError> {
    Regex::new(&pattern).map_err(|source| AdapterError::Pattern {
        label: label.to_string(),
        source,
    })
}

impl CompiledRules {
    fn compile(rules: &SiteRules) -> Result<Self, AdapterError> {
        let label = rules.deadline_label.trim();
        if label.is_empty() {
            return Err(AdapterError::EmptyDeadlineLabel);
        }
        let label = regex::escape(label);
        Ok(Self {
            article: compile_selector(&rules.article_selector)?,
            title_link: compile_selector(&rules.title_link_selector)?,
            paragraph: compile_selector(&rules.paragraph_selector)?,
            link: compile_selector(&rules.link_selector)?,
            emphasis: compile_selector(&rules.emphasis_selector)?,
            thumbnail: compile_selector(&rules.thumbnail_selector)?,
            content: compile_selector(&rules.content_selector)?,
            tag: compile_selector(&rules.tag_selector)?,
            deadline: compile_pattern(&rules.deadline_label, format!(r"(?is)^{label}\s*(.*)$"))?,
            deadline_prefix: compile_pattern(
                &rules.deadline_label,
                format!(r"(?i)^{label}\s*[^.]*\.?\s*"),
            )?,
        })
    }
}

/// Extractor for opportunitydesk.org's WordPress markup.
#[derive(Debug, Clone)]
pub struct OpportunityDeskAdapter {
    rules: SiteRules,
    compiled: CompiledRules,
    phrases: Vec<String>,
    politeness: DelayRange,
}

impl OpportunityDeskAdapter {
    pub fn new(rules: SiteRules) -> Result<Self, AdapterError> {
        let compiled = CompiledRules::compile(&rules)?;
        let phrases = rules
            .apply_link_phrases
            .iter()
            .map(|p| normalize_text(p).to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        Ok(Self {
            rules,
            compiled,
            phrases,
            politeness: DelayRange::new(Duration::from_secs(5), Duration::from_secs(10)),
        })
    }

    pub fn with_politeness(mut self, politeness: DelayRange) -> Self {
        self.politeness = politeness;
        self
    }

    pub fn rules(&self) -> &SiteRules {
        &self.rules
    }

    fn extract_apply_link(&self, paragraph: ElementRef<'_>) -> Option<String> {
        let text = element_text(paragraph).to_lowercase();
        if !self.phrases.iter().any(|phrase| text.contains(phrase.as_str())) {
            return None;
        }
        paragraph
            .select(&self.compiled.link)
            .find_map(|a| a.value().attr("href"))
            .and_then(|href| text_or_none(href.to_string()))
    }

    fn extract_deadline(&self, paragraph: ElementRef<'_>) -> Option<String> {
        paragraph.select(&self.compiled.emphasis).find_map(|span| {
            let text = element_text(span);
            let caps = self.compiled.deadline.captures(&text)?;
            caps.get(1)
                .and_then(|m| text_or_none(m.as_str().to_string()))
        })
    }

    fn extract_description(&self, document: &Html) -> Option<String> {
        let content = document.select(&self.compiled.content).next()?;
        let joined = content
            .children()
            .filter_map(ElementRef::wrap)
            .filter(|el| el.value().name() == "p")
            .take(self.rules.description_paragraphs)
            .map(element_text)
            .collect::<Vec<_>>()
            .join(" ");

        // A leading "Deadline: ..." sentence repeats the deadline field.
        let stripped = self.compiled.deadline_prefix.replace(&joined, "");
        text_or_none(normalize_text(&stripped))
    }

    fn extract_tags(&self, document: &Html) -> Vec<String> {
        let mut tags: Vec<String> = Vec::new();
        for tag in document
            .select(&self.compiled.tag)
            .filter_map(|a| text_or_none(element_text(a)))
        {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        tags
    }
}

#[async_trait]
impl SourceAdapter for OpportunityDeskAdapter {
    fn source_id(&self) -> &str {
        &self.rules.source_id
    }

    fn listing_url(&self, date: ScrapeDate) -> String {
        format!(
            "{}/{}/",
            self.rules.base_url.trim_end_matches('/'),
            date.path_segment()
        )
    }

    fn parse_listing(&self, html: &str) -> ListingPage {
        let document = Html::parse_document(html);
        let mut page = ListingPage::default();

        for (idx, article) in document.select(&self.compiled.article).enumerate() {
            let position = idx + 1;
            page.article_count += 1;

            let link = article.select(&self.compiled.title_link).find_map(|a| {
                let title = text_or_none(element_text(a))?;
                let href = text_or_none(a.value().attr("href")?.to_string())?;
                Some((title, href))
            });

            match link {
                Some((title, detail_url)) => page.entries.push(ListingEntry {
                    position,
                    title,
                    detail_url,
                }),
                None => {
                    warn!(position, "no title link found in article, skipping");
                    page.skipped.push(SkippedBlock {
                        position,
                        reason: "no title link".to_string(),
                    });
                }
            }
        }

        page
    }

    fn parse_detail(&self, html: &str, detail_url: &str) -> DetailFields {
        let document = Html::parse_document(html);

        // Later matches replace earlier ones: the apply paragraph and the
        // deadline line sit below any introductory mentions.
        let mut apply_link = None;
        let mut deadline = None;
        for paragraph in document.select(&self.compiled.paragraph) {
            if let Some(link) = self.extract_apply_link(paragraph) {
                apply_link = Some(link);
            }
            if let Some(found) = self.extract_deadline(paragraph) {
                deadline = Some(found);
            }
        }

        let thumbnail_url = document
            .select(&self.compiled.thumbnail)
            .next()
            .and_then(|img| img.value().attr("src"))
            .and_then(|src| text_or_none(src.to_string()));

        DetailFields {
            apply_link: apply_link.or_else(|| Some(detail_url.to_string())),
            deadline,
            thumbnail_url,
            description: self.extract_description(&document),
            tags: self.extract_tags(&document),
        }
    }

    fn resolve_link(&self, page_url: &str, href: &str) -> String {
        if !self.rules.resolve_relative_links {
            return href.to_string();
        }
        resolve(page_url, href).unwrap_or_else(|| href.to_string())
    }

    fn politeness(&self) -> DelayRange {
        self.politeness
    }
}

/// Resolve a potentially relative URL against a base URL string.
pub fn resolve(base_url: &str, href: &str) -> Option<String> {
    Url::parse(base_url)
        .ok()
        .and_then(|base| base.join(href).ok())
        .map(|u| u.to_string())
}

fn normalize_text(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(element: ElementRef<'_>) -> String {
    normalize_text(&element.text().collect::<String>())
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

const MONTHS: &str =
    "January|February|March|April|May|June|July|August|September|October|November|December";

static DEADLINE_DATE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        format!(r"(?i)\d{{1,2}}(?:st|nd|rd|th)?\s+(?:{MONTHS}),?\s+\d{{4}}"),
        format!(r"(?i)(?:{MONTHS})\s+\d{{1,2}}(?:st|nd|rd|th)?,?\s+\d{{4}}"),
        r"\d{1,2}/\d{1,2}/\d{4}".to_string(),
        r"\d{4}-\d{2}-\d{2}".to_string(),
    ]
    .iter()
    .map(|p| Regex::new(p).expect("deadline date pattern is valid"))
    .collect()
});

/// Reduce free-text deadline wording to its first recognizable date,
/// e.g. `"March 1, 2024 (11:59 PM GMT)"` → `"March 1, 2024"`. Text without a
/// recognizable date comes back unchanged.
pub fn normalize_deadline(text: &str) -> String {
    DEADLINE_DATE_PATTERNS
        .iter()
        .find_map(|pattern| pattern.find(text))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| text.trim().to_string())
}
