//! Core domain model for the Opportunity Desk scraper.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Days, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "oppdesk-core";

/// Calendar date a scrape targets. Written as `YYYY/MM/DD` on the command line
/// and in listing URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ScrapeDate(NaiveDate);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DateParseError {
    #[error("expected a date in YYYY/MM/DD form, got {0:?}")]
    Format(String),
    #[error("{0:?} is not a valid calendar date")]
    Calendar(String),
}

impl ScrapeDate {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(Self)
    }

    /// The day before `today`, in local time.
    pub fn yesterday() -> Self {
        let today = Local::now().date_naive();
        Self(today.checked_sub_days(Days::new(1)).unwrap_or(today))
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    /// `YYYY/MM/DD`, the site's listing path segment.
    pub fn path_segment(&self) -> String {
        self.0.format("%Y/%m/%d").to_string()
    }

    /// `YYYY-MM-DD`, used to name snapshot files.
    pub fn file_stamp(&self) -> String {
        self.0.format("%Y-%m-%d").to_string()
    }
}

impl FromStr for ScrapeDate {
    type Err = DateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let bytes = raw.as_bytes();
        let shaped = bytes.len() == 10
            && bytes[4] == b'/'
            && bytes[7] == b'/'
            && bytes
                .iter()
                .enumerate()
                .all(|(i, b)| i == 4 || i == 7 || b.is_ascii_digit());
        if !shaped {
            return Err(DateParseError::Format(raw.to_string()));
        }
        NaiveDate::parse_from_str(raw, "%Y/%m/%d")
            .map(Self)
            .map_err(|_| DateParseError::Calendar(raw.to_string()))
    }
}

impl TryFrom<String> for ScrapeDate {
    type Error = DateParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ScrapeDate> for String {
    fn from(value: ScrapeDate) -> Self {
        value.path_segment()
    }
}

impl fmt::Display for ScrapeDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path_segment())
    }
}

/// One linked article block on a listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingEntry {
    /// 1-based position of the article block on the listing page.
    pub position: usize,
    pub title: String,
    pub detail_url: String,
}

/// An article block that carried no usable title link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedBlock {
    pub position: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ListingPage {
    pub url: String,
    pub article_count: usize,
    pub entries: Vec<ListingEntry>,
    pub skipped: Vec<SkippedBlock>,
}

/// Fields pulled from a detail page. Every field is independently optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DetailFields {
    pub apply_link: Option<String>,
    pub deadline: Option<String>,
    pub thumbnail_url: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// One scraped posting. Field names on the wire follow the downstream store:
/// `link` is the apply link, `thumbnail` the image URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Opportunity {
    pub title: String,
    #[serde(rename = "link")]
    pub apply_link: Option<String>,
    pub deadline: Option<String>,
    #[serde(rename = "thumbnail")]
    pub thumbnail_url: Option<String>,
    pub description: Option<String>,
    pub detail_url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Opportunity {
    /// Combine a listing entry with whatever the detail page yielded.
    ///
    /// Returns `None` when the entry has no title. The apply link falls back
    /// to the detail URL when the page had none (or could not be fetched).
    pub fn assemble(entry: &ListingEntry, detail: DetailFields) -> Option<Self> {
        let title = entry.title.trim();
        if title.is_empty() {
            return None;
        }
        let apply_link = detail
            .apply_link
            .filter(|link| !link.trim().is_empty())
            .unwrap_or_else(|| entry.detail_url.clone());
        Some(Self {
            title: title.to_string(),
            apply_link: Some(apply_link),
            deadline: detail.deadline,
            thumbnail_url: detail.thumbnail_url,
            description: detail.description,
            detail_url: entry.detail_url.clone(),
            tags: detail.tags,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Assembled with no sink configured.
    Extracted,
    Delivered,
    DeliveryFailed,
    ParseSkipped,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extracted => "extracted",
            Self::Delivered => "delivered",
            Self::DeliveryFailed => "delivery_failed",
            Self::ParseSkipped => "parse_skipped",
        }
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub position: usize,
    pub title: Option<String>,
    pub detail_url: Option<String>,
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ItemOutcome {
    pub fn skipped(position: usize, reason: impl Into<String>) -> Self {
        Self {
            position,
            title: None,
            detail_url: None,
            status: OutcomeStatus::ParseSkipped,
            note: Some(reason.into()),
        }
    }

    pub fn for_entry(entry: &ListingEntry, status: OutcomeStatus, note: Option<String>) -> Self {
        Self {
            position: entry.position,
            title: Some(entry.title.clone()),
            detail_url: Some(entry.detail_url.clone()),
            status,
            note,
        }
    }
}

/// Aggregate outcome of one scrape invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub date: ScrapeDate,
    pub listing_url: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Set when the listing page itself could not be fetched.
    pub fatal: Option<String>,
    pub cancelled: bool,
    pub items: Vec<ItemOutcome>,
    pub opportunities: Vec<Opportunity>,
    pub snapshot_path: Option<String>,
}

impl RunResult {
    pub fn begin(date: ScrapeDate, listing_url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            date,
            listing_url: listing_url.into(),
            started_at: now,
            finished_at: now,
            fatal: None,
            cancelled: false,
            items: Vec::new(),
            opportunities: Vec::new(),
            snapshot_path: None,
        }
    }

    pub fn record(&mut self, outcome: ItemOutcome) {
        self.items.push(outcome);
    }

    pub fn mark_fatal(&mut self, reason: impl Into<String>) {
        self.fatal = Some(reason.into());
    }

    pub fn finish(&mut self) {
        self.finished_at = Utc::now();
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.is_some()
    }

    /// Number of listing blocks attempted.
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn count(&self, status: OutcomeStatus) -> usize {
        self.items.iter().filter(|item| item.status == status).count()
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            date: self.date,
            attempted: self.item_count(),
            extracted: self.count(OutcomeStatus::Extracted),
            delivered: self.count(OutcomeStatus::Delivered),
            delivery_failed: self.count(OutcomeStatus::DeliveryFailed),
            parse_skipped: self.count(OutcomeStatus::ParseSkipped),
            fatal: self.is_fatal(),
            cancelled: self.cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub date: ScrapeDate,
    pub attempted: usize,
    pub extracted: usize,
    pub delivered: usize,
    pub delivery_failed: usize,
    pub parse_skipped: usize,
    pub fatal: bool,
    pub cancelled: bool,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "date={} attempted={} extracted={} delivered={} delivery_failed={} parse_skipped={}",
            self.date,
            self.attempted,
            self.extracted,
            self.delivered,
            self.delivery_failed,
            self.parse_skipped
        )?;
        if self.fatal {
            f.write_str(" fatal=true")?;
        }
        if self.cancelled {
            f.write_str(" cancelled=true")?;
        }
        Ok(())
    }
}
