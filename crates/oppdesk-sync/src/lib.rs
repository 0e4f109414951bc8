//! Scrape run orchestration: config, the per-date pipeline, sinks and the scheduler.

pub mod sinks;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use oppdesk_adapters::{normalize_deadline, OpportunityDeskAdapter, SiteRules, SourceAdapter};
use oppdesk_core::{ItemOutcome, ListingEntry, Opportunity, OutcomeStatus, RunResult, ScrapeDate};
use oppdesk_storage::{
    BackoffPolicy, DelayRange, HttpClientConfig, HttpFetcher, PageFetcher, Sleeper, SnapshotStore,
    TokioSleeper,
};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};

pub use sinks::{DeliveryAck, Sink, SinkError, SupabaseSink, TelegramSink, WebhookSink};

pub const CRATE_NAME: &str = "oppdesk-sync";

pub const DEFAULT_SCRAPE_CRON: &str = "0 0 6 * * *";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown sink {0:?} (expected none, webhook, supabase or telegram)")]
    UnknownSink(String),
    #[error("{sink} sink selected but {var} is not set")]
    MissingSetting { sink: SinkKind, var: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    None,
    Webhook,
    Supabase,
    Telegram,
}

impl SinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Webhook => "webhook",
            Self::Supabase => "supabase",
            Self::Telegram => "telegram",
        }
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SinkKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "webhook" => Ok(Self::Webhook),
            "supabase" => Ok(Self::Supabase),
            "telegram" => Ok(Self::Telegram),
            other => Err(ConfigError::UnknownSink(other.to_string())),
        }
    }
}

/// Raw sink settings as found in the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkSettings {
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub supabase_url: Option<String>,
    pub supabase_service_key: Option<String>,
    pub supabase_table: String,
    pub telegram_bot_token: Option<String>,
    pub telegram_channel_id: Option<String>,
    pub telegram_join_url: Option<String>,
    pub telegram_api_base: String,
}

/// A sink selection with all of its required settings present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkConfig {
    None,
    Webhook {
        url: String,
        secret: Option<String>,
    },
    Supabase {
        url: String,
        service_key: String,
        table: String,
    },
    Telegram {
        bot_token: String,
        channel_id: String,
        join_url: Option<String>,
        api_base: String,
    },
}

#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    /// Overrides the site rules' base URL when set.
    pub base_url: Option<String>,
    pub snapshot_dir: PathBuf,
    pub write_snapshot: bool,
    pub http_timeout_secs: u64,
    pub max_attempts: usize,
    pub politeness_min_secs: u64,
    pub politeness_max_secs: u64,
    pub normalize_deadlines: bool,
    pub site_rules_path: Option<PathBuf>,
    pub sink: SinkKind,
    pub sink_settings: SinkSettings,
    pub scheduler_enabled: bool,
    pub scrape_cron: String,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            snapshot_dir: PathBuf::from("./snapshots"),
            write_snapshot: true,
            http_timeout_secs: 30,
            max_attempts: 5,
            politeness_min_secs: 5,
            politeness_max_secs: 10,
            normalize_deadlines: false,
            site_rules_path: None,
            sink: SinkKind::None,
            sink_settings: SinkSettings {
                supabase_table: "opportunities".to_string(),
                telegram_api_base: sinks::DEFAULT_TELEGRAM_API_BASE.to_string(),
                ..SinkSettings::default()
            },
            scheduler_enabled: false,
            scrape_cron: DEFAULT_SCRAPE_CRON.to_string(),
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl ScrapeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let sink_settings = SinkSettings {
            webhook_url: get("WEBHOOK_URL"),
            webhook_secret: get("WEBHOOK_SECRET"),
            supabase_url: get("SUPABASE_URL"),
            supabase_service_key: get("SUPABASE_SERVICE_ROLE_KEY"),
            supabase_table: get("SUPABASE_TABLE").unwrap_or(defaults.sink_settings.supabase_table),
            telegram_bot_token: get("TELEGRAM_BOT_TOKEN"),
            telegram_channel_id: get("TELEGRAM_CHANNEL_ID"),
            telegram_join_url: get("TELEGRAM_JOIN_URL"),
            telegram_api_base: get("TELEGRAM_API_BASE")
                .unwrap_or(defaults.sink_settings.telegram_api_base),
        };

        let sink = match get("OPPDESK_SINK") {
            Some(kind) => kind.parse()?,
            None if sink_settings.webhook_url.is_some() => SinkKind::Webhook,
            None => SinkKind::None,
        };

        Ok(Self {
            base_url: get("OPPDESK_BASE_URL"),
            snapshot_dir: get("OPPDESK_SNAPSHOT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.snapshot_dir),
            write_snapshot: get("OPPDESK_WRITE_SNAPSHOT")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.write_snapshot),
            http_timeout_secs: get("OPPDESK_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            max_attempts: get("OPPDESK_MAX_ATTEMPTS")
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_attempts),
            politeness_min_secs: get("OPPDESK_POLITENESS_MIN_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.politeness_min_secs),
            politeness_max_secs: get("OPPDESK_POLITENESS_MAX_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.politeness_max_secs),
            normalize_deadlines: get("OPPDESK_NORMALIZE_DEADLINES")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.normalize_deadlines),
            site_rules_path: get("OPPDESK_SITE_RULES").map(PathBuf::from),
            sink,
            sink_settings,
            scheduler_enabled: get("OPPDESK_SCHEDULER_ENABLED")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.scheduler_enabled),
            scrape_cron: get("OPPDESK_SCRAPE_CRON").unwrap_or(defaults.scrape_cron),
        })
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn politeness(&self) -> DelayRange {
        DelayRange::from_secs(self.politeness_min_secs, self.politeness_max_secs)
    }

    /// Validate that the selected sink has everything it needs.
    pub fn sink_config(&self) -> Result<SinkConfig, ConfigError> {
        let s = &self.sink_settings;
        let require = |value: &Option<String>, var: &'static str| {
            value.clone().ok_or(ConfigError::MissingSetting {
                sink: self.sink,
                var,
            })
        };
        Ok(match self.sink {
            SinkKind::None => SinkConfig::None,
            SinkKind::Webhook => SinkConfig::Webhook {
                url: require(&s.webhook_url, "WEBHOOK_URL")?,
                secret: s.webhook_secret.clone(),
            },
            SinkKind::Supabase => SinkConfig::Supabase {
                url: require(&s.supabase_url, "SUPABASE_URL")?,
                service_key: require(&s.supabase_service_key, "SUPABASE_SERVICE_ROLE_KEY")?,
                table: s.supabase_table.clone(),
            },
            SinkKind::Telegram => SinkConfig::Telegram {
                bot_token: require(&s.telegram_bot_token, "TELEGRAM_BOT_TOKEN")?,
                channel_id: require(&s.telegram_channel_id, "TELEGRAM_CHANNEL_ID")?,
                join_url: s.telegram_join_url.clone(),
                api_base: s.telegram_api_base.clone(),
            },
        })
    }

    pub fn site_rules(&self) -> Result<SiteRules> {
        let rules = match &self.site_rules_path {
            Some(path) => SiteRules::from_yaml_file(path)?,
            None => SiteRules::default(),
        };
        Ok(match &self.base_url {
            Some(base_url) => rules.with_base_url(base_url.clone()),
            None => rules,
        })
    }
}

/// Instantiate the configured sink, or `None` when records are only extracted.
pub fn build_sink(config: &ScrapeConfig) -> Result<Option<Arc<dyn Sink>>> {
    let timeout = config.http_timeout();
    let sink: Arc<dyn Sink> = match config.sink_config()? {
        SinkConfig::None => return Ok(None),
        SinkConfig::Webhook { url, secret } => Arc::new(WebhookSink::new(url, secret, timeout)?),
        SinkConfig::Supabase {
            url,
            service_key,
            table,
        } => Arc::new(SupabaseSink::new(&url, &service_key, &table, timeout)?),
        SinkConfig::Telegram {
            bot_token,
            channel_id,
            join_url,
            api_base,
        } => Arc::new(TelegramSink::new(
            &api_base, bot_token, channel_id, join_url, timeout,
        )?),
    };
    Ok(Some(sink))
}

/// Cooperative stop signal shared between the pipeline and whoever wants it to halt.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

enum Block<'a> {
    Entry(&'a ListingEntry),
    Skipped { position: usize, reason: &'a str },
}

impl Block<'_> {
    fn position(&self) -> usize {
        match self {
            Self::Entry(entry) => entry.position,
            Self::Skipped { position, .. } => *position,
        }
    }
}

pub struct ScrapePipeline {
    adapter: Arc<dyn SourceAdapter>,
    fetcher: Arc<dyn PageFetcher>,
    sleeper: Arc<dyn Sleeper>,
    snapshots: Option<SnapshotStore>,
    normalize_deadlines: bool,
    cancel: CancelFlag,
}

impl ScrapePipeline {
    pub fn new(adapter: Arc<dyn SourceAdapter>, fetcher: Arc<dyn PageFetcher>) -> Self {
        Self {
            adapter,
            fetcher,
            sleeper: Arc::new(TokioSleeper),
            snapshots: None,
            normalize_deadlines: false,
            cancel: CancelFlag::new(),
        }
    }

    pub fn from_config(config: &ScrapeConfig) -> Result<Self> {
        let rules = config.site_rules().context("loading site rules")?;
        let adapter = OpportunityDeskAdapter::new(rules)
            .context("compiling site rules")?
            .with_politeness(config.politeness());
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout(),
            backoff: BackoffPolicy {
                max_attempts: config.max_attempts,
                ..Default::default()
            },
            ..Default::default()
        })?;
        let snapshots = config
            .write_snapshot
            .then(|| SnapshotStore::new(config.snapshot_dir.clone()));

        Ok(Self::new(Arc::new(adapter), Arc::new(fetcher))
            .with_snapshots(snapshots)
            .with_deadline_normalization(config.normalize_deadlines))
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_snapshots(mut self, snapshots: Option<SnapshotStore>) -> Self {
        self.snapshots = snapshots;
        self
    }

    pub fn with_deadline_normalization(mut self, enabled: bool) -> Self {
        self.normalize_deadlines = enabled;
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Scrape every posting listed for `date`, delivering each to `sink` if given.
    ///
    /// Only an unreachable listing page makes the run fatal. Detail and
    /// delivery failures are recorded per item and the loop moves on.
    pub async fn run(&self, date: ScrapeDate, sink: Option<&dyn Sink>) -> RunResult {
        let mut run = RunResult::begin(date, self.adapter.listing_url(date));
        let span = info_span!("scrape_run", %date, run_id = %run.run_id);

        async move {
            info!(
                source_id = self.adapter.source_id(),
                sink = sink.map(|s| s.name()).unwrap_or("none"),
                "starting scrape"
            );

            if self.cancel.is_cancelled() {
                warn!("cancelled before the listing fetch");
                run.cancelled = true;
                run.finish();
                return run;
            }

            let page = match self.adapter.list_for_date(self.fetcher.as_ref(), date).await {
                Ok(page) => page,
                Err(err) => {
                    error!(error = %err, "listing unavailable; nothing to scrape");
                    run.mark_fatal(err.to_string());
                    run.finish();
                    return run;
                }
            };
            if page.article_count == 0 {
                info!("no articles published for this date");
            }

            let mut blocks: Vec<Block<'_>> = page.entries.iter().map(Block::Entry).collect();
            blocks.extend(page.skipped.iter().map(|s| Block::Skipped {
                position: s.position,
                reason: &s.reason,
            }));
            blocks.sort_by_key(Block::position);

            for block in blocks {
                if self.cancel.is_cancelled() {
                    warn!(position = block.position(), "cancelled; stopping before next item");
                    run.cancelled = true;
                    break;
                }
                match block {
                    Block::Skipped { position, reason } => {
                        run.record(ItemOutcome::skipped(position, reason));
                    }
                    Block::Entry(entry) => {
                        let item_span =
                            info_span!("scrape_item", position = entry.position, title = %entry.title);
                        self.process_entry(entry, sink, &mut run)
                            .instrument(item_span)
                            .await;
                    }
                }
            }

            run.finish();
            self.write_snapshots(&mut run).await;
            info!(summary = %run.summary(), "scrape finished");
            run
        }
        .instrument(span)
        .await
    }

    async fn process_entry(&self, entry: &ListingEntry, sink: Option<&dyn Sink>, run: &mut RunResult) {
        let report = self
            .adapter
            .fetch_detail(self.fetcher.as_ref(), self.sleeper.as_ref(), &entry.detail_url)
            .await;
        let mut fields = report.fields;
        if self.normalize_deadlines {
            fields.deadline = fields.deadline.map(|d| normalize_deadline(&d));
        }

        let Some(opportunity) = Opportunity::assemble(entry, fields) else {
            warn!("entry has no title; dropping");
            run.record(ItemOutcome::skipped(entry.position, "untitled entry"));
            return;
        };
        log_opportunity(&opportunity);

        let fetch_note = report
            .fetch_error
            .map(|e| format!("detail page unavailable: {e}"));
        let (status, note) = match sink {
            None => (OutcomeStatus::Extracted, fetch_note),
            Some(sink) => match sink.deliver(&opportunity).await {
                Ok(DeliveryAck::Accepted) => (OutcomeStatus::Delivered, fetch_note),
                Ok(DeliveryAck::Duplicate) => (
                    OutcomeStatus::Delivered,
                    Some(fetch_note.map_or_else(
                        || "duplicate".to_string(),
                        |n| format!("duplicate; {n}"),
                    )),
                ),
                Err(err) => {
                    warn!(sink = sink.name(), error = %err, "delivery failed");
                    (OutcomeStatus::DeliveryFailed, Some(err.to_string()))
                }
            },
        };

        run.record(ItemOutcome::for_entry(entry, status, note));
        run.opportunities.push(opportunity);
    }

    async fn write_snapshots(&self, run: &mut RunResult) {
        let Some(store) = &self.snapshots else {
            return;
        };
        if run.opportunities.is_empty() {
            info!("no opportunities collected; snapshot skipped");
            return;
        }

        match store.write_opportunities(run.date, &run.opportunities).await {
            Ok(stored) => {
                info!(
                    path = %stored.absolute_path.display(),
                    sha256 = %stored.content_hash,
                    bytes = stored.byte_size,
                    "snapshot written"
                );
                run.snapshot_path = Some(stored.absolute_path.display().to_string());
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "writing snapshot failed");
                return;
            }
        }

        if let Err(err) = store.write_run_report(run).await {
            warn!(error = %format!("{err:#}"), "writing run report failed");
        }
    }
}

fn log_opportunity(op: &Opportunity) {
    info!(
        title = %op.title,
        link = op.apply_link.as_deref().unwrap_or("-"),
        deadline = op.deadline.as_deref().unwrap_or("-"),
        thumbnail = op.thumbnail_url.as_deref().unwrap_or("-"),
        description = op.description.as_deref().unwrap_or("-"),
        "assembled opportunity"
    );
}

/// Cron job that scrapes "yesterday" on every tick. `None` when scheduling is off.
pub async fn maybe_build_scheduler(
    config: &ScrapeConfig,
    pipeline: Arc<ScrapePipeline>,
    sink: Option<Arc<dyn Sink>>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.scrape_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        let sink = sink.clone();
        Box::pin(async move {
            let run = pipeline.run(ScrapeDate::yesterday(), sink.as_deref()).await;
            info!(summary = %run.summary(), "scheduled scrape finished");
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(cron, "scrape scheduled");
    Ok(Some(sched))
}
