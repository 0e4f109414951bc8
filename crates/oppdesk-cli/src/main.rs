use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use oppdesk_core::{RunResult, ScrapeDate};
use oppdesk_sync::{build_sink, maybe_build_scheduler, CancelFlag, ScrapeConfig, ScrapePipeline, SinkKind};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const EXIT_FATAL: u8 = 1;
const EXIT_CANCELLED: u8 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SinkArg {
    None,
    Webhook,
    Supabase,
    Telegram,
}

impl From<SinkArg> for SinkKind {
    fn from(arg: SinkArg) -> Self {
        match arg {
            SinkArg::None => SinkKind::None,
            SinkArg::Webhook => SinkKind::Webhook,
            SinkArg::Supabase => SinkKind::Supabase,
            SinkArg::Telegram => SinkKind::Telegram,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "oppdesk")]
#[command(about = "Scrape one day of Opportunity Desk postings")]
struct Cli {
    /// Day to scrape as YYYY/MM/DD; defaults to yesterday.
    date: Option<ScrapeDate>,

    /// Where to deliver each record (overrides OPPDESK_SINK).
    #[arg(long, value_enum)]
    sink: Option<SinkArg>,

    #[arg(long)]
    snapshot_dir: Option<PathBuf>,

    #[arg(long)]
    no_snapshot: bool,

    /// Reduce deadline text to its first recognizable date.
    #[arg(long)]
    normalize_deadlines: bool,

    /// YAML file overriding the built-in selectors.
    #[arg(long)]
    site_rules: Option<PathBuf>,

    /// Keep running and scrape yesterday on OPPDESK_SCRAPE_CRON.
    #[arg(long)]
    schedule: bool,

    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply(&self, config: &mut ScrapeConfig) {
        if let Some(sink) = self.sink {
            config.sink = sink.into();
        }
        if let Some(dir) = &self.snapshot_dir {
            config.snapshot_dir = dir.clone();
        }
        if self.no_snapshot {
            config.write_snapshot = false;
        }
        if self.normalize_deadlines {
            config.normalize_deadlines = true;
        }
        if let Some(path) = &self.site_rules {
            config.site_rules_path = Some(path.clone());
        }
        if self.schedule {
            config.scheduler_enabled = true;
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "oppdesk failed");
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = ScrapeConfig::from_env().context("reading configuration")?;
    cli.apply(&mut config);

    let sink = build_sink(&config).context("configuring sink")?;
    let cancel = CancelFlag::new();
    let pipeline = Arc::new(
        ScrapePipeline::from_config(&config)?.with_cancel_flag(cancel.clone()),
    );

    if let Some(mut sched) = maybe_build_scheduler(&config, Arc::clone(&pipeline), sink.clone()).await? {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.scrape_cron, "scheduler running; Ctrl-C to stop");
        tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
        cancel.cancel();
        sched.shutdown().await.context("stopping scheduler")?;
        return Ok(ExitCode::SUCCESS);
    }

    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing current item");
            flag.cancel();
        }
    });

    let date = cli.date.unwrap_or_else(ScrapeDate::yesterday);
    let result = pipeline.run(date, sink.as_deref()).await;

    println!("{}", result.summary());
    if let Some(path) = &result.snapshot_path {
        println!("snapshot: {path}");
    }
    if let Some(reason) = &result.fatal {
        eprintln!("listing unavailable: {reason}");
    }

    Ok(ExitCode::from(exit_code(&result)))
}

/// Cancellation wins over a fatal listing failure.
fn exit_code(result: &RunResult) -> u8 {
    if result.cancelled {
        EXIT_CANCELLED
    } else if result.is_fatal() {
        EXIT_FATAL
    } else {
        0
    }
}
