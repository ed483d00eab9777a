use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{Local, TimeZone};
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use url::Url;

use ezshare_sync::config::{self, Config};
use ezshare_sync::ezshare::EzShareClient;
use ezshare_sync::sync::progress::{EventSink, Severity, SyncEvent};
use ezshare_sync::sync::{SyncEngine, SyncOptions, SyncReport};

#[derive(Parser)]
#[command(
    name = "ezshare-sync",
    version,
    about = "Mirror an ez Share Wi-Fi SD card onto a local directory"
)]
struct Cli {
    /// Path to config file [default: ~/.config/ezshare-sync/config.toml]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Mirror the card onto the local directory (default)
    Sync,
    /// Print one parsed directory listing without downloading anything
    List {
        /// Listing URL [default: the configured root]
        #[arg(value_name = "URL")]
        dir: Option<String>,
    },
    /// Print the effective configuration
    Config,
}

/// Command-line settings that win over the config file.
#[derive(Args)]
struct Overrides {
    /// Listing URL of the card's root directory
    #[arg(long, global = true)]
    url: Option<String>,

    /// Local directory to mirror into (must exist)
    #[arg(long, global = true)]
    path: Option<PathBuf>,

    /// Re-download files even when the local copy is not older
    #[arg(long, global = true)]
    overwrite: bool,

    /// Never replace a file that already exists locally
    #[arg(long, global = true)]
    keep_old: bool,

    /// Skip entries with this exact name (repeatable)
    #[arg(long = "ignore", value_name = "NAME", global = true)]
    ignore: Vec<String>,

    /// Expected number of downloads, used for the progress percentage
    #[arg(long, value_name = "N", global = true)]
    expected_files: Option<u64>,

    /// Join the card's Wi-Fi network before syncing
    #[arg(long, global = true)]
    wifi: bool,

    /// Stay on the current network
    #[arg(long, global = true)]
    no_wifi: bool,

    #[arg(long, global = true)]
    ssid: Option<String>,

    #[arg(long, global = true)]
    psk: Option<String>,
}

impl Overrides {
    fn apply(self, cfg: &mut Config) {
        if let Some(url) = self.url {
            cfg.sync.url = url;
        }
        if let Some(path) = self.path {
            cfg.sync.path = path;
        }
        cfg.sync.overwrite |= self.overwrite;
        cfg.sync.keep_old |= self.keep_old;
        cfg.sync.ignore.extend(self.ignore);
        if let Some(n) = self.expected_files {
            cfg.sync.expected_files = n;
        }
        if self.wifi {
            cfg.wifi.enabled = true;
        }
        if self.no_wifi {
            cfg.wifi.enabled = false;
        }
        if let Some(ssid) = self.ssid {
            cfg.wifi.ssid = ssid;
        }
        if let Some(psk) = self.psk {
            cfg.wifi.psk = psk;
        }
    }
}

fn init_tracing(verbosity: u8, log_level: &str) {
    let default_filter = match verbosity {
        0 => format!("ezshare_sync={log_level}"),
        1 => "ezshare_sync=debug".into(),
        2 => "ezshare_sync=trace".into(),
        _ => "trace".into(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = config::load_config(cli.config.as_deref());
    let log_level = loaded
        .as_ref()
        .map_or_else(|_| "info".to_string(), |c| c.config.general.log_level.clone());
    init_tracing(cli.verbose, &log_level);

    let loaded = loaded?;
    match &loaded.source {
        Some(path) => tracing::debug!(path = %path.display(), "loaded config"),
        None => tracing::debug!("no config file, using defaults"),
    }
    let mut cfg = loaded.config;
    cli.overrides.apply(&mut cfg);

    match cli.command.unwrap_or(Command::Sync) {
        Command::Sync => {
            if !run_sync(&cfg).await? {
                std::process::exit(1);
            }
        }
        Command::List { dir } => list(&cfg, dir.as_deref()).await?,
        Command::Config => print!("{}", cfg.to_redacted_toml()?),
    }

    Ok(())
}

/// Connect, mirror, disconnect. Returns whether the mirror is complete.
async fn run_sync(cfg: &Config) -> Result<bool> {
    cfg.validate()?;
    let options = cfg.sync_options()?;

    let link = cfg.network_link();
    let session = tokio::task::block_in_place(|| link.connect())
        .context("Failed to connect to the card")?;

    let outcome = mirror(cfg, options).await;

    if let Err(e) = tokio::task::block_in_place(|| link.disconnect(session)) {
        tracing::error!(error = %e, "failed to leave the card network");
    }

    let report = outcome?;
    print_summary(&report);
    Ok(report.is_complete())
}

/// Run the engine on a worker task and render its events until it ends.
async fn mirror(cfg: &Config, options: SyncOptions) -> Result<SyncReport> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = EzShareClient::new(cfg.client_options());
    let engine = SyncEngine::new(client, options, EventSink::new(tx));
    let cancel = engine.cancel_token();

    let mut worker = tokio::spawn(async move { engine.run().await });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            result = &mut worker => {
                while let Ok(event) = rx.try_recv() {
                    render(event);
                }
                let report = result.context("sync worker panicked")??;
                return Ok(report);
            }

            Some(event) = rx.recv() => render(event),

            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                tracing::info!("received SIGINT, finishing current file boundary");
                cancel.cancel();
            }

            _ = sigterm.recv(), if !cancel.is_cancelled() => {
                tracing::info!("received SIGTERM, finishing current file boundary");
                cancel.cancel();
            }
        }
    }
}

fn render(event: SyncEvent) {
    match event {
        SyncEvent::Progress(percent) => tracing::debug!(percent, "progress"),
        SyncEvent::Status { message, severity } => match severity {
            Severity::Info => tracing::info!("{message}"),
            Severity::Warning => tracing::warn!("{message}"),
            Severity::Error => tracing::error!("{message}"),
        },
    }
}

fn print_summary(report: &SyncReport) {
    println!();
    if report.cancelled {
        println!("Sync cancelled.");
    }
    println!("Downloaded: {} ({} bytes)", report.downloaded, report.bytes);
    println!("Up to date: {}", report.skipped);

    if !report.failed.is_empty() {
        println!("Failed:     {}", report.failed.len());
        for failure in &report.failed {
            println!("  {}: {}", failure.path.display(), failure.error);
        }
    }
    if !report.incomplete.is_empty() {
        println!("Incomplete directories:");
        for dir in &report.incomplete {
            println!("  {} ({}): {}", dir.path.display(), dir.url, dir.error);
        }
    }
}

async fn list(cfg: &Config, url: Option<&str>) -> Result<()> {
    let url = match url {
        Some(u) => Url::parse(u).with_context(|| format!("Invalid URL: {u}"))?,
        None => cfg.root_url()?,
    };
    let rules = cfg.sync_options()?.rules;
    let client = EzShareClient::new(cfg.client_options());
    let listing = client.list_dir(&url, &rules).await?;

    println!("{url}");
    for dir in &listing.dirs {
        println!("  {:<19}  {:<6}  {}/  -> {}", "", "<DIR>", dir.name, dir.href);
    }
    for file in &listing.files {
        println!(
            "  {:<19}  {:<6}  {}  -> download?{}",
            format_time(file.modified),
            "",
            file.name,
            file.query
        );
    }
    Ok(())
}

fn format_time(secs: i64) -> String {
    if secs == 0 {
        return "unknown".into();
    }
    Local
        .timestamp_opt(secs, 0)
        .single()
        .map_or_else(|| "unknown".into(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string())
}
