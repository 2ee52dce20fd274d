use std::path::PathBuf;

use clap::{Parser, Subcommand};

use contentsync::cli::Client;
use contentsync::config::{Config, default_config_path};
use contentsync::daemon;
use contentsync::mirror::{GitCli, repository_exists};
use contentsync::protocol::socket_path;
use contentsync::sync::SyncOutcome;
use contentsync::types::{Locale, Timestamp, now_millis};

#[derive(Parser)]
#[command(
    name = "contentsync",
    about = "Keep a git content mirror in sync and serve cached per-locale snapshots"
)]
struct Cli {
    /// Config file (defaults to $XDG_CONFIG_HOME/contentsync/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync daemon in the foreground
    Daemon,

    /// Stop the running daemon
    Stop,

    /// Show daemon status
    Status,

    /// Force a repository sync now
    Sync,

    /// Invalidate cached content and revalidate downstream pages
    Invalidate {
        /// Only this locale (all locales when omitted)
        #[arg(long)]
        locale: Option<Locale>,
    },

    /// Show the cached content snapshot for a locale
    Content {
        /// Locale to load (daemon default when omitted)
        #[arg(long)]
        locale: Option<Locale>,
    },

    /// Show recent sync attempts
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Check dependencies and configuration
    Doctor,
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Daemon => cmd_daemon(cli.config),
        Commands::Stop => cmd_stop(),
        Commands::Status => cmd_status(),
        Commands::Sync => cmd_sync(),
        Commands::Invalidate { locale } => cmd_invalidate(locale),
        Commands::Content { locale } => cmd_content(locale),
        Commands::History { limit } => cmd_history(limit),
        Commands::Doctor => cmd_doctor(cli.config),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        if e.to_string().contains("not running") {
            eprintln!();
            eprintln!("Hint: Start the daemon with: contentsync daemon");
        }
        std::process::exit(1);
    }
}

fn cmd_daemon(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(config_path.as_deref())?;
    daemon::start(config)?;
    Ok(())
}

fn cmd_stop() -> Result<(), Box<dyn std::error::Error>> {
    let mut client = Client::connect()?;
    client.stop()?;
    println!("Daemon stopped");
    Ok(())
}

fn cmd_status() -> Result<(), Box<dyn std::error::Error>> {
    let mut client = Client::connect()?;
    let status = client.status()?;

    println!("contentsync daemon status");
    println!(
        "  Running:     {}",
        if status.running { "yes" } else { "no" }
    );
    println!("  Version:     {} (pid {})", status.version, status.pid);
    println!("  Uptime:      {}", format_duration(status.uptime_secs));
    println!("  Repository:  {} ({})", status.repo_url, status.branch);
    println!("  Mirror:      {}", status.mirror_dir);

    let sync = &status.sync;
    println!();
    println!("Sync");
    println!("  Generation:  {}", sync.generation);
    println!(
        "  In progress: {}",
        if sync.in_progress { "yes" } else { "no" }
    );
    println!(
        "  Last sync:   {}",
        sync.last_sync_at
            .map(format_timestamp)
            .unwrap_or_else(|| "never".to_string())
    );
    if let Some(result) = &sync.last_result {
        println!("  Last result: {} ({})", result.outcome.as_str(), result.message);
    }
    for job in &status.jobs {
        println!(
            "  Job {}: every {}, last run {}",
            job.id,
            format_duration(job.interval_ms / 1000),
            job.last_run_at
                .map(format_timestamp)
                .unwrap_or_else(|| "never".to_string())
        );
    }

    println!();
    println!("Content cache");
    if status.cache.is_empty() {
        println!("  (empty)");
    }
    for entry in &status.cache {
        println!(
            "  {:<8} generation {:<6} {:<6} {} items, {} pages, loaded {}",
            entry.locale.as_str(),
            entry.generation,
            if entry.valid { "valid" } else { "stale" },
            entry.summary.items,
            entry.summary.pages,
            format_timestamp(entry.loaded_at)
        );
    }

    let reval = &status.revalidation;
    println!();
    println!("Revalidation");
    println!(
        "  queued {}, succeeded {}, failed {}, dropped {}",
        reval.queued, reval.succeeded, reval.failed, reval.dropped
    );

    Ok(())
}

fn cmd_sync() -> Result<(), Box<dyn std::error::Error>> {
    println!("Syncing...");

    let mut client = Client::connect()?;
    let result = client.sync()?;

    match result.outcome {
        SyncOutcome::Synced => println!("Synced successfully"),
        SyncOutcome::Partial => println!("Synced with warnings"),
        SyncOutcome::Failed => println!("Sync failed"),
        SyncOutcome::AlreadyInProgress => println!("A sync is already in progress"),
    }
    println!("  Message:     {}", result.message);
    if let Some(details) = &result.details {
        println!("  Details:     {}", details);
    }
    println!("  Generation:  {}", result.generation);
    println!("  Attempts:    {}", result.attempts);
    println!("  Duration:    {}ms", result.duration_ms);
    if let Some(commit) = &result.commit {
        println!("  Commit:      {} {}", commit.short_hash(), commit.message);
    }

    if !result.success {
        return Err(format!("sync did not complete (status {})", result.http_status()).into());
    }
    Ok(())
}

fn cmd_invalidate(locale: Option<Locale>) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = Client::connect()?;
    let result = client.invalidate(locale)?;

    match result.scope.locale() {
        Some(locale) => println!("Invalidated locale {}", locale),
        None => println!("Invalidated all locales"),
    }
    println!("  Revalidating: {}", result.paths.join(", "));

    Ok(())
}

fn cmd_content(locale: Option<Locale>) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = Client::connect()?;
    let result = client.content(locale)?;

    if let Some(entry) = &result.entry {
        println!(
            "Locale {} at generation {} (loaded {})",
            entry.locale,
            entry.generation,
            format_timestamp(entry.loaded_at)
        );
        let summary = &entry.summary;
        println!(
            "  {} items, {} categories, {} tags, {} collections, {} pages",
            summary.items, summary.categories, summary.tags, summary.collections, summary.pages
        );
    }

    println!();
    println!("Items ({})", result.items.len());
    for slug in &result.items {
        println!("  {}", slug);
    }
    println!("Pages ({})", result.pages.len());
    for slug in &result.pages {
        println!("  {}", slug);
    }

    Ok(())
}

fn cmd_history(limit: usize) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = Client::connect()?;
    let result = client.history(limit)?;

    if result.records.is_empty() {
        println!("No sync attempts recorded");
        return Ok(());
    }

    println!(
        "{:<12} {:<10} {:<20} {:>10} {:>8} {:>10}",
        "WHEN", "REASON", "OUTCOME", "GENERATION", "ATTEMPTS", "DURATION"
    );
    println!("{}", "-".repeat(76));

    for record in result.records {
        println!(
            "{:<12} {:<10} {:<20} {:>10} {:>8} {:>8}ms",
            format_timestamp(record.timestamp),
            record.reason.as_str(),
            record.outcome.as_str(),
            record.generation,
            record.attempts,
            record.duration_ms
        );
        if let Some(details) = record.details {
            println!("    {}", details);
        }
    }

    Ok(())
}

fn cmd_doctor(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    println!("contentsync system check\n");

    let git_ok = GitCli::new().is_available();
    println!(
        "[{}] git: {}",
        if git_ok { "OK" } else { "FAIL" },
        if git_ok { "available" } else { "not found" }
    );

    let shown_path = config_path.clone().unwrap_or_else(default_config_path);
    let config = Config::load(config_path.as_deref());
    match &config {
        Ok(_) => println!("[OK] Config: {}", shown_path.display()),
        Err(e) => println!("[FAIL] Config: {}", e),
    }

    if let Ok(config) = &config {
        let mirror_ok = repository_exists(&config.mirror_dir);
        println!(
            "[{}] Mirror: {}{}",
            if mirror_ok { "OK" } else { "INFO" },
            config.mirror_dir.display(),
            if mirror_ok { "" } else { " (not cloned yet)" }
        );
        println!(
            "[INFO] Revalidation: {}",
            config.revalidate_url.as_deref().unwrap_or("disabled")
        );
    }

    let daemon_running = daemon::is_daemon_running();
    println!(
        "[{}] Daemon: {} ({})",
        if daemon_running { "OK" } else { "INFO" },
        if daemon_running {
            "running"
        } else {
            "not running"
        },
        socket_path().display()
    );

    if !git_ok || config.is_err() {
        std::process::exit(1);
    }

    Ok(())
}

fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}

/// Millisecond timestamp as a relative time.
fn format_timestamp(ts: Timestamp) -> String {
    let now = now_millis();
    if ts > now {
        return format!("in {}s", (ts - now) / 1000);
    }
    format!("{} ago", format_duration((now - ts) / 1000))
}
