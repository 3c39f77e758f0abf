//! emberline - local-first session analytics pipeline
//!
//! This tool records sessions and events into a durable local queue and
//! uploads them to a collector server in immutable batches.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/emberline/queue.db (~/.local/share/emberline/queue.db)
//! - Logs: $XDG_STATE_HOME/emberline/emberline.log (~/.local/state/emberline/emberline.log)
//! - Config: $XDG_CONFIG_HOME/emberline/config.toml (~/.config/emberline/config.toml)

mod process_lock;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use emberline_core::{Config, Database, OpenOutcome, SessionTracker, SyncUploader, UploadRun};
use indicatif::{ProgressBar, ProgressStyle};
use process_lock::acquire_upload_guard;

#[derive(Parser)]
#[command(name = "emberline")]
#[command(about = "Record sessions and upload them to a collector")]
#[command(version)]
struct Args {
    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open a session (or resume one closed within the reconnect window)
    Open,

    /// Close the open session
    Close,

    /// Record an application event against the open session
    Tag {
        /// Event name
        name: String,

        /// Attribute in key=value form (repeatable)
        #[arg(short = 'a', long = "attr")]
        attrs: Vec<String>,
    },

    /// Record a screen transition against the open session
    Screen {
        /// Screen name
        name: String,
    },

    /// Opt the account out of data collection
    OptOut,

    /// Opt the account back in to data collection
    OptIn,

    /// Upload all eligible events to the collector
    Upload {
        /// Watch mode - upload continuously instead of one-shot
        #[arg(short, long)]
        watch: bool,

        /// Poll interval in milliseconds (only with --watch)
        #[arg(long, default_value = "5000")]
        poll: u64,
    },

    /// Show queue and uploader status
    Status,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;

    // Initialize logging (to file; stdout stays clean for command output)
    let _log_guard = if args.verbose {
        Some(
            emberline_core::logging::init(&config.logging)
                .context("failed to initialize logging")?,
        )
    } else {
        None
    };

    let api_key = config
        .require_api_key()
        .context("set api_key in config.toml before using emberline")?
        .to_string();

    let db_path = Config::database_path();
    tracing::info!(path = %db_path.display(), "Opening database");

    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;

    match args.command {
        Command::Open => cmd_open(db, &api_key, &config),
        Command::Close => cmd_close(db, &api_key, &config),
        Command::Tag { name, attrs } => cmd_tag(db, &api_key, &config, &name, &attrs),
        Command::Screen { name } => cmd_screen(db, &api_key, &config, &name),
        Command::OptOut => cmd_opt_out(db, &api_key, &config),
        Command::OptIn => cmd_opt_in(db, &api_key, &config),
        Command::Upload { watch, poll } => cmd_upload(db, &api_key, &config, watch, poll),
        Command::Status => cmd_status(db, &api_key, &config),
    }
}

fn tracker(db: Database, api_key: &str, config: &Config) -> Result<SessionTracker> {
    SessionTracker::new(db, api_key, &config.tracker).context("failed to create session tracker")
}

fn cmd_open(db: Database, api_key: &str, config: &Config) -> Result<()> {
    match tracker(db, api_key, config)?.open_session()? {
        OpenOutcome::New(id) => println!("Opened session {}", id),
        OpenOutcome::Resumed(id) => println!("Resumed session {}", id),
        OpenOutcome::AlreadyOpen(id) => println!("Session {} is already open", id),
        OpenOutcome::OptedOut => println!("Account is opted out; nothing recorded"),
    }
    Ok(())
}

fn cmd_close(db: Database, api_key: &str, config: &Config) -> Result<()> {
    if tracker(db, api_key, config)?.close_session()? {
        println!("Closed session");
    } else {
        println!("No open session");
    }
    Ok(())
}

fn cmd_tag(
    db: Database,
    api_key: &str,
    config: &Config,
    name: &str,
    attrs: &[String],
) -> Result<()> {
    let attributes = parse_attrs(attrs)?;
    if tracker(db, api_key, config)?.tag_event(name, &attributes)? {
        println!("Recorded event '{}'", name);
    } else {
        println!("Event '{}' not recorded (no open session or opted out)", name);
    }
    Ok(())
}

fn cmd_screen(db: Database, api_key: &str, config: &Config, name: &str) -> Result<()> {
    if tracker(db, api_key, config)?.tag_screen(name)? {
        println!("Recorded screen '{}'", name);
    } else {
        println!("Screen '{}' not recorded (duplicate, no open session, or opted out)", name);
    }
    Ok(())
}

fn cmd_opt_out(db: Database, api_key: &str, config: &Config) -> Result<()> {
    if tracker(db, api_key, config)?.opt_out()? {
        println!("Opted out of data collection");
    } else {
        println!("Already opted out");
    }
    Ok(())
}

fn cmd_opt_in(db: Database, api_key: &str, config: &Config) -> Result<()> {
    if tracker(db, api_key, config)?.opt_in()? {
        println!("Opted back in to data collection");
    } else {
        println!("Not currently opted out");
    }
    Ok(())
}

fn cmd_upload(db: Database, api_key: &str, config: &Config, watch: bool, poll: u64) -> Result<()> {
    // One upload process per database; concurrent requests within a process
    // are already coalesced by the uploader itself.
    let _guard = acquire_upload_guard(&Config::database_path())
        .context("failed to acquire upload lock")?;

    let Some(uploader) = SyncUploader::new(db, api_key, &config.tracker, &config.uploader)
        .context("failed to create uploader")?
    else {
        println!("Uploader is disabled. Enable it in config.toml:");
        println!();
        println!("  [uploader]");
        println!("  enabled = true");
        println!("  server_url = \"https://your-collector.example.com\"");
        return Ok(());
    };

    if !watch {
        report_run(uploader.upload()?);
        return Ok(());
    }

    // Watch mode: keep draining the queue until interrupted
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .context("failed to install signal handler")?;
    }

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .context("failed to build progress style")?,
    );
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner.set_message("watching queue");

    while running.load(Ordering::SeqCst) {
        match uploader.upload() {
            Ok(UploadRun::Completed(stats)) if stats.events_uploaded > 0 => {
                spinner.set_message(format!(
                    "delivered {} blob(s), {} event(s)",
                    stats.blobs_delivered, stats.events_uploaded
                ));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Upload iteration failed");
                spinner.set_message(format!("upload failed: {}", e));
            }
        }

        thread::sleep(Duration::from_millis(poll));
    }

    spinner.finish_with_message("stopped");
    Ok(())
}

fn report_run(run: UploadRun) {
    match run {
        UploadRun::Completed(stats) => {
            println!(
                "Delivered {} blob(s) with {} event(s)",
                stats.blobs_delivered, stats.events_uploaded
            );
            if stats.blobs_discarded > 0 {
                println!("Discarded {} rejected blob(s)", stats.blobs_discarded);
            }
            if stats.blobs_retained > 0 {
                println!(
                    "Retained {} blob(s) after server errors; run upload again to retry",
                    stats.blobs_retained
                );
            }
        }
        UploadRun::Coalesced => {
            println!("Upload already in progress; request coalesced");
        }
    }
}

fn cmd_status(db: Database, api_key: &str, config: &Config) -> Result<()> {
    let tracker = tracker(db, api_key, config)?;
    let stats = tracker.stats()?;
    let account = tracker.account();

    println!("Emberline Queue Status");
    println!("======================");
    println!();
    println!("API key:          {}", account.api_key);
    println!("Install id:       {}", account.install_id);
    println!(
        "Opted out:        {}",
        if stats.opted_out { "yes" } else { "no" }
    );
    println!();
    match &stats.open_session_id {
        Some(id) => println!("Open session:     {}", id),
        None => println!("Open session:     none"),
    }
    println!("Unclaimed events: {}", stats.unclaimed_events);
    println!("Claimed events:   {}", stats.claimed_events);
    println!("Pending blobs:    {}", stats.open_blobs);
    println!();

    let uploader = &config.uploader;
    println!("Uploader enabled: {}", uploader.enabled);
    if uploader.enabled {
        println!(
            "Server URL:       {}",
            uploader.server_url.as_deref().unwrap_or("<not set>")
        );
        println!(
            "Auth token:       {}",
            if uploader.auth_token.is_some() {
                "<set>"
            } else {
                "<not set>"
            }
        );
        println!("Timeout:          {}s", uploader.timeout_secs);
    }

    Ok(())
}

/// Parse repeated `key=value` arguments
fn parse_attrs(raw: &[String]) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                Ok((key.to_string(), value.to_string()))
            }
            _ => bail!("invalid attribute '{}', expected key=value", pair),
        })
        .collect()
}
