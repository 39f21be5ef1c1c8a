//! `mailspool` - queue notification mail and deliver it over SMTP
//!
//! Loads a JSON configuration, runs the delivery engine and waits until the
//! queued messages are delivered.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use mailspool_core::{Mailer, MailerConfig};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Queue notification mail and deliver it over SMTP.
#[derive(Parser)]
#[command(name = "mailspool", version, about)]
struct Cli {
    /// Configuration file (default: `<config dir>/mailspool/config.json`).
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Write a configuration template.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Validate the configuration and print it (password redacted).
    Check,
    /// Queue one message and wait until it is delivered.
    Send {
        /// Subject line.
        #[arg(long, short)]
        subject: String,
        /// Recipient (default: `to` from the configuration).
        #[arg(long)]
        to: Option<String>,
        /// Message body (default: read from stdin).
        #[arg(long, short)]
        body: Option<String>,
        /// Give up after this many seconds.
        #[arg(long, default_value_t = 300)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "mailspool=info,mailspool_core=info,mailspool_smtp=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let path = match cli.config {
        Some(path) => path,
        None => default_config_path().context("no configuration directory on this platform")?,
    };

    match cli.command {
        Command::Init { force } => handle_init(&path, force),
        Command::Check => handle_check(&path),
        Command::Send {
            subject,
            to,
            body,
            timeout,
        } => {
            let limit = Duration::from_secs(timeout);
            handle_send(&path, subject, to.as_deref(), body, limit).await
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("mailspool").join("config.json"))
}

fn load_config(path: &Path) -> anyhow::Result<MailerConfig> {
    MailerConfig::load(path).with_context(|| format!("failed to load {}", path.display()))
}

/// Write a configuration template.
fn handle_init(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let template = MailerConfig::builder("smtp.example.com")
        .credentials("user@example.com", "")
        .from("user@example.com")
        .to("user@example.com")
        .build();
    template
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(())
}

/// Validate the configuration and print it.
fn handle_check(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;

    println!("SMTP:");
    println!("  Server: {}:{}", config.server, config.port());
    println!("  Security: {}", config.security().display_name());
    println!("  Username: {}", config.username);
    println!("  Password: <redacted>");
    println!("  From: {}", config.from);
    println!("  To: {}", config.to);
    println!("  EHLO name: {}", config.client_name);
    println!("  Queue capacity: {}", config.queue_capacity);
    println!("  Retry interval: {:?}", config.retry_interval());

    let trust = config
        .trust_anchors()
        .context("failed to load CA certificates")?;
    println!("  Certificate verification: {trust:?}");

    if let Err(errors) = config.validate() {
        for error in &errors {
            println!("  ! {}: {error}", error.field());
        }
        bail!("{} configuration problem(s)", errors.len());
    }
    println!("configuration OK");
    Ok(())
}

/// Queue one message and wait until the queue is drained.
async fn handle_send(
    path: &Path,
    subject: String,
    to: Option<&str>,
    body: Option<String>,
    limit: Duration,
) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let body = match body {
        Some(body) => body,
        None => {
            let mut body = String::new();
            std::io::stdin()
                .read_to_string(&mut body)
                .context("failed to read message body from stdin")?;
            body
        }
    };

    let mailer = Mailer::spawn(&config)?;
    let id = mailer.enqueue(subject, body, to)?;
    info!(id, "message queued");

    let wait = tokio::select! {
        result = tokio::time::timeout(limit, mailer.outbox().wait_empty()) => {
            if result.is_ok() {
                Wait::Drained
            } else {
                Wait::TimedOut(limit)
            }
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted");
            Wait::Interrupted
        }
    };

    let remaining = mailer.shutdown().await;
    summarize(wait, remaining.len())?;
    println!("delivered");
    Ok(())
}

/// How waiting for the queue to drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wait {
    Drained,
    TimedOut(Duration),
    Interrupted,
}

/// Turns the wait outcome and the undelivered count into the command result.
///
/// A queue that drained while the wait was being cut short still counts as
/// delivered.
fn summarize(wait: Wait, undelivered: usize) -> anyhow::Result<()> {
    if undelivered == 0 {
        return Ok(());
    }
    match wait {
        Wait::Drained => bail!("{undelivered} message(s) not delivered"),
        Wait::TimedOut(limit) => bail!(
            "timed out after {}s, {undelivered} message(s) not delivered",
            limit.as_secs()
        ),
        Wait::Interrupted => bail!("interrupted, {undelivered} message(s) not delivered"),
    }
}
