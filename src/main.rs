//! # Nexus: batched email dispatch daemon
//!
//! Usage:
//!   nexus run                         # Scheduler + worker pool until Ctrl-C
//!   nexus tick                        # One scheduling round, deliver it, exit
//!   nexus status                      # Item counts per status
//!   nexus init-config                 # Write ~/.nexus/config.toml
//!   nexus enqueue --owner acme --to a@b.c --subject Hi --body "<p>Hi</p>"
//!   nexus set-smtp --owner acme --host smtp.acme.test --from news@acme.test

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use nexus_channels::SmtpTransport;
use nexus_core::traits::RecordStore;
use nexus_core::{BatchDescriptor, NewWorkItem, NexusConfig, SmtpSettings};
use nexus_scheduler::{BatchSender, DispatchScheduler, MailDb, MemoryQueue, WorkerPool};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "nexus",
    version,
    about = "📬 Nexus — batched, rate-limit aware email dispatch"
)]
struct Cli {
    /// Config file (default: ~/.nexus/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Database path, overrides [database].path
    #[arg(long, global = true)]
    db: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON logs and reports
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and worker pool until Ctrl-C
    Run,
    /// Run one scheduling round, deliver what it claimed, then exit
    Tick,
    /// Show item counts per status
    Status,
    /// Write a default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Queue one email
    Enqueue {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        subject: String,
        /// HTML body
        #[arg(long)]
        body: String,
        #[arg(long)]
        campaign: Option<String>,
        /// RFC 3339 send time (default: now)
        #[arg(long)]
        at: Option<String>,
    },
    /// Store SMTP settings for an owner
    SetSmtp {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        host: String,
        #[arg(long, default_value = "587")]
        port: u16,
        /// Plain connection without STARTTLS
        #[arg(long)]
        no_tls: bool,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        from: String,
        #[arg(long)]
        display_name: Option<String>,
        /// HTML appended to every body
        #[arg(long, default_value = "")]
        signature: String,
        /// Connect timeout in seconds, capped by [sender].connect_timeout_secs
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .as_deref()
        .map(expand_path)
        .unwrap_or_else(NexusConfig::default_path)
}

fn load_config(cli: &Cli) -> Result<NexusConfig> {
    let path = config_path(cli);
    let mut config = if path.exists() {
        NexusConfig::load_from(&path)?
    } else {
        tracing::debug!("No config at {}, using defaults", path.display());
        NexusConfig::default()
    };
    if let Some(db) = &cli.db {
        config.database.path = db.clone();
    }
    config.validate()?;
    Ok(config)
}

fn open_store(config: &NexusConfig) -> Result<Arc<MailDb>> {
    let db_path = expand_path(&config.database.path);
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let db = MailDb::open(&db_path)?.with_fallback_smtp(config.smtp.clone());
    Ok(Arc::new(db))
}

fn init_logging(cli: &Cli) {
    let default = if cli.verbose {
        "nexus=debug,nexus_scheduler=debug,nexus_channels=debug"
    } else {
        "nexus=info,nexus_scheduler=info,nexus_channels=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    if cli.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

type Pipeline = (DispatchScheduler, WorkerPool, UnboundedReceiver<BatchDescriptor>);

/// Scheduler, pool and the queue's receiving half, wired to one store.
fn build_pipeline(config: &NexusConfig, store: &Arc<MailDb>) -> Pipeline {
    let (queue, rx) = MemoryQueue::new();
    let scheduler = DispatchScheduler::new(store.clone(), Arc::new(queue), config);
    let transport = Arc::new(SmtpTransport::new(config.sender.connect_timeout()));
    let sender = BatchSender::new(store.clone(), store.clone(), transport, config);
    let pool = WorkerPool::new(Arc::new(sender), config.sender.pool_size);
    (scheduler, pool, rx)
}

async fn run(config: NexusConfig) -> Result<()> {
    let store = open_store(&config)?;
    let (scheduler, pool, rx) = build_pipeline(&config, &store);

    tracing::info!(
        "📬 Nexus dispatch: batch {} · pool {} · {}ms between sends · db {}",
        config.dispatch.batch_size,
        config.sender.pool_size,
        config.sender.inter_item_delay_ms,
        config.database.path
    );

    let ticking = tokio::spawn(nexus_scheduler::spawn_scheduler(Arc::new(scheduler)));
    let mut draining = tokio::spawn(async move { pool.run(rx).await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("🛑 Shutting down, finishing claimed batches (Ctrl-C again to force)");
    // Dropping the scheduler closes the queue, which ends the pool once drained.
    ticking.abort();

    tokio::select! {
        _ = &mut draining => tracing::info!("👋 Nexus stopped"),
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Forced exit; unfinished claims return to pending after the stuck threshold");
            draining.abort();
        }
    }
    Ok(())
}

async fn tick_once(config: NexusConfig, json: bool) -> Result<()> {
    let store = open_store(&config)?;
    let (scheduler, pool, rx) = build_pipeline(&config, &store);

    let report = scheduler.tick().await?;
    drop(scheduler);
    pool.run(rx).await;

    if json {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        println!(
            "Tick: {} batch(es), {} item(s) claimed, {} hold(s) released, {} stuck reclaimed",
            report.batches, report.items_claimed, report.holds_released, report.stuck_reclaimed
        );
    }
    Ok(())
}

async fn status(config: NexusConfig, json: bool) -> Result<()> {
    let store = open_store(&config)?;
    let counts = store.status_counts().await?;
    if json {
        let map: serde_json::Map<String, serde_json::Value> = counts
            .iter()
            .map(|(status, n)| (status.as_str().to_string(), (*n).into()))
            .collect();
        println!("{}", serde_json::Value::Object(map));
    } else {
        println!("📊 Work items ({})", config.database.path);
        for (status, n) in counts {
            println!("   {:<14} {n}", status.as_str());
        }
    }
    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    NexusConfig::default().save_to(path)?;
    println!("✅ Wrote default config to {}", path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    if let Command::InitConfig { force } = &cli.command {
        return init_config(&config_path(&cli), *force);
    }

    let config = load_config(&cli)?;
    match cli.command {
        Command::Run => run(config).await,
        Command::Tick => tick_once(config, cli.json).await,
        Command::Status => status(config, cli.json).await,
        Command::Enqueue {
            owner,
            to,
            subject,
            body,
            campaign,
            at,
        } => {
            let scheduled_at = match at {
                Some(at) => DateTime::parse_from_rfc3339(&at)
                    .with_context(|| format!("invalid --at '{at}'"))?
                    .with_timezone(&Utc),
                None => Utc::now(),
            };
            let mut item = NewWorkItem::new(&owner, &to, &subject, &body).scheduled_at(scheduled_at);
            if let Some(campaign) = campaign {
                item = item.campaign(&campaign);
            }
            let store = open_store(&config)?;
            let stored = store.insert(&item, Utc::now()).await?;
            println!("✅ Queued {} for {} at {}", stored.id, stored.recipient, stored.scheduled_at);
            Ok(())
        }
        Command::SetSmtp {
            owner,
            host,
            port,
            no_tls,
            username,
            password,
            from,
            display_name,
            signature,
            timeout_secs,
        } => {
            let settings = SmtpSettings {
                host,
                port,
                use_tls: !no_tls,
                username,
                password,
                from_email: from,
                display_name,
                signature,
                timeout_secs,
            };
            open_store(&config)?.save_smtp_settings(&owner, &settings)?;
            println!("✅ SMTP settings saved for '{owner}'");
            Ok(())
        }
        Command::InitConfig { .. } => Ok(()),
    }
}
