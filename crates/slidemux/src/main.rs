//! smx: admin CLI for slidemux session coordination.
//!
//! Thin wrapper over `slidemux-core`: resolves shard placement, inspects the
//! stored session set, and runs synchronize-and-invalidate passes against a
//! deployment described by a TOML config file.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use slidemux_core::config::SlidemuxConfig;
use slidemux_core::logging::{LogError, init_logging};
use slidemux_core::manager::{EvictionPolicy, SessionManager};
use slidemux_core::remote::HttpSessionHandler;
use slidemux_core::session::TileServerShard;
use slidemux_core::sharding::ConsistentHashSharding;
use slidemux_core::storage::SqliteStorage;

/// Exit code signalling back-pressure from a sync pass.
const EXIT_BACKPRESSURE: u8 = 2;

#[derive(Parser)]
#[command(
    name = "smx",
    version,
    about = "Session coordination for sharded WSI tile servers"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(
        long,
        global = true,
        env = "SLIDEMUX_CONFIG",
        default_value = "slidemux.toml"
    )]
    config: PathBuf,

    /// Emit machine-readable JSON instead of human-readable output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve the shard that owns an image key
    Shard {
        /// Image identity (e.g. a slide path)
        key: String,
    },
    /// Inspect stored sessions
    Sessions {
        #[command(subcommand)]
        command: SessionsCommand,
    },
    /// Run one synchronize-and-invalidate pass for the shard owning a key
    Sync {
        /// Image identity whose shard should be reconciled
        key: String,
        /// Override the per-shard session cap
        #[arg(long)]
        max_sessions: Option<usize>,
        /// Override the idle horizon in minutes
        #[arg(long)]
        max_idle_minutes: Option<i64>,
        /// Override the invalidation threshold (fraction of the cap)
        #[arg(long)]
        threshold: Option<f64>,
    },
}

#[derive(Subcommand)]
enum SessionsCommand {
    /// List stored sessions, optionally restricted to one shard
    List {
        /// Shard label to restrict to
        #[arg(long)]
        shard: Option<String>,
    },
    /// Count sessions stored for a shard
    Count {
        /// Shard label
        #[arg(long)]
        shard: String,
    },
    /// Delete the stored session for an image key
    Delete {
        /// Image identity
        key: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        SlidemuxConfig::load(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        SlidemuxConfig::default()
    };

    match init_logging(&config.log) {
        Ok(()) | Err(LogError::AlreadyInitialized) => {}
        Err(err) => return Err(err).context("initializing logging"),
    }

    let manager = build_manager(&config)?;

    match cli.command {
        Command::Shard { key } => cmd_shard(&manager, &key, cli.json),
        Command::Sessions { command } => match command {
            SessionsCommand::List { shard } => {
                cmd_sessions_list(&manager, &config, shard.as_deref(), cli.json).await
            }
            SessionsCommand::Count { shard } => {
                cmd_sessions_count(&manager, &config, &shard, cli.json).await
            }
            SessionsCommand::Delete { key } => cmd_sessions_delete(&manager, &key).await,
        },
        Command::Sync {
            key,
            max_sessions,
            max_idle_minutes,
            threshold,
        } => {
            let mut policy = config.eviction.clone();
            if let Some(max) = max_sessions {
                policy.max_sessions = max;
            }
            if let Some(minutes) = max_idle_minutes {
                policy.max_idle_minutes = minutes;
            }
            if let Some(fraction) = threshold {
                policy.invalidation_threshold = fraction;
            }
            cmd_sync(&manager, &key, &policy, cli.json).await
        }
    }
}

fn build_manager(config: &SlidemuxConfig) -> Result<SessionManager> {
    let storage = SqliteStorage::open(&config.storage.path)
        .with_context(|| format!("opening {}", config.storage.path.display()))?;
    let sharding =
        ConsistentHashSharding::new(config.shard_topology(), config.sharding.virtual_nodes)
            .context("building shard topology")?;
    let remote =
        HttpSessionHandler::new(Duration::from_secs(config.remote.request_timeout_secs))
            .context("building HTTP client")?;
    Ok(SessionManager::new(
        Arc::new(storage),
        Arc::new(sharding),
        Arc::new(remote),
    ))
}

fn cmd_shard(manager: &SessionManager, key: &str, json: bool) -> Result<ExitCode> {
    match manager.shard_for(key) {
        Some(shard) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&shard)?);
            } else {
                println!("{key} -> {shard}");
            }
            Ok(ExitCode::SUCCESS)
        }
        None => {
            if json {
                println!("null");
            } else {
                println!("{key} -> no shard (empty topology)");
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn cmd_sessions_list(
    manager: &SessionManager,
    config: &SlidemuxConfig,
    shard_label: Option<&str>,
    json: bool,
) -> Result<ExitCode> {
    let shards: Vec<TileServerShard> = match shard_label {
        Some(label) => {
            let Some(shard) = config.shard_by_label(label) else {
                bail!("no shard labelled '{label}' in the configured topology");
            };
            vec![shard]
        }
        None => config.shard_topology(),
    };

    let mut rows = Vec::new();
    for shard in &shards {
        for (key, record) in manager.all_key_values(&shard.namespace()).await? {
            rows.push(serde_json::json!({
                "key": key,
                "shard": shard.label,
                "sessionId": record.as_ref().map(|r| r.image_session_id.clone()),
                "lastAccessTimestamp": record.as_ref().map(|r| r.last_access.to_rfc3339()),
            }));
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else if rows.is_empty() {
        println!("no stored sessions");
    } else {
        for row in &rows {
            println!(
                "{}  shard={}  session={}  last_access={}",
                row["key"].as_str().unwrap_or("?"),
                row["shard"].as_str().unwrap_or("?"),
                row["sessionId"].as_str().unwrap_or("<unreadable>"),
                row["lastAccessTimestamp"].as_str().unwrap_or("-"),
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_sessions_count(
    manager: &SessionManager,
    config: &SlidemuxConfig,
    shard_label: &str,
    json: bool,
) -> Result<ExitCode> {
    let Some(shard) = config.shard_by_label(shard_label) else {
        bail!("no shard labelled '{shard_label}' in the configured topology");
    };
    let count = manager.count(&shard.namespace()).await?;
    if json {
        println!(
            "{}",
            serde_json::json!({ "shard": shard.label, "count": count })
        );
    } else {
        println!("{count}");
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_sessions_delete(manager: &SessionManager, key: &str) -> Result<ExitCode> {
    manager.delete_session(key).await?;
    tracing::info!(key, "deleted session record");
    Ok(ExitCode::SUCCESS)
}

async fn cmd_sync(
    manager: &SessionManager,
    key: &str,
    policy: &EvictionPolicy,
    json: bool,
) -> Result<ExitCode> {
    let within_bounds = manager
        .sync_and_invalidate_sessions(key, policy)
        .await
        .context("synchronize-and-invalidate pass failed")?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "key": key, "withinBounds": within_bounds })
        );
    } else if within_bounds {
        println!("shard within bounds");
    } else {
        println!("back-pressure: shard cannot reclaim headroom");
    }

    Ok(if within_bounds {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_BACKPRESSURE)
    })
}
