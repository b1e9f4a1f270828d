//! Feedview CLI
//!
//! Replays a message log into the materialized views and prints one of them
//! as JSON.
//!
//! ## Usage
//!
//! ```bash
//! # Index counts for an identity
//! feedview --log feed.jsonl --local-id @abc...=.ed25519 counts
//!
//! # Newest ten home threads
//! feedview --log feed.jsonl home --limit 10
//!
//! # Resolved names, with a custom data directory
//! FEEDVIEW_DATA_DIR=/tmp/fv feedview --log feed.jsonl names
//! ```
//!
//! Read and subscription flags are kept in `<data_dir>/flags.sled`.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use feedview::{Config, Materializer, MemoryLogStore, RangeOptions, SledFlagStore};
use futures::StreamExt;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "feedview")]
#[command(about = "Materialized views over an append-only social message log")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for the flag database
    #[arg(long, env = "FEEDVIEW_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Feed id of the local identity
    #[arg(long, env = "FEEDVIEW_LOCAL_ID")]
    local_id: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Message log, one JSON message value per line
    #[arg(long)]
    log: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Row and unread counts per index
    Counts,
    /// Resolved display names by feed id
    Names,
    /// One identity's profile
    Profile { id: String },
    /// Home threads, newest first
    Home {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Replies and mentions, newest first
    Inbox {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// A random sample of recent adverts
    Adverts {
        #[arg(long, default_value_t = 3)]
        count: usize,
        #[arg(long, default_value_t = 30)]
        oldest: usize,
    },
    /// Pending alias confirmations
    ActionItems,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("feedview={},info", args.log_level)));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::default(),
    };

    // Apply CLI overrides
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(id) = args.local_id {
        config.local_id = Some(id);
    }

    let Some(local_id) = config.local_id.clone() else {
        bail!("no local identity: pass --local-id or set local_id in the config");
    };
    if !feedview::links::is_feed_id(&local_id) {
        bail!("local id is not a feed id: {}", local_id);
    }

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;

    let (read_flags, subscriptions) = SledFlagStore::open_pair(config.flags_db_path())?;
    let log = MemoryLogStore::load_jsonl(&args.log)
        .with_context(|| format!("loading log {}", args.log.display()))?;

    info!(
        local_id = %local_id,
        data_dir = %config.data_dir.display(),
        "Starting feedview"
    );

    let views = Materializer::start(
        local_id,
        config.views.clone(),
        Arc::new(log),
        Arc::new(read_flags),
        Arc::new(subscriptions),
    );
    views.synced().await;

    match args.command {
        Command::Counts => print_json(&views.get_index_counts().await),
        Command::Names => print_json(&views.get_names_by_id().await),
        Command::Profile { id } => match views.get_profile(&id).await {
            Some(profile) => print_json(&profile),
            None => bail!("no profile for {}", id),
        },
        Command::Home { limit } => {
            let rows: Vec<_> = views
                .create_home_stream(RangeOptions::default().with_limit(limit))
                .collect()
                .await;
            print_json(&rows)
        }
        Command::Inbox { limit } => {
            let rows: Vec<_> = views
                .create_inbox_stream(RangeOptions::default().with_limit(limit))
                .collect()
                .await;
            print_json(&rows)
        }
        Command::Adverts { count, oldest } => {
            print_json(&views.random_adverts(count, oldest).await)
        }
        Command::ActionItems => print_json(&views.get_action_items().await),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
