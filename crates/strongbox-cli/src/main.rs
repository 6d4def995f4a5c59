//! Strongbox CLI - inspect and maintain the encrypted store
//!
//! Usage:
//!   strongbox put KEY VALUE [--deferred]   - Store a JSON value (or plain string)
//!   strongbox get KEY                      - Print a stored value
//!   strongbox remove KEY                   - Delete a value
//!   strongbox keys                         - List stored keys
//!   strongbox wipe                         - Delete every value
//!   strongbox sweep                        - Run the data-retention sweep
//!   strongbox reset-key                    - Delete all values and the encryption key

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use strongbox_crypto::{KeyManager, KeychainKeystore};
use strongbox_store::{
    RetentionOutcome, RetentionPolicy, SecureStore, SqliteSubstrate, StoreConfig,
};
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "strongbox")]
#[command(author = "HeyBattle1")]
#[command(version)]
#[command(about = "Encrypted on-device session store", long_about = None)]
struct Cli {
    /// Database file (defaults to the platform data directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a value
    Put {
        key: String,
        /// JSON value; anything that does not parse is stored as a string
        value: String,
        /// Batch the disk write instead of writing through
        #[arg(long)]
        deferred: bool,
    },

    /// Print a stored value
    Get { key: String },

    /// Delete a value
    Remove { key: String },

    /// List stored keys
    Keys,

    /// Delete every value in the namespace
    Wipe,

    /// Run the data-retention sweep if it is due
    Sweep,

    /// Delete every value and the installation encryption key
    ResetKey,
}

fn default_db_path() -> anyhow::Result<PathBuf> {
    let base = dirs::data_dir().context("no platform data directory")?;
    Ok(base.join("strongbox").join("store.db"))
}

fn open_store(cli: &Cli) -> anyhow::Result<(SecureStore, Arc<KeyManager>)> {
    let config = match &cli.config {
        Some(path) => StoreConfig::from_file(path)?,
        None => StoreConfig::default(),
    };
    let db_path = match &cli.db {
        Some(path) => path.clone(),
        None => default_db_path()?,
    };
    debug!("Opening store at {}", db_path.display());

    let keys = Arc::new(KeyManager::new(Box::new(KeychainKeystore::new(
        &config.keystore_service,
    ))));
    let substrate = SqliteSubstrate::open(&db_path)
        .with_context(|| format!("opening {}", db_path.display()))?;
    let store = SecureStore::open(config, Arc::clone(&keys), Box::new(substrate))?;
    Ok((store, keys))
}

/// A deferred put only counts once the final flush left nothing queued
fn ensure_persisted(key: &str, waiting: usize) -> anyhow::Result<()> {
    if waiting > 0 {
        anyhow::bail!("{} was not written to disk ({} writes still queued)", key, waiting);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let (store, keys) = open_store(&cli)?;

    match cli.command {
        Commands::Put { key, value, deferred } => {
            let value: serde_json::Value =
                serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value));
            if deferred {
                let task = store.start_background_flush()?;
                store.store_deferred(&value, &key, true)?;
                println!("Staged {} ({} pending)", key, store.pending_writes());
                task.shutdown().await;
                ensure_persisted(&key, store.pending_writes())?;
            } else {
                store.store(&value, &key)?;
            }
            println!("✓ Stored {}", key);
        }

        Commands::Get { key } => match store.retrieve::<serde_json::Value>(&key)? {
            Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            None => {
                eprintln!("No readable value for {}", key);
                std::process::exit(1);
            }
        },

        Commands::Remove { key } => {
            store.remove(&key)?;
            println!("✓ Removed {}", key);
        }

        Commands::Keys => {
            let keys = store.keys()?;
            if keys.is_empty() {
                println!("No stored values");
            }
            for key in keys {
                println!("  {}", key);
            }
        }

        Commands::Wipe => {
            let removed = store.clear_all()?;
            println!("✓ Removed {} values", removed);
        }

        Commands::Sweep => {
            let policy = RetentionPolicy::from_config(&store.config().retention);
            match policy.run_if_due(&store, chrono::Utc::now())? {
                RetentionOutcome::Initialized => println!("Retention clock started"),
                RetentionOutcome::NotDue => println!("Retention sweep not due yet"),
                RetentionOutcome::Purged(n) => println!("✓ Retention sweep removed {} values", n),
            }
        }

        Commands::ResetKey => {
            let removed = store.clear_all()?;
            keys.destroy_key()?;
            println!("✓ Removed {} values and destroyed the encryption key", removed);
        }
    }

    Ok(())
}
