//! Laguna Sync - inspect and run the offline-first sync runtime.
//!
//! Without flags, prints a summary of the persisted state in the data
//! directory. With `--watch`, starts the sync engine against the in-process
//! store and logs changes until interrupted.

use clap::Parser;
use futures::StreamExt;
use laguna_sync::storage::{FileStorage, Loaded};
use laguna_sync::{default_schema, MemoryGateway, Session, SyncConfig, SyncEngine};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "laguna-sync")]
#[command(about = "Offline-first sync runtime for KameHouseLaguna")]
struct Args {
    /// Data directory (overrides LAGUNA_DATA_DIR)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Start the engine and log changes until Ctrl-C
    #[arg(long)]
    watch: bool,

    /// User to sign in as when watching
    #[arg(long, default_value = "local")]
    user: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "laguna_sync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let mut config = SyncConfig::from_env()?;
    if let Some(dir) = args.data_dir {
        config = config.with_data_dir(dir);
    }

    if args.watch {
        watch(config, args.user).await
    } else {
        summarize(&config).await
    }
}

async fn summarize(config: &SyncConfig) -> Result<(), Box<dyn std::error::Error>> {
    let storage = FileStorage::open(&config.data_dir).await?;

    match storage.load().await? {
        Loaded::Empty => {
            tracing::info!(path = %storage.state_path().display(), "No persisted state");
        }
        Loaded::Quarantined { path, reason } => {
            tracing::warn!(path = %path.display(), reason = %reason, "State file was unreadable");
        }
        Loaded::Restored(snapshot) => {
            let store = snapshot.decode_store();
            tracing::info!(
                node_id = %snapshot.node_id,
                schema_version = snapshot.schema_version,
                revision = snapshot.revision.current,
                records = snapshot.record_count(),
                corrupt = store.corrupted().count(),
                pending = snapshot.pending.len(),
                deferred = snapshot.deferred.len(),
                "Persisted state"
            );
            for (collection, cursor) in snapshot.cursors.iter() {
                tracing::info!(collection = %collection, cursor = %cursor, "Sync cursor");
            }
            for op in &snapshot.pending {
                tracing::info!(
                    op_id = %op.op_id,
                    kind = %op.kind,
                    collection = %op.collection,
                    key = %op.key,
                    retry_count = op.retry_count,
                    "Pending operation"
                );
            }
        }
    }

    Ok(())
}

async fn watch(config: SyncConfig, user: String) -> Result<(), Box<dyn std::error::Error>> {
    let session = match &config.node_id {
        Some(node_id) => Session::sign_in(user, node_id.clone(), "local"),
        None => Session::sign_in_new_device(user, "local"),
    };
    let schema = default_schema();
    let gateway = Arc::new(MemoryGateway::new(session.clone()).with_schema(schema.clone()));

    let engine = SyncEngine::start(&config, schema, session, gateway).await?;
    tracing::info!(
        data_dir = %config.data_dir.display(),
        restored = engine.startup_report().restored,
        pending = engine.startup_report().pending_operations,
        "Watching for changes"
    );

    let mut changes = engine.observe(|_| true);
    let logger = tokio::spawn(async move {
        while let Some(change) = changes.next().await {
            tracing::info!(
                seq = change.seq,
                collection = %change.collection,
                key = %change.key,
                origin = ?change.origin,
                deleted = change.record.as_ref().map_or(true, |r| !r.is_active()),
                "Change"
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    engine.shutdown().await?;
    logger.await?;
    Ok(())
}
