//! Tideline CLI - Command line interface for an offline-first replica.
//!
//! This tool edits documents in a local replica database and syncs them
//! with a remote, by default a directory shared between replicas.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Number, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use tideline_common::{CollectionPath, Document, DocumentKey, FieldDelta};
use tideline_remote::{create_default_registry, CredentialProvider, StaticCredentials};
use tideline_sync::{SyncConfig, SyncEngine, SyncEvent};

use crate::config::CliConfig;

#[derive(Parser)]
#[command(name = "tideline")]
#[command(about = "Tideline - Offline-first document replica")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// JSON config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the replica database.
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Replica name, used for the default data directory.
    #[arg(short, long, default_value = "default")]
    replica: String,

    /// Shared directory acting as the remote.
    #[arg(long)]
    hub: Option<PathBuf>,

    /// Additional collection to listen on and pull.
    #[arg(long = "collection")]
    collections: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write fields of a document.
    Put {
        /// Document key, e.g. plant/1.
        key: String,

        /// Field assignments, e.g. name=fern or water_count=2.
        #[arg(required = true, value_parser = parse_assignment)]
        fields: Vec<(String, Value)>,

        /// Replace the whole document instead of merging.
        #[arg(long)]
        replace: bool,
    },

    /// Add to a numeric field.
    Incr {
        key: String,
        field: String,

        #[arg(default_value = "1")]
        by: String,
    },

    /// Print a document.
    Get { key: String },

    /// Refresh a document from the remote and print it.
    Fetch { key: String },

    /// List the documents of a collection.
    List {
        collection: String,

        /// Only documents whose field equals a value, e.g. room=kitchen.
        #[arg(short, long = "where", value_parser = parse_assignment)]
        filter: Option<(String, Value)>,
    },

    /// Delete a document.
    Rm { key: String },

    /// Show changes waiting to be pushed.
    Pending,

    /// Show changes the remote refused.
    Failed,

    /// Push pending changes and pull remote ones, then exit.
    Sync,

    /// Keep syncing in the background until interrupted.
    Watch,

    /// Show engine status.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let engine = open_engine(&cli)?;

    match cli.command {
        Commands::Put {
            key,
            fields,
            replace,
        } => cmd_put(&engine, &key, fields, replace).await,

        Commands::Incr { key, field, by } => cmd_incr(&engine, &key, &field, &by).await,

        Commands::Get { key } => cmd_get(&engine, &key),

        Commands::Fetch { key } => cmd_fetch(&engine, &key).await,

        Commands::List { collection, filter } => cmd_list(&engine, &collection, filter),

        Commands::Rm { key } => cmd_rm(&engine, &key).await,

        Commands::Pending => cmd_pending(&engine),

        Commands::Failed => cmd_failed(&engine),

        Commands::Sync => cmd_sync(&engine).await,

        Commands::Watch => cmd_watch(Arc::new(engine)).await,

        Commands::Status => cmd_status(&engine).await,
    }
}

/// Open the replica database and connect it to the configured remote.
fn open_engine(cli: &Cli) -> Result<SyncEngine> {
    let config = CliConfig::load(cli.config.as_deref())?;

    let data_dir = config.resolve_data_dir(cli.data_dir.as_deref(), &cli.replica)?;
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

    let (remote_name, remote_options) = config.resolve_remote(cli.hub.as_deref())?;
    let remote = create_default_registry()
        .resolve(&remote_name, remote_options)
        .with_context(|| format!("Failed to set up remote '{}'", remote_name))?;

    let credentials: Arc<dyn CredentialProvider> = match &config.token {
        Some(token) => Arc::new(StaticCredentials::new(token.clone())),
        None => Arc::new(StaticCredentials::anonymous()),
    };

    let mut sync_config: SyncConfig = config.sync.clone();
    for raw in &cli.collections {
        let collection = CollectionPath::parse(raw).context("Invalid collection")?;
        sync_config = sync_config.with_collection(collection);
    }

    let db_path = data_dir.join("replica.db");
    let engine = SyncEngine::open(&db_path, remote, credentials, sync_config)
        .context("Failed to open replica")?;
    info!("Replica {} using remote '{}'", db_path.display(), remote_name);
    Ok(engine)
}

/// Parse `field=value`; values that are not valid JSON are taken as strings.
fn parse_assignment(raw: &str) -> std::result::Result<(String, Value), String> {
    let (field, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected field=value, got '{}'", raw))?;
    if field.is_empty() {
        return Err("field name is empty".to_string());
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((field.to_string(), value))
}

fn parse_key(raw: &str) -> Result<DocumentKey> {
    DocumentKey::parse(raw).with_context(|| format!("Invalid document key '{}'", raw))
}

fn render(document: &Document) -> Value {
    json!({
        "key": document.key.to_string(),
        "fields": document.fields,
        "local_revision": document.local_revision,
        "server_version": document.server_version(),
        "updated_at": document.updated_at,
    })
}

/// Write fields of a document.
async fn cmd_put(
    engine: &SyncEngine,
    key: &str,
    fields: Vec<(String, Value)>,
    replace: bool,
) -> Result<()> {
    let key = parse_key(key)?;

    let written = if replace {
        let fields = fields.into_iter().collect();
        engine.create(&key, fields).await
    } else {
        let delta = fields
            .into_iter()
            .fold(FieldDelta::new(), |delta, (field, value)| delta.set(field, value));
        engine.update(&key, delta).await
    };
    let document = written.context("Failed to write document")?;

    println!("{}", serde_json::to_string_pretty(&render(&document))?);
    Ok(())
}

/// Add to a numeric field.
async fn cmd_incr(engine: &SyncEngine, key: &str, field: &str, by: &str) -> Result<()> {
    let key = parse_key(key)?;
    let by: Number = serde_json::from_str(by).with_context(|| format!("'{}' is not a number", by))?;

    let document = engine
        .increment(&key, field, by)
        .await
        .context("Failed to increment field")?;

    println!("{} = {}", field, document.field(field).unwrap_or(&Value::Null));
    Ok(())
}

/// Print a document.
fn cmd_get(engine: &SyncEngine, key: &str) -> Result<()> {
    let key = parse_key(key)?;
    match engine.get(&key).context("Failed to read document")? {
        Some(document) => println!("{}", serde_json::to_string_pretty(&render(&document))?),
        None => println!("{} not found.", key),
    }
    Ok(())
}

/// Refresh a document from the remote.
async fn cmd_fetch(engine: &SyncEngine, key: &str) -> Result<()> {
    let key = parse_key(key)?;
    match engine.fetch(&key).await.context("Failed to fetch document")? {
        Some(document) => println!("{}", serde_json::to_string_pretty(&render(&document))?),
        None => println!("{} not found.", key),
    }
    Ok(())
}

/// List the documents of a collection.
fn cmd_list(engine: &SyncEngine, collection: &str, filter: Option<(String, Value)>) -> Result<()> {
    let collection = CollectionPath::parse(collection).context("Invalid collection")?;

    let snapshot = engine
        .list(&collection, |document: &Document| match &filter {
            Some((field, value)) => document.field(field) == Some(value),
            None => true,
        })
        .context("Failed to list collection")?;

    let mut count = 0;
    for document in snapshot.iter() {
        println!("{} {}", document.key, serde_json::to_string(&document.fields)?);
        count += 1;
    }
    if count == 0 {
        println!("No documents in {}.", collection);
    }
    for key in snapshot.corrupted() {
        warn!("Skipped unreadable document {}", key);
    }
    Ok(())
}

/// Delete a document.
async fn cmd_rm(engine: &SyncEngine, key: &str) -> Result<()> {
    let key = parse_key(key)?;
    if engine.delete(&key).await.context("Failed to delete document")? {
        println!("Deleted {}", key);
    } else {
        println!("{} not found.", key);
    }
    Ok(())
}

/// Show changes waiting to be pushed.
fn cmd_pending(engine: &SyncEngine) -> Result<()> {
    let entries = engine
        .changelog()
        .entries()
        .context("Failed to read change log")?;

    if entries.is_empty() {
        println!("Nothing pending.");
        return Ok(());
    }
    for entry in entries {
        println!(
            "#{:<6} {:<7} {} {} {}",
            entry.id,
            entry.change_type.as_str(),
            entry.key,
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            serde_json::to_string(&entry.delta)?
        );
    }
    Ok(())
}

/// Show changes the remote refused.
fn cmd_failed(engine: &SyncEngine) -> Result<()> {
    let failed = engine
        .changelog()
        .failed()
        .context("Failed to read failed changes")?;

    if failed.is_empty() {
        println!("No failed changes.");
        return Ok(());
    }
    for change in failed {
        println!(
            "#{:<6} {:<7} {} failed at {}: {}",
            change.entry.id,
            change.entry.change_type.as_str(),
            change.entry.key,
            change.failed_at.format("%Y-%m-%d %H:%M:%S"),
            change.reason
        );
    }
    Ok(())
}

/// Push pending changes and pull remote ones.
async fn cmd_sync(engine: &SyncEngine) -> Result<()> {
    if engine.config().collections.is_empty() {
        warn!("No collections configured; only pushing");
    }
    let report = engine.sync().await.context("Sync failed")?;

    println!("Sync completed in {:?}", report.duration);
    println!("  Pushed: {}", report.pushed);
    println!("  Pulled: {}", report.pulled);
    println!("  Conflicts: {}", report.conflicts);
    println!("  Rejected: {}", report.rejected);
    Ok(())
}

/// Run the engine until Ctrl-C, printing events as they happen.
async fn cmd_watch(engine: Arc<SyncEngine>) -> Result<()> {
    let mut events = engine.subscribe();
    let handle = engine.start();
    println!("Watching; press Ctrl-C to stop.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(SyncEvent::Conflict(conflict)) => println!(
                    "conflict  {} ({:?}), discarded: {}",
                    conflict.key,
                    conflict.kind,
                    conflict.discarded_fields.join(", ")
                ),
                Ok(SyncEvent::Rejected { key, reason, .. }) => {
                    println!("rejected  {}: {}", key, reason)
                }
                Ok(SyncEvent::Corrupted { key, reason }) => {
                    println!("corrupted {}: {}", key, reason)
                }
                Ok(SyncEvent::PhaseChanged(phase)) => println!("phase     {}", phase),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Missed {} events", missed)
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    handle.shutdown().await;
    Ok(())
}

/// Show engine status.
async fn cmd_status(engine: &SyncEngine) -> Result<()> {
    let status = engine.status().await;
    println!("Replica Status:");
    println!("  Backend: {}", engine.store().backend_name());
    println!("  Phase: {}", status.phase);
    println!("  Pending changes: {}", status.pending);
    println!("  Failed changes: {}", status.failed);
    let collections: Vec<String> = engine
        .config()
        .collections
        .iter()
        .map(|collection| collection.to_string())
        .collect();
    println!("  Collections: {}", collections.join(", "));
    for collection in &engine.config().collections {
        let cursor = engine.store().cursor(collection)?;
        println!(
            "    {}: cursor {}",
            collection,
            cursor.map_or("none".to_string(), |c| c.sequence.to_string())
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assignment() {
        assert_eq!(
            parse_assignment("water_count=2").unwrap(),
            ("water_count".to_string(), json!(2))
        );
        assert_eq!(
            parse_assignment("name=fern").unwrap(),
            ("name".to_string(), json!("fern"))
        );
        assert_eq!(
            parse_assignment("note=a=b").unwrap(),
            ("note".to_string(), json!("a=b"))
        );
        assert!(parse_assignment("novalue").is_err());
        assert!(parse_assignment("=1").is_err());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from([
            "tideline",
            "--hub",
            "/tmp/hub",
            "--collection",
            "plant",
            "put",
            "plant/1",
            "name=fern",
            "water_count=2",
        ])
        .unwrap();
        assert_eq!(cli.collections, vec!["plant".to_string()]);
        match cli.command {
            Commands::Put { key, fields, replace } => {
                assert_eq!(key, "plant/1");
                assert_eq!(fields.len(), 2);
                assert!(!replace);
            }
            _ => panic!("expected put"),
        }

        let cli = Cli::try_parse_from(["tideline", "list", "plant", "--where", "room=kitchen"]).unwrap();
        assert!(matches!(cli.command, Commands::List { filter: Some(_), .. }));
    }
}
