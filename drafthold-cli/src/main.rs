/*!
Drafthold CLI - inspect, verify and repair a Drafthold document store.

Works against a local store directory: lists and verifies backups, restores
a specific backup, purges aged backups and saves documents from JSON files.
*/

use anyhow::Context;
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use drafthold_core::{
    create_engine_from_config, observability, BackupSelector, BackupStatus, DiagramStore,
    Document, EngineConfig,
};
use std::path::{Path, PathBuf};
use tabled::{Table, Tabled};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "drafthold")]
#[command(about = "CLI for the Drafthold diagram persistence engine")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    json_logs: bool,

    /// Store directory
    #[arg(
        short,
        long,
        global = true,
        env = "DRAFTHOLD_PATH",
        default_value = "./drafthold-data"
    )]
    path: PathBuf,

    /// JSON engine config; its backend is replaced by --path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List backups, newest first
    List {
        /// Only backups of this document
        #[arg(short, long)]
        document: Option<String>,
    },
    /// Load a document (falling back to backups) and summarise it
    Show {
        document_id: String,
    },
    /// Check the checksum and payload of every backup
    Verify,
    /// Restore a backup by key, epoch milliseconds or RFC 3339 time
    Restore {
        selector: String,
        /// Only match backups of this document when selecting by time
        #[arg(short, long)]
        document: Option<String>,
        /// Write the document here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Also save the restored document as the current version
        #[arg(long)]
        apply: bool,
    },
    /// Delete backups older than the given age
    Cleanup {
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
    /// Save a document from a JSON file
    Save {
        file: PathBuf,
        #[arg(long)]
        retries: Option<u32>,
        #[arg(long)]
        no_backup: bool,
    },
}

#[derive(Tabled)]
struct BackupRow {
    #[tabled(rename = "Key")]
    key: String,
    #[tabled(rename = "Document")]
    document_id: String,
    #[tabled(rename = "Created")]
    created: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Checksum")]
    checksum: String,
}

#[derive(Tabled)]
struct VerifyRow {
    #[tabled(rename = "Key")]
    key: String,
    #[tabled(rename = "Status")]
    status: String,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    if cli.json_logs {
        observability::init_observability(log_directive(cli.verbose))?;
    } else {
        init_logging(cli.verbose);
    }

    let engine = open_engine(&cli)?;

    match cli.command {
        Commands::List { document } => list_backups(&engine, document.as_deref()).await?,
        Commands::Show { document_id } => show_document(&engine, &document_id).await?,
        Commands::Verify => verify_backups(&engine).await?,
        Commands::Restore {
            selector,
            document,
            output,
            apply,
        } => {
            let selector = parse_selector(&selector, document);
            restore_backup(&engine, selector, output, apply).await?
        }
        Commands::Cleanup { days } => cleanup_backups(&engine, days).await?,
        Commands::Save {
            file,
            retries,
            no_backup,
        } => save_document(&engine, &file, retries, no_backup).await?,
    }

    Ok(())
}

fn log_directive(verbose: bool) -> &'static str {
    if verbose {
        "drafthold=debug"
    } else {
        observability::DEFAULT_LOG_DIRECTIVE
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"))
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn open_engine(cli: &Cli) -> Result<DiagramStore, anyhow::Error> {
    let config = match &cli.config {
        Some(file) => {
            let mut config = EngineConfig::from_json_file(file)?;
            config.backend = EngineConfig::local(&cli.path).backend;
            config
        }
        None => EngineConfig::local(&cli.path),
    };
    info!(path = %cli.path.display(), "opening store");
    Ok(create_engine_from_config(config)?)
}

async fn list_backups(engine: &DiagramStore, document: Option<&str>) -> Result<(), anyhow::Error> {
    let entries = match document {
        Some(id) => engine.backups().list_backups_for(id).await?,
        None => engine.backups().list_backups().await?,
    };

    if entries.is_empty() {
        println!("No backups found");
        return Ok(());
    }

    let rows: Vec<BackupRow> = entries
        .into_iter()
        .map(|entry| BackupRow {
            key: entry.key,
            document_id: entry.document_id,
            created: format_timestamp(entry.timestamp),
            size: format_size(entry.size as u64),
            checksum: entry.checksum.to_string(),
        })
        .collect();
    println!("{}", Table::new(rows));
    Ok(())
}

async fn show_document(engine: &DiagramStore, document_id: &str) -> Result<(), anyhow::Error> {
    let envelope = match engine.read_envelope(document_id).await {
        Ok(envelope) => envelope,
        Err(e) => {
            error!("Primary copy of {} is unreadable: {}", document_id, e);
            None
        }
    };

    let Some(document) = engine.load(document_id).await? else {
        return Err(anyhow::anyhow!("No usable copy of document '{document_id}'"));
    };

    println!("Document Details:");
    println!("  ID: {}", document.id);
    println!("  Components: {}", document.components.len());
    println!("  Connections: {}", document.connections.len());
    println!("  Schema Version: {}", document.metadata.version);
    println!(
        "  Last Modified: {}",
        format_timestamp(document.metadata.last_modified)
    );
    match envelope {
        Some(envelope) => {
            println!("  Stored: {}", format_timestamp(envelope.timestamp));
            println!("  Stored Size: {}", format_size(envelope.stored.len() as u64));
            println!("  Compressed: {}", envelope.is_compressed());
        }
        None => println!("  Source: restored from backup"),
    }

    let report = drafthold_core::validator::validate_document(&document)?;
    for warning in report.warnings {
        println!("  Warning: {warning}");
    }
    Ok(())
}

async fn verify_backups(engine: &DiagramStore) -> Result<(), anyhow::Error> {
    let report = engine.backups().verify_all().await?;
    if report.is_empty() {
        println!("No backups found");
        return Ok(());
    }

    let failed = report.iter().filter(|health| !health.is_ok()).count();
    let rows: Vec<VerifyRow> = report
        .into_iter()
        .map(|health| VerifyRow {
            key: health.entry.key,
            status: match health.status {
                BackupStatus::Verified => "✓ ok".to_string(),
                BackupStatus::Failed(reason) => format!("✗ {reason}"),
            },
        })
        .collect();
    println!("{}", Table::new(rows));

    if failed > 0 {
        return Err(anyhow::anyhow!("{failed} backup(s) failed verification"));
    }
    println!("✓ All backups passed integrity checks");
    Ok(())
}

async fn restore_backup(
    engine: &DiagramStore,
    selector: BackupSelector,
    output: Option<PathBuf>,
    apply: bool,
) -> Result<(), anyhow::Error> {
    let Some(document) = engine.backups().restore(selector.clone()).await? else {
        return Err(anyhow::anyhow!("No verified backup matches {selector:?}"));
    };

    let json = serde_json::to_string_pretty(&document)?;
    match output {
        Some(path) => {
            std::fs::write(&path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("✓ Restored {} to {}", document.id, path.display());
        }
        None => println!("{json}"),
    }

    if apply {
        engine.save(&document, engine.default_options()).await?;
        println!("✓ Saved restored backup as the current version of {}", document.id);
    }
    Ok(())
}

async fn cleanup_backups(engine: &DiagramStore, days: i64) -> Result<(), anyhow::Error> {
    if days < 0 {
        return Err(anyhow::anyhow!("--days must not be negative"));
    }
    let removed = engine
        .backups()
        .cleanup_older_than(chrono::Duration::days(days))
        .await?;
    println!("✓ Removed {removed} backup(s) older than {days} day(s)");
    Ok(())
}

async fn save_document(
    engine: &DiagramStore,
    file: &Path,
    retries: Option<u32>,
    no_backup: bool,
) -> Result<(), anyhow::Error> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let document: Document = serde_json::from_str(&contents)
        .with_context(|| format!("{} is not a diagram document", file.display()))?;

    let mut options = engine.default_options();
    if let Some(retries) = retries {
        options = options.with_retries(retries);
    }
    if no_backup {
        options = options.without_backup();
    }

    engine.save(&document, options).await?;
    println!("✓ Saved {}", document.id);
    Ok(())
}

fn parse_selector(input: &str, document: Option<String>) -> BackupSelector {
    let timestamp = input
        .parse::<i64>()
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .or_else(|| {
            DateTime::parse_from_rfc3339(input)
                .ok()
                .map(|timestamp| timestamp.with_timezone(&Utc))
        });
    match (timestamp, document) {
        (Some(timestamp), Some(document_id)) => BackupSelector::DocumentAt {
            document_id,
            timestamp,
        },
        (Some(timestamp), None) => BackupSelector::Timestamp(timestamp),
        (None, _) => BackupSelector::Key(input.to_string()),
    }
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp
        .with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(51_200), "50.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn test_parse_selector() {
        let at = DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000).unwrap();
        assert_eq!(
            parse_selector("1700000000000", None),
            BackupSelector::Timestamp(at)
        );
        assert!(matches!(
            parse_selector("2024-03-01T12:00:00Z", None),
            BackupSelector::Timestamp(_)
        ));
        assert_eq!(
            parse_selector("1700000000000", Some("d1".to_string())),
            BackupSelector::DocumentAt {
                document_id: "d1".to_string(),
                timestamp: at,
            }
        );
        assert_eq!(
            parse_selector("backup-d1-1700000000000", Some("d1".to_string())),
            BackupSelector::Key("backup-d1-1700000000000".to_string())
        );
    }

    #[test]
    fn test_log_flags() {
        let cli = Cli::try_parse_from(["drafthold", "--json-logs", "-v", "verify"]).unwrap();
        assert!(cli.json_logs);
        assert_eq!(log_directive(cli.verbose), "drafthold=debug");
        assert_eq!(log_directive(false), "drafthold=info");

        let cli = Cli::try_parse_from(["drafthold", "restore", "1700000000000", "-d", "d1"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Restore { document: Some(ref id), .. } if id == "d1"
        ));
    }
}
