/*!
# Drafthold Core Engine

Durable persistence and backup engine for diagram documents.

This crate protects an in-progress diagram (a graph of components and
connections) against data loss with:

- Validated, checksummed saves with retry and capped exponential backoff
- Timestamped backups with a retention cap and newest-valid restore
- Recovery from a full store by reclaiming space and writing uncompressed
- A bounded LRU cache of exports keyed by a content fingerprint

## Architecture

The engine talks to storage only through the [`BackingStore`] port:
- [`MemoryStore`] for tests and ephemeral sessions
- [`LocalFileStore`] for a directory on disk

Compression and retry policy are adapters as well, so the save path can be
tested without real I/O.

## Usage

```rust
use drafthold_core::{Component, DiagramStore, Document, MemoryStore, SaveOptions};

# async fn run() -> drafthold_core::Result<()> {
let engine = DiagramStore::new(MemoryStore::new());

let doc = Document::new("architecture")
    .with_component(Component::new("api", "service", 10.0, 20.0));

// Save (backs up, validates, retries transient failures)
engine.save(&doc, SaveOptions::default()).await?;

// Load (falls back to the newest valid backup)
let restored = engine.load("architecture").await?;
# Ok(())
# }
```
*/

pub mod backup;
pub mod cache;
pub mod checksum;
pub mod compression;
pub mod config;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod model;
pub mod observability;
pub mod storage;
pub mod validator;

#[cfg(test)]
mod error_tests;

pub use backup::{BackupEntry, BackupHealth, BackupManager, BackupSelector, BackupStatus};
pub use cache::{ExportCache, ExportFormat, ExportRequest};
pub use checksum::Checksum;
pub use compression::{BestEffortCompressor, CompressionAdapter, GzipCompressor, Stored};
pub use config::{EngineConfig, StorageBackend};
pub use engine::{create_engine_from_config, DiagramStore, RenderSource, SaveOptions};
pub use envelope::Envelope;
pub use error::{DraftError, Result};
pub use model::{Component, Connection, Document, DocumentMetadata, Position};
pub use storage::{BackingStore, LocalFileStore, MemoryStore};
pub use validator::{validate, ValidationReport};
