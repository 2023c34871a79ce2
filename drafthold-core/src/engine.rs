/*!
Save orchestrator: the engine's entry point.

A save validates the document, snapshots it as a backup on the first attempt,
then writes the primary envelope under `diagram-<documentId>`, retrying
transient failures with capped exponential backoff. Saves for the same
document id are serialized; saves for different ids run concurrently.

A load reads the primary envelope and falls back to the newest valid backup
when the primary is absent, torn or fails validation.
*/

use crate::backup::BackupManager;
use crate::cache::{ExportCache, ExportRequest};
use crate::compression::{BestEffortCompressor, Stored};
use crate::config::{EngineConfig, StorageBackend};
use crate::envelope::Envelope;
use crate::model::Document;
use crate::observability;
use crate::storage::{BackingStore, LocalFileStore, MemoryStore};
use crate::validator;
use crate::{DraftError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use drafthold_retry::{AttemptOutcome, RetryState, RetryableError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

/// Prefix of every primary document key
pub const PRIMARY_KEY_PREFIX: &str = "diagram-";

/// Storage key of a document's primary copy
pub fn primary_key(document_id: &str) -> String {
    format!("{PRIMARY_KEY_PREFIX}{document_id}")
}

/// Per-call save settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveOptions {
    /// Retries after the first attempt; `0` disables retrying
    pub retries: u32,
    pub validate: bool,
    pub compress: bool,
    /// Snapshot the document as a backup before the first write
    pub backup: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            retries: drafthold_retry::DEFAULT_RETRIES,
            validate: true,
            compress: true,
            backup: true,
        }
    }
}

impl SaveOptions {
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn without_validation(mut self) -> Self {
        self.validate = false;
        self
    }

    pub fn without_compression(mut self) -> Self {
        self.compress = false;
        self
    }

    pub fn without_backup(mut self) -> Self {
        self.backup = false;
        self
    }
}

/// Produces rendered bytes for an export request
///
/// Rendering itself lives outside the engine; the engine only caches results.
#[async_trait]
pub trait RenderSource: Send + Sync {
    async fn render(&self, document: &Document, request: &ExportRequest) -> Result<Vec<u8>>;
}

/// What a space reclaim pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpaceReclaimed {
    pub cache_entries: usize,
    pub backups: usize,
}

type TokenMap = HashMap<String, Arc<AsyncMutex<()>>>;

/// In-flight save markers, one async mutex per document id
#[derive(Default)]
struct SaveRegistry {
    tokens: Mutex<TokenMap>,
}

impl SaveRegistry {
    async fn acquire(&self, document_id: &str) -> SaveToken<'_> {
        let lock = self
            .lock()
            .entry(document_id.to_string())
            .or_default()
            .clone();
        let guard = lock.lock_owned().await;
        SaveToken {
            registry: self,
            document_id: document_id.to_string(),
            _guard: guard,
        }
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, TokenMap> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Held for the duration of one save
struct SaveToken<'a> {
    registry: &'a SaveRegistry,
    document_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for SaveToken<'_> {
    fn drop(&mut self) {
        let mut tokens = self.registry.lock();
        // one reference in the map, one in our guard; anything more is a waiter
        let idle = tokens
            .get(&self.document_id)
            .is_some_and(|lock| Arc::strong_count(lock) <= 2);
        if idle {
            tokens.remove(&self.document_id);
        }
    }
}

/// Durable store for diagram documents
///
/// # Example
/// ```rust
/// use drafthold_core::{DiagramStore, Document, MemoryStore, SaveOptions};
///
/// # async fn run() -> drafthold_core::Result<()> {
/// let engine = DiagramStore::new(MemoryStore::new());
/// let doc = Document::new("doc-1");
///
/// engine.save(&doc, SaveOptions::default()).await?;
/// let restored = engine.load("doc-1").await?;
/// assert_eq!(restored.map(|d| d.id), Some("doc-1".to_string()));
/// # Ok(())
/// # }
/// ```
pub struct DiagramStore {
    store: Arc<dyn BackingStore>,
    codec: Arc<BestEffortCompressor>,
    backups: BackupManager,
    cache: ExportCache,
    config: EngineConfig,
    in_flight: SaveRegistry,
}

impl DiagramStore {
    /// Engine over `store` with the default configuration
    pub fn new<S: BackingStore + 'static>(store: S) -> Self {
        Self::build(Arc::new(store), EngineConfig::default())
    }

    /// Engine over `store` with the tunables of `config`
    ///
    /// The config's backend selection is ignored; `store` is used as given.
    pub fn with_config(store: Arc<dyn BackingStore>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(store, config))
    }

    fn build(store: Arc<dyn BackingStore>, config: EngineConfig) -> Self {
        let codec = Arc::new(config.compressor());
        let backups = BackupManager::new(store.clone(), codec.clone())
            .with_max_backups(config.max_backups);
        let cache = ExportCache::new(config.cache_capacity, codec.clone());
        Self {
            store,
            codec,
            backups,
            cache,
            config,
            in_flight: SaveRegistry::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn cache(&self) -> &ExportCache {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    /// Save options using this engine's configured retry count
    pub fn default_options(&self) -> SaveOptions {
        SaveOptions::default().with_retries(self.config.default_retries)
    }

    /// Number of documents with a save in flight or queued
    pub fn saves_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Persist `document`
    ///
    /// # Errors
    /// * `DraftError::Validation` - the document has hard schema errors; nothing was written
    /// * `DraftError::Json` - the document cannot be serialized
    /// * `DraftError::SaveFailed` - every attempt failed; carries the attempt count and last failure
    pub async fn save(&self, document: &Document, options: SaveOptions) -> Result<()> {
        let started = Instant::now();
        let _token = self.in_flight.acquire(&document.id).await;

        if options.validate {
            let report = validator::validate_document(document)?;
            for warning in &report.warnings {
                warn!(document_id = %document.id, warning = %warning, "validation warning");
            }
            if !report.is_valid {
                return Err(DraftError::validation(report.errors.join("; ")));
            }
        }

        let payload = serde_json::to_vec(document)?;
        let key = primary_key(&document.id);
        let mut machine = self.config.retry_policy(options.retries)?.start("save");
        let mut fallback_attempts = 0;

        loop {
            let attempt = machine.attempts();
            let with_backup = options.backup && attempt == 0;
            let mut result = self
                .attempt_save(document, &key, &payload, options.compress, with_backup)
                .await;

            if attempt == 0 && matches!(&result, Err(e) if e.is_quota_exceeded()) {
                fallback_attempts += 1;
                observability::record_quota_fallback();
                warn!(document_id = %document.id, "store full, reclaiming space and writing uncompressed");
                self.reclaim_space().await;
                result = self.write_primary(&key, &payload, false).await;
            }

            let err = match result {
                Ok(compressed) => {
                    machine.record(AttemptOutcome::Succeeded);
                    observability::record_save(started.elapsed(), payload.len());
                    info!(
                        document_id = %document.id,
                        size = payload.len(),
                        compressed,
                        attempts = machine.attempts() + fallback_attempts,
                        "document saved"
                    );
                    return Ok(());
                }
                Err(e) => e,
            };

            let outcome = if err.is_transient() {
                AttemptOutcome::Transient
            } else {
                AttemptOutcome::Permanent
            };
            match machine.record(outcome) {
                RetryState::Backoff { delay, .. } => {
                    warn!(
                        document_id = %document.id,
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "save attempt failed, retrying"
                    );
                    observability::record_retry();
                    tokio::time::sleep(delay).await;
                    machine.resume();
                }
                _ => {
                    let attempts = machine.attempts() + fallback_attempts;
                    observability::record_save_failure();
                    error!(document_id = %document.id, attempts, error = %err, "save failed");
                    return Err(DraftError::SaveFailed {
                        attempts,
                        source: Box::new(err),
                    });
                }
            }
        }
    }

    /// One attempt: optional backup, then the primary write
    ///
    /// Returns whether the primary payload was stored compressed.
    async fn attempt_save(
        &self,
        document: &Document,
        key: &str,
        payload: &[u8],
        compress: bool,
        with_backup: bool,
    ) -> Result<bool> {
        if with_backup {
            self.backups
                .create_backup_from_payload(&document.id, payload.to_vec(), None)
                .await?;
        }
        self.write_primary(key, payload, compress).await
    }

    async fn write_primary(&self, key: &str, payload: &[u8], compress: bool) -> Result<bool> {
        let stored = if compress {
            self.codec.pack(payload.to_vec())
        } else {
            Stored::Raw(payload.to_vec())
        };
        let compressed = stored.is_compressed();
        self.store.set(key, &Envelope::new(stored).encode()).await?;
        Ok(compressed)
    }

    /// Free space after a full store: drop half the export cache and purge aged backups
    pub async fn reclaim_space(&self) -> SpaceReclaimed {
        let cache_entries = self.cache.evict_fraction(0.5);
        let backups = match self
            .backups
            .cleanup_older_than(self.config.backup_max_age())
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "failed to purge aged backups");
                0
            }
        };
        info!(cache_entries, backups, "reclaimed storage space");
        SpaceReclaimed {
            cache_entries,
            backups,
        }
    }

    /// Load the latest good copy of a document
    ///
    /// Returns `None` when neither the primary copy nor any backup is usable.
    pub async fn load(&self, document_id: &str) -> Result<Option<Document>> {
        match self.read_primary(document_id).await {
            Ok(Some(document)) => return Ok(Some(document)),
            Ok(None) => debug!(document_id, "no primary copy, trying backups"),
            Err(e) => warn!(document_id, error = %e, "primary copy unusable, trying backups"),
        }

        let restored = self.backups.restore_latest_valid(document_id).await?;
        if restored.is_none() {
            warn!(document_id, "no usable copy of document");
        }
        Ok(restored)
    }

    async fn read_primary(&self, document_id: &str) -> Result<Option<Document>> {
        let Some(envelope) = self.read_envelope(document_id).await? else {
            return Ok(None);
        };
        envelope.into_document(&self.codec).map(Some)
    }

    /// Raw primary envelope of a document, without decoding the payload
    pub async fn read_envelope(&self, document_id: &str) -> Result<Option<Envelope>> {
        match self.store.get(&primary_key(document_id)).await? {
            Some(bytes) => Envelope::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Pretty-printed JSON export, served from the cache when unchanged
    pub fn export_json(&self, document: &Document) -> Result<Bytes> {
        let request = ExportRequest::json();
        let key = request.fingerprint(&serde_json::to_vec(document)?);
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit);
        }

        let exported = Bytes::from(serde_json::to_vec_pretty(document)?);
        self.cache
            .put(key, exported.clone(), request.format.is_compressible());
        Ok(exported)
    }

    /// Rendered export, produced by `source` on a cache miss
    pub async fn export_image<R>(
        &self,
        document: &Document,
        request: ExportRequest,
        source: &R,
    ) -> Result<Bytes>
    where
        R: RenderSource + ?Sized,
    {
        let key = request.fingerprint(&serde_json::to_vec(document)?);
        if let Some(hit) = self.cache.get(&key) {
            debug!(key = %key, "export served from cache");
            return Ok(hit);
        }

        let rendered = Bytes::from(source.render(document, &request).await?);
        self.cache
            .put(key, rendered.clone(), request.format.is_compressible());
        Ok(rendered)
    }
}

/// Build an engine and its backing store from configuration
///
/// # Example
/// ```rust,no_run
/// use drafthold_core::{create_engine_from_config, EngineConfig};
///
/// let engine = create_engine_from_config(EngineConfig::local("/var/lib/drafthold"))?;
/// # Ok::<(), drafthold_core::DraftError>(())
/// ```
pub fn create_engine_from_config(config: EngineConfig) -> Result<DiagramStore> {
    config.validate()?;

    let store: Arc<dyn BackingStore> = match (&config.backend, config.quota_bytes) {
        (StorageBackend::Memory, None) => Arc::new(MemoryStore::new()),
        (StorageBackend::Memory, Some(quota)) => {
            let quota = usize::try_from(quota)
                .map_err(|_| DraftError::config(format!("Quota {quota} does not fit in memory")))?;
            Arc::new(MemoryStore::with_quota(quota))
        }
        (StorageBackend::Local { base_path }, quota) => {
            let store = LocalFileStore::new(base_path);
            Arc::new(match quota {
                Some(quota) => store.with_quota(quota),
                None => store,
            })
        }
    };

    DiagramStore::with_config(store, config)
}
