/*!
Timestamped, checksummed document backups.

Each backup is a standalone envelope under `backup-<documentId>-<millis>`.
A single index record (`backup-index`) maps every backup key to its document,
timestamp, size and the CRC-32 of the stored bytes. The index is written back
after every mutation so a restart sees the same backups.

Entries are immutable: they are created, verified on restore and eventually
rotated out (retention cap per document) or purged by age.
*/

use crate::checksum::Checksum;
use crate::compression::BestEffortCompressor;
use crate::envelope::Envelope;
use crate::model::Document;
use crate::observability;
use crate::storage::BackingStore;
use crate::{DraftError, Result};
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Storage key of the backup index
pub const BACKUP_INDEX_KEY: &str = "backup-index";

/// Prefix of every backup key
pub const BACKUP_KEY_PREFIX: &str = "backup-";

/// Backups kept per document
pub const DEFAULT_MAX_BACKUPS: usize = 5;

/// Age after which backups are purged when reclaiming space
pub const DEFAULT_BACKUP_MAX_AGE_DAYS: i64 = 30;

/// Index record of one backup as persisted
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub document_id: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub size: usize,
    pub checksum: Checksum,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
struct BackupIndex {
    records: BTreeMap<String, BackupRecord>,
}

/// A backup as listed to callers
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct BackupEntry {
    pub key: String,
    pub document_id: String,
    pub timestamp: DateTime<Utc>,
    pub size: usize,
    pub checksum: Checksum,
}

impl BackupEntry {
    fn from_record(key: &str, record: &BackupRecord) -> Self {
        Self {
            key: key.to_string(),
            document_id: record.document_id.clone(),
            timestamp: DateTime::<Utc>::from_timestamp_millis(record.timestamp)
                .unwrap_or_default(),
            size: record.size,
            checksum: record.checksum,
        }
    }
}

/// Which backup to restore
#[derive(Debug, Clone, PartialEq)]
pub enum BackupSelector {
    /// Exact storage key
    Key(String),
    /// Backup taken at this instant (millisecond precision), of any document
    Timestamp(DateTime<Utc>),
    /// Backup of one document taken at this instant
    DocumentAt {
        document_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl BackupSelector {
    fn matches(&self, entry: &BackupEntry) -> bool {
        match self {
            Self::Key(key) => entry.key == *key,
            Self::Timestamp(ts) => entry.timestamp.timestamp_millis() == ts.timestamp_millis(),
            Self::DocumentAt {
                document_id,
                timestamp,
            } => {
                entry.document_id == *document_id
                    && entry.timestamp.timestamp_millis() == timestamp.timestamp_millis()
            }
        }
    }
}

impl From<&str> for BackupSelector {
    fn from(key: &str) -> Self {
        Self::Key(key.to_string())
    }
}

impl From<String> for BackupSelector {
    fn from(key: String) -> Self {
        Self::Key(key)
    }
}

impl From<DateTime<Utc>> for BackupSelector {
    fn from(timestamp: DateTime<Utc>) -> Self {
        Self::Timestamp(timestamp)
    }
}

/// Result of verifying one backup
#[derive(Debug, Clone, PartialEq)]
pub enum BackupStatus {
    Verified,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackupHealth {
    pub entry: BackupEntry,
    pub status: BackupStatus,
}

impl BackupHealth {
    pub fn is_ok(&self) -> bool {
        self.status == BackupStatus::Verified
    }
}

/// Owns the backup index and the backup keys in a backing store
pub struct BackupManager {
    store: Arc<dyn BackingStore>,
    codec: Arc<BestEffortCompressor>,
    max_backups: usize,
    // loaded lazily on first use
    index: Mutex<Option<BackupIndex>>,
}

impl BackupManager {
    pub fn new(store: Arc<dyn BackingStore>, codec: Arc<BestEffortCompressor>) -> Self {
        Self {
            store,
            codec,
            max_backups: DEFAULT_MAX_BACKUPS,
            index: Mutex::new(None),
        }
    }

    /// Override the per-document retention cap
    pub fn with_max_backups(mut self, max_backups: usize) -> Self {
        self.max_backups = max_backups;
        self
    }

    pub fn max_backups(&self) -> usize {
        self.max_backups
    }

    /// Snapshot `document` as a new backup stamped with the current time
    ///
    /// # Errors
    /// * `DraftError::Json` - the document cannot be serialized
    /// * `DraftError::QuotaExceeded` / `DraftError::Storage` - the store refused a write
    pub async fn create_backup(&self, document: &Document) -> Result<BackupEntry> {
        let payload = serde_json::to_vec(document)?;
        self.create_backup_from_payload(&document.id, payload, None)
            .await
    }

    /// Snapshot `document` as a backup stamped with `timestamp`
    ///
    /// Used to import backups taken elsewhere; the stamp is kept as given
    /// unless another backup of the document already holds it.
    pub async fn create_backup_at(
        &self,
        document: &Document,
        timestamp: DateTime<Utc>,
    ) -> Result<BackupEntry> {
        let payload = serde_json::to_vec(document)?;
        self.create_backup_from_payload(&document.id, payload, Some(timestamp))
            .await
    }

    /// Write a backup of an already serialized document
    ///
    /// Without an explicit `timestamp` the backup is stamped now, and always
    /// later than the document's newest backup so listing order matches
    /// creation order.
    pub(crate) async fn create_backup_from_payload(
        &self,
        document_id: &str,
        payload: Vec<u8>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<BackupEntry> {
        let mut slot = self.index.lock().await;
        let index = self.ensure_index(&mut slot).await?;

        let mut millis = match timestamp {
            Some(timestamp) => timestamp.timestamp_millis(),
            None => {
                let newest = index
                    .records
                    .values()
                    .filter(|record| record.document_id == document_id)
                    .map(|record| record.timestamp + 1)
                    .max();
                newest.map_or(Utc::now().timestamp_millis(), |next| {
                    next.max(Utc::now().timestamp_millis())
                })
            }
        };
        let mut key = backup_key(document_id, millis);
        while index.records.contains_key(&key) {
            millis += 1;
            key = backup_key(document_id, millis);
        }

        let mut envelope = Envelope::new(self.codec.pack(payload));
        if let Some(stamp) = DateTime::<Utc>::from_timestamp_millis(millis) {
            envelope.timestamp = stamp;
        }
        let bytes = envelope.encode();
        let checksum = Checksum::compute(&bytes);

        self.store.set(&key, &bytes).await?;

        let record = BackupRecord {
            document_id: document_id.to_string(),
            timestamp: millis,
            size: bytes.len(),
            checksum,
        };
        let entry = BackupEntry::from_record(&key, &record);
        index.records.insert(key.clone(), record);

        let rotated = self.rotate(index, document_id).await;
        self.write_index(index).await?;

        observability::record_backup_created(bytes.len());
        info!(
            key = %key,
            document_id,
            size = bytes.len(),
            compressed = envelope.is_compressed(),
            rotated,
            "backup created"
        );
        Ok(entry)
    }

    /// Drop this document's backups past the retention cap, oldest first
    async fn rotate(&self, index: &mut BackupIndex, document_id: &str) -> usize {
        let expired: Vec<String> = sorted_entries(index)
            .into_iter()
            .filter(|entry| entry.document_id == document_id)
            .skip(self.max_backups)
            .map(|entry| entry.key)
            .collect();
        if expired.is_empty() {
            return 0;
        }

        self.remove_keys(index, &expired).await;
        observability::record_backups_rotated(expired.len());
        debug!(document_id, count = expired.len(), "rotated out old backups");
        expired.len()
    }

    /// Remove backup blobs and their index records
    ///
    /// A blob that fails to delete is logged and still dropped from the index;
    /// it is unreachable from then on.
    async fn remove_keys(&self, index: &mut BackupIndex, keys: &[String]) {
        let results = join_all(keys.iter().map(|key| self.store.remove(key))).await;
        for (key, result) in keys.iter().zip(results) {
            if let Err(e) = result {
                warn!(key = %key, error = %e, "failed to delete backup blob");
            }
            index.records.remove(key);
        }
    }

    /// Every backup, newest first
    pub async fn list_backups(&self) -> Result<Vec<BackupEntry>> {
        let mut slot = self.index.lock().await;
        let index = self.ensure_index(&mut slot).await?;
        Ok(sorted_entries(index))
    }

    /// Backups of one document, newest first
    pub async fn list_backups_for(&self, document_id: &str) -> Result<Vec<BackupEntry>> {
        let mut entries = self.list_backups().await?;
        entries.retain(|entry| entry.document_id == document_id);
        Ok(entries)
    }

    /// Restore the newest backup of `document_id` that passes checksum and validation
    ///
    /// Backups that fail either check are logged and skipped. Returns `None`
    /// when no backup survives.
    pub async fn restore_latest_valid(&self, document_id: &str) -> Result<Option<Document>> {
        for entry in self.list_backups_for(document_id).await? {
            match self.read_verified(&entry).await {
                Ok(document) => {
                    info!(key = %entry.key, document_id, "restored document from backup");
                    return Ok(Some(document));
                }
                Err(e) => {
                    observability::record_restore_skipped();
                    warn!(key = %entry.key, error = %e, "skipping unusable backup");
                }
            }
        }
        Ok(None)
    }

    /// Restore one specific backup
    ///
    /// Returns `None` when no backup matches or the match fails verification.
    ///
    /// # Errors
    /// * `DraftError::AmbiguousSelector` - a bare timestamp matches backups of
    ///   several documents; use `BackupSelector::DocumentAt` instead
    pub async fn restore<S: Into<BackupSelector>>(&self, selector: S) -> Result<Option<Document>> {
        let selector = selector.into();
        let mut matches: Vec<BackupEntry> = self
            .list_backups()
            .await?
            .into_iter()
            .filter(|entry| selector.matches(entry))
            .collect();
        if matches.len() > 1 {
            let keys: Vec<&str> = matches.iter().map(|entry| entry.key.as_str()).collect();
            return Err(DraftError::AmbiguousSelector(format!(
                "{selector:?} matches {}",
                keys.join(", ")
            )));
        }
        let Some(entry) = matches.pop() else {
            debug!(?selector, "no backup matches selector");
            return Ok(None);
        };

        match self.read_verified(&entry).await {
            Ok(document) => Ok(Some(document)),
            Err(e) if e.is_corruption() => {
                observability::record_restore_skipped();
                warn!(key = %entry.key, error = %e, "requested backup failed verification");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Delete every backup taken more than `max_age` ago
    ///
    /// Returns the number of backups removed.
    pub async fn cleanup_older_than(&self, max_age: Duration) -> Result<usize> {
        let cutoff = (Utc::now() - max_age).timestamp_millis();

        let mut slot = self.index.lock().await;
        let index = self.ensure_index(&mut slot).await?;
        let expired: Vec<String> = index
            .records
            .iter()
            .filter(|(_, record)| record.timestamp < cutoff)
            .map(|(key, _)| key.clone())
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        self.remove_keys(index, &expired).await;
        self.write_index(index).await?;
        info!(count = expired.len(), "purged aged backups");
        Ok(expired.len())
    }

    /// Check every backup's checksum and payload without restoring it
    pub async fn verify_all(&self) -> Result<Vec<BackupHealth>> {
        let mut report = Vec::new();
        for entry in self.list_backups().await? {
            let status = match self.read_verified(&entry).await {
                Ok(_) => BackupStatus::Verified,
                Err(e) => BackupStatus::Failed(e.to_string()),
            };
            report.push(BackupHealth { entry, status });
        }
        Ok(report)
    }

    /// Read a backup, verify its checksum, then decode and validate it
    async fn read_verified(&self, entry: &BackupEntry) -> Result<Document> {
        let bytes = self
            .store
            .get(&entry.key)
            .await?
            .ok_or_else(|| DraftError::corruption(format!("backup {} is missing", entry.key)))?;

        entry.checksum.verify(&bytes)?;
        Envelope::decode(&bytes)?.into_document(&self.codec)
    }

    async fn ensure_index<'a>(
        &self,
        slot: &'a mut Option<BackupIndex>,
    ) -> Result<&'a mut BackupIndex> {
        if slot.is_none() {
            let index = self.read_index().await?;
            *slot = Some(index);
        }
        Ok(slot.get_or_insert_with(BackupIndex::default))
    }

    async fn read_index(&self) -> Result<BackupIndex> {
        let Some(bytes) = self.store.get(BACKUP_INDEX_KEY).await? else {
            return Ok(BackupIndex::default());
        };
        match serde_json::from_slice(&bytes) {
            Ok(index) => Ok(index),
            Err(e) => {
                warn!(error = %e, "backup index unreadable, rebuilding from stored backups");
                let index = self.rebuild_index().await?;
                if let Err(e) = self.write_index(&index).await {
                    warn!(error = %e, "failed to persist rebuilt backup index");
                }
                Ok(index)
            }
        }
    }

    /// Recreate the index from the backup blobs present in the store
    ///
    /// Document id and timestamp come from the blob itself when it decodes,
    /// otherwise from its key. Blobs that no longer decode are still indexed
    /// so retention and cleanup reclaim them.
    async fn rebuild_index(&self) -> Result<BackupIndex> {
        let mut index = BackupIndex::default();
        for key in self.store.keys().await? {
            let Some((key_document_id, key_millis)) = parse_backup_key(&key) else {
                continue;
            };
            let Some(bytes) = self.store.get(&key).await? else {
                continue;
            };

            let (document_id, timestamp) = match Envelope::decode(&bytes) {
                Ok(envelope) => {
                    let timestamp = envelope.timestamp.timestamp_millis();
                    let document_id = envelope
                        .into_document(&self.codec)
                        .map(|document| document.id)
                        .unwrap_or_else(|_| key_document_id.to_string());
                    (document_id, timestamp)
                }
                Err(e) => {
                    debug!(key = %key, error = %e, "indexing undecodable backup from its key");
                    (key_document_id.to_string(), key_millis)
                }
            };
            index.records.insert(
                key,
                BackupRecord {
                    document_id,
                    timestamp,
                    size: bytes.len(),
                    checksum: Checksum::compute(&bytes),
                },
            );
        }
        info!(count = index.records.len(), "rebuilt backup index");
        Ok(index)
    }

    async fn write_index(&self, index: &BackupIndex) -> Result<()> {
        let bytes = serde_json::to_vec(index)?;
        self.store.set(BACKUP_INDEX_KEY, &bytes).await
    }
}

fn backup_key(document_id: &str, millis: i64) -> String {
    format!("{BACKUP_KEY_PREFIX}{document_id}-{millis}")
}

/// Split `backup-<documentId>-<millis>` into its parts
fn parse_backup_key(key: &str) -> Option<(&str, i64)> {
    let (document_id, millis) = key.strip_prefix(BACKUP_KEY_PREFIX)?.rsplit_once('-')?;
    if document_id.is_empty() {
        return None;
    }
    Some((document_id, millis.parse().ok()?))
}

fn sorted_entries(index: &BackupIndex) -> Vec<BackupEntry> {
    let mut entries: Vec<BackupEntry> = index
        .records
        .iter()
        .map(|(key, record)| BackupEntry::from_record(key, record))
        .collect();
    entries.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| b.key.cmp(&a.key))
    });
    entries
}
