/*!
Local filesystem backing store.

Keys map to file names by percent-encoding every byte outside
`[A-Za-z0-9_-]`, so any key (spaces, `/`, non-ASCII, a leading `.`) lands on
exactly one file directly inside the base directory and `keys()` decodes the
names back.
*/

use super::BackingStore;
use crate::{DraftError, Result};
use async_trait::async_trait;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

// '.' is escaped too: no file name can be `..` or start with the temp-file dot
const FILE_NAME_ESCAPES: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

/// File name stored for `key`
fn encode_key(key: &str) -> String {
    utf8_percent_encode(key, FILE_NAME_ESCAPES).to_string()
}

/// Key stored under file name `name`, `None` for names this store never writes
fn decode_key(name: &str) -> Option<String> {
    if name.starts_with('.') {
        return None;
    }
    let key = percent_decode_str(name).decode_utf8().ok()?.into_owned();
    (encode_key(&key) == name).then_some(key)
}

/// One file per key under a base directory
///
/// Writes go to a temporary sibling file that is renamed into place, so a
/// reader sees either the previous value or the new one. The base directory
/// is created on first write.
///
/// # Example
/// ```rust,no_run
/// use drafthold_core::storage::{BackingStore, LocalFileStore};
///
/// # async fn run() -> drafthold_core::Result<()> {
/// let store = LocalFileStore::new("/var/lib/drafthold");
/// store.set("diagram-doc1", b"envelope bytes").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    base_dir: PathBuf,
    quota: Option<u64>,
}

impl LocalFileStore {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            quota: None,
        }
    }

    /// Refuse writes that would grow the directory past `quota` bytes
    pub fn with_quota(mut self, quota: u64) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve the file path for `key`
    fn resolve_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() {
            return Err(DraftError::validation("storage key must not be empty"));
        }
        Ok(self.base_dir.join(encode_key(key)))
    }

    /// Bytes used by every stored key except `key`
    async fn usage_excluding(&self, key: &str) -> Result<u64> {
        let file_name = encode_key(key);
        let mut total = 0;
        let mut entries = match fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || name == file_name {
                continue;
            }
            total += entry.metadata().await?.len();
        }
        Ok(total)
    }
}

fn map_write_error(key: &str, path: &Path, e: std::io::Error) -> DraftError {
    match e.kind() {
        ErrorKind::StorageFull => DraftError::quota_exceeded(key),
        _ => DraftError::storage(format!("Failed to write {}: {e}", path.display())),
    }
}

#[async_trait]
impl BackingStore for LocalFileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve_path(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DraftError::storage(format!(
                "Failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.resolve_path(key)?;

        if let Some(quota) = self.quota {
            let used = self.usage_excluding(key).await?;
            if used + value.len() as u64 > quota {
                debug!(key, used, quota, "local store quota reached");
                return Err(DraftError::quota_exceeded(key));
            }
        }

        fs::create_dir_all(&self.base_dir).await.map_err(|e| {
            DraftError::storage(format!(
                "Failed to create directory {}: {e}",
                self.base_dir.display()
            ))
        })?;

        let tmp_path = self
            .base_dir
            .join(format!(".{}.{}.tmp", encode_key(key), Uuid::new_v4()));
        if let Err(e) = fs::write(&tmp_path, value).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(map_write_error(key, &tmp_path, e));
        }
        if let Err(e) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(map_write_error(key, &path, e));
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.resolve_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DraftError::storage(format!(
                "Failed to delete {}: {e}",
                path.display()
            ))),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(key) = name.to_str().and_then(decode_key) else {
                continue;
            };
            if entry.file_type().await?.is_file() {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_store_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalFileStore::new(temp_dir.path().join("nested"));

        assert_eq!(store.get("diagram-a").await.unwrap(), None);

        store.set("diagram-a", b"first").await.unwrap();
        store.set("diagram-a", b"second").await.unwrap();
        assert_eq!(
            store.get("diagram-a").await.unwrap(),
            Some(b"second".to_vec())
        );
        assert_eq!(store.keys().await.unwrap(), vec!["diagram-a".to_string()]);

        store.remove("diagram-a").await.unwrap();
        store.remove("diagram-a").await.unwrap();
        assert!(store.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_empty_key() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalFileStore::new(temp_dir.path());

        assert!(matches!(
            store.set("", b"x").await,
            Err(DraftError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_arbitrary_keys_stay_inside_base_dir() {
        let temp_dir = TempDir::new().unwrap();
        let base = temp_dir.path().join("store");
        let store = LocalFileStore::new(&base);
        let keys = [
            "../escape",
            "org/doc",
            ".hidden",
            "..",
            "diagram-Team Diagram 1",
            "backup-projet-été-1700000000000",
            "100%",
        ];

        for (i, key) in keys.iter().enumerate() {
            store.set(key, &[i as u8]).await.unwrap();
        }
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(store.get(key).await.unwrap(), Some(vec![i as u8]));
        }

        let mut expected: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        expected.sort();
        assert_eq!(store.keys().await.unwrap(), expected);

        // nothing was written outside the base directory or into a subdirectory
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 1);
        for entry in std::fs::read_dir(&base).unwrap() {
            assert!(entry.unwrap().file_type().unwrap().is_file());
        }

        store.remove("org/doc").await.unwrap();
        assert_eq!(store.get("org/doc").await.unwrap(), None);
    }

    #[test]
    fn test_key_encoding() {
        assert_eq!(encode_key("diagram-doc_1"), "diagram-doc_1");
        assert_eq!(encode_key("a b/c"), "a%20b%2Fc");
        assert_eq!(encode_key(".x"), "%2Ex");
        assert_eq!(decode_key("a%20b%2Fc").as_deref(), Some("a b/c"));
        assert_eq!(decode_key(".diagram-a.1.tmp"), None);
        // names that no key encodes to are foreign files
        assert_eq!(decode_key("notes.txt"), None);
    }

    #[tokio::test]
    async fn test_local_store_quota() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalFileStore::new(temp_dir.path()).with_quota(16);

        store.set("a", &[1; 10]).await.unwrap();
        assert!(store.set("b", &[1; 10]).await.unwrap_err().is_quota_exceeded());
        store.set("a", &[1; 16]).await.unwrap();
    }

    #[tokio::test]
    async fn test_keys_skip_temporary_files() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join(".diagram-a.123.tmp"), b"partial").unwrap();
        let store = LocalFileStore::new(temp_dir.path());

        store.set("diagram-a", b"done").await.unwrap();
        assert_eq!(store.keys().await.unwrap(), vec!["diagram-a".to_string()]);
    }
}
