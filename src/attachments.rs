//! Content-addressed attachment blob storage
//!
//! Blobs are keyed by the lowercase hex SHA-256 of their bytes, so storing the
//! same attachment twice yields the same reference. The local store shards
//! files by the first two hex characters:
//!
//! ```text
//! {base}/
//! ├── 3f/
//! │   └── 3fa2...e1
//! └── a0/
//!     └── a09c...7b
//! ```

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::errors::{AppError, AppResult};

/// Result of storing one blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub storage_ref: String,
    pub checksum: String,
    pub size_bytes: i64,
}

/// Blob store consumed by the sync and send paths
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn put(&self, data: &[u8]) -> AppResult<StoredBlob>;
    async fn get(&self, storage_ref: &str) -> AppResult<Vec<u8>>;
    /// Returns `false` when nothing was stored under the reference.
    async fn remove(&self, storage_ref: &str) -> AppResult<bool>;
}

/// Hex SHA-256 of `data`
pub fn content_ref(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn validate_ref(storage_ref: &str) -> AppResult<()> {
    if storage_ref.len() == 64 && storage_ref.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Ok(());
    }
    Err(AppError::invalid(format!(
        "invalid attachment storage_ref '{storage_ref}'"
    )))
}

fn blob_for(data: &[u8]) -> StoredBlob {
    let checksum = content_ref(data);
    StoredBlob {
        storage_ref: checksum.clone(),
        checksum,
        size_bytes: i64::try_from(data.len()).unwrap_or(i64::MAX),
    }
}

/// Filesystem-backed store
#[derive(Debug, Clone)]
pub struct LocalAttachmentStore {
    base_path: PathBuf,
}

impl LocalAttachmentStore {
    /// Create the store, creating the base directory if needed.
    pub async fn open(base_path: impl Into<PathBuf>) -> AppResult<Self> {
        let base_path = base_path.into();
        tokio::fs::create_dir_all(&base_path).await.map_err(|e| {
            AppError::Storage(format!(
                "failed to create attachment dir {}: {e}",
                base_path.display()
            ))
        })?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn blob_path(&self, storage_ref: &str) -> PathBuf {
        self.base_path.join(&storage_ref[..2]).join(storage_ref)
    }
}

fn io_error(action: &str, storage_ref: &str, err: io::Error) -> AppError {
    AppError::Storage(format!("failed to {action} attachment {storage_ref}: {err}"))
}

#[async_trait]
impl AttachmentStore for LocalAttachmentStore {
    async fn put(&self, data: &[u8]) -> AppResult<StoredBlob> {
        let blob = blob_for(data);
        let path = self.blob_path(&blob.storage_ref);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(blob);
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("store", &blob.storage_ref, e))?;
        }
        // Write then rename so a crash never leaves a truncated blob in place.
        let tmp = path.with_extension("partial");
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| io_error("store", &blob.storage_ref, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error("store", &blob.storage_ref, e))?;
        Ok(blob)
    }

    async fn get(&self, storage_ref: &str) -> AppResult<Vec<u8>> {
        validate_ref(storage_ref)?;
        match tokio::fs::read(self.blob_path(storage_ref)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(AppError::not_found(format!("attachment {storage_ref}")))
            }
            Err(e) => Err(io_error("read", storage_ref, e)),
        }
    }

    async fn remove(&self, storage_ref: &str) -> AppResult<bool> {
        validate_ref(storage_ref)?;
        match tokio::fs::remove_file(self.blob_path(storage_ref)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error("remove", storage_ref, e)),
        }
    }
}

/// In-process store, for tests and ephemeral runs
#[derive(Debug, Default)]
pub struct MemoryAttachmentStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryAttachmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, storage_ref: &str) -> bool {
        self.blobs
            .lock()
            .map(|blobs| blobs.contains_key(storage_ref))
            .unwrap_or(false)
    }

    fn blobs(&self) -> AppResult<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.blobs
            .lock()
            .map_err(|_| AppError::Storage("attachment map poisoned".to_owned()))
    }
}

#[async_trait]
impl AttachmentStore for MemoryAttachmentStore {
    async fn put(&self, data: &[u8]) -> AppResult<StoredBlob> {
        let blob = blob_for(data);
        self.blobs()?
            .entry(blob.storage_ref.clone())
            .or_insert_with(|| data.to_vec());
        Ok(blob)
    }

    async fn get(&self, storage_ref: &str) -> AppResult<Vec<u8>> {
        self.blobs()?
            .get(storage_ref)
            .cloned()
            .ok_or_else(|| AppError::not_found(format!("attachment {storage_ref}")))
    }

    async fn remove(&self, storage_ref: &str) -> AppResult<bool> {
        Ok(self.blobs()?.remove(storage_ref).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::{AttachmentStore, LocalAttachmentStore, MemoryAttachmentStore, content_ref};
    use crate::errors::AppError;

    #[test]
    fn content_ref_is_sha256_hex() {
        assert_eq!(
            content_ref(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn local_store_dedups_and_shards() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalAttachmentStore::open(dir.path()).await.expect("open");

        let first = store.put(b"hello").await.expect("put");
        let second = store.put(b"hello").await.expect("put again");
        assert_eq!(first, second);
        assert_eq!(first.size_bytes, 5);
        assert!(
            dir.path()
                .join(&first.storage_ref[..2])
                .join(&first.storage_ref)
                .exists()
        );

        assert_eq!(store.get(&first.storage_ref).await.expect("get"), b"hello");
        assert!(store.remove(&first.storage_ref).await.expect("remove"));
        assert!(!store.remove(&first.storage_ref).await.expect("remove twice"));
        assert!(matches!(
            store.get(&first.storage_ref).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn local_store_rejects_path_like_refs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalAttachmentStore::open(dir.path()).await.expect("open");
        assert!(matches!(
            store.get("../etc/passwd").await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryAttachmentStore::new();
        let blob = store.put(b"data").await.expect("put");
        assert!(store.contains(&blob.storage_ref));
        assert_eq!(store.get(&blob.storage_ref).await.expect("get"), b"data");
        assert!(store.remove(&blob.storage_ref).await.expect("remove"));
        assert!(!store.contains(&blob.storage_ref));
    }
}
