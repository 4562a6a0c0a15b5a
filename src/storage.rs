//! Object storage used for rendered documents and template files.
//!
//! The worker only needs four operations (head, get, put, server-side copy)
//! plus string metadata per object. `FsObjectStore` keeps objects on a mounted
//! volume with a JSON sidecar holding the metadata; `MemoryObjectStore` keeps
//! everything in process and is used for local runs and tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::debug;

use crate::error::StorageError;
use crate::lock::mutex_lock;

/// Suffix of the metadata sidecar written next to each object.
const META_SUFFIX: &str = ".meta.json";

/// Result of a metadata-only lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectHead {
    pub size: u64,
    pub metadata: HashMap<String, String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Returns object metadata without transferring the body, `None` if absent.
    async fn head(&self, path: &str) -> Result<Option<ObjectHead>, StorageError>;

    /// Fetches the object body.
    async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Writes (or overwrites) an object with the given metadata.
    async fn put(
        &self,
        path: &str,
        body: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> Result<(), StorageError>;

    /// Copies an object, metadata included, without round-tripping the body
    /// through the caller.
    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError>;
}

/// Filesystem-backed object store rooted at a directory.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if path.is_empty() || escapes {
            return Err(StorageError::Backend(format!(
                "object path must be relative without `..`: {path}"
            )));
        }
        Ok(self.root.join(relative))
    }

    fn meta_path(object: &Path) -> PathBuf {
        let mut name = object.as_os_str().to_owned();
        name.push(META_SUFFIX);
        PathBuf::from(name)
    }

    async fn read_metadata(object: &Path) -> Result<HashMap<String, String>, StorageError> {
        let meta_path = Self::meta_path(object);
        match tokio::fs::read(&meta_path).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(StorageError::io(meta_path.display().to_string(), e)),
        }
    }

    async fn ensure_parent(path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent.display().to_string(), e))?;
        }
        Ok(())
    }

    /// Writes through a temporary file so concurrent readers never see a
    /// partially written object. Racing writers: last rename wins.
    async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(format!(".{}.tmp", uuid::Uuid::new_v4()));
        let tmp = PathBuf::from(tmp_name);

        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| StorageError::io(tmp.display().to_string(), e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| StorageError::io(path.display().to_string(), e))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn head(&self, path: &str) -> Result<Option<ObjectHead>, StorageError> {
        let object = self.resolve(path)?;
        let size = match tokio::fs::metadata(&object).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(path, e)),
        };
        let metadata = Self::read_metadata(&object).await?;
        Ok(Some(ObjectHead { size, metadata }))
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let object = self.resolve(path)?;
        match tokio::fs::read(&object).await {
            Ok(body) => Ok(body),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound {
                path: path.to_string(),
            }),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    async fn put(
        &self,
        path: &str,
        body: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> Result<(), StorageError> {
        let object = self.resolve(path)?;
        Self::ensure_parent(&object).await?;

        let meta_json = serde_json::to_vec(&metadata)?;
        Self::write_atomic(&Self::meta_path(&object), &meta_json).await?;
        Self::write_atomic(&object, &body).await?;

        debug!(path = %path, bytes = body.len(), "Stored object");
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;

        if tokio::fs::metadata(&source).await.is_err() {
            return Err(StorageError::NotFound {
                path: from.to_string(),
            });
        }
        Self::ensure_parent(&target).await?;

        let metadata = Self::read_metadata(&source).await?;
        tokio::fs::copy(&source, &target)
            .await
            .map_err(|e| StorageError::io(to, e))?;
        if !metadata.is_empty() {
            let meta_json = serde_json::to_vec(&metadata)?;
            Self::write_atomic(&Self::meta_path(&target), &meta_json).await?;
        }

        debug!(from = %from, to = %to, "Copied object");
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct MemoryObject {
    body: Vec<u8>,
    metadata: HashMap<String, String>,
}

/// In-process object store. Counts body fetches so callers can verify that
/// metadata-only paths stay metadata-only.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, MemoryObject>>,
    body_reads: AtomicUsize,
}

const SOURCE: &str = "storage::memory";

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get` calls served so far.
    pub fn body_reads(&self) -> usize {
        self.body_reads.load(Ordering::Relaxed)
    }

    pub fn contains(&self, path: &str) -> bool {
        mutex_lock(&self.objects, SOURCE, "contains").contains_key(path)
    }

    /// Reads an object without counting it as a body fetch.
    pub fn peek(&self, path: &str) -> Option<Vec<u8>> {
        mutex_lock(&self.objects, SOURCE, "peek")
            .get(path)
            .map(|object| object.body.clone())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn head(&self, path: &str) -> Result<Option<ObjectHead>, StorageError> {
        Ok(mutex_lock(&self.objects, SOURCE, "head")
            .get(path)
            .map(|object| ObjectHead {
                size: object.body.len() as u64,
                metadata: object.metadata.clone(),
            }))
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.body_reads.fetch_add(1, Ordering::Relaxed);
        mutex_lock(&self.objects, SOURCE, "get")
            .get(path)
            .map(|object| object.body.clone())
            .ok_or_else(|| StorageError::NotFound {
                path: path.to_string(),
            })
    }

    async fn put(
        &self,
        path: &str,
        body: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> Result<(), StorageError> {
        mutex_lock(&self.objects, SOURCE, "put")
            .insert(path.to_string(), MemoryObject { body, metadata });
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let mut objects = mutex_lock(&self.objects, SOURCE, "copy");
        let object = objects
            .get(from)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                path: from.to_string(),
            })?;
        objects.insert(to.to_string(), object);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn meta(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_fs_store_put_head_get() {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path());

        store
            .put("exports/cache/abc.docx", b"doc".to_vec(), meta(&[("ttl-hours", "24")]))
            .await
            .unwrap();

        let head = store.head("exports/cache/abc.docx").await.unwrap().unwrap();
        assert_eq!(head.size, 3);
        assert_eq!(head.metadata.get("ttl-hours").map(String::as_str), Some("24"));
        assert_eq!(store.get("exports/cache/abc.docx").await.unwrap(), b"doc");
    }

    #[tokio::test]
    async fn test_fs_store_head_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path());
        assert!(store.head("exports/cache/none.docx").await.unwrap().is_none());
        assert!(matches!(
            store.get("exports/cache/none.docx").await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_fs_store_copy_carries_metadata() {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path());
        store
            .put("exports/cache/k.odt", b"odt".to_vec(), meta(&[("cached-at", "x")]))
            .await
            .unwrap();

        store
            .copy("exports/cache/k.odt", "tenant-1/exports/job-1.odt")
            .await
            .unwrap();

        let head = store.head("tenant-1/exports/job-1.odt").await.unwrap().unwrap();
        assert_eq!(head.metadata.get("cached-at").map(String::as_str), Some("x"));
        assert_eq!(store.get("tenant-1/exports/job-1.odt").await.unwrap(), b"odt");
    }

    #[tokio::test]
    async fn test_fs_store_copy_missing_source_fails() {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path());
        let result = store.copy("exports/cache/missing.docx", "t/exports/j.docx").await;
        assert!(matches!(result, Err(StorageError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_fs_store_rejects_escaping_paths() {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path());
        assert!(store.head("../etc/passwd").await.is_err());
        assert!(store.head("/etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store_counts_body_reads() {
        let store = MemoryObjectStore::new();
        store.put("a", b"1".to_vec(), HashMap::new()).await.unwrap();

        assert!(store.head("a").await.unwrap().is_some());
        assert_eq!(store.body_reads(), 0);
        assert_eq!(store.get("a").await.unwrap(), b"1");
        assert_eq!(store.body_reads(), 1);

        store.copy("a", "b").await.unwrap();
        assert_eq!(store.peek("b"), Some(b"1".to_vec()));
    }
}
