//! Storage backend abstraction for durable state and retained snapshots.
//!
//! This module defines the storage contract every backend implements:
//! - Conditional writes with preconditions (compare-and-swap on a version token)
//! - Object metadata including `last_modified` and the retention lock, if any
//! - Retention-locked writes: an object written with [`StorageBackend::put_retained`]
//!   cannot be overwritten or deleted by anyone until its lock expires
//!
//! The retention check lives in the backend itself and uses the backend's own
//! clock. Callers may check retention metadata first, but the medium never
//! relies on them having done so.
//!
//! ## Backends
//!
//! - [`MemoryBackend`]: thread-safe in-memory objects for tests
//! - [`FileBackend`]: local filesystem objects with sidecar metadata

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};

/// Precondition for conditional writes (CAS operations).
///
/// The version token is opaque; backends interpret it according to their semantics.
#[derive(Debug, Clone)]
pub enum WritePrecondition {
    /// Write only if object does not exist.
    DoesNotExist,
    /// Write only if object's version matches the given token.
    MatchesVersion(String),
    /// Write unconditionally.
    None,
}

/// Result of a conditional write.
#[derive(Debug, Clone)]
pub enum WriteResult {
    /// Write succeeded, returns new version token.
    Success {
        /// The new version token after the write.
        version: String,
    },
    /// Precondition failed, returns current version token.
    PreconditionFailed {
        /// The current version that caused the precondition to fail.
        current_version: String,
    },
}

impl WriteResult {
    /// Returns true if the write was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Object path (key).
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Object version token for CAS operations.
    pub version: String,
    /// Last modification timestamp.
    pub last_modified: Option<DateTime<Utc>>,
    /// Retention lock expiry, if the object was written retention-locked.
    pub retain_until: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// Returns true if the object is still under its retention lock at `now`.
    #[must_use]
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.retain_until.is_some_and(|until| now < until)
    }
}

/// Storage backend trait for object storage.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads entire object.
    ///
    /// Returns `Error::NotFound` if object doesn't exist.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Writes with optional precondition.
    ///
    /// Returns `WriteResult::PreconditionFailed` if precondition not met.
    /// Returns `Error::RetentionLocked` if the existing object is retention-locked.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Writes a new object that is immutable until `retain_until`.
    ///
    /// Retained objects are write-once: the write only succeeds if no object
    /// exists at `path`. The lock cannot be shortened or removed.
    async fn put_retained(
        &self,
        path: &str,
        data: Bytes,
        retain_until: DateTime<Utc>,
    ) -> Result<WriteResult>;

    /// Deletes an object.
    ///
    /// Succeeds even if object doesn't exist (idempotent).
    /// Returns `Error::RetentionLocked` if the object is retention-locked.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Lists objects with the given prefix.
    ///
    /// **Ordering**: results are sorted by path.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Gets object metadata without reading content.
    ///
    /// Returns `None` if object doesn't exist.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;
}

fn check_precondition(
    current: Option<i64>,
    precondition: &WritePrecondition,
) -> Option<WriteResult> {
    match (precondition, current) {
        (WritePrecondition::DoesNotExist, Some(version)) => Some(WriteResult::PreconditionFailed {
            current_version: version.to_string(),
        }),
        (WritePrecondition::MatchesVersion(expected), Some(version)) => {
            let expected_num: i64 = expected.parse().unwrap_or(-1);
            (expected_num != version).then(|| WriteResult::PreconditionFailed {
                current_version: version.to_string(),
            })
        }
        (WritePrecondition::MatchesVersion(_), None) => Some(WriteResult::PreconditionFailed {
            current_version: "0".to_string(),
        }),
        _ => None,
    }
}

fn locked_error(path: &str, retain_until: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Result<()> {
    match retain_until {
        Some(until) if now < until => Err(Error::RetentionLocked {
            path: path.to_string(),
            retain_until: until,
        }),
        _ => Ok(()),
    }
}

/// In-memory storage backend for testing.
///
/// Thread-safe via `RwLock`. Not suitable for production.
/// Uses numeric versions internally (stored as strings).
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: i64,
    last_modified: DateTime<Utc>,
    retain_until: Option<DateTime<Utc>>,
}

impl StoredObject {
    fn meta(&self, path: &str) -> ObjectMeta {
        ObjectMeta {
            path: path.to_string(),
            size: self.data.len() as u64,
            version: self.version.to_string(),
            last_modified: Some(self.last_modified),
            retain_until: self.retain_until,
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Creates a new empty memory backend on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates a memory backend that enforces retention against `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            objects: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    fn write_object(
        &self,
        path: &str,
        data: Bytes,
        precondition: &WritePrecondition,
        retain_until: Option<DateTime<Utc>>,
    ) -> Result<WriteResult> {
        let now = self.clock.now();
        let mut objects = self
            .objects
            .write()
            .map_err(|_| Error::lock_poisoned("memory backend"))?;

        let current = objects.get(path);
        if let Some(obj) = current {
            locked_error(path, obj.retain_until, now)?;
        }
        if let Some(failed) = check_precondition(current.map(|o| o.version), precondition) {
            return Ok(failed);
        }

        let new_version = current.map_or(1, |o| o.version + 1);
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                version: new_version,
                last_modified: now,
                retain_until,
            },
        );
        drop(objects);

        Ok(WriteResult::Success {
            version: new_version.to_string(),
        })
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let objects = self
            .objects
            .read()
            .map_err(|_| Error::lock_poisoned("memory backend"))?;

        objects
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(format!("object not found: {path}")))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        self.write_object(path, data, &precondition, None)
    }

    async fn put_retained(
        &self,
        path: &str,
        data: Bytes,
        retain_until: DateTime<Utc>,
    ) -> Result<WriteResult> {
        self.write_object(
            path,
            data,
            &WritePrecondition::DoesNotExist,
            Some(retain_until),
        )
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let now = self.clock.now();
        let mut objects = self
            .objects
            .write()
            .map_err(|_| Error::lock_poisoned("memory backend"))?;
        if let Some(obj) = objects.get(path) {
            locked_error(path, obj.retain_until, now)?;
        }
        objects.remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self
            .objects
            .read()
            .map_err(|_| Error::lock_poisoned("memory backend"))?;

        let mut metas: Vec<ObjectMeta> = objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(path, obj)| obj.meta(path))
            .collect();
        metas.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(metas)
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let objects = self
            .objects
            .read()
            .map_err(|_| Error::lock_poisoned("memory backend"))?;

        Ok(objects.get(path).map(|obj| obj.meta(path)))
    }
}

/// Sidecar metadata persisted next to each object by [`FileBackend`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileMeta {
    version: i64,
    last_modified: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retain_until: Option<DateTime<Utc>>,
}

/// Local filesystem storage backend.
///
/// Object bytes live under `{root}/objects/{path}` and metadata under
/// `{root}/meta/{path}.json`. Writes go to a temporary file and are renamed
/// into place, so a reader never observes a partially written object.
/// Mutations within one process are serialized by an async mutex.
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
    clock: Arc<dyn Clock>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl FileBackend {
    /// Creates a filesystem backend rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_clock(root, Arc::new(SystemClock))
    }

    /// Creates a filesystem backend that enforces retention against `clock`.
    #[must_use]
    pub fn with_clock(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: root.into(),
            clock,
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn object_path(&self, path: &str) -> Result<PathBuf> {
        validate_relative(path)?;
        Ok(self.root.join("objects").join(path))
    }

    fn meta_path(&self, path: &str) -> Result<PathBuf> {
        validate_relative(path)?;
        Ok(self.root.join("meta").join(format!("{path}.json")))
    }

    async fn read_meta(&self, path: &str) -> Result<Option<FileMeta>> {
        let meta_path = self.meta_path(path)?;
        match tokio::fs::read(&meta_path).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|e| Error::serialization(format!("corrupt metadata for {path}: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage_with_source(
                format!("failed to read metadata for {path}"),
                e,
            )),
        }
    }

    async fn write_object(
        &self,
        path: &str,
        data: Bytes,
        precondition: &WritePrecondition,
        retain_until: Option<DateTime<Utc>>,
    ) -> Result<WriteResult> {
        let _guard = self.write_lock.lock().await;
        let now = self.clock.now();

        let current = self.read_meta(path).await?;
        if let Some(meta) = &current {
            locked_error(path, meta.retain_until, now)?;
        }
        if let Some(failed) = check_precondition(current.as_ref().map(|m| m.version), precondition)
        {
            return Ok(failed);
        }

        let version = current.as_ref().map_or(1, |m| m.version + 1);
        let meta = FileMeta {
            version,
            last_modified: now,
            retain_until,
        };
        let meta_bytes = serde_json::to_vec(&meta).map_err(Error::serialization)?;

        atomic_write(&self.object_path(path)?, &data).await?;
        atomic_write(&self.meta_path(path)?, &meta_bytes).await?;

        Ok(WriteResult::Success {
            version: version.to_string(),
        })
    }

    async fn collect_paths(&self, dir: &Path, out: &mut Vec<String>) -> Result<()> {
        let objects_root = self.root.join("objects");
        let mut pending = vec![dir.to_path_buf()];
        while let Some(current) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::storage_with_source("failed to list objects", e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Error::storage_with_source("failed to list objects", e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| Error::storage_with_source("failed to stat object", e))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&objects_root) {
                    let key = relative.to_string_lossy().replace('\\', "/");
                    if !key.ends_with(".tmp") {
                        out.push(key);
                    }
                }
            }
        }
        Ok(())
    }
}

fn validate_relative(path: &str) -> Result<()> {
    if path.is_empty() || path.starts_with('/') || path.split('/').any(|seg| seg == "..") {
        return Err(Error::InvalidInput(format!("invalid object path: {path}")));
    }
    Ok(())
}

async fn atomic_write(target: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::storage_with_source("failed to create directory", e))?;
    }
    let mut tmp = target.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, data)
        .await
        .map_err(|e| Error::storage_with_source(format!("failed to write {}", tmp.display()), e))?;
    tokio::fs::rename(&tmp, target)
        .await
        .map_err(|e| {
            Error::storage_with_source(format!("failed to publish {}", target.display()), e)
        })
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        match tokio::fs::read(self.object_path(path)?).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("object not found: {path}")))
            }
            Err(e) => Err(Error::storage_with_source(format!("failed to read {path}"), e)),
        }
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        self.write_object(path, data, &precondition, None).await
    }

    async fn put_retained(
        &self,
        path: &str,
        data: Bytes,
        retain_until: DateTime<Utc>,
    ) -> Result<WriteResult> {
        self.write_object(
            path,
            data,
            &WritePrecondition::DoesNotExist,
            Some(retain_until),
        )
        .await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let now = self.clock.now();
        if let Some(meta) = self.read_meta(path).await? {
            locked_error(path, meta.retain_until, now)?;
        }
        for target in [self.object_path(path)?, self.meta_path(path)?] {
            match tokio::fs::remove_file(&target).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(Error::storage_with_source(
                        format!("failed to delete {path}"),
                        e,
                    ));
                }
            }
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut paths = Vec::new();
        self.collect_paths(&self.root.join("objects"), &mut paths)
            .await?;
        paths.retain(|p| p.starts_with(prefix));
        paths.sort();

        let mut metas = Vec::with_capacity(paths.len());
        for path in paths {
            if let Some(meta) = self.head(&path).await? {
                metas.push(meta);
            }
        }
        Ok(metas)
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let Some(meta) = self.read_meta(path).await? else {
            return Ok(None);
        };
        let size = match tokio::fs::metadata(self.object_path(path)?).await {
            Ok(stat) => stat.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::storage_with_source(format!("failed to stat {path}"), e)),
        };
        Ok(Some(ObjectMeta {
            path: path.to_string(),
            size,
            version: meta.version.to_string(),
            last_modified: Some(meta.last_modified),
            retain_until: meta.retain_until,
        }))
    }
}
