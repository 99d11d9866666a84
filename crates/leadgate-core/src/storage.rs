//! Storage backend abstraction for the durable intake store.
//!
//! This module defines the storage contract the claim/release protocol and the
//! run ledger are built on:
//! - Conditional writes with preconditions (the claim primitive)
//! - Object metadata including `last_modified` and a version token
//!
//! The version token is an opaque `String` so different backends can supply
//! their own notion of object version. The in-memory backend uses a numeric
//! generation counter; the filesystem backend uses a content hash.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::io::AsyncWriteExt;
use ulid::Ulid;

use crate::error::{Error, Result};

/// Precondition for conditional writes (CAS operations).
///
/// The version token is opaque; backends interpret it according to their
/// own versioning scheme.
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
}

/// Storage backend trait for the durable intake store.
///
/// All backends (filesystem, memory) implement this trait. The contract is
/// designed around object storage semantics so a cloud backend can slot in
/// without touching the claim or ledger layers.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads entire object.
    ///
    /// Returns `Error::NotFound` if object doesn't exist.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Writes with optional precondition.
    ///
    /// Returns `WriteResult::PreconditionFailed` if precondition not met.
    /// Never returns error for precondition failure - that's a normal result.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Deletes an object.
    ///
    /// Succeeds even if object doesn't exist (idempotent).
    async fn delete(&self, path: &str) -> Result<()>;

    /// Lists objects with the given prefix.
    ///
    /// Returns empty vec if no objects match.
    ///
    /// **Ordering**: Results are returned in arbitrary order that may vary
    /// between backends and invocations. Callers requiring deterministic order
    /// should sort the results (e.g., by `path` or `last_modified`).
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Gets object metadata without reading content.
    ///
    /// Returns `None` if object doesn't exist.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;
}

/// In-memory storage backend for testing.
///
/// Thread-safe via `RwLock`. Not suitable for production.
/// Uses numeric versions internally (stored as strings).
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    /// Numeric version stored as i64 internally, exposed as String via API.
    version: i64,
    last_modified: DateTime<Utc>,
}

impl MemoryBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let objects = self.objects.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

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
        let mut objects = self.objects.write().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

        let current = objects.get(path);

        match precondition {
            WritePrecondition::DoesNotExist => {
                if let Some(obj) = current {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: obj.version.to_string(),
                    });
                }
            }
            WritePrecondition::MatchesVersion(expected) => {
                let expected_num: i64 = expected.parse().unwrap_or(-1);
                match current {
                    Some(obj) if obj.version != expected_num => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: obj.version.to_string(),
                        });
                    }
                    None => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: "0".to_string(),
                        });
                    }
                    _ => {}
                }
            }
            WritePrecondition::None => {}
        }

        let new_version = current.map_or(1, |o| o.version + 1);
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                version: new_version,
                last_modified: Utc::now(),
            },
        );
        drop(objects);

        Ok(WriteResult::Success {
            version: new_version.to_string(),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects
            .write()
            .map_err(|_| Error::Internal {
                message: "lock poisoned".into(),
            })?
            .remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

        Ok(objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(path, obj)| ObjectMeta {
                path: path.clone(),
                size: obj.data.len() as u64,
                version: obj.version.to_string(),
                last_modified: Some(obj.last_modified),
            })
            .collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

        Ok(objects.get(path).map(|obj| ObjectMeta {
            path: path.to_string(),
            size: obj.data.len() as u64,
            version: obj.version.to_string(),
            last_modified: Some(obj.last_modified),
        }))
    }
}

/// Filesystem storage backend for single-node deployments.
///
/// The `DoesNotExist` precondition maps to `O_CREAT | O_EXCL`, which is atomic
/// across processes on a local filesystem. `MatchesVersion` compares content
/// hashes under an in-process mutex, so CAS updates are only serialized within
/// one process. The claim protocol relies on `DoesNotExist` for correctness
/// and on `MatchesVersion` only for stale-claim takeover, where losing a race
/// across processes degrades to an extra retry rather than a double execution.
#[derive(Debug)]
pub struct FsBackend {
    root: PathBuf,
    /// Serializes read-compare-write sequences for conditional updates.
    write_lock: tokio::sync::Mutex<()>,
}

impl FsBackend {
    /// Creates a backend rooted at the given directory, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            Error::storage_with_source(format!("failed to create data dir {}", root.display()), e)
        })?;
        Ok(Self {
            root,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Maps a logical object path onto the root directory.
    ///
    /// Rejects absolute paths and parent-directory traversal.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        if path.is_empty() {
            return Err(Error::InvalidInput("object path is empty".into()));
        }
        let candidate = Path::new(path);
        for component in candidate.components() {
            match component {
                Component::Normal(_) => {}
                _ => {
                    return Err(Error::InvalidInput(format!(
                        "object path {path} must be a relative path without traversal"
                    )));
                }
            }
        }
        Ok(self.root.join(candidate))
    }

    fn rel_path(&self, full: &Path) -> Result<String> {
        let rel = full.strip_prefix(&self.root).map_err(|_| Error::Internal {
            message: format!("path {} escaped storage root", full.display()),
        })?;
        let parts: Vec<&str> = rel
            .components()
            .map(|c| {
                c.as_os_str().to_str().ok_or_else(|| Error::Internal {
                    message: format!("non-utf8 path under storage root: {}", full.display()),
                })
            })
            .collect::<Result<_>>()?;
        Ok(parts.join("/"))
    }

    fn content_version(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    /// Returns the current content version, or `None` if the object is absent.
    async fn version_of(&self, full: &Path) -> Result<Option<String>> {
        match tokio::fs::read(full).await {
            Ok(data) => Ok(Some(Self::content_version(&data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage_with_source(
                format!("failed to read {}", full.display()),
                e,
            )),
        }
    }

    async fn ensure_parent(&self, full: &Path) -> Result<()> {
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::storage_with_source(
                    format!("failed to create directory {}", parent.display()),
                    e,
                )
            })?;
        }
        Ok(())
    }

    /// Writes via a temp file in the same directory followed by a rename,
    /// so readers never observe a partially written object.
    async fn write_atomic(&self, full: &Path, data: &Bytes) -> Result<()> {
        self.ensure_parent(full).await?;
        let tmp = full.with_extension(format!("tmp-{}", Ulid::new()));
        let mut file = tokio::fs::File::create(&tmp).await.map_err(|e| {
            Error::storage_with_source(format!("failed to create {}", tmp.display()), e)
        })?;
        file.write_all(data).await.map_err(|e| {
            Error::storage_with_source(format!("failed to write {}", tmp.display()), e)
        })?;
        file.sync_all().await.map_err(|e| {
            Error::storage_with_source(format!("failed to sync {}", tmp.display()), e)
        })?;
        drop(file);
        tokio::fs::rename(&tmp, full).await.map_err(|e| {
            Error::storage_with_source(format!("failed to rename into {}", full.display()), e)
        })?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FsBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let full = self.resolve(path)?;
        match tokio::fs::read(&full).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("object not found: {path}")))
            }
            Err(e) => Err(Error::storage_with_source(
                format!("failed to read {path}"),
                e,
            )),
        }
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let full = self.resolve(path)?;

        match precondition {
            WritePrecondition::DoesNotExist => {
                self.ensure_parent(&full).await?;
                let created = tokio::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&full)
                    .await;
                match created {
                    Ok(mut file) => {
                        file.write_all(&data).await.map_err(|e| {
                            Error::storage_with_source(format!("failed to write {path}"), e)
                        })?;
                        file.sync_all().await.map_err(|e| {
                            Error::storage_with_source(format!("failed to sync {path}"), e)
                        })?;
                        Ok(WriteResult::Success {
                            version: Self::content_version(&data),
                        })
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                        let current_version = self
                            .version_of(&full)
                            .await?
                            .unwrap_or_else(|| "0".to_string());
                        Ok(WriteResult::PreconditionFailed { current_version })
                    }
                    Err(e) => Err(Error::storage_with_source(
                        format!("failed to create {path}"),
                        e,
                    )),
                }
            }
            WritePrecondition::MatchesVersion(expected) => {
                let _guard = self.write_lock.lock().await;
                match self.version_of(&full).await? {
                    None => Ok(WriteResult::PreconditionFailed {
                        current_version: "0".to_string(),
                    }),
                    Some(current) if current != expected => {
                        Ok(WriteResult::PreconditionFailed {
                            current_version: current,
                        })
                    }
                    Some(_) => {
                        self.write_atomic(&full, &data).await?;
                        Ok(WriteResult::Success {
                            version: Self::content_version(&data),
                        })
                    }
                }
            }
            WritePrecondition::None => {
                let _guard = self.write_lock.lock().await;
                self.write_atomic(&full, &data).await?;
                Ok(WriteResult::Success {
                    version: Self::content_version(&data),
                })
            }
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage_with_source(
                format!("failed to delete {path}"),
                e,
            )),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        // Walk from the prefix directory when it names one, otherwise from
        // the root, and filter on the logical path prefix either way.
        let start = if prefix.is_empty() {
            self.root.clone()
        } else {
            let candidate = self.resolve(prefix.trim_end_matches('/'))?;
            if tokio::fs::metadata(&candidate)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false)
            {
                candidate
            } else {
                self.root.clone()
            }
        };

        let mut results = Vec::new();
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(Error::storage_with_source(
                        format!("failed to list {}", dir.display()),
                        e,
                    ));
                }
            };
            while let Some(entry) = entries.next_entry().await.map_err(|e| {
                Error::storage_with_source(format!("failed to list {}", dir.display()), e)
            })? {
                let entry_path = entry.path();
                let file_type = entry.file_type().await.map_err(|e| {
                    Error::storage_with_source(
                        format!("failed to stat {}", entry_path.display()),
                        e,
                    )
                })?;
                if file_type.is_dir() {
                    pending.push(entry_path);
                    continue;
                }
                let rel = self.rel_path(&entry_path)?;
                if !rel.starts_with(prefix) {
                    continue;
                }
                if let Some(meta) = self.head(&rel).await? {
                    results.push(meta);
                }
            }
        }
        Ok(results)
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let full = self.resolve(path)?;
        let meta = match tokio::fs::metadata(&full).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::storage_with_source(
                    format!("failed to stat {path}"),
                    e,
                ));
            }
        };
        let Some(version) = self.version_of(&full).await? else {
            return Ok(None);
        };
        let last_modified = meta
            .modified()
            .ok()
            .map(DateTime::<Utc>::from);
        Ok(Some(ObjectMeta {
            path: path.to_string(),
            size: meta.len(),
            version,
            last_modified,
        }))
    }
}
