#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kvstore-fs** – File-system storage driver for the kvstore persistence
//! kernel.
//!
//! Each key maps to one file at `<root>/<2-char-prefix>/<sanitized-key>.json`.
//! Writes go through a temp file and an atomic rename so readers never
//! observe a half-written value; a per-file lock map serializes writers
//! against readers racing a rename without blocking concurrent readers of
//! different keys.

mod config;
mod locks;

pub use config::FsConfig;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use kvstore_core::{Entity, Envelope, Predicate, Store, StoreError, StoreResult};
use locks::LockTable;

/// A per-file, JSON-on-disk storage backend.
pub struct FileSystemBackend<T> {
    config: FsConfig,
    locks: LockTable,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Entity> FileSystemBackend<T> {
    /// Open (creating if absent) a backend rooted at `config.root`.
    pub async fn open(config: FsConfig) -> StoreResult<Self> {
        tokio::fs::create_dir_all(&config.root)
            .await
            .map_err(StoreError::Io)?;
        Ok(Self {
            config,
            locks: LockTable::new(),
            _marker: std::marker::PhantomData,
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let sanitized = sanitize(key);
        if self.config.use_subdirectories && sanitized.len() >= 2 {
            let prefix = &sanitized[..2];
            self.config.root.join(prefix).join(format!("{sanitized}.json"))
        } else {
            self.config.root.join(format!("{sanitized}.json"))
        }
    }

    async fn with_retry<F, Fut, R>(&self, mut f: F) -> StoreResult<R>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::io::Result<R>>,
    {
        let mut attempt = 0u32;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt + 1 < self.config.max_retries && is_transient(&e) => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(
                        self.config.retry_delay_ms * (attempt as u64 + 1),
                    ))
                    .await;
                }
                Err(e) => return Err(StoreError::Io(e)),
            }
        }
    }

    async fn read_file(&self, path: &Path) -> StoreResult<Option<Vec<u8>>> {
        self.with_retry(|| async {
            match tokio::fs::read(path).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn write_file_atomic(&self, path: &Path, bytes: &[u8]) -> StoreResult<()> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(StoreError::Io)?;
        }
        let tmp_path = path.with_extension(format!("json.tmp.{}", uuid::Uuid::new_v4()));
        self.with_retry(|| {
            let tmp_path = tmp_path.clone();
            let path = path.to_path_buf();
            let bytes = bytes.to_vec();
            async move {
                tokio::fs::write(&tmp_path, &bytes).await?;
                match tokio::fs::rename(&tmp_path, &path).await {
                    Ok(()) => Ok(()),
                    Err(_) => {
                        // Platform disallows rename-over; fall back to
                        // delete-then-rename.
                        let _ = tokio::fs::remove_file(&path).await;
                        tokio::fs::rename(&tmp_path, &path).await
                    }
                }
            }
        })
        .await
    }

    async fn decode_envelope(&self, key: &str, bytes: &[u8]) -> StoreResult<Envelope<T>> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization {
            key: key.to_string(),
            source: e.into(),
        })
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        e.kind(),
        Interrupted | WouldBlock | TimedOut | PermissionDenied | Other
    )
}

/// Replace any character invalid in a file name (and path separators) with
/// `_`.
fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl<T: Entity> Store<T> for FileSystemBackend<T> {
    async fn get(&self, key: &str) -> StoreResult<Option<T>> {
        let path = self.path_for(key);
        let bytes = self
            .locks
            .with_lock(&path, |_guard| async { self.read_file(&path).await })
            .await?;
        match bytes {
            None => Ok(None),
            Some(bytes) => Ok(Some(self.decode_envelope(key, &bytes).await?.value)),
        }
    }

    async fn get_all(&self, predicate: Option<&Predicate<T>>) -> StoreResult<Vec<T>> {
        let mut entries = tokio::fs::read_dir(&self.config.root)
            .await
            .map_err(StoreError::Io)?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(StoreError::Io)? {
            collect_json_files(entry.path(), &mut files).await;
        }

        let semaphore = Semaphore::new(self.config.max_concurrent_files.max(1));
        let mut out = Vec::with_capacity(files.len());
        for path in files {
            let _permit = semaphore.acquire().await.expect("semaphore not closed");
            let bytes = match self.read_file(&path).await? {
                Some(b) => b,
                None => continue,
            };
            let key = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            match self.decode_envelope(&key, &bytes).await {
                Ok(env) => out.push(env.value),
                Err(e) => {
                    tracing::warn!(%key, error = %e, "skipping file that failed to decode");
                }
            }
        }
        Ok(out
            .into_iter()
            .filter(|v| predicate.map(|p| p.matches(v)).unwrap_or(true))
            .collect())
    }

    async fn save(&self, key: &str, entity: T) -> StoreResult<()> {
        let path = self.path_for(key);
        let key = key.to_string();
        self.locks
            .with_lock(&path, |_guard| async {
                let previous = match self.read_file(&path).await? {
                    Some(bytes) => Some(self.decode_envelope(&key, &bytes).await?),
                    None => None,
                };
                let envelope = match previous {
                    Some(prev) => Envelope::update(&prev, entity),
                    None => Envelope::new(entity),
                };
                let bytes = serde_json::to_vec(&envelope).map_err(|e| StoreError::Backend(e.into()))?;
                self.write_file_atomic(&path, &bytes).await
            })
            .await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let path = self.path_for(key);
        self.locks
            .with_lock(&path, |_guard| async {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(StoreError::Io(e)),
                }
            })
            .await
    }

    async fn clear(&self) -> StoreResult<usize> {
        let mut entries = tokio::fs::read_dir(&self.config.root)
            .await
            .map_err(StoreError::Io)?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(StoreError::Io)? {
            collect_json_files(entry.path(), &mut files).await;
        }
        let mut removed = 0usize;
        for path in files {
            if tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn collect_json_files<'a>(
    path: PathBuf,
    out: &'a mut Vec<PathBuf>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
    Box::pin(async move {
        if path.is_dir() {
            if let Ok(mut entries) = tokio::fs::read_dir(&path).await {
                while let Ok(Some(entry)) = entries.next_entry().await {
                    collect_json_files(entry.path(), out).await;
                }
            }
        } else if path.extension().map(|e| e == "json").unwrap_or(false) {
            out.push(path);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    struct Widget {
        id: String,
        version: u64,
        name: String,
    }

    impl Entity for Widget {
        fn type_name() -> &'static str {
            "Widget"
        }
        fn id(&self) -> &str {
            &self.id
        }
        fn version(&self) -> u64 {
            self.version
        }
        fn set_version(&mut self, version: u64) {
            self.version = version;
        }
    }

    fn widget(id: &str) -> Widget {
        Widget {
            id: id.into(),
            version: 0,
            name: id.to_uppercase(),
        }
    }

    async fn backend() -> (tempfile::TempDir, FileSystemBackend<Widget>) {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileSystemBackend::open(FsConfig::new(dir.path())).await.unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn round_trip_and_count() {
        let (_dir, backend) = backend().await;
        backend.save("a", widget("a")).await.unwrap();
        assert_eq!(backend.get("a").await.unwrap(), Some(widget("a")));
        assert_eq!(backend.count(None).await.unwrap(), 1);
        backend.delete("a").await.unwrap();
        assert_eq!(backend.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_dir, backend) = backend().await;
        backend.delete("missing").await.unwrap();
        backend.delete("missing").await.unwrap();
    }

    #[tokio::test]
    async fn sanitizes_unsafe_characters_in_keys() {
        let (_dir, backend) = backend().await;
        let key = "Widget/weird:name?.json";
        backend
            .save(
                key,
                Widget {
                    id: "weird".into(),
                    version: 0,
                    name: "X".into(),
                },
            )
            .await
            .unwrap();
        assert!(backend.get(key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn save_overwrites_previous_value_for_the_same_key() {
        let (_dir, backend) = backend().await;
        backend.save("a", widget("a")).await.unwrap();
        backend
            .save(
                "a",
                Widget {
                    id: "a".into(),
                    version: 1,
                    name: "UPDATED".into(),
                },
            )
            .await
            .unwrap();
        let stored = backend.get("a").await.unwrap().unwrap();
        assert_eq!(stored.name, "UPDATED");
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn predicate_filters_get_all() {
        let (_dir, backend) = backend().await;
        backend.save("a", widget("a")).await.unwrap();
        backend.save("b", widget("b")).await.unwrap();
        let pred = Predicate::new(|w: &Widget| w.id == "a");
        let filtered = backend.get_all(Some(&pred)).await.unwrap();
        assert_eq!(filtered, vec![widget("a")]);
    }

    #[tokio::test]
    async fn clear_removes_every_file() {
        let (_dir, backend) = backend().await;
        backend.save("a", widget("a")).await.unwrap();
        backend.save("b", widget("b")).await.unwrap();
        let removed = backend.clear().await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(backend.count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_saves_to_same_key_never_corrupt_the_file() {
        let (_dir, backend) = backend().await;
        let backend = std::sync::Arc::new(backend);
        let mut tasks = Vec::new();
        for i in 0..8u64 {
            let backend = backend.clone();
            tasks.push(tokio::spawn(async move {
                backend
                    .save(
                        "k",
                        Widget {
                            id: "k".into(),
                            version: i,
                            name: format!("v{i}"),
                        },
                    )
                    .await
            }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        let value = backend.get("k").await.unwrap().unwrap();
        assert_eq!(value.name, format!("v{}", value.version));
    }
}
