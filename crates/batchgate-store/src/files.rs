//! File stores for batch inputs and artifacts.

use async_trait::async_trait;
use batchgate_core::clients::{FileMetadata, FileReader, FileStore};
use batchgate_core::{Error, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::{Cursor, ErrorKind};
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

fn too_large(location: &str, size_limit: u64) -> Error {
    Error::InvalidInput(format!("{location} exceeds the size limit of {size_limit} bytes"))
}

/// Files under a local root directory. Locations are relative paths.
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map a location to a path under the root, refusing anything that
    /// could escape it.
    fn resolve(&self, location: &str) -> Result<PathBuf> {
        let relative = Path::new(location);
        let contained = !location.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !contained {
            return Err(Error::InvalidInput(format!(
                "invalid file location: {location}"
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn retrieve(&self, location: &str) -> Result<(FileReader, FileMetadata)> {
        let path = self.resolve(location)?;
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("file {location}")));
            }
            Err(e) => return Err(e.into()),
        };
        let metadata = file.metadata().await?;
        let modified_at = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok((
            Box::new(file),
            FileMetadata {
                location: location.to_string(),
                size: metadata.len(),
                modified_at,
            },
        ))
    }

    async fn store(
        &self,
        location: &str,
        size_limit: u64,
        reader: FileReader,
    ) -> Result<FileMetadata> {
        let path = self.resolve(location)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let partial = path.with_file_name(format!(".{file_name}.partial"));

        let mut file = fs::File::create(&partial).await?;
        let mut limited = reader.take(size_limit.saturating_add(1));
        let copied = tokio::io::copy(&mut limited, &mut file).await;
        let size = match copied {
            Ok(size) if size <= size_limit => size,
            Ok(_) => {
                drop(file);
                let _ = fs::remove_file(&partial).await;
                return Err(too_large(location, size_limit));
            }
            Err(e) => {
                drop(file);
                let _ = fs::remove_file(&partial).await;
                return Err(e.into());
            }
        };
        file.flush().await?;
        drop(file);
        fs::rename(&partial, &path).await?;

        debug!(location, size, "Stored file");
        Ok(FileMetadata {
            location: location.to_string(),
            size,
            modified_at: Utc::now(),
        })
    }
}

/// Files held in memory, keyed by location.
#[derive(Default)]
pub struct MemoryFileStore {
    files: Mutex<HashMap<String, (Bytes, DateTime<Utc>)>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (Bytes, DateTime<Utc>)>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, location: impl Into<String>, contents: impl Into<Bytes>) {
        self.lock()
            .insert(location.into(), (contents.into(), Utc::now()));
    }

    pub fn get(&self, location: &str) -> Option<Bytes> {
        self.lock().get(location).map(|(contents, _)| contents.clone())
    }

    pub fn contains(&self, location: &str) -> bool {
        self.lock().contains_key(location)
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn retrieve(&self, location: &str) -> Result<(FileReader, FileMetadata)> {
        let (contents, modified_at) = self
            .lock()
            .get(location)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("file {location}")))?;
        let metadata = FileMetadata {
            location: location.to_string(),
            size: contents.len() as u64,
            modified_at,
        };
        Ok((Box::new(Cursor::new(contents)), metadata))
    }

    async fn store(
        &self,
        location: &str,
        size_limit: u64,
        reader: FileReader,
    ) -> Result<FileMetadata> {
        let mut contents = Vec::new();
        reader
            .take(size_limit.saturating_add(1))
            .read_to_end(&mut contents)
            .await?;
        if contents.len() as u64 > size_limit {
            return Err(too_large(location, size_limit));
        }
        let size = contents.len() as u64;
        let modified_at = Utc::now();
        self.lock()
            .insert(location.to_string(), (Bytes::from(contents), modified_at));
        Ok(FileMetadata {
            location: location.to_string(),
            size,
            modified_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(data: &'static [u8]) -> FileReader {
        Box::new(Cursor::new(data))
    }

    #[tokio::test]
    async fn test_local_store_then_retrieve() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());

        let meta = store
            .store("batch_1/output.jsonl", 1024, reader(b"{\"a\":1}\n"))
            .await
            .unwrap();
        assert_eq!(meta.size, 8);

        let (mut file, meta) = store.retrieve("batch_1/output.jsonl").await.unwrap();
        let mut contents = String::new();
        file.read_to_string(&mut contents).await.unwrap();
        assert_eq!(contents, "{\"a\":1}\n");
        assert_eq!(meta.size, 8);
    }

    #[tokio::test]
    async fn test_local_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());
        assert!(matches!(
            store.retrieve("missing.jsonl").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_local_rejects_escaping_locations() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());
        for location in ["../secret", "/etc/passwd", "a/../../b", ""] {
            assert!(
                matches!(store.retrieve(location).await, Err(Error::InvalidInput(_))),
                "{location}"
            );
        }
    }

    #[tokio::test]
    async fn test_local_size_limit_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());
        let result = store.store("out.jsonl", 4, reader(b"0123456789")).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(!dir.path().join("out.jsonl").exists());
        assert!(!dir.path().join(".out.jsonl.partial").exists());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryFileStore::new();
        store.insert("in.jsonl", "line\n");
        let (mut file, meta) = store.retrieve("in.jsonl").await.unwrap();
        let mut contents = String::new();
        file.read_to_string(&mut contents).await.unwrap();
        assert_eq!(contents, "line\n");
        assert_eq!(meta.size, 5);

        store.store("out.jsonl", 3, reader(b"ok")).await.unwrap();
        assert_eq!(store.get("out.jsonl").unwrap(), Bytes::from_static(b"ok"));
        assert!(store.store("big.jsonl", 3, reader(b"toolong")).await.is_err());
        assert!(!store.contains("big.jsonl"));
    }
}
