//! Streaming JSONL artifact writer.
//!
//! Records are piped straight into [`FileStore::store`] as they are
//! produced, so a job never holds its whole output in memory. Nothing is
//! stored until the first record is written, and a writer dropped before
//! [`ArtifactWriter::finish`] stores nothing.

use batchgate_core::clients::{FileMetadata, FileStore};
use batchgate_core::{Error, Result};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tracing::debug;

/// Buffer between the record producer and the file store upload.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Aborts the upload task when dropped unjoined.
struct Upload {
    writer: DuplexStream,
    task: JoinHandle<Result<FileMetadata>>,
}

impl Upload {
    fn start(store: &Arc<dyn FileStore>, location: &str, size_limit: u64) -> Self {
        let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        let store = Arc::clone(store);
        let location = location.to_string();
        let task = tokio::spawn(async move {
            store
                .store(&location, size_limit, Box::new(reader))
                .await
        });
        Self { writer, task }
    }

    /// Close the pipe and wait for the store to see end of file.
    async fn join(mut self) -> Result<FileMetadata> {
        // The reader is gone when the store already failed; the task says why.
        let _ = self.writer.shutdown().await;
        match (&mut self.task).await {
            Ok(stored) => stored,
            Err(e) => Err(Error::Internal(format!("artifact upload task failed: {e}"))),
        }
    }
}

impl Drop for Upload {
    fn drop(&mut self) {
        // Runs before the writer closes, so the store never sees end of file.
        self.task.abort();
    }
}

/// Lazily created JSONL artifact.
pub struct ArtifactWriter {
    store: Arc<dyn FileStore>,
    location: String,
    size_limit: u64,
    upload: Option<Upload>,
    records: u64,
}

impl ArtifactWriter {
    pub fn new(store: Arc<dyn FileStore>, location: impl Into<String>, size_limit: u64) -> Self {
        Self {
            store,
            location: location.into(),
            size_limit,
            upload: None,
            records: 0,
        }
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    /// Append one record followed by a newline.
    pub async fn write_record(&mut self, record: &[u8]) -> Result<()> {
        let (store, location, size_limit) = (&self.store, &self.location, self.size_limit);
        let upload = self
            .upload
            .get_or_insert_with(|| Upload::start(store, location, size_limit));

        let written = async {
            upload.writer.write_all(record).await?;
            upload.writer.write_all(b"\n").await
        }
        .await;

        if let Err(e) = written {
            // The store stopped reading; its error says why.
            return match self.upload.take() {
                Some(upload) => match upload.join().await {
                    Err(stored) => Err(stored),
                    Ok(_) => Err(e.into()),
                },
                None => Err(e.into()),
            };
        }
        self.records += 1;
        Ok(())
    }

    /// Close the artifact and wait for the store to finish.
    ///
    /// Returns `None` when no record was ever written.
    pub async fn finish(mut self) -> Result<Option<FileMetadata>> {
        let Some(upload) = self.upload.take() else {
            return Ok(None);
        };
        let metadata = upload.join().await?;
        debug!(
            location = %metadata.location,
            size = metadata.size,
            records = self.records,
            "Stored artifact"
        );
        Ok(Some(metadata))
    }

    /// Stop the upload without storing anything further.
    pub fn abort(mut self) {
        self.upload = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchgate_store::MemoryFileStore;

    #[tokio::test]
    async fn test_records_are_newline_delimited() {
        let files = Arc::new(MemoryFileStore::new());
        let mut writer = ArtifactWriter::new(files.clone(), "out.jsonl", 1024);
        writer.write_record(br#"{"a":1}"#).await.unwrap();
        writer.write_record(br#"{"b":2}"#).await.unwrap();
        assert_eq!(writer.records(), 2);

        let metadata = writer.finish().await.unwrap().unwrap();
        assert_eq!(metadata.location, "out.jsonl");
        assert_eq!(
            files.get("out.jsonl").unwrap(),
            bytes::Bytes::from_static(b"{\"a\":1}\n{\"b\":2}\n")
        );
    }

    #[tokio::test]
    async fn test_unused_writer_stores_nothing() {
        let files = Arc::new(MemoryFileStore::new());
        let writer = ArtifactWriter::new(files.clone(), "errors.jsonl", 1024);
        assert!(writer.finish().await.unwrap().is_none());
        assert!(!files.contains("errors.jsonl"));
    }

    #[tokio::test]
    async fn test_dropped_writer_stores_nothing() {
        let files = Arc::new(MemoryFileStore::new());
        let mut writer = ArtifactWriter::new(files.clone(), "out.jsonl", 1024);
        writer.write_record(br#"{"a":1}"#).await.unwrap();
        drop(writer);

        // Give a detached upload every chance to complete.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!files.contains("out.jsonl"));
    }

    #[tokio::test]
    async fn test_aborted_writer_stores_nothing() {
        let files = Arc::new(MemoryFileStore::new());
        let mut writer = ArtifactWriter::new(files.clone(), "out.jsonl", 1024);
        writer.write_record(br#"{"a":1}"#).await.unwrap();
        writer.abort();

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!files.contains("out.jsonl"));
    }

    #[tokio::test]
    async fn test_size_limit_surfaces_store_error() {
        let files = Arc::new(MemoryFileStore::new());
        let mut writer = ArtifactWriter::new(files.clone(), "out.jsonl", 8);
        writer.write_record(b"0123456789").await.unwrap();
        let result = writer.finish().await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(!files.contains("out.jsonl"));
    }
}
