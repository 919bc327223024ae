//! In-memory store implementations.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};

use flowline_core::store::{BlobEntry, BlobStore, ConnectionInfo, RecordStore};
use flowline_core::{ErrorKind, FlowError, Result};

const STORE: &str = "memory_blob_store";

/// Blob store backed by a concurrent map. Writes become visible on
/// writer shutdown, mirroring the commit semantics of object stores.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a blob directly, bypassing the writer path.
    pub fn put(&self, uri: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.blobs.insert(uri.into(), bytes.into());
    }

    pub fn get(&self, uri: &str) -> Option<Vec<u8>> {
        self.blobs.get(uri).map(|b| b.clone())
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn open_read(&self, uri: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let bytes = self
            .blobs
            .get(uri)
            .map(|b| b.clone())
            .ok_or_else(|| FlowError::item(ErrorKind::InputValidation, STORE, format!("no blob at '{uri}'")))?;
        Ok(Box::new(io::Cursor::new(bytes)))
    }

    async fn open_write(&self, uri: &str) -> Result<Box<dyn AsyncWrite + Send + Unpin>> {
        Ok(Box::new(MemoryBlobWriter {
            uri: uri.to_string(),
            buf: Vec::new(),
            blobs: self.blobs.clone(),
        }))
    }

    async fn list(&self, prefix: &str, recursive: bool) -> Result<Vec<BlobEntry>> {
        let mut entries = Vec::new();
        let mut dirs = std::collections::BTreeSet::new();
        for item in self.blobs.iter() {
            let uri = item.key();
            let Some(rest) = uri.strip_prefix(prefix) else {
                continue;
            };
            match rest.find('/') {
                Some(slash) if !recursive => {
                    dirs.insert(format!("{prefix}{}", &rest[..slash]));
                }
                _ => entries.push(BlobEntry {
                    uri: uri.clone(),
                    is_directory: false,
                    size: item.value().len() as u64,
                }),
            }
        }
        for dir in dirs {
            entries.push(BlobEntry {
                uri: dir,
                is_directory: true,
                size: 0,
            });
        }
        entries.sort_by(|a, b| a.uri.cmp(&b.uri));
        Ok(entries)
    }

    async fn exists(&self, uri: &str) -> Result<bool> {
        Ok(self.blobs.contains_key(uri))
    }
}

struct MemoryBlobWriter {
    uri: String,
    buf: Vec<u8>,
    blobs: Arc<DashMap<String, Vec<u8>>>,
}

impl AsyncWrite for MemoryBlobWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().buf.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        me.blobs.insert(me.uri.clone(), std::mem::take(&mut me.buf));
        Poll::Ready(Ok(()))
    }
}

/// Record store backed by a single in-memory table.
#[derive(Clone, Default)]
pub struct MemoryRecordStore {
    rows: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, rows: impl IntoIterator<Item = serde_json::Value>) {
        self.rows.lock().extend(rows);
    }

    pub fn rows(&self) -> Vec<serde_json::Value> {
        self.rows.lock().clone()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn connect(&self, info: &ConnectionInfo) -> Result<()> {
        tracing::debug!(uri = %info.uri, "memory record store connected");
        Ok(())
    }

    async fn read(&self, _query: &str) -> Result<BoxStream<'static, Result<serde_json::Value>>> {
        let snapshot = self.rows.lock().clone();
        Ok(futures::stream::iter(snapshot.into_iter().map(Ok)).boxed())
    }

    async fn write_batch(&self, rows: Vec<serde_json::Value>) -> Result<u64> {
        let count = rows.len() as u64;
        self.rows.lock().extend(rows);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn blob_round_trip_through_writer() {
        let store = MemoryBlobStore::new();
        let mut w = store.open_write("dir/a.txt").await.unwrap();
        w.write_all(b"hello").await.unwrap();
        // Not visible until shutdown.
        assert!(!store.exists("dir/a.txt").await.unwrap());
        w.shutdown().await.unwrap();
        assert!(store.exists("dir/a.txt").await.unwrap());

        let mut r = store.open_read("dir/a.txt").await.unwrap();
        let mut out = String::new();
        r.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn missing_blob_reports_validation_error() {
        let store = MemoryBlobStore::new();
        let err = match store.open_read("nope").await {
            Err(e) => e,
            Ok(_) => panic!("expected open_read to fail"),
        };
        assert_eq!(err.kind(), ErrorKind::InputValidation);
    }

    #[tokio::test]
    async fn list_respects_recursion() {
        let store = MemoryBlobStore::new();
        store.put("data/a.txt", "1");
        store.put("data/sub/b.txt", "22");
        store.put("other/c.txt", "3");

        let flat = store.list("data/", false).await.unwrap();
        let uris: Vec<_> = flat.iter().map(|e| (e.uri.as_str(), e.is_directory)).collect();
        assert_eq!(uris, vec![("data/a.txt", false), ("data/sub", true)]);

        let deep = store.list("data/", true).await.unwrap();
        assert_eq!(deep.len(), 2);
        assert!(deep.iter().all(|e| !e.is_directory));
    }

    #[tokio::test]
    async fn record_store_reads_a_snapshot() {
        use futures::StreamExt;
        let store = MemoryRecordStore::new();
        store.seed([serde_json::json!({"id": 1}), serde_json::json!({"id": 2})]);
        let ack = store
            .write_batch(vec![serde_json::json!({"id": 3})])
            .await
            .unwrap();
        assert_eq!(ack, 1);

        let rows: Vec<_> = store
            .read("select *")
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(rows.len(), 3);
    }
}
