//! Abstract storage interfaces consumed by connectors.
//!
//! The core never opens files or sockets itself: sources and sinks that
//! need storage call out through these traits, and concrete backends
//! (object stores, databases, brokers) implement them outside the core.
//! In-memory implementations live in the `flowline-connect` crate.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// A blob entry as reported by [`BlobStore::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    pub uri: String,
    pub is_directory: bool,
    pub size: u64,
}

/// A blob-addressable byte store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn open_read(&self, uri: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>>;

    /// The written bytes become visible when the writer is shut down.
    async fn open_write(&self, uri: &str) -> Result<Box<dyn AsyncWrite + Send + Unpin>>;

    async fn list(&self, prefix: &str, recursive: bool) -> Result<Vec<BlobEntry>>;

    async fn exists(&self, uri: &str) -> Result<bool>;
}

/// Connection parameters for a record-oriented store.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub uri: String,
    pub options: HashMap<String, String>,
}

impl ConnectionInfo {
    pub fn new(uri: impl Into<String>) -> Self {
        ConnectionInfo {
            uri: uri.into(),
            options: HashMap::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

/// A record-oriented store: query rows in, write batches out.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn connect(&self, info: &ConnectionInfo) -> Result<()>;

    /// Rows produced lazily; the iterator owns whatever cursor state the
    /// backend needs.
    async fn read(&self, query: &str) -> Result<BoxStream<'static, Result<serde_json::Value>>>;

    /// Returns the number of rows acknowledged.
    async fn write_batch(&self, rows: Vec<serde_json::Value>) -> Result<u64>;
}

/// How much offset state a connector persists between runs. The core
/// keeps no durable state; this is a hint connectors honor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointStrategy {
    /// No checkpointing at all.
    #[default]
    None,
    /// Offsets tracked in memory for the life of the process.
    InMemory,
    /// Offsets handed to the backend (consumer groups, cursors).
    Offset,
}
