//! Row-oriented connectors over any [`RecordStore`].

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;

use flowline_core::store::{CheckpointStrategy, ConnectionInfo, RecordStore};
use flowline_core::{NodeContext, Result, Sink, Source, StreamWriter};

/// Source that streams the rows of one query.
pub struct RecordQuerySource {
    store: Arc<dyn RecordStore>,
    info: ConnectionInfo,
    query: String,
}

impl RecordQuerySource {
    pub fn new(
        store: Arc<dyn RecordStore>,
        info: ConnectionInfo,
        query: impl Into<String>,
    ) -> Self {
        RecordQuerySource {
            store,
            info,
            query: query.into(),
        }
    }
}

#[async_trait]
impl Source<serde_json::Value> for RecordQuerySource {
    async fn initialize(&mut self, _ctx: &NodeContext) -> Result<()> {
        self.store.connect(&self.info).await
    }

    async fn run(
        &mut self,
        out: &mut StreamWriter<serde_json::Value>,
        _ctx: &NodeContext,
    ) -> Result<()> {
        let mut rows = self.store.read(&self.query).await?;
        while let Some(row) = rows.next().await {
            out.produce(row?).await?;
        }
        Ok(())
    }
}

/// Sink that writes rows in batches of `batch_size`.
pub struct RecordBatchSink {
    store: Arc<dyn RecordStore>,
    info: ConnectionInfo,
    batch_size: usize,
    checkpoint: CheckpointStrategy,
    pending: Vec<serde_json::Value>,
    acked: u64,
}

impl RecordBatchSink {
    pub fn new(store: Arc<dyn RecordStore>, info: ConnectionInfo, batch_size: usize) -> Self {
        RecordBatchSink {
            store,
            info,
            batch_size: batch_size.max(1),
            checkpoint: CheckpointStrategy::None,
            pending: Vec::new(),
            acked: 0,
        }
    }

    /// Offset tracking is the backend's business; the sink only records
    /// the hint it was configured with.
    pub fn with_checkpoint(mut self, strategy: CheckpointStrategy) -> Self {
        self.checkpoint = strategy;
        self
    }

    async fn write_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.pending);
        self.acked += self.store.write_batch(batch).await?;
        Ok(())
    }
}

#[async_trait]
impl Sink<serde_json::Value> for RecordBatchSink {
    async fn initialize(&mut self, _ctx: &NodeContext) -> Result<()> {
        self.store.connect(&self.info).await
    }

    async fn on_item(&mut self, item: serde_json::Value, _ctx: &NodeContext) -> Result<()> {
        self.pending.push(item);
        if self.pending.len() >= self.batch_size {
            self.write_pending().await?;
        }
        Ok(())
    }

    async fn flush(&mut self, ctx: &NodeContext) -> Result<()> {
        self.write_pending().await?;
        tracing::debug!(
            node = ctx.node_name(),
            acked = self.acked,
            checkpoint = ?self.checkpoint,
            "record batch sink flushed"
        );
        Ok(())
    }
}
