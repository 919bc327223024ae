//! # flowline-connect: connector substrate for flowline
//!
//! The core runtime talks to storage only through the abstract
//! interfaces in `flowline_core::store`. This crate supplies:
//!
//! - in-memory implementations of those interfaces ([`MemoryBlobStore`],
//!   [`MemoryRecordStore`]) for tests, demos, and small jobs;
//! - generic source/sink nodes over any implementation:
//!   [`BlobLineSource`]/[`BlobLineSink`] for line-oriented text blobs and
//!   [`RecordQuerySource`]/[`RecordBatchSink`] for record stores.
//!
//! Concrete backends (object stores, databases, brokers) implement the
//! same traits in their own crates and reuse the node types here.

pub mod lines;
pub mod memory;
pub mod record;

pub use lines::{BlobLineSink, BlobLineSource};
pub use memory::{MemoryBlobStore, MemoryRecordStore};
pub use record::{RecordBatchSink, RecordQuerySource};
