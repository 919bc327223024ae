//! # flowline-core: a typed dataflow runtime
//!
//! Build multi-stage processing pipelines as a DAG of typed nodes
//! (sources, transforms, joins, aggregators, taps, sinks) connected by
//! bounded streams, executed one cooperative task per node with
//! watermark-driven time semantics and per-node fault tolerance.
//!
//! ```text
//! ┌────────┐    ┌───────────┐    ┌───────────────┐    ┌──────┐
//! │ source ├───▶│ transform ├───▶│   aggregate   ├───▶│ sink │
//! └────────┘    └───────────┘    │ (keyed windows│    └──────┘
//!                                │  + watermarks)│
//! ┌────────┐    ┌─────┐          └───────────────┘
//! │ source ├───▶│ join├───▶ ...
//! └────────┘ ┌─▶└─────┘
//! ┌────────┐ │
//! │ source ├─┘     every edge: bounded FIFO, backpressure, FIFO order
//! └────────┘
//! ```
//!
//! ## Core pieces
//!
//! - [`graph::GraphBuilder`]: declare nodes and typed edges, validate,
//!   freeze into a [`plan::Plan`]. Edge types are checked at compile
//!   time.
//! - [`stream`]: bounded single-consumer channels carrying items,
//!   event-time stamps, and in-band watermarks.
//! - [`engine::Engine`]: one task per node, retry/breaker wrapping,
//!   error routing, cooperative cancellation, shutdown deadlines.
//! - [`join`] / [`aggregate`]: keyed stateful operators finalized by
//!   watermarks; [`window`] assigns tumbling, sliding, and session
//!   windows; [`watermark`] generates and merges watermarks.
//! - [`retry`] / [`breaker`]: the per-node fault-tolerance substrate.
//! - [`composite`]: embed a whole sub-plan as a single transform.
//! - [`store`]: the abstract storage interfaces connectors implement.
//!
//! ## A minimal pipeline
//!
//! ```rust,ignore
//! use flowline_core::prelude::*;
//! use std::sync::Arc;
//! use parking_lot::Mutex;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let results = Arc::new(Mutex::new(Vec::new()));
//!     let sink_results = results.clone();
//!
//!     let mut g = GraphBuilder::new();
//!     let src = g.add_source("numbers", || source_iter(1i64..=10));
//!     let square = g.add_transform("square", || map_fn(|n: i64| n * n));
//!     let sink = g.add_sink("collect", move || collect_sink(sink_results.clone()));
//!     g.connect(&src, &square);
//!     g.connect(&square, &sink);
//!     let plan = g.build()?;
//!
//!     let outcome = Engine::new().run(&plan, Arc::new(ExecutionContext::new())).await;
//!     assert!(outcome.is_success());
//!     Ok(())
//! }
//! ```

pub mod aggregate;
pub mod breaker;
pub mod composite;
pub mod context;
pub mod engine;
pub mod error;
pub mod graph;
pub mod join;
pub mod metrics;
pub mod node;
pub mod observe;
pub mod plan;
pub mod retry;
pub mod store;
pub mod stream;
pub mod time;
pub mod visualization;
pub mod watermark;
pub mod window;

pub use aggregate::Aggregator;
pub use breaker::{BreakerManager, BreakerState, CircuitBreaker, CircuitBreakerOptions};
pub use composite::{CompositeInput, CompositeOutput, CompositeTransform};
pub use context::{ExecutionContext, InheritOptions, NodeContext};
pub use engine::{Engine, EngineOptions, PipelineResult};
pub use error::{ErrorKind, FlowError, GraphBuildError, Result};
pub use graph::GraphBuilder;
pub use join::{Join, JoinType};
pub use metrics::{MetricsSnapshot, RunMetrics};
pub use node::{Sink, Source, StreamTransform, Transform};
pub use plan::Plan;
pub use retry::{BackoffStrategy, RetryOptions};
pub use stream::{Data, Key, StreamEvent, StreamMessage, StreamReader, StreamSpec, StreamWriter};
pub use time::{EventTime, Watermark};
pub use visualization::{visualize, VisualizationFormat, VisualizationOptions};
pub use watermark::{BoundedOutOfOrderness, PeriodicWatermarks, WatermarkClock};
pub use window::{LatePolicy, Window, WindowAssigner};

/// The common imports for building pipelines.
pub mod prelude {
    pub use crate::aggregate::Aggregator;
    pub use crate::breaker::CircuitBreakerOptions;
    pub use crate::composite::{CompositeInput, CompositeOutput, CompositeTransform};
    pub use crate::context::{ExecutionContext, InheritOptions, NodeContext};
    pub use crate::engine::{Engine, EngineOptions};
    pub use crate::error::{ErrorKind, FlowError, GraphBuildError, Result};
    pub use crate::graph::{GraphBuilder, InputPort, NodeRef, OutputPort};
    pub use crate::join::{Join, JoinType};
    pub use crate::node::{
        collect_sink, filter_fn, flat_map_fn, map_fn, paced_source, sink_fn, source_iter,
        timestamped_source, try_map_fn, Sink, Source, StreamTransform, Transform,
    };
    pub use crate::retry::{BackoffStrategy, RetryOptions};
    pub use crate::stream::{Data, Key, StreamEvent, StreamMessage, StreamReader, StreamWriter};
    pub use crate::time::{from_epoch_ms, EventTime, Watermark};
    pub use crate::watermark::BoundedOutOfOrderness;
    pub use crate::window::{LatePolicy, WindowAssigner};
}
