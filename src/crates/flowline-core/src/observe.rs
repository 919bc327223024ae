//! Observability seams: tracing, lineage, and error-handler interfaces.
//!
//! The engine consumes these as abstract factories from the execution
//! context and never depends on a concrete backend. The defaults log
//! through `tracing`; exporters (distributed tracing, lineage sinks) live
//! outside the core and plug in here.

use std::sync::Arc;

use crate::error::FlowError;

/// Per-node tracer. One instance is obtained per node per run.
pub trait NodeTracer: Send + Sync {
    fn on_start(&self, node: &str) {
        let _ = node;
    }
    fn on_complete(&self, node: &str, outcome: Result<(), &FlowError>) {
        let _ = (node, outcome);
    }
}

pub trait TracerFactory: Send + Sync {
    fn tracer_for(&self, node: &str) -> Arc<dyn NodeTracer>;
}

/// Observes per-item errors (every attempt, including recovered ones).
pub trait ErrorHandler: Send + Sync {
    fn on_error(&self, node: &str, error: &FlowError, attempt: usize);
}

pub trait ErrorHandlerFactory: Send + Sync {
    fn handler_for(&self, node: &str) -> Arc<dyn ErrorHandler>;
}

/// Records which edges carried data, and how much.
pub trait LineageRecorder: Send + Sync {
    fn edge_opened(&self, producer: &str, consumer: &str) {
        let _ = (producer, consumer);
    }
    fn edge_closed(&self, producer: &str, consumer: &str, items: u64) {
        let _ = (producer, consumer, items);
    }
}

/// Tracer that logs node lifecycle through `tracing`.
#[derive(Debug, Default, Clone)]
pub struct TracingTracer;

impl NodeTracer for TracingTracer {
    fn on_start(&self, node: &str) {
        tracing::debug!(node, "node started");
    }

    fn on_complete(&self, node: &str, outcome: Result<(), &FlowError>) {
        match outcome {
            Ok(()) => tracing::debug!(node, "node completed"),
            Err(e) => tracing::error!(node, error = %e, "node failed"),
        }
    }
}

impl TracerFactory for TracingTracer {
    fn tracer_for(&self, _node: &str) -> Arc<dyn NodeTracer> {
        Arc::new(TracingTracer)
    }
}

/// Error handler that logs through `tracing`.
#[derive(Debug, Default, Clone)]
pub struct TracingErrorHandler;

impl ErrorHandler for TracingErrorHandler {
    fn on_error(&self, node: &str, error: &FlowError, attempt: usize) {
        tracing::warn!(node, attempt, error = %error, "item error");
    }
}

impl ErrorHandlerFactory for TracingErrorHandler {
    fn handler_for(&self, _node: &str) -> Arc<dyn ErrorHandler> {
        Arc::new(TracingErrorHandler)
    }
}

/// Lineage recorder that logs edge lifecycles at debug level.
#[derive(Debug, Default, Clone)]
pub struct TracingLineage;

impl LineageRecorder for TracingLineage {
    fn edge_closed(&self, producer: &str, consumer: &str, items: u64) {
        tracing::debug!(producer, consumer, items, "edge closed");
    }
}

/// Discards everything. Useful in tests and benchmarks.
#[derive(Debug, Default, Clone)]
pub struct NoopObserver;

impl NodeTracer for NoopObserver {}
impl TracerFactory for NoopObserver {
    fn tracer_for(&self, _node: &str) -> Arc<dyn NodeTracer> {
        Arc::new(NoopObserver)
    }
}
impl ErrorHandler for NoopObserver {
    fn on_error(&self, _node: &str, _error: &FlowError, _attempt: usize) {}
}
impl ErrorHandlerFactory for NoopObserver {
    fn handler_for(&self, _node: &str) -> Arc<dyn ErrorHandler> {
        Arc::new(NoopObserver)
    }
}
impl LineageRecorder for NoopObserver {}

/// The bundle of observability services carried by the execution context.
#[derive(Clone)]
pub struct Observability {
    pub tracers: Arc<dyn TracerFactory>,
    pub error_handlers: Arc<dyn ErrorHandlerFactory>,
    pub lineage: Arc<dyn LineageRecorder>,
}

impl Default for Observability {
    fn default() -> Self {
        Observability {
            tracers: Arc::new(TracingTracer),
            error_handlers: Arc::new(TracingErrorHandler),
            lineage: Arc::new(TracingLineage),
        }
    }
}

impl Observability {
    pub fn silent() -> Self {
        Observability {
            tracers: Arc::new(NoopObserver),
            error_handlers: Arc::new(NoopObserver),
            lineage: Arc::new(NoopObserver),
        }
    }
}
