//! Execution context: the per-run bag of services and settings.
//!
//! The engine owns one [`ExecutionContext`] per pipeline run. Nodes never
//! see it directly; each node receives an immutable [`NodeContext`] view
//! built by the engine (two-phase init; the context never holds
//! references back into nodes).
//!
//! The context carries:
//!
//! - `parameters`: user-provided key/value bag, opaque to the engine
//! - `items`: engine-internal per-run scratch (composite node I/O)
//! - `properties`: observability labels
//! - the cancellation token every suspension point observes
//! - default retry and circuit-breaker options, overridable per node
//! - observability factories (tracer, error handler, lineage)

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::breaker::{BreakerManager, CircuitBreaker, CircuitBreakerOptions};
use crate::metrics::RunMetrics;
use crate::observe::{ErrorHandler, NodeTracer, Observability};
use crate::retry::RetryOptions;

/// Which parts of a parent context a composite sub-context inherits.
///
/// The cancellation token, observability services, and retry/breaker
/// defaults are always inherited; these flags only govern the data bags.
#[derive(Debug, Clone, Copy)]
pub struct InheritOptions {
    pub parameters: bool,
    pub items: bool,
    pub properties: bool,
}

impl Default for InheritOptions {
    fn default() -> Self {
        InheritOptions {
            parameters: true,
            items: false,
            properties: true,
        }
    }
}

/// Per-run execution context.
pub struct ExecutionContext {
    run_id: Uuid,
    parameters: HashMap<String, serde_json::Value>,
    properties: HashMap<String, String>,
    items: Mutex<HashMap<String, serde_json::Value>>,
    cancel: CancellationToken,
    pub retry: RetryOptions,
    pub breaker: Option<CircuitBreakerOptions>,
    pub observability: Observability,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        ExecutionContext {
            run_id: Uuid::new_v4(),
            parameters: HashMap::new(),
            properties: HashMap::new(),
            items: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            retry: RetryOptions::default(),
            breaker: None,
            observability: Observability::default(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn with_parameter(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_breaker(mut self, breaker: CircuitBreakerOptions) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_observability(mut self, obs: Observability) -> Self {
        self.observability = obs;
        self
    }

    pub fn parameter(&self, key: &str) -> Option<&serde_json::Value> {
        self.parameters.get(key)
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Engine-internal scratch. Composite nodes use well-known keys here
    /// to hand items into and out of sub-plans.
    pub fn set_item(&self, key: impl Into<String>, value: serde_json::Value) {
        self.items.lock().insert(key.into(), value);
    }

    pub fn get_item(&self, key: &str) -> Option<serde_json::Value> {
        self.items.lock().get(key).cloned()
    }

    pub fn take_item(&self, key: &str) -> Option<serde_json::Value> {
        self.items.lock().remove(key)
    }

    /// The run's cancellation token. Cancelling it asks every node to
    /// drain and stop at its next suspension point.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Build a child context for a composite sub-plan. Cancellation is
    /// linked (cancelling the parent cancels the child), services and
    /// policy defaults are always carried over, and the data bags follow
    /// `inherit`.
    pub fn child(&self, inherit: InheritOptions) -> ExecutionContext {
        ExecutionContext {
            run_id: Uuid::new_v4(),
            parameters: if inherit.parameters {
                self.parameters.clone()
            } else {
                HashMap::new()
            },
            properties: if inherit.properties {
                self.properties.clone()
            } else {
                HashMap::new()
            },
            items: Mutex::new(if inherit.items {
                self.items.lock().clone()
            } else {
                HashMap::new()
            }),
            cancel: self.cancel.child_token(),
            retry: self.retry.clone(),
            breaker: self.breaker.clone(),
            observability: self.observability.clone(),
        }
    }
}

/// Per-node policy overrides recorded by the graph builder.
#[derive(Debug, Clone, Default)]
pub struct NodePolicy {
    pub retry: Option<RetryOptions>,
    pub breaker: Option<CircuitBreakerOptions>,
}

/// The immutable per-node view handed to node code and drive loops.
#[derive(Clone)]
pub struct NodeContext {
    node_name: Arc<str>,
    ctx: Arc<ExecutionContext>,
    metrics: RunMetrics,
    retry: RetryOptions,
    breaker: Option<Arc<CircuitBreaker>>,
    tracer: Arc<dyn NodeTracer>,
    error_handler: Arc<dyn ErrorHandler>,
}

impl NodeContext {
    pub(crate) fn new(
        node_name: &str,
        ctx: Arc<ExecutionContext>,
        metrics: RunMetrics,
        policy: &NodePolicy,
    ) -> Self {
        let retry = policy.retry.clone().unwrap_or_else(|| ctx.retry.clone());
        let breaker_opts = policy.breaker.clone().or_else(|| ctx.breaker.clone());
        let breaker = breaker_opts.filter(|o| o.enabled).map(|o| {
            // Breaker identity is the node name, so state survives across
            // runs of the same pipeline shape.
            BreakerManager::global().acquire(node_name, &o)
        });
        NodeContext {
            node_name: Arc::from(node_name),
            tracer: ctx.observability.tracers.tracer_for(node_name),
            error_handler: ctx.observability.error_handlers.handler_for(node_name),
            ctx,
            metrics,
            retry,
            breaker,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn parameter(&self, key: &str) -> Option<serde_json::Value> {
        self.ctx.parameter(key).cloned()
    }

    pub fn property(&self, key: &str) -> Option<String> {
        self.ctx.property(key).map(str::to_owned)
    }

    pub fn get_item(&self, key: &str) -> Option<serde_json::Value> {
        self.ctx.get_item(key)
    }

    pub fn set_item(&self, key: impl Into<String>, value: serde_json::Value) {
        self.ctx.set_item(key, value)
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.ctx.cancellation()
    }

    pub fn is_cancelled(&self) -> bool {
        self.ctx.is_cancelled()
    }

    pub fn metrics(&self) -> &RunMetrics {
        &self.metrics
    }

    pub fn retry(&self) -> &RetryOptions {
        &self.retry
    }

    pub(crate) fn breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    pub(crate) fn tracer(&self) -> &Arc<dyn NodeTracer> {
        &self.tracer
    }

    pub(crate) fn error_handler(&self) -> &Arc<dyn ErrorHandler> {
        &self.error_handler
    }

    pub(crate) fn execution(&self) -> &Arc<ExecutionContext> {
        &self.ctx
    }

    /// A sibling view for an auxiliary task of the same node (a tap's
    /// side sink).
    pub(crate) fn for_aux(&self, suffix: &str) -> NodeContext {
        let name = format!("{}{}", self.node_name, suffix);
        NodeContext::new(
            &name,
            self.ctx.clone(),
            self.metrics.clone(),
            &NodePolicy {
                retry: Some(self.retry.clone()),
                breaker: None,
            },
        )
    }
}
