//! The execution engine: materialize a plan and drive it to completion.
//!
//! One cooperative task per node, connected by the plan's bounded
//! channels. Nodes communicate only through streams; the engine never
//! holds a lock while user code runs.
//!
//! Shutdown:
//!
//! - **Normal**: sources reach end-of-stream, closure propagates to the
//!   leaves, sinks complete.
//! - **Abnormal**: a node terminates with an unrecovered error. The
//!   engine cancels the run token, waits for the remaining nodes within
//!   the shutdown deadline, and reports the first fatal error with any
//!   later ones attached as contributory causes.
//! - **Cancelled**: the context's token was cancelled externally. Every
//!   node observes it at its next suspension point; the run drains and
//!   finishes without reporting a failure.

pub(crate) mod worker;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use crate::context::{ExecutionContext, NodeContext};
use crate::error::{FlowError, Result};
use crate::metrics::{MetricsSnapshot, RunMetrics};
use crate::plan::{AnyBox, Plan, PortRef};

/// Engine-level settings, distinct from per-run context options.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// How long abnormal shutdown waits for in-flight nodes to drain
    /// before aborting their tasks.
    pub shutdown_deadline: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            shutdown_deadline: Duration::from_secs(30),
        }
    }
}

/// Outcome of one pipeline run.
#[derive(Debug)]
pub struct PipelineResult {
    /// The first fatal error, if the run failed. Cancellation is not a
    /// failure and leaves this empty.
    pub error: Option<FlowError>,
    /// Fatal errors that surfaced after the first one.
    pub contributory: Vec<FlowError>,
    /// Whether the run ended through cancellation.
    pub cancelled: bool,
    pub metrics: MetricsSnapshot,
}

impl PipelineResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(self) -> Result<MetricsSnapshot> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.metrics),
        }
    }
}

/// Executes [`Plan`]s.
#[derive(Debug, Clone, Default)]
pub struct Engine {
    opts: EngineOptions,
}

impl Engine {
    pub fn new() -> Self {
        Engine::default()
    }

    pub fn with_options(opts: EngineOptions) -> Self {
        Engine { opts }
    }

    /// Run `plan` under `ctx` to completion.
    pub async fn run(&self, plan: &Plan, ctx: Arc<ExecutionContext>) -> PipelineResult {
        let metrics = RunMetrics::new();
        let cancel = ctx.cancellation();
        tracing::debug!(
            run_id = %ctx.run_id(),
            nodes = plan.node_count(),
            edges = plan.edge_count(),
            "materializing plan"
        );

        // One bounded channel per edge; endpoints keyed by port.
        let mut writers: HashMap<PortRef, AnyBox> = HashMap::new();
        let mut readers: HashMap<PortRef, AnyBox> = HashMap::new();
        for edge in plan.edges() {
            let producer = plan.node_name(edge.producer.node);
            let consumer = plan.node_name(edge.consumer.node);
            let name = format!(
                "{}:{}->{}:{}",
                producer, edge.producer.port, consumer, edge.consumer.port
            );
            let keyed = matches!(
                plan.nodes()[edge.consumer.node].kind,
                crate::node::NodeKind::Join | crate::node::NodeKind::Aggregate
            );
            ctx.observability.lineage.edge_opened(producer, consumer);
            let (w, r) = (edge.make)(&name, keyed, edge.capacity, cancel.clone());
            writers.insert(edge.producer, w);
            readers.insert(edge.consumer, r);
        }

        // One task per node, in topological order.
        let mut tasks: JoinSet<(usize, Result<()>)> = JoinSet::new();
        for &idx in plan.order() {
            let decl = &plan.nodes()[idx];
            let inputs: Vec<AnyBox> = (0..decl.inputs.len())
                .filter_map(|port| readers.remove(&PortRef { node: idx, port }))
                .collect();
            let outputs: Vec<AnyBox> = (0..decl.outputs.len())
                .filter_map(|port| writers.remove(&PortRef { node: idx, port }))
                .collect();
            let node_ctx = NodeContext::new(&decl.name, ctx.clone(), metrics.clone(), &decl.policy);
            let fut = decl.launcher.launch(inputs, outputs, node_ctx);
            tasks.spawn(async move { (idx, fut.await) });
        }
        // A validated plan leaves nothing behind here; dropping any
        // stragglers closes their channels instead of wedging consumers.
        drop(writers);
        drop(readers);

        // Drain the run, entering the shutdown deadline once the token
        // fires (externally or on the first fatal error).
        let mut first_fatal: Option<FlowError> = None;
        let mut contributory = Vec::new();
        let mut deadline_at: Option<tokio::time::Instant> = None;
        let mut deadline_missed = false;
        loop {
            if deadline_at.is_none() && cancel.is_cancelled() {
                deadline_at = Some(tokio::time::Instant::now() + self.opts.shutdown_deadline);
            }
            let joined = match deadline_at {
                Some(at) => match tokio::time::timeout_at(at, tasks.join_next()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        tracing::error!(
                            run_id = %ctx.run_id(),
                            "shutdown deadline exceeded; aborting remaining node tasks"
                        );
                        tasks.abort_all();
                        while tasks.join_next().await.is_some() {}
                        deadline_missed = true;
                        break;
                    }
                },
                None => tasks.join_next().await,
            };
            match joined {
                None => break,
                Some(Ok((_, Ok(())))) => {}
                Some(Ok((idx, Err(e)))) => {
                    if e.is_cancellation() {
                        continue;
                    }
                    tracing::error!(
                        run_id = %ctx.run_id(),
                        node = plan.node_name(idx),
                        error = %e,
                        "node reported fatal error"
                    );
                    if first_fatal.is_none() {
                        first_fatal = Some(e);
                        ctx.cancel();
                    } else {
                        contributory.push(e);
                    }
                }
                Some(Err(join_err)) => {
                    let e = FlowError::Engine(format!("node task aborted: {join_err}"));
                    if first_fatal.is_none() {
                        first_fatal = Some(e);
                        ctx.cancel();
                    } else {
                        contributory.push(e);
                    }
                }
            }
        }

        // Close the lineage ledger with per-producer item counts.
        let snapshot = metrics.snapshot();
        for edge in plan.edges() {
            let producer = plan.node_name(edge.producer.node);
            let consumer = plan.node_name(edge.consumer.node);
            ctx.observability.lineage.edge_closed(
                producer,
                consumer,
                snapshot.get(producer, crate::metrics::counter::ITEMS_OUT),
            );
        }

        if deadline_missed && first_fatal.is_none() {
            first_fatal = Some(FlowError::Engine(
                "shutdown deadline exceeded while draining nodes".to_string(),
            ));
        }
        let cancelled = first_fatal.is_none() && cancel.is_cancelled();
        PipelineResult {
            error: first_fatal,
            contributory,
            cancelled,
            metrics: snapshot,
        }
    }
}
