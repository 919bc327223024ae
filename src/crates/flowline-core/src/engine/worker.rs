//! Per-node drive loops and the per-item retry/breaker wrapper.
//!
//! The engine spawns one task per node; each task runs the drive loop for
//! its node kind. Drive loops share a termination policy:
//!
//! - clean end-of-stream: outbound streams close cleanly, the task
//!   returns `Ok`;
//! - upstream error: the closure is forwarded downstream unchanged and
//!   the task returns `Ok`; only the originating node and the sinks
//!   report the error to the engine;
//! - own unrecovered failure: outbound streams close with the causal
//!   error and the task returns it wrapped in `NodeFailed`;
//! - cancellation: outbound streams close with `Cancelled`, which the
//!   engine does not count as a failure.

use crate::context::NodeContext;
use crate::error::{ErrorKind, FlowError, Result};
use crate::metrics::counter;
use crate::node::{Sink, Source, StreamTransform, Transform};
use crate::stream::{
    channel, Data, StreamEvent, StreamMessage, StreamReader, StreamSpec, StreamWriter,
    DEFAULT_CAPACITY,
};
use crate::time::EventTime;
use crate::window::LatePolicy;

/// Result of pushing one item through a node's retry and breaker
/// policies.
pub(crate) enum AttemptOutcome<T> {
    Success(T),
    /// Failed permanently and was dropped under `continue_on_error`.
    Dropped(FlowError),
    /// Failed permanently; the node must fail.
    Fatal(FlowError),
}

/// Attempt bookkeeping for one item: breaker admission, retry
/// classification, backoff sleeps. Drives the [`with_policy!`] loop.
///
/// Backoff sleeps observe the run's cancellation token. Time the node
/// later spends blocked on `produce` happens outside the policy loop and
/// never counts against the retry budget.
pub(crate) struct Attempts<'c> {
    ctx: &'c NodeContext,
    attempt: usize,
}

impl<'c> Attempts<'c> {
    pub(crate) fn new(ctx: &'c NodeContext) -> Self {
        Attempts { ctx, attempt: 0 }
    }

    /// Whether the breaker admits the next call. `false` means fast-fail
    /// without invoking user code.
    pub(crate) fn admit(&mut self) -> bool {
        self.attempt += 1;
        match self.ctx.breaker() {
            Some(b) => b.try_acquire(),
            None => true,
        }
    }

    pub(crate) fn fast_fail<T>(&self) -> AttemptOutcome<T> {
        let ctx = self.ctx;
        ctx.metrics().incr(ctx.node_name(), counter::FAST_FAILED);
        let e = FlowError::BreakerOpen {
            node: ctx.node_name().to_string(),
        };
        ctx.error_handler().on_error(ctx.node_name(), &e, self.attempt);
        self.permanent(e)
    }

    pub(crate) fn success(&self) {
        if let Some(b) = self.ctx.breaker() {
            b.record_success();
        }
        if self.attempt > 1 {
            tracing::info!(
                node = self.ctx.node_name(),
                attempts = self.attempt,
                "item succeeded after retry"
            );
        }
    }

    /// Digest a failed attempt. `None` means a retry is due (the backoff
    /// sleep has already happened); `Some` is the final outcome.
    pub(crate) async fn failed<T>(&mut self, e: FlowError) -> Option<AttemptOutcome<T>> {
        let ctx = self.ctx;
        let kind = ctx.retry().classify(&e);
        if kind == ErrorKind::Cancelled {
            return Some(AttemptOutcome::Fatal(FlowError::Cancelled));
        }
        if let Some(b) = ctx.breaker() {
            b.record_failure();
        }
        ctx.error_handler().on_error(ctx.node_name(), &e, self.attempt);
        if kind.is_transient() && self.attempt < ctx.retry().max_attempts {
            let delay = ctx.retry().delay_for(self.attempt, kind);
            tracing::warn!(
                node = ctx.node_name(),
                attempt = self.attempt,
                max_attempts = ctx.retry().max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "item failed, retrying after delay"
            );
            ctx.metrics().incr(ctx.node_name(), counter::RETRIES);
            let cancel = ctx.cancellation();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Some(AttemptOutcome::Fatal(FlowError::Cancelled)),
                _ = tokio::time::sleep(delay) => {}
            }
            return None;
        }
        tracing::error!(
            node = ctx.node_name(),
            attempts = self.attempt,
            error = %e,
            "item failed permanently"
        );
        Some(self.permanent(e))
    }

    fn permanent<T>(&self, e: FlowError) -> AttemptOutcome<T> {
        if self.ctx.retry().continue_on_error {
            self.ctx.metrics().incr(self.ctx.node_name(), counter::DROPPED);
            AttemptOutcome::Dropped(e)
        } else {
            AttemptOutcome::Fatal(e)
        }
    }
}

/// Run `$call` (an expression yielding `Result<T>`) under the node's
/// retry and circuit-breaker policies; evaluates to an
/// [`AttemptOutcome<T>`]. The expression is re-evaluated per attempt, so
/// it may freely borrow the node and the current item.
macro_rules! with_policy {
    ($ctx:expr, $call:expr) => {{
        let mut attempts = $crate::engine::worker::Attempts::new($ctx);
        loop {
            if !attempts.admit() {
                break attempts.fast_fail();
            }
            match $call {
                Ok(v) => {
                    attempts.success();
                    break $crate::engine::worker::AttemptOutcome::Success(v);
                }
                Err(e) => {
                    if let Some(outcome) = attempts.failed(e).await {
                        break outcome;
                    }
                }
            }
        }
    }};
}

pub(crate) use with_policy;

/// Apply the node's drop-on-error setting to a permanent per-item error
/// raised outside a user call (bad input shape, late data under the
/// `Fail` policy).
pub(crate) fn drop_or_fail(ctx: &NodeContext, e: FlowError) -> Result<()> {
    if ctx.retry().continue_on_error {
        ctx.error_handler().on_error(ctx.node_name(), &e, 1);
        ctx.metrics().incr(ctx.node_name(), counter::DROPPED);
        Ok(())
    } else {
        Err(e)
    }
}

/// Handle an item that arrived behind the operator's watermark.
pub(crate) fn late_item(ctx: &NodeContext, policy: LatePolicy) -> Result<()> {
    match policy {
        LatePolicy::Drop => {
            ctx.metrics().incr(ctx.node_name(), counter::LATE_DROPPED);
            Ok(())
        }
        LatePolicy::Fail => drop_or_fail(
            ctx,
            FlowError::validation(ctx.node_name(), "late item behind the input watermark"),
        ),
    }
}

/// How a drive loop ended. `Propagated` carries an upstream error whose
/// stream closure is forwarded without failing this node.
type DriveEnd = Result<Option<FlowError>>;

/// Close `out` according to how the node ended, and translate the ending
/// into the task's result.
async fn finish<T: Data>(out: StreamWriter<T>, ctx: &NodeContext, end: DriveEnd) -> Result<()> {
    ctx.metrics()
        .add(ctx.node_name(), counter::ITEMS_OUT, out.produced());
    match end {
        Ok(None) => {
            ctx.tracer().on_complete(ctx.node_name(), Ok(()));
            out.close(None).await;
            Ok(())
        }
        Ok(Some(upstream)) => {
            ctx.tracer().on_complete(ctx.node_name(), Ok(()));
            out.close(Some(upstream)).await;
            Ok(())
        }
        Err(e) if e.is_cancellation() => {
            ctx.tracer().on_complete(ctx.node_name(), Err(&e));
            out.close(Some(FlowError::Cancelled)).await;
            Err(FlowError::Cancelled)
        }
        Err(e) => {
            let failed = FlowError::NodeFailed {
                node: ctx.node_name().to_string(),
                source: Box::new(e.clone()),
            };
            ctx.tracer().on_complete(ctx.node_name(), Err(&failed));
            out.close(Some(e)).await;
            Err(failed)
        }
    }
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

pub(crate) async fn run_source<T: Data>(
    node: Result<Box<dyn Source<T>>>,
    mut out: StreamWriter<T>,
    ctx: NodeContext,
) -> Result<()> {
    ctx.tracer().on_start(ctx.node_name());
    let mut node = match node {
        Ok(n) => n,
        Err(e) => return finish(out, &ctx, Err(e)).await,
    };
    let res = async {
        node.initialize(&ctx).await?;
        node.run(&mut out, &ctx).await
    }
    .await;
    node.dispose().await;
    finish(out, &ctx, res.map(|_| None)).await
}

// ---------------------------------------------------------------------------
// Transform (per-item)
// ---------------------------------------------------------------------------

pub(crate) async fn run_transform<In: Data, Out: Data>(
    node: Result<Box<dyn Transform<In, Out>>>,
    mut input: StreamReader<In>,
    mut out: StreamWriter<Out>,
    ctx: NodeContext,
) -> Result<()> {
    ctx.tracer().on_start(ctx.node_name());
    let mut node = match node {
        Ok(n) => n,
        Err(e) => return finish(out, &ctx, Err(e)).await,
    };
    let end = transform_loop(node.as_mut(), &mut input, &mut out, &ctx).await;
    node.dispose().await;
    ctx.metrics()
        .add(ctx.node_name(), counter::ITEMS_IN, input.consumed());
    finish(out, &ctx, end).await
}

async fn transform_loop<In: Data, Out: Data>(
    node: &mut (dyn Transform<In, Out> + '_),
    input: &mut StreamReader<In>,
    out: &mut StreamWriter<Out>,
    ctx: &NodeContext,
) -> DriveEnd {
    node.initialize(ctx).await?;
    loop {
        let msg = match input.consume().await {
            Ok(msg) => msg,
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e) => return Ok(Some(e)),
        };
        let (item, at) = match msg {
            StreamMessage::Event(StreamEvent::Item(item)) => (item, None),
            StreamMessage::Event(StreamEvent::Timestamped(item, at)) => (item, Some(at)),
            StreamMessage::Event(StreamEvent::Watermark(w)) => {
                out.watermark(w).await?;
                continue;
            }
            StreamMessage::EndOfStream => return Ok(None),
        };
        match with_policy!(ctx, node.on_item(item.clone(), ctx).await) {
            AttemptOutcome::Success(v) => match at {
                Some(t) => out.produce_at(v, t).await?,
                None => out.produce(v).await?,
            },
            AttemptOutcome::Dropped(_) => {}
            AttemptOutcome::Fatal(e) => return Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Stream-driven transform
// ---------------------------------------------------------------------------

pub(crate) async fn run_raw_transform<In: Data, Out: Data>(
    node: Result<Box<dyn StreamTransform<In, Out>>>,
    mut input: StreamReader<In>,
    mut out: StreamWriter<Out>,
    ctx: NodeContext,
) -> Result<()> {
    ctx.tracer().on_start(ctx.node_name());
    let mut node = match node {
        Ok(n) => n,
        Err(e) => return finish(out, &ctx, Err(e)).await,
    };
    let res = node.run(&mut input, &mut out, &ctx).await;
    ctx.metrics()
        .add(ctx.node_name(), counter::ITEMS_IN, input.consumed());
    finish(out, &ctx, res.map(|_| None)).await
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

pub(crate) async fn run_sink<T: Data>(
    node: Result<Box<dyn Sink<T>>>,
    mut input: StreamReader<T>,
    ctx: NodeContext,
) -> Result<()> {
    ctx.tracer().on_start(ctx.node_name());
    let mut node = match node {
        Ok(n) => n,
        Err(e) => {
            ctx.tracer().on_complete(ctx.node_name(), Err(&e));
            return Err(e);
        }
    };
    let res = sink_loop(node.as_mut(), &mut input, &ctx).await;
    node.dispose().await;
    ctx.metrics()
        .add(ctx.node_name(), counter::ITEMS_IN, input.consumed());
    match res {
        Ok(()) => {
            ctx.tracer().on_complete(ctx.node_name(), Ok(()));
            Ok(())
        }
        Err(e) if e.is_cancellation() => {
            ctx.tracer().on_complete(ctx.node_name(), Err(&e));
            Err(FlowError::Cancelled)
        }
        // Sinks surface errors to the engine, both their own and
        // propagated upstream closures.
        Err(e) => {
            ctx.tracer().on_complete(ctx.node_name(), Err(&e));
            Err(e)
        }
    }
}

async fn sink_loop<T: Data>(
    node: &mut (dyn Sink<T> + '_),
    input: &mut StreamReader<T>,
    ctx: &NodeContext,
) -> Result<()> {
    node.initialize(ctx).await?;
    loop {
        let item = match input.consume().await? {
            StreamMessage::Event(StreamEvent::Item(item)) => item,
            StreamMessage::Event(StreamEvent::Timestamped(item, _)) => item,
            StreamMessage::Event(StreamEvent::Watermark(_)) => continue,
            StreamMessage::EndOfStream => break,
        };
        match with_policy!(ctx, node.on_item(item.clone(), ctx).await) {
            AttemptOutcome::Success(()) => {}
            AttemptOutcome::Dropped(_) => {}
            AttemptOutcome::Fatal(e) => return Err(e),
        }
    }
    match with_policy!(ctx, node.flush(ctx).await) {
        AttemptOutcome::Success(()) | AttemptOutcome::Dropped(_) => Ok(()),
        AttemptOutcome::Fatal(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Tap
// ---------------------------------------------------------------------------

/// Forward the input unchanged while feeding a forked copy to a side
/// sink running as its own task. A failing or lagging-then-dead side sink
/// closes the fork without disturbing the main stream.
pub(crate) async fn run_tap<T: Data>(
    side: Result<Box<dyn Sink<T>>>,
    mut input: StreamReader<T>,
    mut out: StreamWriter<T>,
    ctx: NodeContext,
) -> Result<()> {
    ctx.tracer().on_start(ctx.node_name());
    let side_ctx = ctx.for_aux("#side");
    let fork_spec = StreamSpec::new::<T>(format!("{}#fork", ctx.node_name()));
    let (mut fork_w, fork_r) = channel::<T>(fork_spec, DEFAULT_CAPACITY, ctx.cancellation());
    let side_task = tokio::spawn(run_side_sink(side, fork_r, side_ctx));

    let end = tap_loop(&mut input, &mut out, &mut fork_w).await;

    fork_w.close(None).await;
    // The fork observed a prefix of the main stream; wait for the side
    // sink to settle before reporting completion.
    if let Err(join_err) = side_task.await {
        tracing::warn!(node = ctx.node_name(), error = %join_err, "side sink task aborted");
    }
    ctx.metrics()
        .add(ctx.node_name(), counter::ITEMS_IN, input.consumed());
    finish(out, &ctx, end).await
}

async fn tap_loop<T: Data>(
    input: &mut StreamReader<T>,
    out: &mut StreamWriter<T>,
    fork: &mut StreamWriter<T>,
) -> DriveEnd {
    let mut fork_alive = true;
    loop {
        let msg = match input.consume().await {
            Ok(msg) => msg,
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e) => return Ok(Some(e)),
        };
        match msg {
            StreamMessage::Event(StreamEvent::Item(item)) => {
                if fork_alive {
                    fork_alive = feed_fork(fork, item.clone(), None).await?;
                }
                out.produce(item).await?;
            }
            StreamMessage::Event(StreamEvent::Timestamped(item, at)) => {
                if fork_alive {
                    fork_alive = feed_fork(fork, item.clone(), Some(at)).await?;
                }
                out.produce_at(item, at).await?;
            }
            StreamMessage::Event(StreamEvent::Watermark(w)) => {
                if fork_alive {
                    let _ = fork.watermark(w).await;
                }
                out.watermark(w).await?;
            }
            StreamMessage::EndOfStream => return Ok(None),
        }
    }
}

/// Returns whether the fork is still consuming.
async fn feed_fork<T: Data>(
    fork: &mut StreamWriter<T>,
    item: T,
    at: Option<EventTime>,
) -> Result<bool> {
    let sent = match at {
        Some(t) => fork.produce_at(item, t).await,
        None => fork.produce(item).await,
    };
    match sent {
        Ok(()) => Ok(true),
        Err(FlowError::StreamClosed { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

async fn run_side_sink<T: Data>(
    node: Result<Box<dyn Sink<T>>>,
    mut input: StreamReader<T>,
    ctx: NodeContext,
) {
    let mut node = match node {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!(node = ctx.node_name(), error = %e, "side sink failed to construct");
            return;
        }
    };
    let res = async {
        node.initialize(&ctx).await?;
        loop {
            let item = match input.consume().await? {
                StreamMessage::Event(StreamEvent::Item(item)) => item,
                StreamMessage::Event(StreamEvent::Timestamped(item, _)) => item,
                StreamMessage::Event(StreamEvent::Watermark(_)) => continue,
                StreamMessage::EndOfStream => break,
            };
            ctx.metrics().incr(ctx.node_name(), counter::SIDE_ITEMS);
            match with_policy!(&ctx, node.on_item(item.clone(), &ctx).await) {
                AttemptOutcome::Success(()) | AttemptOutcome::Dropped(_) => {}
                AttemptOutcome::Fatal(e) => return Err(e),
            }
        }
        node.flush(&ctx).await
    }
    .await;
    node.dispose().await;
    if let Err(e) = res {
        if !e.is_cancellation() {
            tracing::warn!(node = ctx.node_name(), error = %e, "side sink failed; fork closed");
        }
    }
}

// ---------------------------------------------------------------------------
// Broadcast
// ---------------------------------------------------------------------------

/// Replicate one input stream onto every output, watermarks included.
/// Backpressure on any output blocks the broadcast.
pub(crate) async fn run_broadcast<T: Data>(
    mut input: StreamReader<T>,
    mut outs: Vec<StreamWriter<T>>,
    ctx: NodeContext,
) -> Result<()> {
    ctx.tracer().on_start(ctx.node_name());
    let end: DriveEnd = loop {
        let msg = match input.consume().await {
            Ok(msg) => msg,
            Err(e) if e.is_cancellation() => break Err(e),
            Err(e) => break Ok(Some(e)),
        };
        let result: Result<()> = async {
            match msg {
                StreamMessage::Event(StreamEvent::Item(item)) => {
                    for w in outs.iter_mut() {
                        w.produce(item.clone()).await?;
                    }
                }
                StreamMessage::Event(StreamEvent::Timestamped(item, at)) => {
                    for w in outs.iter_mut() {
                        w.produce_at(item.clone(), at).await?;
                    }
                }
                StreamMessage::Event(StreamEvent::Watermark(wm)) => {
                    for w in outs.iter_mut() {
                        w.watermark(wm).await?;
                    }
                }
                StreamMessage::EndOfStream => {}
            }
            Ok(())
        }
        .await;
        if let Err(e) = result {
            break Err(e);
        }
        if input.watermark().is_final() {
            break Ok(None);
        }
    };
    ctx.metrics()
        .add(ctx.node_name(), counter::ITEMS_IN, input.consumed());
    let produced: u64 = outs.iter().map(|w| w.produced()).sum();
    ctx.metrics()
        .add(ctx.node_name(), counter::ITEMS_OUT, produced);
    let mut outcome = Ok(());
    for w in outs {
        match &end {
            Ok(None) => w.close(None).await,
            Ok(Some(e)) => w.close(Some(e.clone())).await,
            Err(e) if e.is_cancellation() => w.close(Some(FlowError::Cancelled)).await,
            Err(e) => w.close(Some(e.clone())).await,
        }
    }
    match end {
        Ok(_) => {
            ctx.tracer().on_complete(ctx.node_name(), Ok(()));
        }
        Err(e) if e.is_cancellation() => {
            ctx.tracer().on_complete(ctx.node_name(), Err(&e));
            outcome = Err(FlowError::Cancelled);
        }
        Err(e) => {
            let failed = FlowError::NodeFailed {
                node: ctx.node_name().to_string(),
                source: Box::new(e),
            };
            ctx.tracer().on_complete(ctx.node_name(), Err(&failed));
            outcome = Err(failed);
        }
    }
    outcome
}

// ---------------------------------------------------------------------------
// Join and aggregate wrappers
// ---------------------------------------------------------------------------

pub(crate) async fn run_join<L, R, J>(
    node: Result<J>,
    mut left: StreamReader<L>,
    mut right: StreamReader<R>,
    mut out: StreamWriter<J::Out>,
    ctx: NodeContext,
) -> Result<()>
where
    L: Data,
    R: Data,
    J: crate::join::Join<L, R>,
{
    ctx.tracer().on_start(ctx.node_name());
    let mut node = match node {
        Ok(n) => n,
        Err(e) => return finish(out, &ctx, Err(e)).await,
    };
    let end = crate::join::drive_join(&mut node, &mut left, &mut right, &mut out, &ctx).await;
    ctx.metrics().add(
        ctx.node_name(),
        counter::ITEMS_IN,
        left.consumed() + right.consumed(),
    );
    finish(out, &ctx, end).await
}

pub(crate) async fn run_aggregate<In, A>(
    node: Result<A>,
    mut input: StreamReader<In>,
    mut out: StreamWriter<A::Out>,
    ctx: NodeContext,
) -> Result<()>
where
    In: Data,
    A: crate::aggregate::Aggregator<In>,
{
    ctx.tracer().on_start(ctx.node_name());
    let mut node = match node {
        Ok(n) => n,
        Err(e) => return finish(out, &ctx, Err(e)).await,
    };
    let end = crate::aggregate::drive_aggregate(&mut node, &mut input, &mut out, &ctx).await;
    ctx.metrics()
        .add(ctx.node_name(), counter::ITEMS_IN, input.consumed());
    finish(out, &ctx, end).await
}
