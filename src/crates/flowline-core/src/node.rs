//! Node contracts: the operations each node kind must provide.
//!
//! | Kind          | Required operations                          |
//! |---------------|----------------------------------------------|
//! | [`Source`]    | `run(out, ctx)` until end or cancellation    |
//! | [`Transform`] | `on_item(item, ctx)`, 1-in/1-out, retryable |
//! | [`StreamTransform`] | `run(input, out, ctx)`, driven form    |
//! | [`Sink`]      | `on_item` + `flush` at end-of-stream         |
//!
//! Joins and aggregators have their own contracts in [`crate::join`] and
//! [`crate::aggregate`]; taps and broadcasts are built-in kinds that take
//! no user operations beyond the tap's side sink.
//!
//! Every trait has `initialize`/`dispose` lifecycle hooks with no-op
//! defaults. A node instance is private to one run of one pipeline; the
//! engine never invokes the same node concurrently, so operator state
//! needs no locking.
//!
//! The `*_fn` adapters wrap plain closures for the common cases, in the
//! closure-first style of the builder:
//!
//! ```rust,ignore
//! let mut g = GraphBuilder::new();
//! let src = g.add_source("numbers", || source_iter(0..100));
//! let double = g.add_transform("double", || map_fn(|n: i64| n * 2));
//! let out = g.add_sink("collect", move || collect_sink(results.clone()));
//! g.connect(&src, &double);
//! g.connect(&double, &out);
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::context::NodeContext;
use crate::error::Result;
use crate::stream::{Data, StreamReader, StreamWriter};
use crate::time::EventTime;
use crate::watermark::{BoundedOutOfOrderness, PeriodicWatermarks};

/// The tagged kinds of nodes a plan can contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Source,
    Transform,
    Join,
    Aggregate,
    Tap,
    Sink,
    Broadcast,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeKind::Source => "source",
            NodeKind::Transform => "transform",
            NodeKind::Join => "join",
            NodeKind::Aggregate => "aggregate",
            NodeKind::Tap => "tap",
            NodeKind::Sink => "sink",
            NodeKind::Broadcast => "broadcast",
        };
        f.write_str(s)
    }
}

/// Produces a stream of items. No inputs, one output.
#[async_trait]
pub trait Source<T: Data>: Send {
    async fn initialize(&mut self, ctx: &NodeContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Produce items into `out` until exhausted or cancelled. The engine
    /// closes the stream when this returns; do not close it here.
    async fn run(&mut self, out: &mut StreamWriter<T>, ctx: &NodeContext) -> Result<()>;

    async fn dispose(&mut self) {}
}

/// Per-item transform: one input, one output, engine-driven.
///
/// `on_item` is wrapped in the node's retry and circuit-breaker policies;
/// it must be safe to call again with a clone of the same item after a
/// transient failure.
#[async_trait]
pub trait Transform<In: Data, Out: Data>: Send {
    async fn initialize(&mut self, ctx: &NodeContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    async fn on_item(&mut self, item: In, ctx: &NodeContext) -> Result<Out>;

    async fn dispose(&mut self) {}
}

/// Stream-driven transform: the node owns the consume/produce loop.
///
/// Use this for operators that filter, expand, reorder, or batch:
/// shapes the 1-in/1-out contract cannot express. The node is responsible for
/// forwarding watermarks and for its own per-item error handling.
#[async_trait]
pub trait StreamTransform<In: Data, Out: Data>: Send {
    async fn run(
        &mut self,
        input: &mut StreamReader<In>,
        out: &mut StreamWriter<Out>,
        ctx: &NodeContext,
    ) -> Result<()>;
}

/// Terminal node: one input, no outputs.
#[async_trait]
pub trait Sink<T: Data>: Send {
    async fn initialize(&mut self, ctx: &NodeContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    async fn on_item(&mut self, item: T, ctx: &NodeContext) -> Result<()>;

    /// Called once after end-of-stream, before `dispose`.
    async fn flush(&mut self, ctx: &NodeContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    async fn dispose(&mut self) {}
}

// ---------------------------------------------------------------------------
// Closure adapters
// ---------------------------------------------------------------------------

/// Source over anything iterable. Items are emitted untimestamped.
pub fn source_iter<T, I>(items: I) -> IterSource<T>
where
    T: Data,
    I: IntoIterator<Item = T>,
{
    IterSource {
        items: items.into_iter().collect(),
    }
}

pub struct IterSource<T> {
    items: Vec<T>,
}

#[async_trait]
impl<T: Data> Source<T> for IterSource<T> {
    async fn run(&mut self, out: &mut StreamWriter<T>, _ctx: &NodeContext) -> Result<()> {
        for item in self.items.drain(..) {
            out.produce(item).await?;
        }
        Ok(())
    }
}

/// Source over `(item, event-time)` pairs, advancing a
/// bounded-out-of-orderness watermark as it emits.
pub fn timestamped_source<T, I>(items: I, watermarks: BoundedOutOfOrderness) -> TimestampedSource<T>
where
    T: Data,
    I: IntoIterator<Item = (T, EventTime)>,
{
    TimestampedSource {
        items: items.into_iter().collect(),
        watermarks,
    }
}

pub struct TimestampedSource<T> {
    items: Vec<(T, EventTime)>,
    watermarks: BoundedOutOfOrderness,
}

#[async_trait]
impl<T: Data> Source<T> for TimestampedSource<T> {
    async fn run(&mut self, out: &mut StreamWriter<T>, _ctx: &NodeContext) -> Result<()> {
        for (item, at) in self.items.drain(..) {
            out.produce_at(item, at).await?;
            if let Some(w) = self.watermarks.observe(at) {
                out.watermark(w).await?;
            }
        }
        Ok(())
    }
}

/// Source over `(item, event-time)` pairs that paces emission on the
/// wall clock and advances watermarks on the generator's fixed cadence,
/// the way a live feed would.
pub fn paced_source<T, I>(
    items: I,
    pace: std::time::Duration,
    watermarks: PeriodicWatermarks,
) -> PacedSource<T>
where
    T: Data,
    I: IntoIterator<Item = (T, EventTime)>,
{
    PacedSource {
        items: items.into_iter().collect(),
        pace,
        watermarks,
    }
}

pub struct PacedSource<T> {
    items: Vec<(T, EventTime)>,
    pace: std::time::Duration,
    watermarks: PeriodicWatermarks,
}

#[async_trait]
impl<T: Data> Source<T> for PacedSource<T> {
    async fn run(&mut self, out: &mut StreamWriter<T>, _ctx: &NodeContext) -> Result<()> {
        let mut last_tick = tokio::time::Instant::now();
        for (item, at) in self.items.drain(..) {
            if !self.pace.is_zero() {
                tokio::time::sleep(self.pace).await;
            }
            out.produce_at(item, at).await?;
            self.watermarks.observe(at);
            if last_tick.elapsed() >= self.watermarks.interval() {
                last_tick = tokio::time::Instant::now();
                if let Some(w) = self.watermarks.on_tick() {
                    out.watermark(w).await?;
                }
            }
        }
        Ok(())
    }
}

/// Infallible mapping transform.
pub fn map_fn<In, Out, F>(f: F) -> MapFn<F>
where
    In: Data,
    Out: Data,
    F: FnMut(In) -> Out + Send + 'static,
{
    MapFn { f }
}

pub struct MapFn<F> {
    f: F,
}

#[async_trait]
impl<In, Out, F> Transform<In, Out> for MapFn<F>
where
    In: Data,
    Out: Data,
    F: FnMut(In) -> Out + Send + 'static,
{
    async fn on_item(&mut self, item: In, _ctx: &NodeContext) -> Result<Out> {
        Ok((self.f)(item))
    }
}

/// Fallible mapping transform.
pub fn try_map_fn<In, Out, F>(f: F) -> TryMapFn<F>
where
    In: Data,
    Out: Data,
    F: FnMut(In) -> Result<Out> + Send + 'static,
{
    TryMapFn { f }
}

pub struct TryMapFn<F> {
    f: F,
}

#[async_trait]
impl<In, Out, F> Transform<In, Out> for TryMapFn<F>
where
    In: Data,
    Out: Data,
    F: FnMut(In) -> Result<Out> + Send + 'static,
{
    async fn on_item(&mut self, item: In, _ctx: &NodeContext) -> Result<Out> {
        (self.f)(item)
    }
}

/// Keep items matching the predicate. Driven form: forwards timestamps
/// and watermarks untouched.
pub fn filter_fn<T, F>(predicate: F) -> FilterFn<F>
where
    T: Data,
    F: FnMut(&T) -> bool + Send + 'static,
{
    FilterFn { predicate }
}

pub struct FilterFn<F> {
    predicate: F,
}

#[async_trait]
impl<T, F> StreamTransform<T, T> for FilterFn<F>
where
    T: Data,
    F: FnMut(&T) -> bool + Send + 'static,
{
    async fn run(
        &mut self,
        input: &mut StreamReader<T>,
        out: &mut StreamWriter<T>,
        _ctx: &NodeContext,
    ) -> Result<()> {
        use crate::stream::{StreamEvent, StreamMessage};
        loop {
            match input.consume().await? {
                StreamMessage::Event(StreamEvent::Item(v)) => {
                    if (self.predicate)(&v) {
                        out.produce(v).await?;
                    }
                }
                StreamMessage::Event(StreamEvent::Timestamped(v, at)) => {
                    if (self.predicate)(&v) {
                        out.produce_at(v, at).await?;
                    }
                }
                StreamMessage::Event(StreamEvent::Watermark(w)) => out.watermark(w).await?,
                StreamMessage::EndOfStream => return Ok(()),
            }
        }
    }
}

/// Expand each item into zero or more outputs. Driven form.
pub fn flat_map_fn<In, Out, F>(f: F) -> FlatMapFn<F>
where
    In: Data,
    Out: Data,
    F: FnMut(In) -> Vec<Out> + Send + 'static,
{
    FlatMapFn { f }
}

pub struct FlatMapFn<F> {
    f: F,
}

#[async_trait]
impl<In, Out, F> StreamTransform<In, Out> for FlatMapFn<F>
where
    In: Data,
    Out: Data,
    F: FnMut(In) -> Vec<Out> + Send + 'static,
{
    async fn run(
        &mut self,
        input: &mut StreamReader<In>,
        out: &mut StreamWriter<Out>,
        _ctx: &NodeContext,
    ) -> Result<()> {
        use crate::stream::{StreamEvent, StreamMessage};
        loop {
            match input.consume().await? {
                StreamMessage::Event(StreamEvent::Item(v)) => {
                    for o in (self.f)(v) {
                        out.produce(o).await?;
                    }
                }
                StreamMessage::Event(StreamEvent::Timestamped(v, at)) => {
                    for o in (self.f)(v) {
                        out.produce_at(o, at).await?;
                    }
                }
                StreamMessage::Event(StreamEvent::Watermark(w)) => out.watermark(w).await?,
                StreamMessage::EndOfStream => return Ok(()),
            }
        }
    }
}

/// Sink over a plain closure.
pub fn sink_fn<T, F>(f: F) -> FnSink<F>
where
    T: Data,
    F: FnMut(T) + Send + 'static,
{
    FnSink { f }
}

pub struct FnSink<F> {
    f: F,
}

#[async_trait]
impl<T, F> Sink<T> for FnSink<F>
where
    T: Data,
    F: FnMut(T) + Send + 'static,
{
    async fn on_item(&mut self, item: T, _ctx: &NodeContext) -> Result<()> {
        (self.f)(item);
        Ok(())
    }
}

/// Sink that appends every item to a shared vector. The workhorse of the
/// test suites.
pub fn collect_sink<T: Data>(into: Arc<Mutex<Vec<T>>>) -> CollectSink<T> {
    CollectSink { into }
}

pub struct CollectSink<T> {
    into: Arc<Mutex<Vec<T>>>,
}

#[async_trait]
impl<T: Data> Sink<T> for CollectSink<T> {
    async fn on_item(&mut self, item: T, _ctx: &NodeContext) -> Result<()> {
        self.into.lock().push(item);
        Ok(())
    }
}

/// A transform whose output type equals its input and whose body is the
/// identity.
pub fn identity_fn<T: Data>() -> MapFn<impl FnMut(T) -> T + Send + 'static> {
    map_fn(|x: T| x)
}
