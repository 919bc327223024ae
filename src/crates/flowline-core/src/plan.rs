//! The frozen, executable plan and its type-erased node launchers.
//!
//! The builder is fully typed; the engine is not. The bridge is built
//! here: every `add_*` call captures its element types inside a launcher
//! (and every `connect` inside a channel factory), so the engine can
//! materialize channels and spawn node tasks without knowing any element
//! type. Launchers downcast their endpoints back to the concrete
//! `StreamWriter<T>`/`StreamReader<T>` they were built with; a failed
//! downcast is a programmer error surfaced at materialization, never a
//! silent miswire.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::aggregate::Aggregator;
use crate::context::{NodeContext, NodePolicy};
use crate::engine::worker;
use crate::error::{FlowError, Result};
use crate::join::Join;
use crate::node::{NodeKind, Sink, Source, StreamTransform, Transform};
use crate::stream::{channel, Data, StreamReader, StreamSpec, StreamWriter};

pub(crate) type AnyBox = Box<dyn Any + Send>;

/// Creates one typed channel for an edge: `(name, keyed, capacity,
/// cancel) -> (writer, reader)`.
pub(crate) type ChannelFactory =
    Arc<dyn Fn(&str, bool, usize, CancellationToken) -> (AnyBox, AnyBox) + Send + Sync>;

/// Identifies one port of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRef {
    pub(crate) node: usize,
    pub(crate) port: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct PortDecl {
    pub type_id: std::any::TypeId,
    pub type_name: &'static str,
}

impl PortDecl {
    pub(crate) fn of<T: 'static>() -> Self {
        PortDecl {
            type_id: std::any::TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }
}

pub(crate) struct EdgeDecl {
    pub producer: PortRef,
    pub consumer: PortRef,
    pub type_id: std::any::TypeId,
    pub type_name: &'static str,
    pub capacity: usize,
    pub make: ChannelFactory,
}

/// Spawns the node's task given its materialized endpoints.
pub(crate) trait NodeLauncher: Send + Sync {
    fn launch(
        &self,
        inputs: Vec<AnyBox>,
        outputs: Vec<AnyBox>,
        ctx: NodeContext,
    ) -> BoxFuture<'static, Result<()>>;
}

pub(crate) struct NodeDecl {
    pub name: String,
    pub kind: NodeKind,
    pub inputs: Vec<PortDecl>,
    pub outputs: Vec<PortDecl>,
    pub policy: NodePolicy,
    pub launcher: Arc<dyn NodeLauncher>,
}

/// An immutable, validated, executable dataflow graph.
///
/// Plans are cheap to clone and reusable: node factories construct a
/// fresh node instance per run, so the same plan can drive any number of
/// concurrent or sequential runs (the composite node relies on this).
#[derive(Clone)]
pub struct Plan {
    nodes: Arc<Vec<NodeDecl>>,
    edges: Arc<Vec<EdgeDecl>>,
    order: Arc<Vec<usize>>,
}

impl Plan {
    pub(crate) fn new(nodes: Vec<NodeDecl>, edges: Vec<EdgeDecl>, order: Vec<usize>) -> Self {
        Plan {
            nodes: Arc::new(nodes),
            edges: Arc::new(edges),
            order: Arc::new(order),
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.name.as_str())
    }

    /// One line per node and edge, for logs and debugging.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for idx in self.order.iter() {
            let n = &self.nodes[*idx];
            out.push_str(&format!("{} {}\n", n.kind, n.name));
        }
        for e in self.edges.iter() {
            out.push_str(&format!(
                "{}:{} -> {}:{} [{}]\n",
                self.nodes[e.producer.node].name,
                e.producer.port,
                self.nodes[e.consumer.node].name,
                e.consumer.port,
                e.type_name,
            ));
        }
        out
    }

    pub(crate) fn nodes(&self) -> &[NodeDecl] {
        &self.nodes
    }

    pub(crate) fn edges(&self) -> &[EdgeDecl] {
        &self.edges
    }

    pub(crate) fn order(&self) -> &[usize] {
        &self.order
    }

    pub(crate) fn node_name(&self, idx: usize) -> &str {
        &self.nodes[idx].name
    }
}

impl std::fmt::Debug for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plan")
            .field("nodes", &self.nodes.len())
            .field("edges", &self.edges.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Endpoint downcasting
// ---------------------------------------------------------------------------

pub(crate) fn make_channel_factory<T: Data>() -> ChannelFactory {
    Arc::new(|name, keyed, capacity, cancel| {
        let mut spec = StreamSpec::new::<T>(name);
        if keyed {
            spec = spec.keyed();
        }
        let (w, r) = channel::<T>(spec, capacity, cancel);
        (Box::new(w) as AnyBox, Box::new(r) as AnyBox)
    })
}

fn take_writer<T: Data>(slot: Option<AnyBox>, node: &str) -> Result<StreamWriter<T>> {
    slot.and_then(|b| b.downcast::<StreamWriter<T>>().ok())
        .map(|b| *b)
        .ok_or_else(|| FlowError::programmer(node, "output port mismatch at materialization"))
}

fn take_reader<T: Data>(slot: Option<AnyBox>, node: &str) -> Result<StreamReader<T>> {
    slot.and_then(|b| b.downcast::<StreamReader<T>>().ok())
        .map(|b| *b)
        .ok_or_else(|| FlowError::programmer(node, "input port mismatch at materialization"))
}

fn one<T>(mut v: Vec<T>) -> (Option<T>, Option<T>) {
    let second = if v.len() > 1 { Some(v.remove(1)) } else { None };
    (v.into_iter().next(), second)
}

// ---------------------------------------------------------------------------
// Factories and launchers
// ---------------------------------------------------------------------------

/// Node factories may be called once per run; preconfigured instances
/// yield themselves exactly once.
pub(crate) type Factory<N> = Arc<dyn Fn() -> Result<N> + Send + Sync>;

pub(crate) fn factory_of<N, F>(f: F) -> Factory<N>
where
    F: Fn() -> N + Send + Sync + 'static,
{
    Arc::new(move || Ok(f()))
}

/// Wrap a pre-constructed node: the first materialization takes it, any
/// later one reports a programmer error.
pub(crate) fn once_factory<N: Send + 'static>(name: String, instance: N) -> Factory<N> {
    let cell = Arc::new(Mutex::new(Some(instance)));
    Arc::new(move || {
        cell.lock().take().ok_or_else(|| {
            FlowError::programmer(
                name.clone(),
                "preconfigured node instance was already consumed by an earlier run",
            )
        })
    })
}

pub(crate) struct SourceLauncher<T: Data> {
    pub factory: Factory<Box<dyn Source<T>>>,
}

impl<T: Data> NodeLauncher for SourceLauncher<T> {
    fn launch(
        &self,
        _inputs: Vec<AnyBox>,
        outputs: Vec<AnyBox>,
        ctx: NodeContext,
    ) -> BoxFuture<'static, Result<()>> {
        let node = (self.factory)();
        let (out, _) = one(outputs);
        Box::pin(async move {
            let out = take_writer::<T>(out, ctx.node_name())?;
            worker::run_source(node, out, ctx).await
        })
    }
}

pub(crate) struct TransformLauncher<In: Data, Out: Data> {
    pub factory: Factory<Box<dyn Transform<In, Out>>>,
}

impl<In: Data, Out: Data> NodeLauncher for TransformLauncher<In, Out> {
    fn launch(
        &self,
        inputs: Vec<AnyBox>,
        outputs: Vec<AnyBox>,
        ctx: NodeContext,
    ) -> BoxFuture<'static, Result<()>> {
        let node = (self.factory)();
        let (input, _) = one(inputs);
        let (out, _) = one(outputs);
        Box::pin(async move {
            let input = take_reader::<In>(input, ctx.node_name())?;
            let out = take_writer::<Out>(out, ctx.node_name())?;
            worker::run_transform(node, input, out, ctx).await
        })
    }
}

pub(crate) struct RawTransformLauncher<In: Data, Out: Data> {
    pub factory: Factory<Box<dyn StreamTransform<In, Out>>>,
}

impl<In: Data, Out: Data> NodeLauncher for RawTransformLauncher<In, Out> {
    fn launch(
        &self,
        inputs: Vec<AnyBox>,
        outputs: Vec<AnyBox>,
        ctx: NodeContext,
    ) -> BoxFuture<'static, Result<()>> {
        let node = (self.factory)();
        let (input, _) = one(inputs);
        let (out, _) = one(outputs);
        Box::pin(async move {
            let input = take_reader::<In>(input, ctx.node_name())?;
            let out = take_writer::<Out>(out, ctx.node_name())?;
            worker::run_raw_transform(node, input, out, ctx).await
        })
    }
}

pub(crate) struct SinkLauncher<T: Data> {
    pub factory: Factory<Box<dyn Sink<T>>>,
}

impl<T: Data> NodeLauncher for SinkLauncher<T> {
    fn launch(
        &self,
        inputs: Vec<AnyBox>,
        _outputs: Vec<AnyBox>,
        ctx: NodeContext,
    ) -> BoxFuture<'static, Result<()>> {
        let node = (self.factory)();
        let (input, _) = one(inputs);
        Box::pin(async move {
            let input = take_reader::<T>(input, ctx.node_name())?;
            worker::run_sink(node, input, ctx).await
        })
    }
}

pub(crate) struct TapLauncher<T: Data> {
    pub side_factory: Factory<Box<dyn Sink<T>>>,
}

impl<T: Data> NodeLauncher for TapLauncher<T> {
    fn launch(
        &self,
        inputs: Vec<AnyBox>,
        outputs: Vec<AnyBox>,
        ctx: NodeContext,
    ) -> BoxFuture<'static, Result<()>> {
        let side = (self.side_factory)();
        let (input, _) = one(inputs);
        let (out, _) = one(outputs);
        Box::pin(async move {
            let input = take_reader::<T>(input, ctx.node_name())?;
            let out = take_writer::<T>(out, ctx.node_name())?;
            worker::run_tap(side, input, out, ctx).await
        })
    }
}

pub(crate) struct BroadcastLauncher<T: Data> {
    pub _marker: PhantomData<fn() -> T>,
}

impl<T: Data> NodeLauncher for BroadcastLauncher<T> {
    fn launch(
        &self,
        inputs: Vec<AnyBox>,
        outputs: Vec<AnyBox>,
        ctx: NodeContext,
    ) -> BoxFuture<'static, Result<()>> {
        let (input, _) = one(inputs);
        Box::pin(async move {
            let input = take_reader::<T>(input, ctx.node_name())?;
            let outs = outputs
                .into_iter()
                .map(|slot| take_writer::<T>(Some(slot), ctx.node_name()))
                .collect::<Result<Vec<_>>>()?;
            worker::run_broadcast(input, outs, ctx).await
        })
    }
}

pub(crate) struct JoinLauncher<L, R, J> {
    pub factory: Factory<J>,
    pub _marker: PhantomData<fn() -> (L, R)>,
}

impl<L, R, J> NodeLauncher for JoinLauncher<L, R, J>
where
    L: Data + Sync,
    R: Data + Sync,
    J: Join<L, R>,
{
    fn launch(
        &self,
        mut inputs: Vec<AnyBox>,
        outputs: Vec<AnyBox>,
        ctx: NodeContext,
    ) -> BoxFuture<'static, Result<()>> {
        let node = (self.factory)();
        let right = if inputs.len() > 1 {
            Some(inputs.remove(1))
        } else {
            None
        };
        let left = inputs.into_iter().next();
        let (out, _) = one(outputs);
        Box::pin(async move {
            let left = take_reader::<L>(left, ctx.node_name())?;
            let right = take_reader::<R>(right, ctx.node_name())?;
            let out = take_writer::<J::Out>(out, ctx.node_name())?;
            worker::run_join(node, left, right, out, ctx).await
        })
    }
}

pub(crate) struct AggregateLauncher<In, A> {
    pub factory: Factory<A>,
    pub _marker: PhantomData<fn() -> In>,
}

impl<In, A> NodeLauncher for AggregateLauncher<In, A>
where
    In: Data,
    A: Aggregator<In> + Sync,
{
    fn launch(
        &self,
        inputs: Vec<AnyBox>,
        outputs: Vec<AnyBox>,
        ctx: NodeContext,
    ) -> BoxFuture<'static, Result<()>> {
        let node = (self.factory)();
        let (input, _) = one(inputs);
        let (out, _) = one(outputs);
        Box::pin(async move {
            let input = take_reader::<In>(input, ctx.node_name())?;
            let out = take_writer::<A::Out>(out, ctx.node_name())?;
            worker::run_aggregate(node, input, out, ctx).await
        })
    }
}
