//! Graph builder: declare nodes, wire typed edges, validate, freeze.
//!
//! Every `add_*` call returns a typed handle; [`GraphBuilder::connect`]
//! unifies the producer's element type with the consumer's at compile
//! time, so a type mismatch on an edge is a compile error rather than a
//! build error. The shapes the type system cannot express (connectivity,
//! acyclicity, buffer capacities) are validated by
//! [`build`](GraphBuilder::build), which either reports a
//! [`GraphBuildError`] or freezes the graph into an executable
//! [`Plan`]. A source with an input or a sink with an output is not
//! representable at all: the handles simply have no such port.
//!
//! Nodes are registered through factories, not instances, so one plan can
//! drive many runs (composites re-run their sub-plan per item). The
//! `add_*_instance` variants bind a pre-constructed node with take-once
//! semantics for the odd node that cannot be rebuilt.
//!
//! ```rust,ignore
//! let mut g = GraphBuilder::new();
//! let src = g.add_source("events", make_event_source);
//! let parse = g.add_transform("parse", || try_map_fn(parse_event));
//! let totals = g.add_aggregate("totals", make_totals_aggregator);
//! let sink = g.add_sink("store", make_store_sink);
//! g.connect(&src, &parse);
//! g.connect(&parse, &totals);
//! g.connect(&totals, &sink);
//! let plan = g.build()?;
//! ```

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::aggregate::Aggregator;
use crate::breaker::CircuitBreakerOptions;
use crate::context::NodePolicy;
use crate::error::GraphBuildError;
use crate::join::Join;
use crate::node::{NodeKind, Sink, Source, StreamTransform, Transform};
use crate::plan::{
    factory_of, make_channel_factory, once_factory, AggregateLauncher, BroadcastLauncher,
    EdgeDecl, JoinLauncher, NodeDecl, NodeLauncher, Plan, PortDecl, PortRef, RawTransformLauncher,
    SinkLauncher, SourceLauncher, TapLauncher, TransformLauncher,
};
use crate::retry::RetryOptions;
use crate::stream::{Data, DEFAULT_CAPACITY};

/// A producing port carrying elements of type `T`.
pub trait OutputPort<T> {
    #[doc(hidden)]
    fn port_ref(&self) -> PortRef;
}

/// A consuming port expecting elements of type `T`.
pub trait InputPort<T> {
    #[doc(hidden)]
    fn port_ref(&self) -> PortRef;
}

/// Anything that names a node: used for per-node policy overrides.
pub trait NodeRef {
    #[doc(hidden)]
    fn node_index(&self) -> usize;
}

macro_rules! handle_type {
    ($(#[$doc:meta])* $name:ident < $($p:ident),+ >) => {
        $(#[$doc])*
        pub struct $name<$($p),+> {
            node: usize,
            _marker: PhantomData<fn($($p),+)>,
        }

        impl<$($p),+> Clone for $name<$($p),+> {
            fn clone(&self) -> Self {
                *self
            }
        }

        impl<$($p),+> Copy for $name<$($p),+> {}

        impl<$($p),+> NodeRef for $name<$($p),+> {
            fn node_index(&self) -> usize {
                self.node
            }
        }
    };
}

handle_type!(
    /// Handle to a source node producing `T`.
    SourceHandle<T>
);
handle_type!(
    /// Handle to a per-item transform from `In` to `Out`.
    TransformHandle<In, Out>
);
handle_type!(
    /// Handle to a keyed aggregate from `In` to its windowed results.
    AggregateHandle<In, Out>
);
handle_type!(
    /// Handle to a tap on a stream of `T`.
    TapHandle<T>
);
handle_type!(
    /// Handle to a sink consuming `T`.
    SinkHandle<T>
);
handle_type!(
    /// The left input port of a join.
    JoinLeft<L>
);
handle_type!(
    /// The right input port of a join.
    JoinRight<R>
);

/// Handle to a join of `L` and `R` producing `Out`.
pub struct JoinHandle<L, R, Out> {
    node: usize,
    _marker: PhantomData<fn(L, R) -> Out>,
}

impl<L, R, Out> Clone for JoinHandle<L, R, Out> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<L, R, Out> Copy for JoinHandle<L, R, Out> {}
impl<L, R, Out> NodeRef for JoinHandle<L, R, Out> {
    fn node_index(&self) -> usize {
        self.node
    }
}

impl<L, R, Out> JoinHandle<L, R, Out> {
    pub fn left(&self) -> JoinLeft<L> {
        JoinLeft {
            node: self.node,
            _marker: PhantomData,
        }
    }

    pub fn right(&self) -> JoinRight<R> {
        JoinRight {
            node: self.node,
            _marker: PhantomData,
        }
    }
}

/// Handle to a broadcast node replicating `T` onto several outputs.
pub struct BroadcastHandle<T> {
    node: usize,
    outputs: usize,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for BroadcastHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for BroadcastHandle<T> {}
impl<T> NodeRef for BroadcastHandle<T> {
    fn node_index(&self) -> usize {
        self.node
    }
}

impl<T> BroadcastHandle<T> {
    /// The `i`-th replicated output. Panics if `i` is out of range; the
    /// fan-out was fixed at `add_broadcast` time.
    pub fn output(&self, i: usize) -> BroadcastOutput<T> {
        assert!(i < self.outputs, "broadcast output {i} out of range");
        BroadcastOutput {
            node: self.node,
            port: i,
            _marker: PhantomData,
        }
    }
}

/// One output of a broadcast node.
pub struct BroadcastOutput<T> {
    node: usize,
    port: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for BroadcastOutput<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for BroadcastOutput<T> {}

impl<T> OutputPort<T> for SourceHandle<T> {
    fn port_ref(&self) -> PortRef {
        PortRef {
            node: self.node,
            port: 0,
        }
    }
}

impl<In, Out> InputPort<In> for TransformHandle<In, Out> {
    fn port_ref(&self) -> PortRef {
        PortRef {
            node: self.node,
            port: 0,
        }
    }
}

impl<In, Out> OutputPort<Out> for TransformHandle<In, Out> {
    fn port_ref(&self) -> PortRef {
        PortRef {
            node: self.node,
            port: 0,
        }
    }
}

impl<In, Out> InputPort<In> for AggregateHandle<In, Out> {
    fn port_ref(&self) -> PortRef {
        PortRef {
            node: self.node,
            port: 0,
        }
    }
}

impl<In, Out> OutputPort<Out> for AggregateHandle<In, Out> {
    fn port_ref(&self) -> PortRef {
        PortRef {
            node: self.node,
            port: 0,
        }
    }
}

impl<T> InputPort<T> for TapHandle<T> {
    fn port_ref(&self) -> PortRef {
        PortRef {
            node: self.node,
            port: 0,
        }
    }
}

impl<T> OutputPort<T> for TapHandle<T> {
    fn port_ref(&self) -> PortRef {
        PortRef {
            node: self.node,
            port: 0,
        }
    }
}

impl<T> InputPort<T> for SinkHandle<T> {
    fn port_ref(&self) -> PortRef {
        PortRef {
            node: self.node,
            port: 0,
        }
    }
}

impl<L> InputPort<L> for JoinLeft<L> {
    fn port_ref(&self) -> PortRef {
        PortRef {
            node: self.node,
            port: 0,
        }
    }
}

impl<R> InputPort<R> for JoinRight<R> {
    fn port_ref(&self) -> PortRef {
        PortRef {
            node: self.node,
            port: 1,
        }
    }
}

impl<L, R, Out> OutputPort<Out> for JoinHandle<L, R, Out> {
    fn port_ref(&self) -> PortRef {
        PortRef {
            node: self.node,
            port: 0,
        }
    }
}

impl<T> InputPort<T> for BroadcastHandle<T> {
    fn port_ref(&self) -> PortRef {
        PortRef {
            node: self.node,
            port: 0,
        }
    }
}

impl<T> OutputPort<T> for BroadcastOutput<T> {
    fn port_ref(&self) -> PortRef {
        PortRef {
            node: self.node,
            port: self.port,
        }
    }
}

/// Accumulates node declarations and typed edges, then freezes a
/// [`Plan`].
pub struct GraphBuilder {
    nodes: Vec<NodeDecl>,
    edges: Vec<EdgeDecl>,
    connected_outputs: HashSet<PortRef>,
    connected_inputs: HashSet<PortRef>,
    deferred: Vec<GraphBuildError>,
    default_capacity: usize,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    pub fn new() -> Self {
        GraphBuilder {
            nodes: Vec::new(),
            edges: Vec::new(),
            connected_outputs: HashSet::new(),
            connected_inputs: HashSet::new(),
            deferred: Vec::new(),
            default_capacity: DEFAULT_CAPACITY,
        }
    }

    /// Default buffer capacity for edges added after this call.
    pub fn with_default_capacity(mut self, capacity: usize) -> Self {
        self.default_capacity = capacity;
        self
    }

    fn push_node(
        &mut self,
        name: String,
        kind: NodeKind,
        inputs: Vec<PortDecl>,
        outputs: Vec<PortDecl>,
        launcher: Arc<dyn NodeLauncher>,
    ) -> usize {
        if self.nodes.iter().any(|n| n.name == name) {
            self.deferred.push(GraphBuildError::DuplicateNode(name.clone()));
        }
        self.nodes.push(NodeDecl {
            name,
            kind,
            inputs,
            outputs,
            policy: NodePolicy::default(),
            launcher,
        });
        self.nodes.len() - 1
    }

    pub fn add_source<T, S, F>(&mut self, name: impl Into<String>, factory: F) -> SourceHandle<T>
    where
        T: Data,
        S: Source<T> + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        let launcher = SourceLauncher::<T> {
            factory: factory_of(move || Box::new(factory()) as Box<dyn Source<T>>),
        };
        let node = self.push_node(
            name.into(),
            NodeKind::Source,
            vec![],
            vec![PortDecl::of::<T>()],
            Arc::new(launcher),
        );
        SourceHandle {
            node,
            _marker: PhantomData,
        }
    }

    /// Bind a pre-constructed source. The instance is consumed by the
    /// first run of the plan.
    pub fn add_source_instance<T, S>(
        &mut self,
        name: impl Into<String>,
        instance: S,
    ) -> SourceHandle<T>
    where
        T: Data,
        S: Source<T> + 'static,
    {
        let name = name.into();
        let launcher = SourceLauncher::<T> {
            factory: once_factory(name.clone(), Box::new(instance) as Box<dyn Source<T>>),
        };
        let node = self.push_node(
            name,
            NodeKind::Source,
            vec![],
            vec![PortDecl::of::<T>()],
            Arc::new(launcher),
        );
        SourceHandle {
            node,
            _marker: PhantomData,
        }
    }

    pub fn add_transform<In, Out, X, F>(
        &mut self,
        name: impl Into<String>,
        factory: F,
    ) -> TransformHandle<In, Out>
    where
        In: Data,
        Out: Data,
        X: Transform<In, Out> + 'static,
        F: Fn() -> X + Send + Sync + 'static,
    {
        let launcher = TransformLauncher::<In, Out> {
            factory: factory_of(move || Box::new(factory()) as Box<dyn Transform<In, Out>>),
        };
        let node = self.push_node(
            name.into(),
            NodeKind::Transform,
            vec![PortDecl::of::<In>()],
            vec![PortDecl::of::<Out>()],
            Arc::new(launcher),
        );
        TransformHandle {
            node,
            _marker: PhantomData,
        }
    }

    /// Bind a pre-constructed transform (take-once semantics).
    pub fn add_transform_instance<In, Out, X>(
        &mut self,
        name: impl Into<String>,
        instance: X,
    ) -> TransformHandle<In, Out>
    where
        In: Data,
        Out: Data,
        X: Transform<In, Out> + 'static,
    {
        let name = name.into();
        let launcher = TransformLauncher::<In, Out> {
            factory: once_factory(name.clone(), Box::new(instance) as Box<dyn Transform<In, Out>>),
        };
        let node = self.push_node(
            name,
            NodeKind::Transform,
            vec![PortDecl::of::<In>()],
            vec![PortDecl::of::<Out>()],
            Arc::new(launcher),
        );
        TransformHandle {
            node,
            _marker: PhantomData,
        }
    }

    /// A stream-driven transform: the node owns its consume/produce loop.
    pub fn add_raw_transform<In, Out, X, F>(
        &mut self,
        name: impl Into<String>,
        factory: F,
    ) -> TransformHandle<In, Out>
    where
        In: Data,
        Out: Data,
        X: StreamTransform<In, Out> + 'static,
        F: Fn() -> X + Send + Sync + 'static,
    {
        let launcher = RawTransformLauncher::<In, Out> {
            factory: factory_of(move || Box::new(factory()) as Box<dyn StreamTransform<In, Out>>),
        };
        let node = self.push_node(
            name.into(),
            NodeKind::Transform,
            vec![PortDecl::of::<In>()],
            vec![PortDecl::of::<Out>()],
            Arc::new(launcher),
        );
        TransformHandle {
            node,
            _marker: PhantomData,
        }
    }

    pub fn add_join<L, R, J, F>(
        &mut self,
        name: impl Into<String>,
        factory: F,
    ) -> JoinHandle<L, R, J::Out>
    where
        L: Data + Sync,
        R: Data + Sync,
        J: Join<L, R>,
        F: Fn() -> J + Send + Sync + 'static,
    {
        let launcher = JoinLauncher::<L, R, J> {
            factory: factory_of(factory),
            _marker: PhantomData,
        };
        let node = self.push_node(
            name.into(),
            NodeKind::Join,
            vec![PortDecl::of::<L>(), PortDecl::of::<R>()],
            vec![PortDecl::of::<J::Out>()],
            Arc::new(launcher),
        );
        JoinHandle {
            node,
            _marker: PhantomData,
        }
    }

    pub fn add_aggregate<In, A, F>(
        &mut self,
        name: impl Into<String>,
        factory: F,
    ) -> AggregateHandle<In, A::Out>
    where
        In: Data,
        A: Aggregator<In> + Sync,
        F: Fn() -> A + Send + Sync + 'static,
    {
        let launcher = AggregateLauncher::<In, A> {
            factory: factory_of(factory),
            _marker: PhantomData,
        };
        let node = self.push_node(
            name.into(),
            NodeKind::Aggregate,
            vec![PortDecl::of::<In>()],
            vec![PortDecl::of::<A::Out>()],
            Arc::new(launcher),
        );
        AggregateHandle {
            node,
            _marker: PhantomData,
        }
    }

    /// A pass-through node that feeds a forked copy of the stream to a
    /// side sink.
    pub fn add_tap<T, S, F>(&mut self, name: impl Into<String>, side_factory: F) -> TapHandle<T>
    where
        T: Data,
        S: Sink<T> + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        let launcher = TapLauncher::<T> {
            side_factory: factory_of(move || Box::new(side_factory()) as Box<dyn Sink<T>>),
        };
        let node = self.push_node(
            name.into(),
            NodeKind::Tap,
            vec![PortDecl::of::<T>()],
            vec![PortDecl::of::<T>()],
            Arc::new(launcher),
        );
        TapHandle {
            node,
            _marker: PhantomData,
        }
    }

    pub fn add_sink<T, S, F>(&mut self, name: impl Into<String>, factory: F) -> SinkHandle<T>
    where
        T: Data,
        S: Sink<T> + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        let launcher = SinkLauncher::<T> {
            factory: factory_of(move || Box::new(factory()) as Box<dyn Sink<T>>),
        };
        let node = self.push_node(
            name.into(),
            NodeKind::Sink,
            vec![PortDecl::of::<T>()],
            vec![],
            Arc::new(launcher),
        );
        SinkHandle {
            node,
            _marker: PhantomData,
        }
    }

    /// Bind a pre-constructed sink (take-once semantics).
    pub fn add_sink_instance<T, S>(&mut self, name: impl Into<String>, instance: S) -> SinkHandle<T>
    where
        T: Data,
        S: Sink<T> + 'static,
    {
        let name = name.into();
        let launcher = SinkLauncher::<T> {
            factory: once_factory(name.clone(), Box::new(instance) as Box<dyn Sink<T>>),
        };
        let node = self.push_node(
            name,
            NodeKind::Sink,
            vec![PortDecl::of::<T>()],
            vec![],
            Arc::new(launcher),
        );
        SinkHandle {
            node,
            _marker: PhantomData,
        }
    }

    /// Explicit fan-out: one input, `outputs` replicated output ports.
    /// Streams are single-consumer; this is the only way to feed one
    /// stream to several consumers.
    pub fn add_broadcast<T>(&mut self, name: impl Into<String>, outputs: usize) -> BroadcastHandle<T>
    where
        T: Data,
    {
        let launcher = BroadcastLauncher::<T> {
            _marker: PhantomData,
        };
        let node = self.push_node(
            name.into(),
            NodeKind::Broadcast,
            vec![PortDecl::of::<T>()],
            (0..outputs.max(1)).map(|_| PortDecl::of::<T>()).collect(),
            Arc::new(launcher),
        );
        BroadcastHandle {
            node,
            outputs: outputs.max(1),
            _marker: PhantomData,
        }
    }

    /// Wire a producer port to a consumer port. The element types unify
    /// at compile time.
    pub fn connect<T: Data>(&mut self, from: &impl OutputPort<T>, to: &impl InputPort<T>) {
        self.connect_with_capacity(from, to, self.default_capacity)
    }

    /// Like [`connect`](Self::connect) with an explicit buffer capacity
    /// for this edge.
    pub fn connect_with_capacity<T: Data>(
        &mut self,
        from: &impl OutputPort<T>,
        to: &impl InputPort<T>,
        capacity: usize,
    ) {
        let producer = from.port_ref();
        let consumer = to.port_ref();
        if !self.connected_outputs.insert(producer) {
            self.deferred.push(GraphBuildError::OutputAlreadyConnected {
                node: self.node_name(producer.node),
                port: producer.port,
            });
            return;
        }
        if !self.connected_inputs.insert(consumer) {
            self.deferred.push(GraphBuildError::InputAlreadyConnected {
                node: self.node_name(consumer.node),
                port: consumer.port,
            });
            return;
        }
        self.edges.push(EdgeDecl {
            producer,
            consumer,
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            capacity,
            make: make_channel_factory::<T>(),
        });
    }

    /// Override the retry policy for one node.
    pub fn with_retry(&mut self, node: &impl NodeRef, retry: RetryOptions) -> &mut Self {
        self.nodes[node.node_index()].policy.retry = Some(retry);
        self
    }

    /// Override (or enable) the circuit breaker for one node.
    pub fn with_breaker(&mut self, node: &impl NodeRef, breaker: CircuitBreakerOptions) -> &mut Self {
        self.nodes[node.node_index()].policy.breaker = Some(breaker);
        self
    }

    fn node_name(&self, idx: usize) -> String {
        self.nodes
            .get(idx)
            .map(|n| n.name.clone())
            .unwrap_or_else(|| format!("#{idx}"))
    }

    /// Validate and freeze.
    pub fn build(self) -> Result<Plan, GraphBuildError> {
        if let Some(e) = self.deferred.into_iter().next() {
            return Err(e);
        }

        for edge in &self.edges {
            if edge.capacity == 0 {
                return Err(GraphBuildError::ZeroCapacity {
                    producer: self.nodes[edge.producer.node].name.clone(),
                    consumer: self.nodes[edge.consumer.node].name.clone(),
                });
            }
            // The typed connect makes a mismatch unreachable; this guards
            // the invariant against future untyped entry points.
            let producer_decl = self
                .nodes
                .get(edge.producer.node)
                .and_then(|n| n.outputs.get(edge.producer.port))
                .ok_or(GraphBuildError::UnknownPort {
                    node: edge.producer.node,
                    port: edge.producer.port,
                })?;
            let consumer_decl = self
                .nodes
                .get(edge.consumer.node)
                .and_then(|n| n.inputs.get(edge.consumer.port))
                .ok_or(GraphBuildError::UnknownPort {
                    node: edge.consumer.node,
                    port: edge.consumer.port,
                })?;
            if producer_decl.type_id != edge.type_id || consumer_decl.type_id != edge.type_id {
                return Err(GraphBuildError::TypeMismatch {
                    producer: self.nodes[edge.producer.node].name.clone(),
                    consumer: self.nodes[edge.consumer.node].name.clone(),
                    expected: producer_decl.type_name,
                    found: edge.type_name,
                });
            }
        }

        let connected_inputs: HashSet<PortRef> =
            self.edges.iter().map(|e| e.consumer).collect();
        let connected_outputs: HashSet<PortRef> =
            self.edges.iter().map(|e| e.producer).collect();
        for (idx, node) in self.nodes.iter().enumerate() {
            let missing_inputs: Vec<usize> = (0..node.inputs.len())
                .filter(|&port| !connected_inputs.contains(&PortRef { node: idx, port }))
                .collect();
            if !missing_inputs.is_empty() {
                if node.kind == NodeKind::Join {
                    return Err(GraphBuildError::JoinUnderConnected(node.name.clone()));
                }
                return Err(GraphBuildError::UnconnectedInput {
                    node: node.name.clone(),
                    port: missing_inputs[0],
                });
            }
            for port in 0..node.outputs.len() {
                if !connected_outputs.contains(&PortRef { node: idx, port }) {
                    return Err(GraphBuildError::UnconnectedOutput {
                        node: node.name.clone(),
                        port,
                    });
                }
            }
        }

        let order = toposort(&self.nodes, &self.edges)?;
        Ok(Plan::new(self.nodes, self.edges, order))
    }
}

/// Kahn's algorithm; any remaining node after the pass names a cycle.
fn toposort(nodes: &[NodeDecl], edges: &[EdgeDecl]) -> Result<Vec<usize>, GraphBuildError> {
    let mut indegree = vec![0usize; nodes.len()];
    let mut adjacency: HashMap<usize, Vec<usize>> = HashMap::new();
    for e in edges {
        indegree[e.consumer.node] += 1;
        adjacency.entry(e.producer.node).or_default().push(e.consumer.node);
    }
    let mut ready: Vec<usize> = (0..nodes.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(n) = ready.pop() {
        order.push(n);
        if let Some(next) = adjacency.get(&n) {
            for &m in next {
                indegree[m] -= 1;
                if indegree[m] == 0 {
                    ready.push(m);
                }
            }
        }
    }
    if order.len() != nodes.len() {
        let stuck = (0..nodes.len())
            .find(|&i| indegree[i] > 0)
            .map(|i| nodes[i].name.clone())
            .unwrap_or_default();
        return Err(GraphBuildError::Cycle(stuck));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{collect_sink, map_fn, source_iter};
    use parking_lot::Mutex;

    fn linear_builder() -> (GraphBuilder, SinkHandle<i64>) {
        let out = Arc::new(Mutex::new(Vec::new()));
        let mut g = GraphBuilder::new();
        let src = g.add_source("numbers", || source_iter(vec![1i64, 2, 3]));
        let double = g.add_transform("double", || map_fn(|n: i64| n * 2));
        let sink = g.add_sink("collect", move || collect_sink(out.clone()));
        g.connect(&src, &double);
        g.connect(&double, &sink);
        (g, sink)
    }

    #[test]
    fn linear_graph_builds() {
        let (g, _) = linear_builder();
        let plan = g.build().expect("valid graph");
        assert_eq!(plan.node_count(), 3);
        assert_eq!(plan.edge_count(), 2);
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut g = GraphBuilder::new();
        g.add_source("same", || source_iter(vec![1i64]));
        g.add_source("same", || source_iter(vec![2i64]));
        assert!(matches!(
            g.build(),
            Err(GraphBuildError::DuplicateNode(name)) if name == "same"
        ));
    }

    #[test]
    fn unconnected_input_rejected() {
        let mut g = GraphBuilder::new();
        let src = g.add_source("numbers", || source_iter(vec![1i64]));
        let _orphan = g.add_transform("orphan", || map_fn(|n: i64| n));
        let sink = g.add_sink("sink", || crate::node::sink_fn(|_: i64| {}));
        g.connect(&src, &sink);
        let err = g.build().unwrap_err();
        assert!(matches!(err, GraphBuildError::UnconnectedInput { node, .. } if node == "orphan"));
    }

    #[test]
    fn double_consumption_rejected() {
        let mut g = GraphBuilder::new();
        let src = g.add_source("numbers", || source_iter(vec![1i64]));
        let a = g.add_sink("a", || crate::node::sink_fn(|_: i64| {}));
        let b = g.add_sink("b", || crate::node::sink_fn(|_: i64| {}));
        g.connect(&src, &a);
        // Fan-out without a broadcast node is a build error.
        g.connect(&src, &b);
        let err = g.build().unwrap_err();
        assert!(matches!(err, GraphBuildError::OutputAlreadyConnected { .. }));
    }

    #[test]
    fn zero_capacity_rejected() {
        let mut g = GraphBuilder::new();
        let src = g.add_source("numbers", || source_iter(vec![1i64]));
        let sink = g.add_sink("sink", || crate::node::sink_fn(|_: i64| {}));
        g.connect_with_capacity(&src, &sink, 0);
        assert!(matches!(g.build(), Err(GraphBuildError::ZeroCapacity { .. })));
    }

    #[test]
    fn join_requires_both_inputs() {
        use crate::join::Join;

        struct PairJoin;
        impl Join<i64, i64> for PairJoin {
            type Key = i64;
            type Out = i64;
            fn key_left(&self, l: &i64) -> i64 {
                *l
            }
            fn key_right(&self, r: &i64) -> i64 {
                *r
            }
            fn combine(&mut self, l: &i64, r: &i64) -> crate::error::Result<i64> {
                Ok(l + r)
            }
        }

        let mut g = GraphBuilder::new();
        let src = g.add_source("numbers", || source_iter(vec![1i64]));
        let join = g.add_join("pair", || PairJoin);
        let sink = g.add_sink("sink", || crate::node::sink_fn(|_: i64| {}));
        g.connect(&src, &join.left());
        g.connect(&join, &sink);
        assert!(matches!(
            g.build(),
            Err(GraphBuildError::JoinUnderConnected(name)) if name == "pair"
        ));
    }

    #[test]
    fn cycle_rejected() {
        let mut g = GraphBuilder::new();
        let a = g.add_transform("a", || map_fn(|n: i64| n));
        let b = g.add_transform("b", || map_fn(|n: i64| n));
        g.connect(&a, &b);
        g.connect(&b, &a);
        assert!(matches!(g.build(), Err(GraphBuildError::Cycle(_))));
    }

    #[test]
    fn broadcast_enables_fanout() {
        let mut g = GraphBuilder::new();
        let src = g.add_source("numbers", || source_iter(vec![1i64]));
        let fan = g.add_broadcast::<i64>("fan", 2);
        let a = g.add_sink("a", || crate::node::sink_fn(|_: i64| {}));
        let b = g.add_sink("b", || crate::node::sink_fn(|_: i64| {}));
        g.connect(&src, &fan);
        g.connect(&fan.output(0), &a);
        g.connect(&fan.output(1), &b);
        assert!(g.build().is_ok());
    }
}
