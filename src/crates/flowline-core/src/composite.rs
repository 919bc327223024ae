//! Composite nodes: a whole sub-plan embedded as one transform.
//!
//! For each input item the composite builds a fresh child context,
//! places the item under the well-known scratch key [`INPUT_KEY`], runs
//! the sub-plan to completion, and emits whatever the sub-plan left
//! under [`OUTPUT_KEY`]. Inside the sub-plan, [`CompositeInput`] is the
//! source that reads the input key and [`CompositeOutput`] the sink that
//! writes the output key.
//!
//! The child context always inherits the cancellation token (as a linked
//! child token), observability services, and retry/breaker defaults;
//! parameters, items, and properties follow the configured
//! [`InheritOptions`]. Sub-plan failures are failures of the composite
//! transform and go through its own retry and breaker policies like any
//! other per-item error.
//!
//! The sub-plan is re-instantiated per item (its node factories run
//! again); pooling heavy resources across items is left to the nodes
//! themselves.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::{InheritOptions, NodeContext};
use crate::engine::{Engine, EngineOptions};
use crate::error::{FlowError, Result};
use crate::node::{Sink, Source, Transform};
use crate::plan::Plan;
use crate::stream::{Data, StreamWriter};

/// Scratch key the enclosing transform writes each input item to.
pub const INPUT_KEY: &str = "__input__";
/// Scratch key the sub-plan's output sink writes the result to.
pub const OUTPUT_KEY: &str = "__output__";

/// A transform that runs `plan` once per item.
pub struct CompositeTransform<In, Out> {
    plan: Arc<Plan>,
    engine: Engine,
    inherit: InheritOptions,
    _marker: PhantomData<fn(In) -> Out>,
}

impl<In, Out> CompositeTransform<In, Out> {
    pub fn new(plan: Plan) -> Self {
        CompositeTransform {
            plan: Arc::new(plan),
            engine: Engine::new(),
            inherit: InheritOptions::default(),
            _marker: PhantomData,
        }
    }

    pub fn with_inherit(mut self, inherit: InheritOptions) -> Self {
        self.inherit = inherit;
        self
    }

    pub fn with_engine_options(mut self, opts: EngineOptions) -> Self {
        self.engine = Engine::with_options(opts);
        self
    }
}

#[async_trait]
impl<In, Out> Transform<In, Out> for CompositeTransform<In, Out>
where
    In: Data + Serialize,
    Out: Data + DeserializeOwned,
{
    async fn on_item(&mut self, item: In, ctx: &NodeContext) -> Result<Out> {
        let sub = Arc::new(ctx.execution().child(self.inherit));
        let value = serde_json::to_value(&item).map_err(|e| {
            FlowError::programmer(ctx.node_name(), format!("composite input not serializable: {e}"))
        })?;
        sub.set_item(INPUT_KEY, value);

        let result = self.engine.run(&self.plan, sub.clone()).await;
        if let Some(e) = result.error {
            return Err(e);
        }
        if result.cancelled {
            return Err(FlowError::Cancelled);
        }

        let out = sub.take_item(OUTPUT_KEY).ok_or_else(|| {
            FlowError::validation(ctx.node_name(), "sub-plan finished without writing an output")
        })?;
        serde_json::from_value(out).map_err(|e| {
            FlowError::programmer(
                ctx.node_name(),
                format!("composite output has the wrong shape: {e}"),
            )
        })
    }
}

/// Sub-plan source that emits the single item under [`INPUT_KEY`].
pub struct CompositeInput<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for CompositeInput<T> {
    fn default() -> Self {
        CompositeInput {
            _marker: PhantomData,
        }
    }
}

impl<T> CompositeInput<T> {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<T> Source<T> for CompositeInput<T>
where
    T: Data + DeserializeOwned,
{
    async fn run(&mut self, out: &mut StreamWriter<T>, ctx: &NodeContext) -> Result<()> {
        let value = ctx.get_item(INPUT_KEY).ok_or_else(|| {
            FlowError::validation(ctx.node_name(), "no composite input in this context")
        })?;
        let item: T = serde_json::from_value(value).map_err(|e| {
            FlowError::programmer(
                ctx.node_name(),
                format!("composite input has the wrong shape: {e}"),
            )
        })?;
        out.produce(item).await
    }
}

/// Sub-plan sink that stores the last item under [`OUTPUT_KEY`].
pub struct CompositeOutput<T> {
    _marker: PhantomData<fn(T)>,
}

impl<T> Default for CompositeOutput<T> {
    fn default() -> Self {
        CompositeOutput {
            _marker: PhantomData,
        }
    }
}

impl<T> CompositeOutput<T> {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<T> Sink<T> for CompositeOutput<T>
where
    T: Data + Serialize,
{
    async fn on_item(&mut self, item: T, ctx: &NodeContext) -> Result<()> {
        let value = serde_json::to_value(&item).map_err(|e| {
            FlowError::programmer(
                ctx.node_name(),
                format!("composite output not serializable: {e}"),
            )
        })?;
        ctx.set_item(OUTPUT_KEY, value);
        Ok(())
    }
}
