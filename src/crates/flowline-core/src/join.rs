//! Keyed two-input joins, windowed or whole-stream.
//!
//! A join holds per-key buffers for both inputs, each entry carrying a
//! *matched* flag. Arrivals probe the opposite buffer of the same key
//! (and, when windowed, the same window): every compatible pair produces
//! one `combine` call, in deterministic (left arrival, right arrival)
//! order. Outer variants emit `left_only`/`right_only` fallbacks for
//! entries still unmatched when their scope closes: the window for
//! windowed joins, end-of-stream on both inputs for whole-stream joins.
//!
//! The two inputs are merged into one internally tagged sequence, which
//! is also what makes self-joins (both inputs fed from one broadcast
//! node) work without any special casing: each side keeps its own tag
//! regardless of where the items originated.
//!
//! The operator's event-time clock is the minimum of the latest
//! watermarks seen per input; an exhausted input counts as `+inf`.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::context::NodeContext;
use crate::engine::worker::{drop_or_fail, late_item, with_policy, AttemptOutcome};
use crate::error::{FlowError, Result};
use crate::metrics::counter;
use crate::stream::{Data, Key, StreamEvent, StreamMessage, StreamReader, StreamWriter};
use crate::time::{EventTime, Watermark};
use crate::watermark::WatermarkClock;
use crate::window::{LatePolicy, Window, WindowAssigner};

/// Which unmatched items produce fallback output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinType {
    #[default]
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
}

impl JoinType {
    fn emits_left_fallback(self) -> bool {
        matches!(self, JoinType::LeftOuter | JoinType::FullOuter)
    }

    fn emits_right_fallback(self) -> bool {
        matches!(self, JoinType::RightOuter | JoinType::FullOuter)
    }
}

/// User contract for a keyed join of `L` and `R`.
///
/// `key_left` and `key_right` are total; `combine` is called exactly once
/// per matched pair and is wrapped in the node's retry and breaker
/// policies. The fallbacks default to emitting nothing; outer joins
/// override the side(s) they care about.
pub trait Join<L: Data, R: Data>: Send + 'static {
    type Key: Key;
    type Out: Data;

    fn key_left(&self, item: &L) -> Self::Key;
    fn key_right(&self, item: &R) -> Self::Key;
    fn combine(&mut self, left: &L, right: &R) -> Result<Self::Out>;

    fn left_only(&mut self, left: &L) -> Result<Option<Self::Out>> {
        let _ = left;
        Ok(None)
    }

    fn right_only(&mut self, right: &R) -> Result<Option<Self::Out>> {
        let _ = right;
        Ok(None)
    }

    fn join_type(&self) -> JoinType {
        JoinType::Inner
    }

    /// Absent means whole-stream: buffers live until end-of-stream.
    fn window(&self) -> Option<WindowAssigner> {
        None
    }

    fn allowed_lateness(&self) -> Duration {
        Duration::ZERO
    }

    fn late_policy(&self) -> LatePolicy {
        LatePolicy::Drop
    }
}

struct Buffered<T> {
    item: T,
    at: Option<EventTime>,
    matched: bool,
}

struct KeyBuffers<L, R> {
    left: Vec<Buffered<L>>,
    right: Vec<Buffered<R>>,
}

impl<L, R> KeyBuffers<L, R> {
    fn new() -> Self {
        KeyBuffers {
            left: Vec::new(),
            right: Vec::new(),
        }
    }
}

enum JoinState<K, L, R> {
    Whole(HashMap<K, KeyBuffers<L, R>>),
    Windowed {
        assigner: WindowAssigner,
        // Ordered by (window end, window start) so closure pops from the
        // front.
        windows: BTreeMap<(i64, i64), HashMap<K, KeyBuffers<L, R>>>,
    },
}

/// Drive loop for a join node. Consumes both inputs to completion,
/// producing combined output. Returns `Ok(Some(e))` when an upstream
/// error terminated the inputs (the closure is forwarded, the node did
/// not fail); `Err` means the join itself failed. The caller owns stream
/// closure.
pub(crate) async fn drive_join<L, R, J>(
    join: &mut J,
    left: &mut StreamReader<L>,
    right: &mut StreamReader<R>,
    out: &mut StreamWriter<J::Out>,
    ctx: &NodeContext,
) -> Result<Option<FlowError>>
where
    L: Data,
    R: Data,
    J: Join<L, R>,
{
    let mut clock = WatermarkClock::new(2);
    let mut state = match join.window() {
        None => JoinState::Whole(HashMap::new()),
        Some(assigner) => JoinState::Windowed {
            assigner,
            windows: BTreeMap::new(),
        },
    };
    let lateness = join.allowed_lateness();
    let mut left_done = false;
    let mut right_done = false;

    while !(left_done && right_done) {
        enum Fed<L, R> {
            Left(Result<StreamMessage<L>>),
            Right(Result<StreamMessage<R>>),
        }
        let fed = tokio::select! {
            msg = left.consume(), if !left_done => Fed::Left(msg),
            msg = right.consume(), if !right_done => Fed::Right(msg),
        };
        let advanced = match fed {
            Fed::Left(Err(e)) | Fed::Right(Err(e)) => {
                if e.is_cancellation() {
                    return Err(e);
                }
                return Ok(Some(e));
            }
            Fed::Left(Ok(msg)) => match msg {
                StreamMessage::Event(StreamEvent::Item(item)) => {
                    on_left(join, &mut state, item, None, &clock, ctx, out).await?;
                    None
                }
                StreamMessage::Event(StreamEvent::Timestamped(item, at)) => {
                    on_left(join, &mut state, item, Some(at), &clock, ctx, out).await?;
                    None
                }
                StreamMessage::Event(StreamEvent::Watermark(w)) => clock.advance(0, w),
                StreamMessage::EndOfStream => {
                    left_done = true;
                    clock.advance(0, Watermark::maximum())
                }
            },
            Fed::Right(Ok(msg)) => match msg {
                StreamMessage::Event(StreamEvent::Item(item)) => {
                    on_right(join, &mut state, item, None, &clock, ctx, out).await?;
                    None
                }
                StreamMessage::Event(StreamEvent::Timestamped(item, at)) => {
                    on_right(join, &mut state, item, Some(at), &clock, ctx, out).await?;
                    None
                }
                StreamMessage::Event(StreamEvent::Watermark(w)) => clock.advance(1, w),
                StreamMessage::EndOfStream => {
                    right_done = true;
                    clock.advance(1, Watermark::maximum())
                }
            },
        };
        if let Some(merged) = advanced {
            if let JoinState::Windowed { windows, .. } = &mut state {
                flush_closed_windows(join, windows, merged, lateness, ctx, out).await?;
            }
            if !merged.is_final() {
                out.watermark(merged).await?;
            }
        }
    }

    // Whole-stream joins settle unmatched items once both inputs ended.
    if let JoinState::Whole(buffers) = &mut state {
        let mut keys: Vec<_> = buffers.keys().cloned().collect();
        keys.sort();
        for k in keys {
            if let Some(pair) = buffers.remove(&k) {
                emit_fallbacks(join, pair, ctx, out).await?;
            }
        }
    }
    Ok(None)
}

#[allow(clippy::too_many_arguments)]
async fn on_left<L, R, J>(
    join: &mut J,
    state: &mut JoinState<J::Key, L, R>,
    item: L,
    at: Option<EventTime>,
    clock: &WatermarkClock,
    ctx: &NodeContext,
    out: &mut StreamWriter<J::Out>,
) -> Result<()>
where
    L: Data,
    R: Data,
    J: Join<L, R>,
{
    let key = join.key_left(&item);
    match state {
        JoinState::Whole(buffers) => {
            let pair = buffers.entry(key).or_insert_with(KeyBuffers::new);
            let mut matched = false;
            for r in pair.right.iter_mut() {
                let combined = combine_pair(join, &item, &r.item, ctx, out, at, r.at).await?;
                if combined {
                    matched = true;
                    r.matched = true;
                }
            }
            pair.left.push(Buffered { item, at, matched });
        }
        JoinState::Windowed { assigner, windows } => {
            let Some(at_time) = at else {
                return drop_or_fail(
                    ctx,
                    FlowError::validation(ctx.node_name(), "windowed join requires timestamped items"),
                );
            };
            if clock.current().is_late(at_time) {
                return late_item(ctx, join.late_policy());
            }
            for w in assigner.assign(at_time) {
                let slot = windows
                    .entry((w.end_ms(), w.start_ms()))
                    .or_default()
                    .entry(key.clone())
                    .or_insert_with(KeyBuffers::new);
                let mut matched = false;
                for r in slot.right.iter_mut() {
                    let combined =
                        combine_pair(join, &item, &r.item, ctx, out, at, r.at).await?;
                    if combined {
                        matched = true;
                        r.matched = true;
                    }
                }
                slot.left.push(Buffered {
                    item: item.clone(),
                    at,
                    matched,
                });
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn on_right<L, R, J>(
    join: &mut J,
    state: &mut JoinState<J::Key, L, R>,
    item: R,
    at: Option<EventTime>,
    clock: &WatermarkClock,
    ctx: &NodeContext,
    out: &mut StreamWriter<J::Out>,
) -> Result<()>
where
    L: Data,
    R: Data,
    J: Join<L, R>,
{
    let key = join.key_right(&item);
    match state {
        JoinState::Whole(buffers) => {
            let pair = buffers.entry(key).or_insert_with(KeyBuffers::new);
            let mut matched = false;
            for l in pair.left.iter_mut() {
                let combined = combine_pair(join, &l.item, &item, ctx, out, l.at, at).await?;
                if combined {
                    matched = true;
                    l.matched = true;
                }
            }
            pair.right.push(Buffered { item, at, matched });
        }
        JoinState::Windowed { assigner, windows } => {
            let Some(at_time) = at else {
                return drop_or_fail(
                    ctx,
                    FlowError::validation(ctx.node_name(), "windowed join requires timestamped items"),
                );
            };
            if clock.current().is_late(at_time) {
                return late_item(ctx, join.late_policy());
            }
            for w in assigner.assign(at_time) {
                let slot = windows
                    .entry((w.end_ms(), w.start_ms()))
                    .or_default()
                    .entry(key.clone())
                    .or_insert_with(KeyBuffers::new);
                let mut matched = false;
                for l in slot.left.iter_mut() {
                    let combined =
                        combine_pair(join, &l.item, &item, ctx, out, l.at, at).await?;
                    if combined {
                        matched = true;
                        l.matched = true;
                    }
                }
                slot.right.push(Buffered {
                    item: item.clone(),
                    at,
                    matched,
                });
            }
        }
    }
    Ok(())
}

/// Run `combine` under the node's retry policy and produce the result.
/// Returns whether a pair was actually emitted (a dropped combine leaves
/// both sides unmatched).
async fn combine_pair<L, R, J>(
    join: &mut J,
    left: &L,
    right: &R,
    ctx: &NodeContext,
    out: &mut StreamWriter<J::Out>,
    left_at: Option<EventTime>,
    right_at: Option<EventTime>,
) -> Result<bool>
where
    L: Data,
    R: Data,
    J: Join<L, R>,
{
    let outcome = with_policy!(ctx, join.combine(left, right));
    match outcome {
        AttemptOutcome::Success(v) => {
            match (left_at, right_at) {
                (Some(a), Some(b)) => out.produce_at(v, a.max(b)).await?,
                _ => out.produce(v).await?,
            }
            Ok(true)
        }
        AttemptOutcome::Dropped(_) => Ok(false),
        AttemptOutcome::Fatal(e) => Err(e),
    }
}

async fn flush_closed_windows<L, R, J>(
    join: &mut J,
    windows: &mut BTreeMap<(i64, i64), HashMap<J::Key, KeyBuffers<L, R>>>,
    merged: Watermark,
    lateness: Duration,
    ctx: &NodeContext,
    out: &mut StreamWriter<J::Out>,
) -> Result<()>
where
    L: Data,
    R: Data,
    J: Join<L, R>,
{
    loop {
        let Some((&(end_ms, start_ms), _)) = windows.iter().next() else {
            break;
        };
        let window = Window::from_epoch_ms(start_ms, end_ms);
        if !window.is_closed_at(merged, lateness) {
            break;
        }
        let Some(mut keyed) = windows.remove(&(end_ms, start_ms)) else {
            break;
        };
        let mut keys: Vec<_> = keyed.keys().cloned().collect();
        keys.sort();
        for k in keys {
            if let Some(pair) = keyed.remove(&k) {
                emit_fallbacks(join, pair, ctx, out).await?;
            }
        }
    }
    Ok(())
}

/// Emit outer-join fallbacks for whatever is still unmatched in `pair`,
/// counting every unmatched item whether or not a fallback is produced.
async fn emit_fallbacks<L, R, J>(
    join: &mut J,
    pair: KeyBuffers<L, R>,
    ctx: &NodeContext,
    out: &mut StreamWriter<J::Out>,
) -> Result<()>
where
    L: Data,
    R: Data,
    J: Join<L, R>,
{
    let jt = join.join_type();
    for l in pair.left.into_iter().filter(|b| !b.matched) {
        ctx.metrics().incr(ctx.node_name(), counter::UNMATCHED_LEFT);
        if jt.emits_left_fallback() {
            let outcome = with_policy!(ctx, join.left_only(&l.item));
            match outcome {
                AttemptOutcome::Success(Some(v)) => match l.at {
                    Some(at) => out.produce_at(v, at).await?,
                    None => out.produce(v).await?,
                },
                AttemptOutcome::Success(None) | AttemptOutcome::Dropped(_) => {}
                AttemptOutcome::Fatal(e) => return Err(e),
            }
        }
    }
    for r in pair.right.into_iter().filter(|b| !b.matched) {
        ctx.metrics().incr(ctx.node_name(), counter::UNMATCHED_RIGHT);
        if jt.emits_right_fallback() {
            let outcome = with_policy!(ctx, join.right_only(&r.item));
            match outcome {
                AttemptOutcome::Success(Some(v)) => match r.at {
                    Some(at) => out.produce_at(v, at).await?,
                    None => out.produce(v).await?,
                },
                AttemptOutcome::Success(None) | AttemptOutcome::Dropped(_) => {}
                AttemptOutcome::Fatal(e) => return Err(e),
            }
        }
    }
    Ok(())
}
