//! Keyed windowed aggregation.
//!
//! Each timestamped item is folded into one accumulator per (key, window)
//! pair. A window's result is emitted exactly once, when the input
//! watermark reaches `window.end + allowed_lateness`; the state entry is
//! destroyed on emission. Emission order on a watermark tick is ascending
//! window end, then ascending key.
//!
//! Tumbling and sliding windows fold eagerly, exactly as items arrive.
//! Session windows buffer raw items per (key, session) and fold once at
//! finalization: `accumulate` has no merge companion, so a bridged pair
//! of sessions is merged by concatenating buffers rather than by merging
//! two live accumulators. Either way there is at most one accumulator per
//! (key, window) at any instant.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::context::NodeContext;
use crate::engine::worker::{drop_or_fail, late_item};
use crate::error::{FlowError, Result};
use crate::stream::{Data, Key, StreamEvent, StreamMessage, StreamReader, StreamWriter};
use crate::time::{from_epoch_ms, EventTime, Watermark};
use crate::window::{LatePolicy, Window, WindowAssigner};

/// User contract for a keyed windowed aggregation.
///
/// `accumulate` must be associative within one window; commutativity is
/// not required, and items arrive in input order.
pub trait Aggregator<In: Data>: Send + 'static {
    type Key: Key;
    type Acc: Send + 'static;
    type Out: Data;

    fn key_of(&self, item: &In) -> Self::Key;
    fn create_accumulator(&self) -> Self::Acc;
    fn accumulate(&self, acc: Self::Acc, item: &In) -> Self::Acc;
    fn result(&self, acc: Self::Acc) -> Self::Out;

    /// The window assigner. Required: an aggregator without windows has
    /// nothing to bound its state.
    fn window(&self) -> WindowAssigner;

    fn allowed_lateness(&self) -> Duration {
        Duration::ZERO
    }

    fn late_policy(&self) -> LatePolicy {
        LatePolicy::Drop
    }
}

/// Eager per-(window, key) accumulators, ordered for emission.
type EagerState<K, Acc> = BTreeMap<(i64, K, i64), Acc>;

struct SessionBuf<In> {
    start_ms: i64,
    end_ms: i64,
    items: Vec<In>,
}

enum AggState<K, In, Acc> {
    Eager(EagerState<K, Acc>),
    Session {
        gap_ms: i64,
        sessions: HashMap<K, Vec<SessionBuf<In>>>,
    },
}

/// Drive loop for an aggregate node. `Ok(Some(e))` reports an upstream
/// error whose closure should be forwarded; `Err` means the aggregation
/// itself failed.
pub(crate) async fn drive_aggregate<In, A>(
    agg: &mut A,
    input: &mut StreamReader<In>,
    out: &mut StreamWriter<A::Out>,
    ctx: &NodeContext,
) -> Result<Option<FlowError>>
where
    In: Data,
    A: Aggregator<In>,
{
    let assigner = agg.window();
    let lateness = agg.allowed_lateness();
    let mut state = match assigner {
        WindowAssigner::Session { gap } => AggState::Session {
            gap_ms: gap.as_millis() as i64,
            sessions: HashMap::new(),
        },
        _ => AggState::Eager(BTreeMap::new()),
    };
    let mut clock = Watermark::minimum();

    loop {
        let msg = match input.consume().await {
            Ok(msg) => msg,
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e) => return Ok(Some(e)),
        };
        match msg {
            StreamMessage::Event(StreamEvent::Item(_)) => {
                drop_or_fail(
                    ctx,
                    FlowError::validation(
                        ctx.node_name(),
                        "aggregation requires timestamped items",
                    ),
                )?;
            }
            StreamMessage::Event(StreamEvent::Timestamped(item, at)) => {
                if clock.is_late(at) {
                    late_item(ctx, agg.late_policy())?;
                    continue;
                }
                accumulate_item(agg, &assigner, &mut state, item, at);
            }
            StreamMessage::Event(StreamEvent::Watermark(w)) => {
                if w > clock {
                    clock = w;
                    flush_closed(agg, &mut state, clock, lateness, out).await?;
                    out.watermark(w).await?;
                }
            }
            StreamMessage::EndOfStream => {
                flush_closed(agg, &mut state, Watermark::maximum(), lateness, out).await?;
                return Ok(None);
            }
        }
    }
}

fn accumulate_item<In, A>(
    agg: &A,
    assigner: &WindowAssigner,
    state: &mut AggState<A::Key, In, A::Acc>,
    item: In,
    at: EventTime,
) where
    In: Data,
    A: Aggregator<In>,
{
    let key = agg.key_of(&item);
    match state {
        AggState::Eager(map) => {
            for w in assigner.assign(at) {
                let slot = (w.end_ms(), key.clone(), w.start_ms());
                let acc = map
                    .remove(&slot)
                    .unwrap_or_else(|| agg.create_accumulator());
                map.insert(slot, agg.accumulate(acc, &item));
            }
        }
        AggState::Session { gap_ms, sessions } => {
            let ms = at.timestamp_millis();
            let (mut start, mut end) = (ms, ms + *gap_ms);
            let list = sessions.entry(key).or_default();
            // Pull out every session this item touches and fold them into
            // one span; an item can bridge two previously separate
            // sessions.
            let mut items = Vec::new();
            let mut i = 0;
            while i < list.len() {
                let overlaps = list[i].start_ms < end && start < list[i].end_ms;
                if overlaps {
                    let s = list.swap_remove(i);
                    start = start.min(s.start_ms);
                    end = end.max(s.end_ms);
                    items.extend(s.items);
                } else {
                    i += 1;
                }
            }
            items.push(item);
            list.push(SessionBuf {
                start_ms: start,
                end_ms: end,
                items,
            });
        }
    }
}

async fn flush_closed<In, A>(
    agg: &A,
    state: &mut AggState<A::Key, In, A::Acc>,
    clock: Watermark,
    lateness: Duration,
    out: &mut StreamWriter<A::Out>,
) -> Result<()>
where
    In: Data,
    A: Aggregator<In>,
{
    match state {
        AggState::Eager(map) => {
            // BTreeMap order is (end, key, start): exactly the emission
            // order the contract asks for.
            loop {
                let Some((&(end_ms, ref key, start_ms), _)) = map.iter().next() else {
                    break;
                };
                let window = Window::from_epoch_ms(start_ms, end_ms);
                if !window.is_closed_at(clock, lateness) {
                    break;
                }
                let slot = (end_ms, key.clone(), start_ms);
                if let Some(acc) = map.remove(&slot) {
                    out.produce_at(agg.result(acc), from_epoch_ms(end_ms)).await?;
                }
            }
        }
        AggState::Session { sessions, .. } => {
            let mut closed: Vec<(i64, A::Key, SessionBuf<In>)> = Vec::new();
            for (key, list) in sessions.iter_mut() {
                let mut i = 0;
                while i < list.len() {
                    let window = Window::from_epoch_ms(list[i].start_ms, list[i].end_ms);
                    if window.is_closed_at(clock, lateness) {
                        let buf = list.swap_remove(i);
                        closed.push((buf.end_ms, key.clone(), buf));
                    } else {
                        i += 1;
                    }
                }
            }
            sessions.retain(|_, list| !list.is_empty());
            closed.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
            for (end_ms, _key, buf) in closed {
                let mut acc = agg.create_accumulator();
                for item in &buf.items {
                    acc = agg.accumulate(acc, item);
                }
                out.produce_at(agg.result(acc), from_epoch_ms(end_ms)).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SumPerKey {
        assigner: WindowAssigner,
    }

    impl Aggregator<(String, i64)> for SumPerKey {
        type Key = String;
        type Acc = i64;
        type Out = (String, i64);

        fn key_of(&self, item: &(String, i64)) -> String {
            item.0.clone()
        }

        fn create_accumulator(&self) -> i64 {
            0
        }

        fn accumulate(&self, acc: i64, item: &(String, i64)) -> i64 {
            acc + item.1
        }

        fn result(&self, acc: i64) -> (String, i64) {
            ("sum".to_string(), acc)
        }

        fn window(&self) -> WindowAssigner {
            self.assigner
        }
    }

    #[test]
    fn session_items_merge_on_bridge() {
        let agg = SumPerKey {
            assigner: WindowAssigner::session(Duration::from_millis(10)),
        };
        let assigner = agg.window();
        let mut state: AggState<String, (String, i64), i64> = AggState::Session {
            gap_ms: 10,
            sessions: HashMap::new(),
        };
        // Two sessions 25ms apart, then a bridging item between them.
        accumulate_item(&agg, &assigner, &mut state, ("a".into(), 1), from_epoch_ms(0));
        accumulate_item(&agg, &assigner, &mut state, ("a".into(), 2), from_epoch_ms(25));
        if let AggState::Session { sessions, .. } = &state {
            assert_eq!(sessions["a"].len(), 2);
        }
        accumulate_item(&agg, &assigner, &mut state, ("a".into(), 4), from_epoch_ms(8));
        if let AggState::Session { sessions, .. } = &state {
            // [0,10) and [8,18) merged; [25,35) stays separate.
            assert_eq!(sessions["a"].len(), 2);
            let spans: Vec<_> = sessions["a"]
                .iter()
                .map(|s| (s.start_ms, s.end_ms, s.items.len()))
                .collect();
            assert!(spans.contains(&(0, 18, 2)));
            assert!(spans.contains(&(25, 35, 1)));
        } else {
            panic!("expected session state");
        }
    }

    #[test]
    fn eager_state_keeps_one_accumulator_per_window() {
        let agg = SumPerKey {
            assigner: WindowAssigner::tumbling(Duration::from_millis(10)),
        };
        let assigner = agg.window();
        let mut state: AggState<String, (String, i64), i64> = AggState::Eager(BTreeMap::new());
        accumulate_item(&agg, &assigner, &mut state, ("a".into(), 1), from_epoch_ms(3));
        accumulate_item(&agg, &assigner, &mut state, ("a".into(), 2), from_epoch_ms(7));
        accumulate_item(&agg, &assigner, &mut state, ("b".into(), 5), from_epoch_ms(7));
        if let AggState::Eager(map) = &state {
            assert_eq!(map.len(), 2);
            assert_eq!(map[&(10, "a".to_string(), 0)], 3);
            assert_eq!(map[&(10, "b".to_string(), 0)], 5);
        } else {
            panic!("expected eager state");
        }
    }
}
