//! End-to-end pipeline scenarios.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use flowline_core::metrics::counter;
use flowline_core::prelude::*;

fn ts(ms: i64) -> EventTime {
    from_epoch_ms(ms)
}

async fn run_ok(g: GraphBuilder) -> flowline_core::PipelineResult {
    let plan = g.build().expect("plan should build");
    let result = Engine::new()
        .run(&plan, Arc::new(ExecutionContext::new()))
        .await;
    assert!(
        result.is_success(),
        "pipeline failed: {:?}",
        result.error
    );
    result
}

/// Replaces each item with `(item, event_time_ms)`, `-1` when
/// untimestamped. Lets sinks assert on emission times.
struct Stamp;

#[async_trait]
impl<T: Data> StreamTransform<T, (T, i64)> for Stamp {
    async fn run(
        &mut self,
        input: &mut StreamReader<T>,
        out: &mut StreamWriter<(T, i64)>,
        _ctx: &NodeContext,
    ) -> flowline_core::Result<()> {
        loop {
            match input.consume().await? {
                StreamMessage::Event(StreamEvent::Item(v)) => out.produce((v, -1)).await?,
                StreamMessage::Event(StreamEvent::Timestamped(v, at)) => {
                    out.produce((v, at.timestamp_millis())).await?
                }
                StreamMessage::Event(StreamEvent::Watermark(w)) => out.watermark(w).await?,
                StreamMessage::EndOfStream => return Ok(()),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// S1: tumbling aggregation with bounded out-of-orderness
// ---------------------------------------------------------------------------

struct AvgPerKey;

impl Aggregator<(String, f64)> for AvgPerKey {
    type Key = String;
    type Acc = (String, f64, u64);
    type Out = (String, f64);

    fn key_of(&self, item: &(String, f64)) -> String {
        item.0.clone()
    }

    fn create_accumulator(&self) -> (String, f64, u64) {
        (String::new(), 0.0, 0)
    }

    fn accumulate(&self, acc: (String, f64, u64), item: &(String, f64)) -> (String, f64, u64) {
        (item.0.clone(), acc.1 + item.1, acc.2 + 1)
    }

    fn result(&self, acc: (String, f64, u64)) -> (String, f64) {
        (acc.0, acc.1 / acc.2 as f64)
    }

    fn window(&self) -> WindowAssigner {
        WindowAssigner::tumbling(Duration::from_secs(300))
    }
}

#[tokio::test]
async fn s1_tumbling_average_per_window() {
    const MIN5: i64 = 300_000;
    let results: Arc<Mutex<Vec<((String, f64), i64)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_results = results.clone();

    let mut g = GraphBuilder::new();
    let src = g.add_source("events", || {
        timestamped_source(
            vec![
                (("A".to_string(), 10.0), ts(0)),
                (("A".to_string(), 20.0), ts(30_000)),
                (("A".to_string(), 7.0), ts(MIN5)),
            ],
            BoundedOutOfOrderness::new(Duration::ZERO),
        )
    });
    let avg = g.add_aggregate("avg", || AvgPerKey);
    let stamp = g.add_raw_transform("stamp", || Stamp);
    let sink = g.add_sink("collect", move || collect_sink(sink_results.clone()));
    g.connect(&src, &avg);
    g.connect(&avg, &stamp);
    g.connect(&stamp, &sink);
    run_ok(g).await;

    let got = results.lock().clone();
    assert_eq!(
        got,
        vec![
            (("A".to_string(), 15.0), MIN5),
            (("A".to_string(), 7.0), 2 * MIN5),
        ]
    );
}

// ---------------------------------------------------------------------------
// S2 / S3: keyed joins
// ---------------------------------------------------------------------------

struct TagJoin {
    join_type: JoinType,
}

impl Join<(i64, String), (i64, String)> for TagJoin {
    type Key = i64;
    type Out = String;

    fn key_left(&self, l: &(i64, String)) -> i64 {
        l.0
    }

    fn key_right(&self, r: &(i64, String)) -> i64 {
        r.0
    }

    fn combine(&mut self, l: &(i64, String), r: &(i64, String)) -> flowline_core::Result<String> {
        Ok(format!("{}+{}", l.1, r.1))
    }

    fn left_only(&mut self, l: &(i64, String)) -> flowline_core::Result<Option<String>> {
        Ok(Some(format!("{}+none", l.1)))
    }

    fn join_type(&self) -> JoinType {
        self.join_type
    }
}

async fn run_tag_join(join_type: JoinType) -> (Vec<String>, flowline_core::MetricsSnapshot) {
    let results = Arc::new(Mutex::new(Vec::new()));
    let sink_results = results.clone();

    let mut g = GraphBuilder::new();
    let left = g.add_source("left", || {
        source_iter(vec![(1i64, "L1".to_string()), (2, "L2".to_string())])
    });
    let right = g.add_source("right", || {
        source_iter(vec![(1i64, "R1".to_string()), (3, "R3".to_string())])
    });
    let join = g.add_join("tag_join", move || TagJoin { join_type });
    let sink = g.add_sink("collect", move || collect_sink(sink_results.clone()));
    g.connect(&left, &join.left());
    g.connect(&right, &join.right());
    g.connect(&join, &sink);
    let result = run_ok(g).await;
    let got = results.lock().clone();
    (got, result.metrics)
}

#[tokio::test]
async fn s2_inner_join_matches_only_shared_keys() {
    let (got, metrics) = run_tag_join(JoinType::Inner).await;
    assert_eq!(got, vec!["L1+R1".to_string()]);
    assert_eq!(metrics.get("tag_join", counter::UNMATCHED_LEFT), 1);
    assert_eq!(metrics.get("tag_join", counter::UNMATCHED_RIGHT), 1);
}

#[tokio::test]
async fn s3_left_outer_join_emits_fallbacks_after_matches() {
    let (got, metrics) = run_tag_join(JoinType::LeftOuter).await;
    assert_eq!(got, vec!["L1+R1".to_string(), "L2+none".to_string()]);
    assert_eq!(metrics.get("tag_join", counter::UNMATCHED_LEFT), 1);
    assert_eq!(metrics.get("tag_join", counter::UNMATCHED_RIGHT), 1);
}

// ---------------------------------------------------------------------------
// S4: transient failures recovered by retry
// ---------------------------------------------------------------------------

struct FlakyDouble {
    attempts: Arc<AtomicUsize>,
    failures_before_success: usize,
}

#[async_trait]
impl Transform<i64, i64> for FlakyDouble {
    async fn on_item(&mut self, item: i64, ctx: &NodeContext) -> flowline_core::Result<i64> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures_before_success {
            return Err(FlowError::transient(
                ctx.node_name(),
                format!("simulated I/O failure on attempt {attempt}"),
            ));
        }
        Ok(item * 2)
    }
}

#[tokio::test]
async fn s4_transient_errors_recovered_within_budget() {
    let results = Arc::new(Mutex::new(Vec::new()));
    let sink_results = results.clone();
    let attempts = Arc::new(AtomicUsize::new(0));
    let transform_attempts = attempts.clone();

    let mut g = GraphBuilder::new();
    let src = g.add_source("one", || source_iter(vec![21i64]));
    let flaky = g.add_transform("flaky", move || FlakyDouble {
        attempts: transform_attempts.clone(),
        failures_before_success: 2,
    });
    g.with_retry(
        &flaky,
        RetryOptions::new(3)
            .with_initial_backoff(Duration::from_millis(1))
            .with_strategy(BackoffStrategy::Exponential { factor: 2.0 }),
    );
    let sink = g.add_sink("collect", move || collect_sink(sink_results.clone()));
    g.connect(&src, &flaky);
    g.connect(&flaky, &sink);
    let result = run_ok(g).await;

    assert_eq!(results.lock().clone(), vec![42i64]);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(result.metrics.get("flaky", counter::RETRIES), 2);
}

// ---------------------------------------------------------------------------
// S5: circuit breaker fast-fails without invoking user code
// ---------------------------------------------------------------------------

struct AlwaysPermanent {
    invocations: Arc<AtomicUsize>,
}

#[async_trait]
impl Transform<i64, i64> for AlwaysPermanent {
    async fn on_item(&mut self, _item: i64, ctx: &NodeContext) -> flowline_core::Result<i64> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Err(FlowError::permanent(ctx.node_name(), "remote rejected"))
    }
}

#[tokio::test]
async fn s5_breaker_opens_after_threshold() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let transform_invocations = invocations.clone();

    let mut g = GraphBuilder::new();
    let src = g.add_source("five", || source_iter(vec![1i64, 2, 3, 4, 5]));
    // Unique node name: breaker state is process-wide by node id.
    let broken = g.add_transform("s5_remote_call", move || AlwaysPermanent {
        invocations: transform_invocations.clone(),
    });
    g.with_retry(&broken, RetryOptions::new(1).continue_on_error(true));
    g.with_breaker(
        &broken,
        CircuitBreakerOptions::new(3, Duration::from_millis(500)),
    );
    let sink = g.add_sink("collect", || sink_fn(|_: i64| {}));
    g.connect(&src, &broken);
    g.connect(&broken, &sink);
    let result = run_ok(g).await;

    // Items 1-3 reach user code and fail; 4 and 5 fast-fail at the
    // breaker.
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    assert_eq!(result.metrics.get("s5_remote_call", counter::FAST_FAILED), 2);
    assert_eq!(result.metrics.get("s5_remote_call", counter::DROPPED), 5);
}

// ---------------------------------------------------------------------------
// S6: composite transform
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s6_composite_runs_sub_plan_per_item() {
    use flowline_core::{CompositeInput, CompositeOutput, CompositeTransform};

    let mut sub = GraphBuilder::new();
    let input = sub.add_source("sub_in", CompositeInput::<i64>::new);
    let double = sub.add_transform("sub_double", || map_fn(|n: i64| n * 2));
    let output = sub.add_sink("sub_out", CompositeOutput::<i64>::new);
    sub.connect(&input, &double);
    sub.connect(&double, &output);
    let sub_plan = sub.build().expect("sub-plan should build");

    let results = Arc::new(Mutex::new(Vec::new()));
    let sink_results = results.clone();
    let mut g = GraphBuilder::new();
    let src = g.add_source("parent_in", || source_iter(vec![42i64]));
    let composite = g.add_transform("doubler", move || {
        CompositeTransform::<i64, i64>::new(sub_plan.clone())
    });
    let sink = g.add_sink("collect", move || collect_sink(sink_results.clone()));
    g.connect(&src, &composite);
    g.connect(&composite, &sink);
    run_ok(g).await;

    assert_eq!(results.lock().clone(), vec![84i64]);
}

// ---------------------------------------------------------------------------
// Laws and liveness
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pure_transform_preserves_order_and_cardinality() {
    let results = Arc::new(Mutex::new(Vec::new()));
    let sink_results = results.clone();

    let mut g = GraphBuilder::new();
    let src = g.add_source("numbers", || source_iter(0i64..100));
    let square = g.add_transform("square", || map_fn(|n: i64| n * n));
    let sink = g.add_sink("collect", move || collect_sink(sink_results.clone()));
    g.connect(&src, &square);
    g.connect(&square, &sink);
    run_ok(g).await;

    let expected: Vec<i64> = (0..100).map(|n| n * n).collect();
    assert_eq!(results.lock().clone(), expected);
}

#[tokio::test]
async fn tap_forwards_main_stream_unchanged() {
    let main = Arc::new(Mutex::new(Vec::new()));
    let side = Arc::new(Mutex::new(Vec::new()));
    let main_sink = main.clone();
    let side_sink = side.clone();

    let mut g = GraphBuilder::new();
    let src = g.add_source("numbers", || source_iter(1i64..=50));
    let tap = g.add_tap("audit", move || collect_sink(side_sink.clone()));
    let sink = g.add_sink("collect", move || collect_sink(main_sink.clone()));
    g.connect(&src, &tap);
    g.connect(&tap, &sink);
    run_ok(g).await;

    let expected: Vec<i64> = (1..=50).collect();
    assert_eq!(main.lock().clone(), expected, "main stream must be untouched");
    // The fork observes a prefix; with a healthy side sink that prefix is
    // the whole stream.
    let side_items = side.lock().clone();
    assert_eq!(side_items, expected);
}

#[tokio::test]
async fn zero_items_produce_zero_outputs() {
    let results: Arc<Mutex<Vec<(String, f64)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_results = results.clone();

    let mut g = GraphBuilder::new();
    let src = g.add_source("empty", || {
        timestamped_source(
            Vec::<((String, f64), EventTime)>::new(),
            BoundedOutOfOrderness::new(Duration::ZERO),
        )
    });
    let avg = g.add_aggregate("avg", || AvgPerKey);
    let sink = g.add_sink("collect", move || collect_sink(sink_results.clone()));
    g.connect(&src, &avg);
    g.connect(&avg, &sink);
    run_ok(g).await;

    assert!(results.lock().is_empty());
}

struct Unbounded;

#[async_trait]
impl Source<i64> for Unbounded {
    async fn run(
        &mut self,
        out: &mut StreamWriter<i64>,
        _ctx: &NodeContext,
    ) -> flowline_core::Result<()> {
        let mut n = 0i64;
        loop {
            out.produce(n).await?;
            n += 1;
        }
    }
}

#[tokio::test]
async fn cancellation_terminates_promptly() {
    let mut g = GraphBuilder::new();
    let src = g.add_source("unbounded", || Unbounded);
    let sink = g.add_sink("devnull", || sink_fn(|_: i64| {}));
    g.connect(&src, &sink);
    let plan = g.build().expect("plan should build");

    let ctx = Arc::new(ExecutionContext::new());
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(5), Engine::new().run(&plan, ctx))
        .await
        .expect("cancellation must terminate the run promptly");
    assert!(result.is_success(), "cancellation is not a failure");
    assert!(result.cancelled);
}

#[tokio::test]
async fn permanent_failure_aborts_pipeline() {
    let mut g = GraphBuilder::new();
    let src = g.add_source("numbers", || source_iter(0i64..1000));
    let boom = g.add_transform("boom", || {
        try_map_fn(|n: i64| {
            if n == 3 {
                Err(FlowError::permanent("boom", "bad record"))
            } else {
                Ok(n)
            }
        })
    });
    let sink = g.add_sink("devnull", || sink_fn(|_: i64| {}));
    g.connect(&src, &boom);
    g.connect(&boom, &sink);
    let plan = g.build().expect("plan should build");

    let result = Engine::new()
        .run(&plan, Arc::new(ExecutionContext::new()))
        .await;
    let err = result.error.expect("pipeline must fail");
    assert_eq!(err.kind(), ErrorKind::PermanentRemote);
    assert!(err.to_string().contains("boom"));
}

#[tokio::test]
async fn self_join_through_broadcast() {
    struct SelfJoin;
    impl Join<i64, i64> for SelfJoin {
        type Key = i64;
        type Out = i64;
        fn key_left(&self, l: &i64) -> i64 {
            *l
        }
        fn key_right(&self, r: &i64) -> i64 {
            *r
        }
        fn combine(&mut self, l: &i64, r: &i64) -> flowline_core::Result<i64> {
            Ok(l + r)
        }
    }

    let results = Arc::new(Mutex::new(Vec::new()));
    let sink_results = results.clone();
    let mut g = GraphBuilder::new();
    let src = g.add_source("numbers", || source_iter(1i64..=3));
    let fan = g.add_broadcast::<i64>("fan", 2);
    let join = g.add_join("pair", || SelfJoin);
    let sink = g.add_sink("collect", move || collect_sink(sink_results.clone()));
    g.connect(&src, &fan);
    g.connect(&fan.output(0), &join.left());
    g.connect(&fan.output(1), &join.right());
    g.connect(&join, &sink);
    run_ok(g).await;

    let mut got = results.lock().clone();
    got.sort();
    assert_eq!(got, vec![2i64, 4, 6]);
}

#[tokio::test]
async fn paced_source_interleaves_periodic_watermarks() {
    use flowline_core::PeriodicWatermarks;

    let marks = Arc::new(AtomicUsize::new(0));
    let marks_seen = marks.clone();

    struct CountMarks(Arc<AtomicUsize>);

    #[async_trait]
    impl StreamTransform<i64, i64> for CountMarks {
        async fn run(
            &mut self,
            input: &mut StreamReader<i64>,
            out: &mut StreamWriter<i64>,
            _ctx: &NodeContext,
        ) -> flowline_core::Result<()> {
            loop {
                match input.consume().await? {
                    StreamMessage::Event(StreamEvent::Item(v)) => out.produce(v).await?,
                    StreamMessage::Event(StreamEvent::Timestamped(v, at)) => {
                        out.produce_at(v, at).await?
                    }
                    StreamMessage::Event(StreamEvent::Watermark(w)) => {
                        self.0.fetch_add(1, Ordering::SeqCst);
                        out.watermark(w).await?;
                    }
                    StreamMessage::EndOfStream => return Ok(()),
                }
            }
        }
    }

    let results = Arc::new(Mutex::new(Vec::new()));
    let sink_results = results.clone();
    let mut g = GraphBuilder::new();
    let src = g.add_source("live", move || {
        paced_source(
            (0..5i64).map(|i| (i, ts(i * 1_000))).collect::<Vec<_>>(),
            Duration::from_millis(1),
            // Zero interval: a marker is due after every item.
            PeriodicWatermarks::new(Duration::ZERO, Duration::ZERO),
        )
    });
    let count = g.add_raw_transform("count_marks", move || CountMarks(marks_seen.clone()));
    let sink = g.add_sink("collect", move || collect_sink(sink_results.clone()));
    g.connect(&src, &count);
    g.connect(&count, &sink);
    run_ok(g).await;

    assert_eq!(results.lock().clone(), vec![0i64, 1, 2, 3, 4]);
    assert_eq!(marks.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn preconfigured_instance_is_consumed_by_first_run() {
    let mut g = GraphBuilder::new();
    let src = g.add_source_instance("seed", source_iter(vec![1i64, 2, 3]));
    let sink = g.add_sink("devnull", || sink_fn(|_: i64| {}));
    g.connect(&src, &sink);
    let plan = g.build().expect("plan should build");

    let engine = Engine::new();
    let first = engine.run(&plan, Arc::new(ExecutionContext::new())).await;
    assert!(first.is_success());

    // The bound instance is gone; a second run reports a programmer
    // error instead of silently producing nothing.
    let second = engine.run(&plan, Arc::new(ExecutionContext::new())).await;
    let err = second.error.expect("second run must fail");
    assert_eq!(err.kind(), ErrorKind::Programmer);
}

struct SleepySink;

#[async_trait]
impl Sink<i64> for SleepySink {
    async fn on_item(&mut self, _item: i64, _ctx: &NodeContext) -> flowline_core::Result<()> {
        // Deliberately ignores cancellation.
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }
}

struct ProduceThenFail;

#[async_trait]
impl Source<i64> for ProduceThenFail {
    async fn run(
        &mut self,
        out: &mut StreamWriter<i64>,
        ctx: &NodeContext,
    ) -> flowline_core::Result<()> {
        out.produce(1).await?;
        Err(FlowError::permanent(ctx.node_name(), "upstream gone"))
    }
}

#[tokio::test]
async fn shutdown_deadline_bounds_unresponsive_nodes() {
    let mut g = GraphBuilder::new();
    let src = g.add_source("failing", || ProduceThenFail);
    let sink = g.add_sink("sleepy", || SleepySink);
    g.connect(&src, &sink);
    let plan = g.build().expect("plan should build");

    let engine = Engine::with_options(EngineOptions {
        shutdown_deadline: Duration::from_millis(100),
    });
    let started = std::time::Instant::now();
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        engine.run(&plan, Arc::new(ExecutionContext::new())),
    )
    .await
    .expect("deadline must bound the drain");
    assert!(started.elapsed() < Duration::from_secs(5));
    let err = result.error.expect("run must report the source failure");
    assert_eq!(err.kind(), ErrorKind::PermanentRemote);
}

#[tokio::test]
async fn dropped_items_do_not_fail_the_node() {
    let results = Arc::new(Mutex::new(Vec::new()));
    let sink_results = results.clone();

    let mut g = GraphBuilder::new();
    let src = g.add_source("numbers", || source_iter(0i64..10));
    let picky = g.add_transform("picky", || {
        try_map_fn(|n: i64| {
            if n % 2 == 0 {
                Ok(n)
            } else {
                Err(FlowError::validation("picky", "odd input"))
            }
        })
    });
    g.with_retry(&picky, RetryOptions::new(1).continue_on_error(true));
    let sink = g.add_sink("collect", move || collect_sink(sink_results.clone()));
    g.connect(&src, &picky);
    g.connect(&picky, &sink);
    let result = run_ok(g).await;

    assert_eq!(results.lock().clone(), vec![0i64, 2, 4, 6, 8]);
    assert_eq!(result.metrics.get("picky", counter::DROPPED), 5);
}
