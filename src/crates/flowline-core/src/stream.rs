//! Typed streams: the edges of the dataflow graph.
//!
//! A stream is a lazy, single-producer/single-consumer sequence of
//! [`StreamEvent`]s delivered through a bounded FIFO channel. The buffer
//! policy is *block the producer*: when the buffer is full, `produce`
//! suspends until the consumer drains an item. Drop policies are not
//! supported.
//!
//! Watermarks travel in-band as out-of-band markers interleaved with
//! items; the writer clamps them so the delivered sequence is always
//! non-decreasing. End-of-stream (the producer dropping its endpoint, or
//! an explicit [`StreamWriter::close`]) is equivalent to the final
//! watermark `+inf`.
//!
//! ```text
//!  producer ──produce──▶ [ bounded FIFO (default 64) ] ──consume──▶ consumer
//!                        items · watermarks · close(err?)
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::error::FlowError;
use crate::time::{EventTime, Watermark};

/// Marker trait for stream element types.
pub trait Data: Clone + Send + 'static {}
impl<T: Clone + Send + 'static> Data for T {}

/// Marker trait for key types used by keyed operators.
pub trait Key: Clone + Eq + Ord + std::hash::Hash + Send + 'static {}
impl<T: Clone + Eq + Ord + std::hash::Hash + Send + 'static> Key for T {}

/// Default per-edge buffer capacity.
pub const DEFAULT_CAPACITY: usize = 64;

/// One element of a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent<T> {
    /// A plain item.
    Item(T),
    /// An item carrying its event-time stamp.
    Timestamped(T, EventTime),
    /// A watermark marker: no later event on this stream will carry an
    /// event-time at or before it.
    Watermark(Watermark),
}

impl<T> StreamEvent<T> {
    /// The event-time stamp, if the event carries one.
    pub fn event_time(&self) -> Option<EventTime> {
        match self {
            StreamEvent::Timestamped(_, t) => Some(*t),
            _ => None,
        }
    }

    /// Map the payload type, preserving timestamps and watermarks.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StreamEvent<U> {
        match self {
            StreamEvent::Item(v) => StreamEvent::Item(f(v)),
            StreamEvent::Timestamped(v, t) => StreamEvent::Timestamped(f(v), t),
            StreamEvent::Watermark(w) => StreamEvent::Watermark(w),
        }
    }
}

/// What a consumer sees on each call to [`StreamReader::consume`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage<T> {
    Event(StreamEvent<T>),
    /// The producer finished cleanly and the buffer is drained.
    EndOfStream,
}

/// Stream identity and static properties.
#[derive(Debug, Clone)]
pub struct StreamSpec {
    pub name: String,
    /// Element type name, for diagnostics.
    pub element: &'static str,
    pub is_keyed: bool,
    pub is_timestamped: bool,
    pub is_finite: bool,
}

impl StreamSpec {
    pub fn new<T>(name: impl Into<String>) -> Self {
        StreamSpec {
            name: name.into(),
            element: std::any::type_name::<T>(),
            is_keyed: false,
            is_timestamped: false,
            is_finite: true,
        }
    }

    pub fn keyed(mut self) -> Self {
        self.is_keyed = true;
        self
    }

    pub fn timestamped(mut self) -> Self {
        self.is_timestamped = true;
        self
    }

    pub fn unbounded(mut self) -> Self {
        self.is_finite = false;
        self
    }
}

type Payload<T> = std::result::Result<StreamEvent<T>, FlowError>;

/// Create a bounded stream channel.
///
/// `capacity` must be non-zero; the graph builder rejects zero-capacity
/// edges before any channel is created.
pub fn channel<T: Data>(
    spec: StreamSpec,
    capacity: usize,
    cancel: CancellationToken,
) -> (StreamWriter<T>, StreamReader<T>) {
    debug_assert!(capacity > 0, "stream buffer capacity must be non-zero");
    let spec = Arc::new(spec);
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        StreamWriter {
            tx,
            spec: spec.clone(),
            cancel: cancel.clone(),
            last_watermark: Watermark::minimum(),
            produced: 0,
        },
        StreamReader {
            rx,
            spec,
            cancel,
            watermark: Watermark::minimum(),
            consumed: 0,
            done: false,
        },
    )
}

/// Producing endpoint of a stream.
pub struct StreamWriter<T> {
    tx: mpsc::Sender<Payload<T>>,
    spec: Arc<StreamSpec>,
    cancel: CancellationToken,
    last_watermark: Watermark,
    produced: u64,
}

impl<T: Data> StreamWriter<T> {
    /// Append an item. Suspends while the buffer is full (backpressure)
    /// and observes cancellation at that suspension point.
    pub async fn produce(&mut self, item: T) -> crate::error::Result<()> {
        self.send(StreamEvent::Item(item)).await
    }

    /// Append an item with its event-time stamp.
    pub async fn produce_at(&mut self, item: T, at: EventTime) -> crate::error::Result<()> {
        self.send(StreamEvent::Timestamped(item, at)).await
    }

    /// Like [`produce`](Self::produce), but gives up after `timeout` with
    /// an [`ErrorKind::BackpressureTimeout`](crate::error::ErrorKind)
    /// error instead of blocking indefinitely.
    pub async fn produce_within(&mut self, item: T, timeout: Duration) -> crate::error::Result<()> {
        match tokio::time::timeout(timeout, self.produce(item)).await {
            Ok(res) => res,
            Err(_) => Err(FlowError::backpressure(
                self.spec.name.clone(),
                format!("produce blocked longer than {timeout:?}"),
            )),
        }
    }

    /// Emit a watermark. Regressing watermarks are silently clamped so the
    /// delivered sequence stays non-decreasing.
    pub async fn watermark(&mut self, w: Watermark) -> crate::error::Result<()> {
        if w <= self.last_watermark {
            return Ok(());
        }
        self.last_watermark = w;
        self.raw_send(StreamEvent::Watermark(w)).await
    }

    /// The latest watermark emitted on this stream.
    pub fn current_watermark(&self) -> Watermark {
        self.last_watermark
    }

    /// Number of items produced so far (watermarks excluded).
    pub fn produced(&self) -> u64 {
        self.produced
    }

    pub fn spec(&self) -> &StreamSpec {
        &self.spec
    }

    async fn send(&mut self, ev: StreamEvent<T>) -> crate::error::Result<()> {
        self.raw_send(ev).await?;
        self.produced += 1;
        Ok(())
    }

    async fn raw_send(&mut self, ev: StreamEvent<T>) -> crate::error::Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(FlowError::Cancelled),
            sent = self.tx.send(Ok(ev)) => sent.map_err(|_| FlowError::StreamClosed {
                stream: self.spec.name.clone(),
            }),
        }
    }

    /// Terminate the stream. With an error, the consumer's next `consume`
    /// surfaces it; without, the consumer sees end-of-stream once the
    /// buffer drains.
    pub async fn close(self, error: Option<FlowError>) {
        if let Some(e) = error {
            // Best effort: if the consumer is already gone there is nobody
            // left to tell.
            let _ = self.tx.send(Err(e)).await;
        }
        // Dropping the sender is the end-of-stream signal.
    }
}

/// Consuming endpoint of a stream.
pub struct StreamReader<T> {
    rx: mpsc::Receiver<Payload<T>>,
    spec: Arc<StreamSpec>,
    cancel: CancellationToken,
    watermark: Watermark,
    consumed: u64,
    done: bool,
}

impl<T: Data> StreamReader<T> {
    /// Yield the next event, end-of-stream, or the error the producer
    /// closed with. Suspends while the buffer is empty and observes
    /// cancellation at that suspension point.
    ///
    /// After end-of-stream (or an error) has been returned once, further
    /// calls keep returning end-of-stream.
    pub async fn consume(&mut self) -> crate::error::Result<StreamMessage<T>> {
        if self.done {
            return Ok(StreamMessage::EndOfStream);
        }
        let received = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(FlowError::Cancelled),
            msg = self.rx.recv() => msg,
        };
        match received {
            None => {
                self.done = true;
                self.watermark = Watermark::maximum();
                Ok(StreamMessage::EndOfStream)
            }
            Some(Ok(ev)) => {
                if let StreamEvent::Watermark(w) = &ev {
                    if *w > self.watermark {
                        self.watermark = *w;
                    }
                } else {
                    self.consumed += 1;
                }
                Ok(StreamMessage::Event(ev))
            }
            Some(Err(e)) => {
                self.done = true;
                self.watermark = Watermark::maximum();
                Err(e)
            }
        }
    }

    /// The latest watermark observed on this stream. End-of-stream counts
    /// as the final watermark.
    pub fn watermark(&self) -> Watermark {
        self.watermark
    }

    /// Number of items consumed so far (watermarks excluded).
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn spec(&self) -> &StreamSpec {
        &self.spec
    }

    /// Adapt the raw channel into a `futures::Stream` of payloads, for
    /// driver-style operators that prefer combinators.
    pub fn into_event_stream(self) -> ReceiverStream<Payload<T>> {
        ReceiverStream::new(self.rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::from_epoch_ms;

    fn spec(name: &str) -> StreamSpec {
        StreamSpec::new::<u32>(name)
    }

    #[tokio::test]
    async fn fifo_order_preserved() {
        let (mut w, mut r) = channel::<u32>(spec("fifo"), 8, CancellationToken::new());
        tokio::spawn(async move {
            for i in 0..5 {
                w.produce(i).await.unwrap();
            }
            w.close(None).await;
        });
        let mut seen = Vec::new();
        loop {
            match r.consume().await.unwrap() {
                StreamMessage::Event(StreamEvent::Item(i)) => seen.push(i),
                StreamMessage::Event(_) => {}
                StreamMessage::EndOfStream => break,
            }
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn backpressure_blocks_producer() {
        let (mut w, mut r) = channel::<u32>(spec("bp"), 2, CancellationToken::new());
        w.produce(1).await.unwrap();
        w.produce(2).await.unwrap();
        // Buffer is full; the next produce must not complete until the
        // consumer drains.
        let blocked = tokio::time::timeout(Duration::from_millis(20), w.produce(3)).await;
        assert!(blocked.is_err(), "produce should block on a full buffer");
        assert!(matches!(
            r.consume().await.unwrap(),
            StreamMessage::Event(StreamEvent::Item(1))
        ));
        w.produce(3).await.unwrap();
    }

    #[tokio::test]
    async fn produce_within_times_out() {
        let (mut w, _r) = channel::<u32>(spec("bpt"), 1, CancellationToken::new());
        w.produce(1).await.unwrap();
        let err = w
            .produce_within(2, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BackpressureTimeout);
    }

    #[tokio::test]
    async fn watermarks_never_regress() {
        let (mut w, mut r) = channel::<u32>(spec("wm"), 8, CancellationToken::new());
        w.watermark(Watermark::from_epoch_ms(100)).await.unwrap();
        w.watermark(Watermark::from_epoch_ms(50)).await.unwrap(); // clamped
        w.watermark(Watermark::from_epoch_ms(200)).await.unwrap();
        w.close(None).await;

        let mut marks = Vec::new();
        loop {
            match r.consume().await.unwrap() {
                StreamMessage::Event(StreamEvent::Watermark(w)) => marks.push(w.epoch_ms()),
                StreamMessage::Event(_) => {}
                StreamMessage::EndOfStream => break,
            }
        }
        assert_eq!(marks, vec![100, 200]);
        assert!(r.watermark().is_final());
    }

    #[tokio::test]
    async fn close_with_error_surfaces_once() {
        let (w, mut r) = channel::<u32>(spec("err"), 4, CancellationToken::new());
        w.close(Some(FlowError::permanent("up", "boom"))).await;
        let err = r.consume().await.unwrap_err();
        assert!(err.to_string().contains("boom"));
        // Subsequent calls report end-of-stream.
        assert_eq!(r.consume().await.unwrap(), StreamMessage::EndOfStream);
    }

    #[tokio::test]
    async fn cancellation_unblocks_both_ends() {
        let cancel = CancellationToken::new();
        let (mut w, mut r) = channel::<u32>(spec("cancel"), 1, cancel.clone());
        w.produce(1).await.unwrap();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        // Producer blocked on full buffer observes cancellation.
        let err = w.produce(2).await.unwrap_err();
        assert!(err.is_cancellation());
        // The reader observes the token at its next suspension point too.
        let err = r.consume().await.unwrap_err();
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn timestamps_travel_with_items() {
        let (mut w, mut r) = channel::<u32>(spec("ts"), 4, CancellationToken::new());
        let t = from_epoch_ms(42);
        w.produce_at(7, t).await.unwrap();
        w.close(None).await;
        match r.consume().await.unwrap() {
            StreamMessage::Event(StreamEvent::Timestamped(v, at)) => {
                assert_eq!(v, 7);
                assert_eq!(at, t);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
