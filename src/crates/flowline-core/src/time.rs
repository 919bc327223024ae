//! Event-time primitives: timestamps and watermarks.
//!
//! All time semantics in flowline are event-time. An [`EventTime`] is an
//! absolute instant with millisecond precision and a zone offset; the wall
//! clock only matters to the periodic watermark generator. A [`Watermark`]
//! is a monotonically non-decreasing threshold carried in-band on a stream:
//! once a watermark `W` has been observed, no item with event-time `<= W`
//! will appear on that stream again.

use chrono::{DateTime, FixedOffset, TimeZone, Utc};

/// Absolute instant with millisecond precision and a zone offset.
pub type EventTime = DateTime<FixedOffset>;

/// Earliest representable instant. Watermarks start here.
pub fn min_instant() -> EventTime {
    DateTime::<Utc>::MIN_UTC.fixed_offset()
}

/// Latest representable instant. Equivalent to end-of-stream.
pub fn max_instant() -> EventTime {
    DateTime::<Utc>::MAX_UTC.fixed_offset()
}

/// Build an [`EventTime`] from milliseconds since the Unix epoch (UTC).
///
/// Out-of-range values clamp to the representable extremes.
pub fn from_epoch_ms(ms: i64) -> EventTime {
    match Utc.timestamp_millis_opt(ms) {
        chrono::LocalResult::Single(dt) => dt.fixed_offset(),
        _ if ms < 0 => min_instant(),
        _ => max_instant(),
    }
}

/// Milliseconds since the Unix epoch for `t`.
pub fn epoch_ms(t: EventTime) -> i64 {
    t.timestamp_millis()
}

/// A monotone event-time threshold.
///
/// The initial watermark of every stream is [`Watermark::minimum`]; the
/// final watermark, implied by end-of-stream, is [`Watermark::maximum`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark(EventTime);

impl Watermark {
    pub fn new(at: EventTime) -> Self {
        Watermark(at)
    }

    /// The initial watermark: the minimum representable instant.
    pub fn minimum() -> Self {
        Watermark(min_instant())
    }

    /// The final watermark: no further items can follow it.
    pub fn maximum() -> Self {
        Watermark(max_instant())
    }

    pub fn from_epoch_ms(ms: i64) -> Self {
        Watermark(from_epoch_ms(ms))
    }

    pub fn time(&self) -> EventTime {
        self.0
    }

    pub fn epoch_ms(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// True once this watermark equals the final (+infinity) watermark.
    pub fn is_final(&self) -> bool {
        self.0 == max_instant()
    }

    /// An item with event-time `ts` is late when `ts < self`.
    pub fn is_late(&self, ts: EventTime) -> bool {
        ts < self.0
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_final() {
            write!(f, "watermark(+inf)")
        } else if *self == Watermark::minimum() {
            write!(f, "watermark(-inf)")
        } else {
            write!(f, "watermark({})", self.0.to_rfc3339())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_round_trip() {
        let t = from_epoch_ms(1_700_000_123_456);
        assert_eq!(epoch_ms(t), 1_700_000_123_456);
    }

    #[test]
    fn extremes_are_ordered() {
        assert!(min_instant() < from_epoch_ms(0));
        assert!(from_epoch_ms(0) < max_instant());
    }

    #[test]
    fn watermark_lateness() {
        let w = Watermark::from_epoch_ms(1_000);
        assert!(w.is_late(from_epoch_ms(999)));
        assert!(!w.is_late(from_epoch_ms(1_000)));
        assert!(!w.is_late(from_epoch_ms(1_001)));
    }

    #[test]
    fn minimum_is_not_final() {
        assert!(!Watermark::minimum().is_final());
        assert!(Watermark::maximum().is_final());
    }
}
