//! Time windows and window assignment.
//!
//! Assignment is pure: given an event-time, [`WindowAssigner::assign`]
//! returns the windows the item belongs to. Session windows are seeded
//! here as `[t, t + gap)` and grown/merged by the stateful operators that
//! own per-key session state.

use std::time::Duration;

use crate::time::{from_epoch_ms, EventTime, Watermark};

/// A half-open event-time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Window {
    start_ms: i64,
    end_ms: i64,
}

impl Window {
    pub fn new(start: EventTime, end: EventTime) -> Self {
        Window {
            start_ms: start.timestamp_millis(),
            end_ms: end.timestamp_millis(),
        }
    }

    pub fn from_epoch_ms(start_ms: i64, end_ms: i64) -> Self {
        Window { start_ms, end_ms }
    }

    pub fn start(&self) -> EventTime {
        from_epoch_ms(self.start_ms)
    }

    pub fn end(&self) -> EventTime {
        from_epoch_ms(self.end_ms)
    }

    pub fn start_ms(&self) -> i64 {
        self.start_ms
    }

    pub fn end_ms(&self) -> i64 {
        self.end_ms
    }

    pub fn contains(&self, at: EventTime) -> bool {
        let ms = at.timestamp_millis();
        self.start_ms <= ms && ms < self.end_ms
    }

    /// Whether the watermark has passed `end + allowed_lateness`.
    pub fn is_closed_at(&self, watermark: Watermark, allowed_lateness: Duration) -> bool {
        let deadline = self.end_ms.saturating_add(allowed_lateness.as_millis() as i64);
        watermark.is_final() || watermark.epoch_ms() >= deadline
    }
}

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start_ms, self.end_ms)
    }
}

/// What to do with an item whose event-time is behind the operator clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LatePolicy {
    /// Drop the item and bump the node's `late_dropped` counter.
    #[default]
    Drop,
    /// Treat the item as an input-validation failure, subject to the
    /// node's `continue_on_error` setting.
    Fail,
}

/// Pure window assignment strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowAssigner {
    /// Aligned windows `[n*size, (n+1)*size)`; each item lands in exactly
    /// one.
    Tumbling { size: Duration },
    /// Windows of `size`, starting every `slide`; each item lands in
    /// `ceil(size / slide)` windows.
    Sliding { size: Duration, slide: Duration },
    /// Per-key window seeded as `[t, t + gap)` and extended while items
    /// keep arriving within `gap`.
    Session { gap: Duration },
}

impl WindowAssigner {
    pub fn tumbling(size: Duration) -> Self {
        assert!(!size.is_zero(), "tumbling window size must be > 0");
        WindowAssigner::Tumbling { size }
    }

    pub fn sliding(size: Duration, slide: Duration) -> Self {
        assert!(!size.is_zero(), "sliding window size must be > 0");
        assert!(!slide.is_zero(), "sliding window slide must be > 0");
        assert!(slide <= size, "slide must not exceed window size");
        WindowAssigner::Sliding { size, slide }
    }

    pub fn session(gap: Duration) -> Self {
        assert!(!gap.is_zero(), "session gap must be > 0");
        WindowAssigner::Session { gap }
    }

    pub fn is_session(&self) -> bool {
        matches!(self, WindowAssigner::Session { .. })
    }

    /// The windows an item with event-time `at` belongs to, in ascending
    /// start order.
    pub fn assign(&self, at: EventTime) -> Vec<Window> {
        let ms = at.timestamp_millis();
        match *self {
            WindowAssigner::Tumbling { size } => {
                let size = size.as_millis() as i64;
                let start = ms.div_euclid(size) * size;
                vec![Window::from_epoch_ms(start, start + size)]
            }
            WindowAssigner::Sliding { size, slide } => {
                let size = size.as_millis() as i64;
                let slide = slide.as_millis() as i64;
                let last_start = ms - ms.rem_euclid(slide);
                let mut windows = Vec::new();
                let mut start = last_start;
                while start + size > ms {
                    windows.push(Window::from_epoch_ms(start, start + size));
                    start -= slide;
                }
                windows.reverse();
                windows
            }
            WindowAssigner::Session { gap } => {
                let gap = gap.as_millis() as i64;
                vec![Window::from_epoch_ms(ms, ms + gap)]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: i64) -> EventTime {
        from_epoch_ms(ms)
    }

    #[test]
    fn tumbling_assigns_exactly_one() {
        let a = WindowAssigner::tumbling(Duration::from_millis(10));
        assert_eq!(a.assign(at(0)), vec![Window::from_epoch_ms(0, 10)]);
        assert_eq!(a.assign(at(9)), vec![Window::from_epoch_ms(0, 10)]);
        assert_eq!(a.assign(at(10)), vec![Window::from_epoch_ms(10, 20)]);
        // Pre-epoch timestamps align correctly as well.
        assert_eq!(a.assign(at(-1)), vec![Window::from_epoch_ms(-10, 0)]);
    }

    #[test]
    fn sliding_assigns_overlapping_windows() {
        let a = WindowAssigner::sliding(Duration::from_millis(10), Duration::from_millis(5));
        let windows = a.assign(at(12));
        assert_eq!(
            windows,
            vec![Window::from_epoch_ms(5, 15), Window::from_epoch_ms(10, 20)]
        );
        for w in &windows {
            assert!(w.contains(at(12)));
        }
    }

    #[test]
    fn sliding_equal_slide_degenerates_to_tumbling() {
        let a = WindowAssigner::sliding(Duration::from_millis(10), Duration::from_millis(10));
        assert_eq!(a.assign(at(25)), vec![Window::from_epoch_ms(20, 30)]);
    }

    #[test]
    fn session_seeds_gap_window() {
        let a = WindowAssigner::session(Duration::from_millis(30));
        assert_eq!(a.assign(at(100)), vec![Window::from_epoch_ms(100, 130)]);
    }

    #[test]
    fn closure_honors_allowed_lateness() {
        let w = Window::from_epoch_ms(0, 10);
        let late = Duration::from_millis(5);
        assert!(!w.is_closed_at(Watermark::from_epoch_ms(14), late));
        assert!(w.is_closed_at(Watermark::from_epoch_ms(15), late));
        assert!(w.is_closed_at(Watermark::maximum(), late));
    }
}
