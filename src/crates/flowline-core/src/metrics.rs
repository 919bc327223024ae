//! Per-run counters.
//!
//! Every node increments a small set of named counters; the engine hands
//! a snapshot back in the pipeline result. Counter names are stable
//! strings in [`counter`].

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;

/// Stable counter names.
pub mod counter {
    pub const ITEMS_IN: &str = "items_in";
    pub const ITEMS_OUT: &str = "items_out";
    pub const RETRIES: &str = "retries";
    /// Items dropped under `continue_on_error`.
    pub const DROPPED: &str = "dropped";
    /// Late items dropped by windowed operators.
    pub const LATE_DROPPED: &str = "late_dropped";
    /// Left-side items that never matched in a join.
    pub const UNMATCHED_LEFT: &str = "unmatched_left";
    /// Right-side items that never matched in a join.
    pub const UNMATCHED_RIGHT: &str = "unmatched_right";
    /// Calls rejected by an open circuit breaker.
    pub const FAST_FAILED: &str = "fast_failed";
    /// Items observed by a tap's side sink.
    pub const SIDE_ITEMS: &str = "side_items";
}

/// Shared counter registry for one pipeline run.
#[derive(Clone, Default)]
pub struct RunMetrics {
    counters: Arc<DashMap<(String, &'static str), u64>>,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, node: &str, name: &'static str) {
        self.add(node, name, 1);
    }

    pub fn add(&self, node: &str, name: &'static str, delta: u64) {
        if delta == 0 {
            return;
        }
        *self
            .counters
            .entry((node.to_string(), name))
            .or_insert(0) += delta;
    }

    pub fn get(&self, node: &str, name: &'static str) -> u64 {
        self.counters
            .get(&(node.to_string(), name))
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// Ordered copy of all counters, grouped by node.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut nodes: BTreeMap<String, BTreeMap<&'static str, u64>> = BTreeMap::new();
        for entry in self.counters.iter() {
            let (node, name) = entry.key();
            nodes
                .entry(node.clone())
                .or_default()
                .insert(*name, *entry.value());
        }
        MetricsSnapshot { nodes }
    }
}

/// Immutable counter snapshot taken at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    nodes: BTreeMap<String, BTreeMap<&'static str, u64>>,
}

impl MetricsSnapshot {
    pub fn get(&self, node: &str, name: &str) -> u64 {
        self.nodes
            .get(node)
            .and_then(|c| c.get(name))
            .copied()
            .unwrap_or(0)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&str, &BTreeMap<&'static str, u64>)> {
        self.nodes.iter().map(|(n, c)| (n.as_str(), c))
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
