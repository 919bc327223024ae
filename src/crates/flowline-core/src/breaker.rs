//! Per-node circuit breakers and the process-wide breaker manager.
//!
//! State machine:
//!
//! ```text
//!            failures >= threshold (within window)
//!   Closed ───────────────────────────────────────▶ Open(since)
//!      ▲                                               │
//!      │ all probes succeed              open_duration │ elapses
//!      │                                               ▼
//!      └─────────────────────────────────────────── HalfOpen
//!                         any probe fails ──▶ back to Open (timer reset)
//! ```
//!
//! While open, calls fast-fail with a breaker-open error without invoking
//! user code. Each breaker's transitions are guarded by a mutex, so they
//! are linearizable; the manager is a process-wide concurrent map with
//! (max-size, inactivity) eviction so breaker state survives across runs
//! of the same pipeline.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

/// Circuit-breaker configuration, per node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerOptions {
    pub enabled: bool,
    /// Consecutive failures (within `failure_window`) that trip the
    /// breaker.
    pub failure_threshold: usize,
    /// How long the breaker stays open before probing.
    pub open_duration: Duration,
    /// Number of probe calls admitted while half-open.
    pub half_open_probe_count: usize,
    /// Sliding window over which consecutive failures are counted.
    pub failure_window: Duration,
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        CircuitBreakerOptions {
            enabled: true,
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            half_open_probe_count: 1,
            failure_window: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerOptions {
    pub fn new(failure_threshold: usize, open_duration: Duration) -> Self {
        CircuitBreakerOptions {
            failure_threshold: failure_threshold.max(1),
            open_duration,
            ..Default::default()
        }
    }

    pub fn with_probe_count(mut self, probes: usize) -> Self {
        self.half_open_probe_count = probes.max(1);
        self
    }

    pub fn with_failure_window(mut self, window: Duration) -> Self {
        self.failure_window = window;
        self
    }

    pub fn disabled() -> Self {
        CircuitBreakerOptions {
            enabled: false,
            ..Default::default()
        }
    }
}

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

enum Inner {
    Closed {
        failures: VecDeque<Instant>,
    },
    Open {
        since: Instant,
    },
    HalfOpen {
        admitted: usize,
        succeeded: usize,
    },
}

/// A single node's circuit breaker.
pub struct CircuitBreaker {
    opts: CircuitBreakerOptions,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(opts: CircuitBreakerOptions) -> Self {
        CircuitBreaker {
            opts,
            inner: Mutex::new(Inner::Closed {
                failures: VecDeque::new(),
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        match &*self.inner.lock() {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Ask to make a call. `false` means fast-fail without invoking user
    /// code. An open breaker whose timer has elapsed flips to half-open
    /// and admits probes.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        match &mut *inner {
            Inner::Closed { .. } => true,
            Inner::Open { since } => {
                if since.elapsed() >= self.opts.open_duration {
                    *inner = Inner::HalfOpen {
                        admitted: 1,
                        succeeded: 0,
                    };
                    true
                } else {
                    false
                }
            }
            Inner::HalfOpen { admitted, .. } => {
                if *admitted < self.opts.half_open_probe_count {
                    *admitted += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match &mut *inner {
            Inner::Closed { failures } => failures.clear(),
            Inner::HalfOpen { succeeded, .. } => {
                *succeeded += 1;
                if *succeeded >= self.opts.half_open_probe_count {
                    *inner = Inner::Closed {
                        failures: VecDeque::new(),
                    };
                }
            }
            Inner::Open { .. } => {}
        }
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match &mut *inner {
            Inner::Closed { failures } => {
                failures.push_back(now);
                while let Some(front) = failures.front() {
                    if now.duration_since(*front) > self.opts.failure_window {
                        failures.pop_front();
                    } else {
                        break;
                    }
                }
                if failures.len() >= self.opts.failure_threshold {
                    *inner = Inner::Open { since: now };
                }
            }
            // Any half-open failure reopens with a fresh timer.
            Inner::HalfOpen { .. } => *inner = Inner::Open { since: now },
            Inner::Open { .. } => {}
        }
    }
}

/// Process-wide registry of breakers, keyed by node id.
///
/// Entries are evicted by size (least-recently-used first) and by
/// inactivity, so long-lived processes running many distinct pipelines do
/// not accumulate state without bound.
pub struct BreakerManager {
    entries: DashMap<String, Arc<Entry>>,
    max_size: usize,
    inactivity: Duration,
}

struct Entry {
    breaker: Arc<CircuitBreaker>,
    last_used: Mutex<Instant>,
}

const DEFAULT_MANAGER_CAPACITY: usize = 1024;
const DEFAULT_INACTIVITY: Duration = Duration::from_secs(30 * 60);

static GLOBAL: OnceLock<BreakerManager> = OnceLock::new();

impl BreakerManager {
    pub fn new(max_size: usize, inactivity: Duration) -> Self {
        BreakerManager {
            entries: DashMap::new(),
            max_size: max_size.max(1),
            inactivity,
        }
    }

    /// The process-wide manager used by the engine.
    pub fn global() -> &'static BreakerManager {
        GLOBAL.get_or_init(|| BreakerManager::new(DEFAULT_MANAGER_CAPACITY, DEFAULT_INACTIVITY))
    }

    /// Fetch or create the breaker for `id`. The breaker keeps its state
    /// across runs until evicted.
    pub fn acquire(&self, id: &str, opts: &CircuitBreakerOptions) -> Arc<CircuitBreaker> {
        if let Some(entry) = self.entries.get(id) {
            *entry.last_used.lock() = Instant::now();
            return entry.breaker.clone();
        }
        self.evict();
        let entry = Arc::new(Entry {
            breaker: Arc::new(CircuitBreaker::new(opts.clone())),
            last_used: Mutex::new(Instant::now()),
        });
        let breaker = entry.breaker.clone();
        self.entries.insert(id.to_string(), entry);
        breaker
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict(&self) {
        let now = Instant::now();
        // Inactivity pass.
        self.entries
            .retain(|_, e| now.duration_since(*e.last_used.lock()) <= self.inactivity);
        // Size pass: drop the least recently used until under the cap.
        while self.entries.len() >= self.max_size {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| *e.value().last_used.lock())
                .map(|e| e.key().clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}
