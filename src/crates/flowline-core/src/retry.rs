//! Per-node retry policies with backoff.
//!
//! A [`RetryOptions`] record governs how the engine wraps each per-item
//! call into a node: how an error is classified, how many attempts are
//! made, how long to back off between them, and whether an unrecovered
//! item failure drops the item or fails the node.
//!
//! Backoff timing only covers the user call. Time a node spends blocked
//! on `produce` (backpressure) never counts against the retry budget,
//! because the retry wrapper sits strictly inside the drive loop, before
//! the produce.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{ErrorKind, FlowError};

/// Extra backoff multiplier applied to backpressure timeouts, which
/// deserve a longer pause than plain transient failures.
const BACKPRESSURE_FACTOR: u32 = 4;

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffStrategy {
    /// Same delay every attempt.
    Fixed,
    /// Delay multiplied by `factor` after each attempt.
    Exponential { factor: f64 },
    /// Exponential growth with a random 0.5x..1.5x jitter factor.
    ExponentialJitter { factor: f64 },
}

/// Classifies an error for the retry decision. Defaults to the error's
/// own [`ErrorKind`].
pub type RetryPredicate = Arc<dyn Fn(&FlowError) -> ErrorKind + Send + Sync>;

/// Per-node fault-tolerance configuration.
#[derive(Clone)]
pub struct RetryOptions {
    /// Total attempts, including the first. Always at least 1.
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub strategy: BackoffStrategy,
    /// Optional override of the default error classification.
    pub predicate: Option<RetryPredicate>,
    /// When true, a permanent per-item failure is logged and the item is
    /// dropped; when false, it fails the node.
    pub continue_on_error: bool,
}

impl std::fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_attempts", &self.max_attempts)
            .field("initial_backoff", &self.initial_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("strategy", &self.strategy)
            .field("predicate", &self.predicate.as_ref().map(|_| "<fn>"))
            .field("continue_on_error", &self.continue_on_error)
            .finish()
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        RetryOptions {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
            strategy: BackoffStrategy::ExponentialJitter { factor: 2.0 },
            predicate: None,
            continue_on_error: false,
        }
    }
}

impl RetryOptions {
    pub fn new(max_attempts: usize) -> Self {
        RetryOptions {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// A policy that never retries and never drops.
    pub fn none() -> Self {
        RetryOptions {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_initial_backoff(mut self, d: Duration) -> Self {
        self.initial_backoff = d;
        self
    }

    pub fn with_max_backoff(mut self, d: Duration) -> Self {
        self.max_backoff = d;
        self
    }

    pub fn with_strategy(mut self, s: BackoffStrategy) -> Self {
        self.strategy = s;
        self
    }

    pub fn with_predicate(
        mut self,
        p: impl Fn(&FlowError) -> ErrorKind + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(p));
        self
    }

    pub fn continue_on_error(mut self, yes: bool) -> Self {
        self.continue_on_error = yes;
        self
    }

    /// Classify `error`, honoring the configured predicate override.
    pub fn classify(&self, error: &FlowError) -> ErrorKind {
        match &self.predicate {
            Some(p) => p(error),
            None => error.kind(),
        }
    }

    /// Delay before the next attempt, given the 1-indexed attempt that
    /// just failed.
    pub fn delay_for(&self, attempt: usize, kind: ErrorKind) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base = match self.strategy {
            BackoffStrategy::Fixed => self.initial_backoff,
            BackoffStrategy::Exponential { factor } => {
                self.initial_backoff.mul_f64(factor.powi(exponent).max(1.0))
            }
            BackoffStrategy::ExponentialJitter { factor } => {
                let scaled = self.initial_backoff.mul_f64(factor.powi(exponent).max(1.0));
                let jitter: f64 = rand::Rng::gen_range(&mut rand::thread_rng(), 0.5..=1.5);
                scaled.mul_f64(jitter)
            }
        };
        let base = base.min(self.max_backoff);
        if kind == ErrorKind::BackpressureTimeout {
            (base * BACKPRESSURE_FACTOR).min(self.max_backoff)
        } else {
            base
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy() {
        let p = RetryOptions::default();
        assert_eq!(p.max_attempts, 3);
        assert!(!p.continue_on_error);
    }

    #[test]
    fn exponential_backoff_grows_and_caps() {
        let p = RetryOptions::new(5)
            .with_initial_backoff(Duration::from_millis(100))
            .with_max_backoff(Duration::from_millis(350))
            .with_strategy(BackoffStrategy::Exponential { factor: 2.0 });
        assert_eq!(p.delay_for(1, ErrorKind::TransientIo), Duration::from_millis(100));
        assert_eq!(p.delay_for(2, ErrorKind::TransientIo), Duration::from_millis(200));
        // 400ms capped at 350ms.
        assert_eq!(p.delay_for(3, ErrorKind::TransientIo), Duration::from_millis(350));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let p = RetryOptions::new(4)
            .with_initial_backoff(Duration::from_millis(20))
            .with_strategy(BackoffStrategy::Fixed);
        for attempt in 1..4 {
            assert_eq!(p.delay_for(attempt, ErrorKind::TransientIo), Duration::from_millis(20));
        }
    }

    #[test]
    fn jitter_stays_in_band() {
        let p = RetryOptions::new(3)
            .with_initial_backoff(Duration::from_millis(100))
            .with_max_backoff(Duration::from_secs(60))
            .with_strategy(BackoffStrategy::ExponentialJitter { factor: 2.0 });
        for _ in 0..20 {
            let d = p.delay_for(2, ErrorKind::TransientIo);
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(300));
        }
    }

    #[test]
    fn backpressure_gets_longer_backoff() {
        let p = RetryOptions::new(3)
            .with_initial_backoff(Duration::from_millis(10))
            .with_max_backoff(Duration::from_secs(10))
            .with_strategy(BackoffStrategy::Fixed);
        let plain = p.delay_for(1, ErrorKind::TransientIo);
        let bp = p.delay_for(1, ErrorKind::BackpressureTimeout);
        assert!(bp > plain);
    }

    #[test]
    fn predicate_overrides_classification() {
        let p = RetryOptions::new(3).with_predicate(|_| ErrorKind::PermanentRemote);
        let e = FlowError::transient("n", "flaky");
        assert_eq!(p.classify(&e), ErrorKind::PermanentRemote);
    }
}
