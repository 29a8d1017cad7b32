//! Tier-wide circuit breaker for RPC calls.
//!
//! Trips when the failure rate over the last 100 calls exceeds 20%. Open for
//! 30 s, then half-open: a single probe call is let through and its outcome
//! decides whether the breaker closes again.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker configuration.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Sliding window size in calls.
    pub window: usize,
    /// Failure rate that trips the breaker, 0.0..=1.0.
    pub failure_threshold: f64,
    /// How long the breaker stays open.
    pub open_duration: Duration,
    /// Minimum calls in the window before the rate is meaningful.
    pub min_calls: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: 100,
            failure_threshold: 0.20,
            open_duration: Duration::from_secs(30),
            min_calls: 10,
        }
    }
}

struct BreakerInner {
    outcomes: VecDeque<bool>,
    state: BreakerState,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Sliding-window circuit breaker.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                outcomes: VecDeque::with_capacity(config.window),
                state: BreakerState::Closed,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Whether a call may proceed right now.
    ///
    /// In half-open state only the first caller gets through as the probe.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.config.open_duration)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!("Circuit breaker half-open, probing");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a call outcome.
    pub fn record(&self, success: bool) {
        let mut inner = self.inner.lock();

        if inner.state == BreakerState::HalfOpen {
            inner.probe_in_flight = false;
            if success {
                info!("Circuit breaker closed after successful probe");
                inner.state = BreakerState::Closed;
                inner.outcomes.clear();
            } else {
                warn!("Probe failed, circuit breaker re-opened");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
            return;
        }

        inner.outcomes.push_back(success);
        while inner.outcomes.len() > self.config.window {
            inner.outcomes.pop_front();
        }

        if inner.state == BreakerState::Closed && inner.outcomes.len() >= self.config.min_calls {
            let failures = inner.outcomes.iter().filter(|ok| !**ok).count();
            let rate = failures as f64 / inner.outcomes.len() as f64;
            if rate > self.config.failure_threshold {
                warn!(
                    failures,
                    calls = inner.outcomes.len(),
                    "Failure rate exceeded, opening circuit breaker"
                );
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            window: 100,
            failure_threshold: 0.20,
            open_duration: Duration::from_millis(10),
            min_calls: 10,
        }
    }

    #[test]
    fn test_stays_closed_under_threshold() {
        let breaker = CircuitBreaker::new(fast_config());
        for i in 0..100 {
            // 10% failures.
            breaker.record(i % 10 != 0);
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow());
    }

    #[test]
    fn test_opens_over_threshold() {
        let breaker = CircuitBreaker::new(fast_config());
        for i in 0..100 {
            // 30% failures.
            breaker.record(i % 10 >= 3);
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn test_half_open_probe_closes_on_success() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..20 {
            breaker.record(false);
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(15));
        // First caller is the probe; second is held back.
        assert!(breaker.allow());
        assert!(!breaker.allow());

        breaker.record(true);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow());
    }

    #[test]
    fn test_half_open_probe_reopens_on_failure() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..20 {
            breaker.record(false);
        }
        std::thread::sleep(Duration::from_millis(15));
        assert!(breaker.allow());
        breaker.record(false);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn test_needs_min_calls() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..5 {
            breaker.record(false);
        }
        // 100% failure but below min_calls.
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
