//! Process-wide failure gate in front of the link-risk classifier.
//!
//! One breaker per classifier name, shared by every task worker. The failure
//! counter is a plain atomic so concurrent workers never lose an increment.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU32, Ordering},
        Arc, Mutex,
    },
};

use chrono::{DateTime, Duration, TimeZone, Utc};
use tracing::{info, warn};

use crate::core::time::Clock;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_COOLDOWN_SECONDS: u64 = 600;

const NO_FAILURE: i64 = i64::MIN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown: Duration::seconds(DEFAULT_COOLDOWN_SECONDS as i64),
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    failures: AtomicU32,
    last_failure_ms: AtomicI64,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            settings,
            failures: AtomicU32::new(0),
            last_failure_ms: AtomicI64::new(NO_FAILURE),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn last_failure(&self) -> Option<DateTime<Utc>> {
        match self.last_failure_ms.load(Ordering::SeqCst) {
            NO_FAILURE => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    /// Read-only view of the gate; does not perform the half-open reset.
    pub fn state(&self) -> BreakerState {
        let count = self.failure_count();
        if count < self.settings.failure_threshold {
            return BreakerState::Closed;
        }
        if self.cooling_down() {
            BreakerState::Open
        } else {
            BreakerState::HalfOpen
        }
    }

    /// Whether a classifier call may go out right now.
    ///
    /// Once the cooldown since the last failure has elapsed, the counter is
    /// reset and calls flow again.
    pub fn should_process(&self) -> bool {
        if !self.settings.enabled {
            return false;
        }
        let count = self.failure_count();
        if count < self.settings.failure_threshold {
            return true;
        }
        if self.cooling_down() {
            return false;
        }
        if self
            .failures
            .compare_exchange(count, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.last_failure_ms.store(NO_FAILURE, Ordering::SeqCst);
            info!(breaker = %self.name, "circuit half-open after cooldown; counter reset");
        }
        true
    }

    /// Count one failed call. Returns the counter after the increment.
    pub fn record_failure(&self) -> u32 {
        let now_ms = self.clock.now().timestamp_millis();
        let previous = self.last_failure_ms.swap(now_ms, Ordering::SeqCst);
        if previous != NO_FAILURE && now_ms - previous >= self.settings.cooldown.num_milliseconds() {
            // the counter expires with the window of its last failure
            let stale = self.failures.load(Ordering::SeqCst);
            let _ = self
                .failures
                .compare_exchange(stale, 0, Ordering::SeqCst, Ordering::SeqCst);
        }
        let count = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        if count == self.settings.failure_threshold {
            warn!(
                breaker = %self.name,
                failures = count,
                cooldown_secs = self.settings.cooldown.num_seconds(),
                "circuit opened"
            );
        }
        count
    }

    pub fn record_success(&self) {
        let previous = self.failures.swap(0, Ordering::SeqCst);
        self.last_failure_ms.store(NO_FAILURE, Ordering::SeqCst);
        if previous > 0 {
            info!(breaker = %self.name, cleared = previous, "circuit closed after success");
        }
    }

    fn cooling_down(&self) -> bool {
        match self.last_failure() {
            Some(last) => self.clock.now().signed_duration_since(last) < self.settings.cooldown,
            None => false,
        }
    }
}

/// Breakers keyed by classifier name.
pub struct BreakerRegistry {
    settings: BreakerSettings,
    clock: Arc<dyn Clock>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(settings: BreakerSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = match self.breakers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    name,
                    self.settings.clone(),
                    self.clock.clone(),
                ))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::ManualClock;

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-02T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn breaker(clock: Arc<ManualClock>) -> CircuitBreaker {
        CircuitBreaker::new("pbn-detector", BreakerSettings::default(), clock)
    }

    #[test]
    fn opens_after_exactly_five_failures() {
        let clock = Arc::new(ManualClock::new(start()));
        let cb = breaker(clock);
        for _ in 0..4 {
            cb.record_failure();
            assert!(cb.should_process());
        }
        assert_eq!(cb.record_failure(), 5);
        assert!(!cb.should_process());
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn success_clears_history_immediately() {
        let clock = Arc::new(ManualClock::new(start()));
        let cb = breaker(clock);
        for _ in 0..7 {
            cb.record_failure();
        }
        assert!(!cb.should_process());
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.last_failure().is_none());
        assert!(cb.should_process());
    }

    #[test]
    fn cooldown_elapsing_resets_counter_on_next_check() {
        let clock = Arc::new(ManualClock::new(start()));
        let cb = breaker(clock.clone());
        for _ in 0..5 {
            cb.record_failure();
        }
        clock.advance(Duration::minutes(2));
        assert!(!cb.should_process());
        clock.advance(Duration::minutes(9));
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert!(cb.should_process());
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn stale_failures_expire_with_their_window() {
        let clock = Arc::new(ManualClock::new(start()));
        let cb = breaker(clock.clone());
        for _ in 0..4 {
            cb.record_failure();
        }
        clock.advance(Duration::minutes(15));
        assert_eq!(cb.record_failure(), 1);
        assert!(cb.should_process());
    }

    #[test]
    fn disabled_breaker_never_processes() {
        let clock = Arc::new(ManualClock::new(start()));
        let settings = BreakerSettings {
            enabled: false,
            ..BreakerSettings::default()
        };
        let cb = CircuitBreaker::new("pbn-detector", settings, clock);
        assert!(!cb.should_process());
    }

    #[test]
    fn concurrent_failures_are_all_counted() {
        let clock = Arc::new(ManualClock::new(start()));
        let cb = Arc::new(breaker(clock));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cb = cb.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        cb.record_failure();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cb.failure_count(), 200);
    }

    #[test]
    fn registry_shares_one_breaker_per_name() {
        let clock = Arc::new(ManualClock::new(start()));
        let registry = BreakerRegistry::new(BreakerSettings::default(), clock);
        let a = registry.get("pbn-detector");
        let b = registry.get("pbn-detector");
        a.record_failure();
        assert_eq!(b.failure_count(), 1);
        assert_eq!(registry.get("other").failure_count(), 0);
    }
}
