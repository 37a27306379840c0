//! Circuit breaker state machine (C3).
//!
//! One breaker guards one named service. It opens on either a run of
//! consecutive failures or a failure ratio over a minimum sample size,
//! transitions lazily from Open to HalfOpen once `open_timeout` has elapsed,
//! and closes again after enough consecutive half-open successes. State
//! transitions are computed under a lock but listener notification happens
//! after the lock is released, so a slow listener never blocks another
//! caller's admission check.

use crate::clock::{Clock, MonotonicClock};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

fn state_from_u8(raw: u8) -> CircuitState {
    match raw {
        STATE_CLOSED => CircuitState::Closed,
        STATE_OPEN => CircuitState::Open,
        STATE_HALF_OPEN => CircuitState::HalfOpen,
        _ => unreachable!("invalid circuit breaker state byte"),
    }
}

fn state_to_u8(state: CircuitState) -> u8 {
    match state {
        CircuitState::Closed => STATE_CLOSED,
        CircuitState::Open => STATE_OPEN,
        CircuitState::HalfOpen => STATE_HALF_OPEN,
    }
}

/// Opening policy and timing for one breaker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Open once this many consecutive failures have been observed.
    pub consecutive_failures: u32,
    /// Open once `failures / requests >= failure_ratio`, provided `min_requests` has been met.
    pub failure_ratio: f64,
    /// Minimum sample size before the ratio policy can trip the breaker.
    pub min_requests: u32,
    /// Consecutive half-open successes required to close again.
    pub max_requests_in_half_open: u32,
    /// Rolling window after which Closed-state counters reset even without a failure.
    pub window_interval: Duration,
    /// How long the breaker stays Open before the next call may probe it.
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            consecutive_failures: 3,
            failure_ratio: 0.4,
            min_requests: 5,
            max_requests_in_half_open: 3,
            window_interval: Duration::from_secs(30),
            open_timeout: Duration::from_secs(30),
        }
    }
}

/// A circuit breaker never opens (used for services that explicitly disable protection).
impl CircuitBreakerConfig {
    pub fn disabled() -> Self {
        Self {
            consecutive_failures: u32::MAX,
            failure_ratio: 1.1,
            min_requests: u32::MAX,
            max_requests_in_half_open: u32::MAX,
            window_interval: Duration::from_secs(u64::MAX / 2),
            open_timeout: Duration::from_secs(0),
        }
    }
}

/// Observer notified on every state transition. Registered listeners are
/// invoked after the state-change lock is released.
pub trait CircuitStateListener: Send + Sync {
    fn on_state_change(&self, service: &str, from: CircuitState, to: CircuitState);
}

#[derive(Debug)]
struct Counters {
    requests: u32,
    failures: u32,
    consecutive_failures: u32,
    consecutive_half_open_successes: u32,
    half_open_in_flight: u32,
    opened_at_millis: u64,
    window_end_millis: u64,
}

impl Counters {
    fn fresh(window_interval: Duration, now_millis: u64) -> Self {
        Self {
            requests: 0,
            failures: 0,
            consecutive_failures: 0,
            consecutive_half_open_successes: 0,
            half_open_in_flight: 0,
            opened_at_millis: 0,
            window_end_millis: now_millis + window_interval.as_millis() as u64,
        }
    }
}

/// Error produced by a guarded call: either the circuit rejected it outright,
/// or the wrapped operation itself failed.
#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    Open { failure_count: u32, open_duration: Duration },
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open { failure_count, open_duration } => {
                write!(f, "circuit open ({failure_count} failures, open for {open_duration:?})")
            }
            Self::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CircuitBreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Open { .. } => None,
        }
    }
}

impl<E> CircuitBreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Open { .. } => None,
        }
    }
}

/// Point-in-time counters for diagnostics (the `Counts` the spec's C4
/// inspection surface exposes alongside `get_state`/`is_healthy`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitCounts {
    pub requests: u32,
    pub failures: u32,
    pub consecutive_failures: u32,
}

/// Per-service circuit breaker. Cheap to clone; the state lives in an `Arc`.
#[derive(Clone)]
pub struct CircuitBreaker {
    service: Arc<str>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    state: Arc<AtomicU8>,
    counters: Arc<Mutex<Counters>>,
    listeners: Arc<Mutex<Vec<Arc<dyn CircuitStateListener>>>>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("service", &self.service)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(service: impl Into<Arc<str>>, config: CircuitBreakerConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        let now = clock.now_millis();
        Self {
            service: service.into(),
            counters: Arc::new(Mutex::new(Counters::fresh(config.window_interval, now))),
            config,
            clock,
            state: Arc::new(AtomicU8::new(STATE_CLOSED)),
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(clock);
        let now = clock.now_millis();
        *self.counters.lock().expect("circuit breaker counters poisoned") =
            Counters::fresh(self.config.window_interval, now);
        self.clock = clock;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> CircuitState {
        state_from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn add_listener(&self, listener: Arc<dyn CircuitStateListener>) {
        self.listeners.lock().expect("circuit breaker listeners poisoned").push(listener);
    }

    /// Current failure count for diagnostics (`Counts` in the spec's C4 inspection surface).
    pub fn failure_count(&self) -> u32 {
        self.counters.lock().expect("circuit breaker counters poisoned").failures
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn counts(&self) -> CircuitCounts {
        let counters = self.counters.lock().expect("circuit breaker counters poisoned");
        CircuitCounts {
            requests: counters.requests,
            failures: counters.failures,
            consecutive_failures: counters.consecutive_failures,
        }
    }

    /// Explicit reset used by operator tooling. Unlike every other transition
    /// this does *not* notify listeners directly; the health supervisor's
    /// recovery monitor (C6) is the compensating path that observes it.
    pub fn reset(&self) {
        let now = self.clock.now_millis();
        let mut counters = self.counters.lock().expect("circuit breaker counters poisoned");
        *counters = Counters::fresh(self.config.window_interval, now);
        self.state.store(STATE_CLOSED, Ordering::Release);
    }

    /// Run `op` through the breaker. Rejects immediately without invoking `op`
    /// when the circuit is Open, or when HalfOpen has already admitted
    /// `max_requests_in_half_open` concurrent probes.
    pub async fn execute<T, E, Fut, Op>(&self, op: Op) -> Result<T, CircuitBreakerError<E>>
    where
        E: std::error::Error + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<T, E>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let was_half_open = match self.admit() {
            Admission::Rejected { failure_count, open_duration } => {
                return Err(CircuitBreakerError::Open { failure_count, open_duration });
            }
            Admission::Proceed { was_half_open } => was_half_open,
        };

        let result = op().await;
        self.record_result(was_half_open, result.is_ok());
        result.map_err(CircuitBreakerError::Inner)
    }

    fn admit(&self) -> Admission {
        loop {
            let now = self.clock.now_millis();
            let current = state_from_u8(self.state.load(Ordering::Acquire));

            match current {
                CircuitState::Closed => {
                    self.maybe_roll_window(now);
                    return Admission::Proceed { was_half_open: false };
                }
                CircuitState::Open => {
                    let opened_at = self.counters.lock().expect("poisoned").opened_at_millis;
                    let elapsed = now.saturating_sub(opened_at);
                    if elapsed < self.config.open_timeout.as_millis() as u64 {
                        let failure_count =
                            self.counters.lock().expect("poisoned").failures;
                        return Admission::Rejected {
                            failure_count,
                            open_duration: Duration::from_millis(elapsed),
                        };
                    }
                    // Lazily transition: the first caller past the timeout wins the race.
                    if self
                        .state
                        .compare_exchange(STATE_OPEN, STATE_HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        {
                            let mut counters = self.counters.lock().expect("poisoned");
                            counters.half_open_in_flight = 1;
                            counters.consecutive_half_open_successes = 0;
                        }
                        self.notify(CircuitState::Open, CircuitState::HalfOpen);
                        return Admission::Proceed { was_half_open: true };
                    }
                    // Lost the race; re-check under the new state.
                    continue;
                }
                CircuitState::HalfOpen => {
                    let mut counters = self.counters.lock().expect("poisoned");
                    if counters.half_open_in_flight >= self.config.max_requests_in_half_open {
                        return Admission::Rejected { failure_count: counters.failures, open_duration: Duration::from_millis(0) };
                    }
                    counters.half_open_in_flight += 1;
                    return Admission::Proceed { was_half_open: true };
                }
            }
        }
    }

    fn maybe_roll_window(&self, now: u64) {
        let mut counters = self.counters.lock().expect("poisoned");
        if now >= counters.window_end_millis {
            counters.requests = 0;
            counters.failures = 0;
            counters.consecutive_failures = 0;
            counters.window_end_millis = now + self.config.window_interval.as_millis() as u64;
        }
    }

    fn record_result(&self, was_half_open: bool, success: bool) {
        if was_half_open {
            self.record_half_open_result(success);
        } else {
            self.record_closed_result(success);
        }
    }

    fn record_closed_result(&self, success: bool) {
        let mut counters = self.counters.lock().expect("poisoned");
        counters.requests += 1;
        if success {
            counters.consecutive_failures = 0;
            return;
        }

        counters.failures += 1;
        counters.consecutive_failures += 1;

        let by_streak = counters.consecutive_failures >= self.config.consecutive_failures;
        let by_ratio = counters.requests >= self.config.min_requests
            && (counters.failures as f64 / counters.requests as f64) >= self.config.failure_ratio;

        if by_streak || by_ratio {
            let now = self.clock.now_millis();
            counters.opened_at_millis = now;
            let failure_count = counters.failures;
            drop(counters);
            if self
                .state
                .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                tracing::error!(service = %self.service, failure_count, "circuit breaker opened");
                self.notify(CircuitState::Closed, CircuitState::Open);
            }
        }
    }

    fn record_half_open_result(&self, success: bool) {
        let mut counters = self.counters.lock().expect("poisoned");
        counters.half_open_in_flight = counters.half_open_in_flight.saturating_sub(1);

        if success {
            counters.consecutive_half_open_successes += 1;
            if counters.consecutive_half_open_successes >= self.config.max_requests_in_half_open {
                drop(counters);
                if self
                    .state
                    .compare_exchange(STATE_HALF_OPEN, STATE_CLOSED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let now = self.clock.now_millis();
                    *self.counters.lock().expect("poisoned") =
                        Counters::fresh(self.config.window_interval, now);
                    tracing::info!(service = %self.service, "circuit breaker closed");
                    self.notify(CircuitState::HalfOpen, CircuitState::Closed);
                }
            }
            return;
        }

        counters.failures += 1;
        let now = self.clock.now_millis();
        counters.opened_at_millis = now;
        let failure_count = counters.failures;
        drop(counters);
        if self
            .state
            .compare_exchange(STATE_HALF_OPEN, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::warn!(service = %self.service, failure_count, "circuit breaker probe failed, reopening");
            self.notify(CircuitState::HalfOpen, CircuitState::Open);
        }
    }

    fn notify(&self, from: CircuitState, to: CircuitState) {
        let listeners = self.listeners.lock().expect("poisoned").clone();
        for listener in listeners {
            listener.on_state_change(&self.service, from, to);
        }
    }
}

enum Admission {
    Proceed { was_half_open: bool },
    Rejected { failure_count: u32, open_duration: Duration },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(&'static str);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }
    impl std::error::Error for TestError {}

    #[derive(Debug, Clone)]
    struct ManualClock {
        now: Arc<std::sync::atomic::AtomicU64>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self { now: Arc::new(std::sync::atomic::AtomicU64::new(0)) }
        }
        fn advance(&self, millis: u64) {
            self.now.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        transitions: Mutex<Vec<(CircuitState, CircuitState)>>,
    }

    impl CircuitStateListener for RecordingListener {
        fn on_state_change(&self, _service: &str, from: CircuitState, to: CircuitState) {
            self.transitions.lock().unwrap().push((from, to));
        }
    }

    fn config(consecutive_failures: u32, open_timeout: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            consecutive_failures,
            failure_ratio: 2.0, // effectively disables ratio policy for these tests
            min_requests: u32::MAX,
            max_requests_in_half_open: 1,
            window_interval: Duration::from_secs(3600),
            open_timeout,
        }
    }

    #[tokio::test]
    async fn starts_closed_and_executes() {
        let breaker = CircuitBreaker::new("svc", config(3, Duration::from_secs(10)));
        let result = breaker.execute(|| async { Ok::<_, TestError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new("svc", config(3, Duration::from_secs(10)));
        for _ in 0..3 {
            let _ = breaker.execute(|| async { Err::<(), _>(TestError("fail")) }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let result = breaker.execute(|| async { Ok::<_, TestError>(()) }).await;
        assert!(result.unwrap_err().is_open());
    }

    #[tokio::test]
    async fn opens_by_failure_ratio_once_min_requests_met() {
        let cfg = CircuitBreakerConfig {
            consecutive_failures: u32::MAX,
            failure_ratio: 0.5,
            min_requests: 4,
            max_requests_in_half_open: 1,
            window_interval: Duration::from_secs(3600),
            open_timeout: Duration::from_secs(10),
        };
        let breaker = CircuitBreaker::new("svc", cfg);
        // 2 successes, 2 failures: ratio 0.5 over 4 requests trips it, even though
        // the failures are not consecutive.
        let _ = breaker.execute(|| async { Ok::<_, TestError>(()) }).await;
        let _ = breaker.execute(|| async { Err::<(), _>(TestError("f")) }).await;
        let _ = breaker.execute(|| async { Ok::<_, TestError>(()) }).await;
        let _ = breaker.execute(|| async { Err::<(), _>(TestError("f")) }).await;

        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn transitions_to_half_open_after_timeout_and_closes_on_success() {
        let clock = ManualClock::new();
        let breaker =
            CircuitBreaker::new("svc", config(1, Duration::from_millis(100))).with_clock(clock.clone());

        let _ = breaker.execute(|| async { Err::<(), _>(TestError("fail")) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(150);
        let result = breaker.execute(|| async { Ok::<_, TestError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn reopens_if_half_open_probe_fails() {
        let clock = ManualClock::new();
        let breaker =
            CircuitBreaker::new("svc", config(1, Duration::from_millis(100))).with_clock(clock.clone());

        let _ = breaker.execute(|| async { Err::<(), _>(TestError("fail")) }).await;
        clock.advance(150);
        let _ = breaker.execute(|| async { Err::<(), _>(TestError("fail again")) }).await;

        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn half_open_sheds_calls_beyond_the_limit() {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::new(
            "svc",
            CircuitBreakerConfig {
                consecutive_failures: 1,
                failure_ratio: 2.0,
                min_requests: u32::MAX,
                max_requests_in_half_open: 1,
                window_interval: Duration::from_secs(3600),
                open_timeout: Duration::from_millis(100),
            },
        )
        .with_clock(clock.clone());

        let _ = breaker.execute(|| async { Err::<(), _>(TestError("fail")) }).await;
        clock.advance(150);

        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let breaker = breaker.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                breaker
                    .execute(|| {
                        let counter = counter.clone();
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok::<_, TestError>(())
                        }
                    })
                    .await
            }));
        }

        let results: Vec<_> = futures::future::join_all(handles).await;
        let admitted = results.iter().filter(|r| r.as_ref().unwrap().is_ok()).count();
        assert_eq!(admitted, 1, "only one half-open probe should be admitted");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_breaker_never_opens() {
        let breaker = CircuitBreaker::new("svc", CircuitBreakerConfig::disabled());
        for _ in 0..100 {
            let _ = breaker.execute(|| async { Err::<(), _>(TestError("fail")) }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn listener_observes_open_and_close_transitions() {
        let clock = ManualClock::new();
        let breaker =
            CircuitBreaker::new("svc", config(1, Duration::from_millis(50))).with_clock(clock.clone());
        let listener = Arc::new(RecordingListener::default());
        breaker.add_listener(listener.clone());

        let _ = breaker.execute(|| async { Err::<(), _>(TestError("fail")) }).await;
        clock.advance(100);
        let _ = breaker.execute(|| async { Ok::<_, TestError>(()) }).await;

        let transitions = listener.transitions.lock().unwrap().clone();
        assert_eq!(
            transitions,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test]
    async fn counts_reflects_requests_and_failures() {
        let breaker = CircuitBreaker::new("svc", config(u32::MAX, Duration::from_secs(10)));
        let _ = breaker.execute(|| async { Ok::<_, TestError>(()) }).await;
        let _ = breaker.execute(|| async { Err::<(), _>(TestError("fail")) }).await;

        let counts = breaker.counts();
        assert_eq!(counts.requests, 2);
        assert_eq!(counts.failures, 1);
        assert_eq!(counts.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn reset_clears_state_without_notifying_listeners() {
        let breaker = CircuitBreaker::new("svc", config(1, Duration::from_secs(10)));
        let listener = Arc::new(RecordingListener::default());
        breaker.add_listener(listener.clone());

        let _ = breaker.execute(|| async { Err::<(), _>(TestError("fail")) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        listener.transitions.lock().unwrap().clear();
        breaker.reset();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(listener.transitions.lock().unwrap().is_empty());
    }
}
