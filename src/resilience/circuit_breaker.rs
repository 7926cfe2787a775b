//! Circuit Breaker
//!
//! Stops calling a failing backend until it recovers.
//!
//! ## States
//! - **Closed**: Normal operation, calls flow through
//! - **Open**: Backend failing, calls rejected immediately
//! - **Half-Open**: Cool-down elapsed; exactly one trial call is admitted
//!
//! A closed breaker opens after `failure_threshold` consecutive failures, or
//! when the failure rate over the last `window_size` calls reaches
//! `failure_rate_threshold` (once at least `min_calls` were observed).
//! The half-open trial closes the breaker on success and reopens it on failure.
//!
//! ## Usage
//!
//! ```no_run
//! use tokio_prediction_orchestrator::resilience::{BreakerSettings, CircuitBreaker, CircuitBreakerError};
//! # #[tokio::main]
//! # async fn main() {
//! let breaker = CircuitBreaker::new("scorer", BreakerSettings::default());
//!
//! match breaker.call(|| async { Ok::<f64, String>(0.8) }).await {
//!     Ok(value) => println!("{value}"),
//!     Err(CircuitBreakerError::Open) => { /* fail fast, use fallback */ }
//!     Err(CircuitBreakerError::Failed(e)) => eprintln!("backend failed: {e}"),
//! }
//! # }
//! ```

use dashmap::DashMap;
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::metrics;

/// Breaker tuning (`[resilience]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive failures that open a closed breaker.
    pub failure_threshold: usize,
    /// Failure rate (0.0–1.0) over the rolling window that opens the breaker.
    pub failure_rate_threshold: f64,
    /// Rolling window length in calls.
    pub window_size: usize,
    /// Calls required in the window before the rate rule applies.
    pub min_calls: usize,
    /// Time spent open before a trial call is admitted.
    pub cooldown_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            window_size: 50,
            min_calls: 20,
            cooldown_ms: 30_000,
        }
    }
}

impl BreakerSettings {
    /// Cool-down as a [`Duration`].
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    /// Calls flow through normally.
    Closed,
    /// Calls are rejected without invoking the backend.
    Open,
    /// One trial call is allowed through to test recovery.
    HalfOpen,
}

impl CircuitStatus {
    fn gauge(self) -> i64 {
        match self {
            CircuitStatus::Closed => 0,
            CircuitStatus::HalfOpen => 1,
            CircuitStatus::Open => 2,
        }
    }
}

/// Circuit breaker errors
#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, request rejected
    Open,
    /// Operation failed
    Failed(E),
}

#[derive(Debug)]
struct CircuitState {
    status: CircuitStatus,
    consecutive_failures: usize,
    total_failures: u64,
    total_successes: u64,
    rejected: u64,
    opened_at: Option<Instant>,
    last_state_change: Instant,
    trial_in_flight: bool,
    /// Recent results (true = success, false = failure)
    recent_results: VecDeque<bool>,
}

/// Circuit breaker for one backend. Clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    state: Arc<Mutex<CircuitState>>,
    settings: BreakerSettings,
}

/// Resets the half-open trial slot if the trial future is dropped before it
/// reports a result.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.breaker.state.lock();
            state.trial_in_flight = false;
            debug!(backend = %self.breaker.name, "circuit breaker: trial call abandoned");
        }
    }
}

impl CircuitBreaker {
    /// Create a closed breaker for `name`.
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        let name: String = name.into();
        Self {
            name: Arc::from(name.as_str()),
            state: Arc::new(Mutex::new(CircuitState {
                status: CircuitStatus::Closed,
                consecutive_failures: 0,
                total_failures: 0,
                total_successes: 0,
                rejected: 0,
                opened_at: None,
                last_state_change: Instant::now(),
                trial_in_flight: false,
                recent_results: VecDeque::new(),
            })),
            settings,
        }
    }

    /// Backend this breaker protects.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute operation through circuit breaker
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let is_trial = self.admit()?;
        let mut guard = TrialGuard {
            breaker: self,
            armed: is_trial,
        };

        let result = f().await;
        guard.armed = false;

        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }

        result.map_err(CircuitBreakerError::Failed)
    }

    /// Decide whether a call may proceed. Returns `Ok(true)` for the
    /// half-open trial call.
    fn admit<E>(&self) -> Result<bool, CircuitBreakerError<E>> {
        let mut state = self.state.lock();
        match state.status {
            CircuitStatus::Closed => Ok(false),
            CircuitStatus::Open => {
                let cooled = state
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= self.settings.cooldown());
                if cooled {
                    self.transition(&mut state, CircuitStatus::HalfOpen);
                    state.trial_in_flight = true;
                    info!(backend = %self.name, "circuit breaker: transitioning to half-open");
                    Ok(true)
                } else {
                    state.rejected += 1;
                    debug!(backend = %self.name, "circuit breaker: request rejected (open)");
                    Err(CircuitBreakerError::Open)
                }
            }
            CircuitStatus::HalfOpen => {
                if state.trial_in_flight {
                    state.rejected += 1;
                    debug!(backend = %self.name, "circuit breaker: request rejected (trial in flight)");
                    Err(CircuitBreakerError::Open)
                } else {
                    state.trial_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn transition(&self, state: &mut CircuitState, to: CircuitStatus) {
        state.status = to;
        state.last_state_change = Instant::now();
        metrics::set_circuit_state(&self.name, to.gauge());
    }

    fn push_result(&self, state: &mut CircuitState, ok: bool) {
        state.recent_results.push_back(ok);
        while state.recent_results.len() > self.settings.window_size.max(1) {
            state.recent_results.pop_front();
        }
    }

    fn record_success(&self) {
        let mut state = self.state.lock();
        state.total_successes += 1;
        state.consecutive_failures = 0;
        self.push_result(&mut state, true);

        if state.status == CircuitStatus::HalfOpen {
            state.trial_in_flight = false;
            state.recent_results.clear();
            state.opened_at = None;
            self.transition(&mut state, CircuitStatus::Closed);
            info!(backend = %self.name, "circuit breaker: closing (backend recovered)");
        }
    }

    fn record_failure(&self) {
        let mut state = self.state.lock();
        state.total_failures += 1;
        state.consecutive_failures += 1;
        self.push_result(&mut state, false);

        warn!(
            backend = %self.name,
            status = ?state.status,
            consecutive = state.consecutive_failures,
            threshold = self.settings.failure_threshold,
            "circuit breaker: failure recorded"
        );

        match state.status {
            CircuitStatus::Closed => {
                let rate = failure_rate(&state.recent_results);
                let by_count = state.consecutive_failures >= self.settings.failure_threshold;
                let by_rate = state.recent_results.len() >= self.settings.min_calls.max(1)
                    && rate >= self.settings.failure_rate_threshold;
                if by_count || by_rate {
                    state.opened_at = Some(Instant::now());
                    self.transition(&mut state, CircuitStatus::Open);
                    warn!(
                        backend = %self.name,
                        consecutive = state.consecutive_failures,
                        failure_rate = rate,
                        "circuit breaker: opening"
                    );
                }
            }
            CircuitStatus::HalfOpen => {
                state.trial_in_flight = false;
                state.opened_at = Some(Instant::now());
                self.transition(&mut state, CircuitStatus::Open);
                warn!(backend = %self.name, "circuit breaker: reopening (trial call failed)");
            }
            CircuitStatus::Open => {}
        }
    }

    /// Get current circuit status
    pub fn status(&self) -> CircuitStatus {
        self.state.lock().status
    }

    /// Get circuit breaker statistics
    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.state.lock();
        CircuitBreakerStats {
            backend: self.name.to_string(),
            status: state.status,
            consecutive_failures: state.consecutive_failures,
            total_failures: state.total_failures,
            total_successes: state.total_successes,
            rejected: state.rejected,
            failure_rate: failure_rate(&state.recent_results),
            time_in_current_state_ms: state.last_state_change.elapsed().as_millis() as u64,
        }
    }

    /// Manually reset circuit breaker to closed state
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.recent_results.clear();
        state.trial_in_flight = false;
        state.opened_at = None;
        self.transition(&mut state, CircuitStatus::Closed);
        info!(backend = %self.name, "circuit breaker: manually reset to closed");
    }

    /// Force circuit to open state (for testing/maintenance)
    pub fn trip(&self) {
        let mut state = self.state.lock();
        state.opened_at = Some(Instant::now());
        state.trial_in_flight = false;
        self.transition(&mut state, CircuitStatus::Open);
        warn!(backend = %self.name, "circuit breaker: manually tripped to open");
    }
}

fn failure_rate(results: &VecDeque<bool>) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    let failures = results.iter().filter(|ok| !**ok).count();
    failures as f64 / results.len() as f64
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CircuitBreakerStats {
    /// Backend the breaker protects.
    pub backend: String,
    /// Current state of the circuit breaker.
    pub status: CircuitStatus,
    /// Failures since the last success.
    pub consecutive_failures: usize,
    /// Lifetime failures.
    pub total_failures: u64,
    /// Lifetime successes.
    pub total_successes: u64,
    /// Calls rejected without reaching the backend.
    pub rejected: u64,
    /// Failure fraction over the rolling window (0.0 – 1.0).
    pub failure_rate: f64,
    /// Wall-clock time spent in the current state.
    pub time_in_current_state_ms: u64,
}

/// One breaker per backend, created on first use.
pub struct BreakerRegistry {
    breakers: DashMap<String, CircuitBreaker>,
    settings: BreakerSettings,
}

impl BreakerRegistry {
    /// Registry whose breakers all use `settings`.
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            breakers: DashMap::new(),
            settings,
        }
    }

    /// The breaker for `backend`, created closed if missing.
    pub fn get(&self, backend: &str) -> CircuitBreaker {
        if let Some(existing) = self.breakers.get(backend) {
            return existing.clone();
        }
        self.breakers
            .entry(backend.to_string())
            .or_insert_with(|| CircuitBreaker::new(backend, self.settings.clone()))
            .clone()
    }

    /// Stats for every known breaker, sorted by backend.
    pub fn snapshot(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self.breakers.iter().map(|b| b.value().stats()).collect();
        stats.sort_by(|a, b| a.backend.cmp(&b.backend));
        stats
    }
}
