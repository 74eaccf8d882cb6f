use crate::error::{Result, TransferError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through and are counted
    Closed,
    /// Calls go straight to the fallback
    Open,
    /// One probing call is allowed through
    HalfOpen,
}

impl CircuitState {
    fn gauge_value(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CircuitBreakerConfig {
    /// Failures that trip the breaker once enough samples exist
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u64,
    /// Failure ratio that trips the breaker once enough samples exist
    #[serde(default = "default_failure_rate")]
    pub failure_rate_threshold: f64,
    /// Samples required before the trip condition is evaluated
    #[serde(default = "default_minimum_requests")]
    pub minimum_requests: u64,
    /// Time spent open before a trial call is allowed
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_rate_threshold: default_failure_rate(),
            minimum_requests: default_minimum_requests(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_failure_threshold() -> u64 {
    50
}
fn default_failure_rate() -> f64 {
    0.5
}
fn default_minimum_requests() -> u64 {
    20
}
fn default_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug)]
struct CircuitStats {
    state: CircuitState,
    success_count: u64,
    failure_count: u64,
    last_state_change: Instant,
    trial_started_at: Option<Instant>,
}

impl CircuitStats {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            success_count: 0,
            failure_count: 0,
            last_state_change: Instant::now(),
            trial_started_at: None,
        }
    }

    fn total(&self) -> u64 {
        self.success_count + self.failure_count
    }

    fn failure_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            self.failure_count as f64 / total as f64
        }
    }

    fn transition(&mut self, state: CircuitState) {
        self.state = state;
        self.last_state_change = Instant::now();
        self.trial_started_at = None;
    }

    fn reset(&mut self) {
        self.success_count = 0;
        self.failure_count = 0;
        self.transition(CircuitState::Closed);
    }
}

enum Admission {
    Allowed,
    Trial,
    Rejected,
}

/// Guards one class of remote operation; shared by every caller using the same name
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    stats: RwLock<CircuitStats>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            stats: RwLock::new(CircuitStats::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `operation` unless the breaker is open, in which case `fallback` runs instead.
    ///
    /// A failure that trips the breaker also returns the fallback's result. Errors produced by
    /// the fallback are hard failures and are not retried by callers.
    pub async fn execute<T, F, Fut, FB>(&self, operation: F, fallback: FB) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        FB: FnOnce() -> Result<T>,
    {
        match self.admit().await {
            Admission::Rejected => {
                crate::metrics::record_breaker_call(&self.name, "rejected");
                debug!("Circuit breaker '{}' is open, using fallback", self.name);
                return fallback();
            }
            Admission::Trial => {
                info!("Circuit breaker '{}' letting a trial call through", self.name);
            }
            Admission::Allowed => {}
        }

        match operation().await {
            Ok(value) => {
                self.record_success().await;
                crate::metrics::record_breaker_call(&self.name, "success");
                Ok(value)
            }
            Err(err) => {
                crate::metrics::record_breaker_call(&self.name, "failure");
                if self.record_failure().await {
                    warn!(
                        "Circuit breaker '{}' is open after failure: {}",
                        self.name, err
                    );
                    fallback()
                } else {
                    Err(err)
                }
            }
        }
    }

    /// `execute` with a fallback that reports the open circuit
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let name = self.name.clone();
        self.execute(operation, move || Err(TransferError::CircuitOpen { name }))
            .await
    }

    async fn admit(&self) -> Admission {
        let mut stats = self.stats.write().await;
        let timeout = self.config.timeout();

        match stats.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                if stats.last_state_change.elapsed() >= timeout {
                    info!(
                        "Circuit breaker '{}' transitioning from Open to HalfOpen",
                        self.name
                    );
                    stats.transition(CircuitState::HalfOpen);
                    stats.trial_started_at = Some(Instant::now());
                    crate::metrics::update_breaker_state(&self.name, CircuitState::HalfOpen.gauge_value());
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                // A trial call abandoned by its caller must not block the breaker forever
                let trial_active = stats
                    .trial_started_at
                    .map(|started| started.elapsed() < timeout)
                    .unwrap_or(false);
                if trial_active {
                    Admission::Rejected
                } else {
                    stats.trial_started_at = Some(Instant::now());
                    Admission::Trial
                }
            }
        }
    }

    /// Record a successful operation
    pub async fn record_success(&self) {
        let mut stats = self.stats.write().await;
        stats.success_count += 1;

        if stats.state == CircuitState::HalfOpen {
            info!("Circuit breaker '{}' closing after successful trial call", self.name);
            stats.reset();
            crate::metrics::update_breaker_state(&self.name, CircuitState::Closed.gauge_value());
        }
    }

    /// Record a failed operation; returns true when the breaker is open afterwards
    pub async fn record_failure(&self) -> bool {
        let mut stats = self.stats.write().await;
        stats.failure_count += 1;

        match stats.state {
            CircuitState::HalfOpen => {
                warn!(
                    "Circuit breaker '{}' reopening after failed trial call",
                    self.name
                );
                stats.transition(CircuitState::Open);
            }
            CircuitState::Closed => {
                let enough_samples = stats.total() >= self.config.minimum_requests;
                let too_many = stats.failure_count >= self.config.failure_threshold;
                let rate = stats.failure_rate();
                if enough_samples && (too_many || rate >= self.config.failure_rate_threshold) {
                    warn!(
                        breaker = %self.name,
                        failures = stats.failure_count,
                        total = stats.total(),
                        failure_rate = rate,
                        "Circuit breaker opening"
                    );
                    stats.transition(CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }

        crate::metrics::update_breaker_state(&self.name, stats.state.gauge_value());
        stats.state == CircuitState::Open
    }

    /// Get current state
    pub async fn get_state(&self) -> CircuitState {
        self.stats.read().await.state
    }

    /// Force the circuit open until the timeout elapses
    pub async fn force_open(&self) {
        let mut stats = self.stats.write().await;
        warn!("Circuit breaker '{}' forced open", self.name);
        stats.transition(CircuitState::Open);
        crate::metrics::update_breaker_state(&self.name, CircuitState::Open.gauge_value());
    }

    /// Force the circuit closed and zero its counters
    pub async fn force_close(&self) {
        let mut stats = self.stats.write().await;
        info!("Circuit breaker '{}' forced closed", self.name);
        stats.reset();
        crate::metrics::update_breaker_state(&self.name, CircuitState::Closed.gauge_value());
    }

    /// Get circuit breaker statistics
    pub async fn get_stats(&self) -> CircuitBreakerStats {
        let stats = self.stats.read().await;

        CircuitBreakerStats {
            name: self.name.clone(),
            state: stats.state,
            success_count: stats.success_count,
            failure_count: stats.failure_count,
            failure_rate: stats.failure_rate(),
            time_in_state: stats.last_state_change.elapsed(),
        }
    }
}

/// Public circuit breaker statistics
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub success_count: u64,
    pub failure_count: u64,
    pub failure_rate: f64,
    pub time_in_state: Duration,
}

/// Registry of named breakers, injected into every engine
pub struct CircuitBreakerManager {
    default_config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerManager {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create a breaker with the default configuration
    pub async fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create(name, self.default_config.clone()).await
    }

    /// Get or create a circuit breaker
    pub async fn get_or_create(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(name) {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write().await;
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    /// Run `operation` through the breaker called `name`
    pub async fn execute<T, F, Fut, FB>(&self, name: &str, operation: F, fallback: FB) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        FB: FnOnce() -> Result<T>,
    {
        self.get(name).await.execute(operation, fallback).await
    }

    /// `execute` with the default open-circuit fallback
    pub async fn call<T, F, Fut>(&self, name: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.get(name).await.call(operation).await
    }

    pub async fn force_open(&self, name: &str) {
        self.get(name).await.force_open().await;
    }

    pub async fn force_close(&self, name: &str) {
        self.get(name).await.force_close().await;
    }

    /// Snapshot of every registered breaker
    pub async fn all_status(&self) -> Vec<CircuitBreakerStats> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().await.values().cloned().collect();
        let mut stats = Vec::with_capacity(breakers.len());

        for breaker in breakers {
            stats.push(breaker.get_stats().await);
        }

        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Reset all circuit breakers
    pub async fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().await.values().cloned().collect();

        for breaker in breakers {
            breaker.force_close().await;
        }
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
