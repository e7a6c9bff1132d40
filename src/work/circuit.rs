// src/work/circuit.rs

//! Circuit breaker for work that talks to a flaky external system.
//!
//! ```text
//! closed --(failure_threshold consecutive failures)--> open
//! open --(reset_timeout elapsed, next call)--> half_open
//! half_open --(success_threshold successes)--> closed
//! half_open --(any failure | half_open_max_calls exceeded)--> open
//! ```
//!
//! A rejected call fails the attempt with [`TaskError::CircuitOpen`]; it is
//! retried by the engine like any other failure.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::errors::TaskError;
use crate::work::{TaskWork, WorkContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub half_open_max_calls: u32,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
            success_threshold: 2,
        }
    }
}

/// Point-in-time counters of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitMetrics {
    pub name: String,
    pub state: CircuitState,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub consecutive_failures: u32,
    pub success_rate: f64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_calls: u32,
    opened_at: Option<Instant>,
    total_calls: u64,
    total_successes: u64,
    total_failures: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                half_open_calls: 0,
                opened_at: None,
                total_calls: 0,
                total_successes: 0,
                total_failures: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Admit or reject one call.
    pub fn acquire(&self) -> Result<(), TaskError> {
        let mut inner = self.lock();
        inner.total_calls += 1;

        if inner.state == CircuitState::Open {
            let elapsed = inner
                .opened_at
                .map(|at| at.elapsed() >= self.config.reset_timeout)
                .unwrap_or(false);
            if !elapsed {
                return Err(TaskError::CircuitOpen(self.name.clone()));
            }
            self.transition(&mut inner, CircuitState::HalfOpen);
        }

        if inner.state == CircuitState::HalfOpen {
            if inner.half_open_calls >= self.config.half_open_max_calls {
                self.transition(&mut inner, CircuitState::Open);
                return Err(TaskError::CircuitOpen(self.name.clone()));
            }
            inner.half_open_calls += 1;
        }

        Ok(())
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.total_successes += 1;
        inner.consecutive_failures = 0;

        if inner.state == CircuitState::HalfOpen {
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.config.success_threshold {
                self.transition(&mut inner, CircuitState::Closed);
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.total_failures += 1;
        inner.consecutive_failures += 1;

        if inner.state == CircuitState::HalfOpen
            || inner.consecutive_failures >= self.config.failure_threshold
        {
            self.transition(&mut inner, CircuitState::Open);
        }
    }

    pub fn metrics(&self) -> CircuitMetrics {
        let inner = self.lock();
        CircuitMetrics {
            name: self.name.clone(),
            state: inner.state,
            total_calls: inner.total_calls,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            consecutive_failures: inner.consecutive_failures,
            success_rate: if inner.total_calls > 0 {
                inner.total_successes as f64 / inner.total_calls as f64
            } else {
                0.0
            },
        }
    }

    /// Force the breaker back to `closed`.
    pub fn reset(&self) {
        let mut inner = self.lock();
        info!(circuit = %self.name, "manually resetting circuit breaker");
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.half_open_successes = 0;
        inner.half_open_calls = 0;
        inner.opened_at = None;
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        if inner.state == to {
            return;
        }
        info!(circuit = %self.name, from = %inner.state, %to, "circuit breaker transition");
        inner.state = to;
        match to {
            CircuitState::Open => inner.opened_at = Some(Instant::now()),
            CircuitState::HalfOpen => {
                inner.half_open_calls = 0;
                inner.half_open_successes = 0;
            }
            CircuitState::Closed => {}
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Runs the inner work only when the breaker admits the call.
///
/// Cancellation is not counted as a failure of the protected system.
#[derive(Clone)]
pub struct CircuitBreakerWork {
    inner: Arc<dyn TaskWork>,
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakerWork {
    pub fn new(inner: Arc<dyn TaskWork>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

impl fmt::Debug for CircuitBreakerWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerWork")
            .field("inner", &self.inner.describe())
            .field("breaker", &self.breaker.name)
            .finish()
    }
}

#[async_trait]
impl TaskWork for CircuitBreakerWork {
    async fn run(&self, ctx: WorkContext) -> Result<Value, TaskError> {
        if let Err(err) = self.breaker.acquire() {
            warn!(task = %ctx.task, circuit = %self.breaker.name, "call rejected by open circuit");
            return Err(err);
        }

        let result = self.inner.run(ctx).await;
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(TaskError::Cancelled) => {}
            Err(_) => self.breaker.record_failure(),
        }
        result
    }

    fn describe(&self) -> String {
        format!("{} [circuit {}]", self.inner.describe(), self.breaker.name)
    }
}
