//! Retry executor wrapping every remote call.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{ErrorClass, RemoteError};

const DEFAULT_WINDOW: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub network_delay: Duration,
    pub rate_limit_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            network_delay: Duration::from_secs(2),
            rate_limit_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Fixed delay before the next attempt; `None` for errors that must not be retried.
    pub fn delay_for(&self, class: ErrorClass) -> Option<Duration> {
        match class {
            ErrorClass::RateLimited => Some(self.rate_limit_delay),
            ErrorClass::Transient => Some(self.network_delay),
            ErrorClass::Fatal => None,
        }
    }
}

/// Where in the run a remote call happened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub operation: String,
    pub cursor: Option<String>,
    pub page_url: Option<String>,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Self::default()
        }
    }

    pub fn with_cursor(mut self, cursor: Option<&str>) -> Self {
        self.cursor = cursor.map(str::to_string);
        self
    }

    pub fn with_page(mut self, page_url: &str) -> Self {
        self.page_url = Some(page_url.to_string());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.operation)?;
        if let Some(cursor) = &self.cursor {
            write!(f, " cursor={cursor}")?;
        }
        if let Some(page_url) = &self.page_url {
            write!(f, " page={page_url}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: String,
    pub message: String,
    pub context: ErrorContext,
    pub attempt: usize,
    pub at: DateTime<Utc>,
}

/// Run-scoped, append-only error log shared by every phase.
#[derive(Debug, Clone, Default)]
pub struct RunErrorLog {
    entries: Arc<Mutex<Vec<RunError>>>,
}

impl RunErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, error: RunError) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.push(error);
    }

    pub fn entries(&self) -> Vec<RunError> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounded rolling window of successful call durations.
#[derive(Debug, Clone)]
pub struct ThroughputWindow {
    capacity: usize,
    samples: VecDeque<Duration>,
}

impl ThroughputWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn record(&mut self, elapsed: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(elapsed);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }

    /// Calls per second implied by the window, assuming serial execution.
    pub fn calls_per_second(&self) -> Option<f64> {
        self.average()
            .filter(|avg| !avg.is_zero())
            .map(|avg| 1.0 / avg.as_secs_f64())
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("{context}: giving up after {attempts} attempts")]
    Exhausted {
        context: String,
        attempts: usize,
        #[source]
        source: RemoteError,
    },
    #[error("{context}: not retryable")]
    Fatal {
        context: String,
        #[source]
        source: RemoteError,
    },
}

impl ExecutorError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExecutorError::Fatal { .. })
    }

    pub fn remote(&self) -> &RemoteError {
        match self {
            ExecutorError::Exhausted { source, .. } | ExecutorError::Fatal { source, .. } => {
                source
            }
        }
    }
}

#[derive(Debug)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    window: Mutex<ThroughputWindow>,
    errors: RunErrorLog,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, errors: RunErrorLog) -> Self {
        Self {
            policy,
            window: Mutex::new(ThroughputWindow::new(DEFAULT_WINDOW)),
            errors,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn errors(&self) -> &RunErrorLog {
        &self.errors
    }

    pub fn throughput(&self) -> ThroughputWindow {
        self.window.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub async fn execute<T, F, Fut>(
        &self,
        context: &ErrorContext,
        operation: F,
    ) -> Result<T, ExecutorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        self.execute_with_retry(context, self.policy.max_attempts, operation)
            .await
    }

    /// Run `operation` until it succeeds, hits a fatal error, or `max_attempts` is spent.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        context: &ErrorContext,
        max_attempts: usize,
        mut operation: F,
    ) -> Result<T, ExecutorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let started = Instant::now();
            let err = match operation().await {
                Ok(value) => {
                    self.window
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .record(started.elapsed());
                    return Ok(value);
                }
                Err(err) => err,
            };

            let class = err.class();
            self.errors.record(RunError {
                kind: class.as_str().to_string(),
                message: err.to_string(),
                context: context.clone(),
                attempt,
                at: Utc::now(),
            });

            let Some(delay) = self.policy.delay_for(class) else {
                warn!(%context, error = %err, "remote call failed with a non-retryable error");
                return Err(ExecutorError::Fatal {
                    context: context.to_string(),
                    source: err,
                });
            };
            if attempt >= max_attempts {
                warn!(%context, attempts = attempt, error = %err, "remote call retries exhausted");
                return Err(ExecutorError::Exhausted {
                    context: context.to_string(),
                    attempts: attempt,
                    source: err,
                });
            }

            debug!(
                %context,
                attempt,
                class = class.as_str(),
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying remote call"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
