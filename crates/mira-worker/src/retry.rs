use std::future::Future;
use std::time::Duration;

use mira_core::WaError;
use tracing::warn;

use crate::stop::StopFlag;

const PERMANENT_MARKERS: &[&str] = &[
    "not logged in",
    "401 unauthorized",
    "logged out",
    "session expired",
    "authentication failed",
];

const RATE_LIMIT_MARKERS: &[&str] = &["429", "rate-overlimit", "rate limit", "too many requests"];

const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "context deadline",
    "connection refused",
    "connection reset",
    "not connected",
    "websocket",
];

const DEVICE_REMOVED_MARKERS: &[&str] = &["device_removed", "device removed", "conflict"];

const STREAM_ERROR_MARKERS: &[&str] = &["stream error", "stream:error", "stream errored", "515"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Session is gone; retrying cannot help.
    Permanent,
    RateLimited,
    Transient,
    /// Anything else, reported as-is without retry.
    Other,
}

pub fn classify_message(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

    if has(PERMANENT_MARKERS) {
        ErrorClass::Permanent
    } else if has(RATE_LIMIT_MARKERS) {
        ErrorClass::RateLimited
    } else if has(TRANSIENT_MARKERS) {
        ErrorClass::Transient
    } else {
        ErrorClass::Other
    }
}

pub fn classify(err: &WaError) -> ErrorClass {
    match err {
        WaError::NotLoggedIn => ErrorClass::Permanent,
        WaError::Timeout(_) | WaError::NotConnected | WaError::ChannelClosed => {
            ErrorClass::Transient
        }
        WaError::Remote {
            code: Some(429), ..
        } => ErrorClass::RateLimited,
        other => classify_message(&other.to_string()),
    }
}

/// Errors a [`RetryPolicy`] can schedule.
pub trait Retryable: std::fmt::Display {
    fn class(&self) -> ErrorClass;
}

impl Retryable for WaError {
    fn class(&self) -> ErrorClass {
        classify(self)
    }
}

/// Operator-facing remedy for a fatal protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hint {
    WaitMinutes(u64),
    RePair,
    RestartPhoneApp,
}

/// Minutes to suggest after a rate-limit schedule ran out: the longest
/// wait, rounded up.
pub fn wait_minutes(rate_limit_backoff: &[Duration]) -> u64 {
    let longest = rate_limit_backoff.last().copied().unwrap_or(Duration::from_secs(60));
    longest.as_secs().div_ceil(60).max(1)
}

pub fn hint_for(err: &WaError, rate_limit_backoff: &[Duration]) -> Option<Hint> {
    let lower = err.to_string().to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

    if classify(err) == ErrorClass::RateLimited {
        return Some(Hint::WaitMinutes(wait_minutes(rate_limit_backoff)));
    }
    if has(DEVICE_REMOVED_MARKERS) || classify(err) == ErrorClass::Permanent {
        return Some(Hint::RePair);
    }
    if has(STREAM_ERROR_MARKERS) {
        return Some(Hint::RestartPhoneApp);
    }
    None
}

/// Backoff schedules for transient failures and rate limits. Each schedule
/// of `n` waits allows `n + 1` attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub transient: Vec<Duration>,
    pub rate_limit: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(transient: Vec<Duration>, rate_limit: Vec<Duration>) -> Self {
        Self {
            transient,
            rate_limit,
        }
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// schedule for its error class is exhausted. A raised `stop` flag ends
    /// the wait and returns the last error.
    pub async fn run<T, E, F, Fut>(
        &self,
        label: &str,
        stop: Option<&StopFlag>,
        mut op: F,
    ) -> Result<T, E>
    where
        E: Retryable,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut transient_used = 0;
        let mut rate_used = 0;

        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let wait = match err.class() {
                ErrorClass::Transient => {
                    let wait = self.transient.get(transient_used).copied();
                    transient_used += 1;
                    wait
                }
                ErrorClass::RateLimited => {
                    let wait = self.rate_limit.get(rate_used).copied();
                    rate_used += 1;
                    wait
                }
                ErrorClass::Permanent | ErrorClass::Other => None,
            };

            let Some(wait) = wait else {
                return Err(err);
            };

            warn!(
                op = label,
                error = %err,
                wait_secs = wait.as_secs_f32(),
                attempt = transient_used + rate_used,
                "Retrying after failure"
            );

            let completed = match stop {
                Some(flag) => flag.sleep(wait).await,
                None => {
                    tokio::time::sleep(wait).await;
                    true
                }
            };
            if !completed {
                return Err(err);
            }
        }
    }
}
