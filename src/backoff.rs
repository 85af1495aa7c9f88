//! Wait computation between two physical attempts.

use std::time::{Duration, SystemTime};

use rand::Rng;
use reqwest::header::{HeaderValue, RETRY_AFTER};

use crate::Response;

/// Largest exponent applied to the minimum wait; higher attempts saturate.
const MAX_EXPONENT: u32 = 31;

/// How long to wait before retry number `attempt`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum BackoffStrategy {
    /// `min * 2^(attempt - 1)` capped at `max`, then drawn uniformly from
    /// the upper half of that window.
    #[default]
    ExponentialJitter,
    /// `min * 2^(attempt - 1)` capped at `max`, no randomness.
    Exponential,
    /// `min * attempt` capped at `max`, no randomness.
    Linear,
}

impl BackoffStrategy {
    /// Computes the wait before retry `attempt` (1-based: the first retry is
    /// attempt 1).
    ///
    /// A `Retry-After` header on the last response takes precedence. The
    /// result always lies in `[min, max]`; when `min > max` the maximum wins.
    pub fn wait(
        &self,
        attempt: u32,
        min: Duration,
        max: Duration,
        last: Option<&Response>,
    ) -> Duration {
        let min = min.min(max);

        if let Some(delay) = last.and_then(retry_after) {
            return delay.clamp(min, max);
        }

        let attempt = attempt.max(1);
        let wait = match self {
            Self::ExponentialJitter => {
                let base = exponential_base(attempt, min, max);
                rand::thread_rng().gen_range(base / 2..=base)
            }
            Self::Exponential => exponential_base(attempt, min, max),
            Self::Linear => min.saturating_mul(attempt).min(max),
        };
        wait.clamp(min, max)
    }
}

fn exponential_base(attempt: u32, min: Duration, max: Duration) -> Duration {
    let exponent = (attempt - 1).min(MAX_EXPONENT);
    min.saturating_mul(1u32 << exponent).min(max)
}

/// Reads the `Retry-After` header of a response, if it holds a valid value.
fn retry_after(response: &Response) -> Option<Duration> {
    let value = response.headers.get(RETRY_AFTER)?;
    match parse_retry_after(value) {
        Ok(delay) => Some(delay),
        Err(err) => {
            tracing::debug!("ignoring Retry-After header: {err}");
            None
        }
    }
}

/// Parses a `Retry-After` value: delay-seconds or an HTTP-date. Dates in
/// the past yield zero.
pub(crate) fn parse_retry_after(
    value: &HeaderValue,
) -> std::result::Result<Duration, RetryAfterError> {
    let value = value
        .to_str()
        .map_err(|_| RetryAfterError::InvalidChars)?
        .trim();

    value.parse::<u64>().map(Duration::from_secs).or_else(|_| {
        httpdate::parse_http_date(value)
            .map(|date| {
                date.duration_since(SystemTime::now())
                    .unwrap_or(Duration::ZERO)
            })
            .map_err(|_| RetryAfterError::Value(value.to_owned()))
    })
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum RetryAfterError {
    #[error("unable to parse value '{0}'")]
    Value(String),
    #[error("header value contains invalid chars")]
    InvalidChars,
}
