use std::time::Duration;

use serde::Deserialize;

use crate::{ResilientError, Result};

/// Overall timeouts above this value are split so that one physical attempt
/// only gets a share of the budget.
const SPLIT_TIMEOUT_THRESHOLD: Duration = Duration::from_secs(15);

/// Share of the overall timeout, in tenths, granted to one physical attempt
/// once the timeout is split.
const PER_ATTEMPT_TIMEOUT_TENTHS: u32 = 3;

const ENV_PREFIX: &str = "RESILIENT_HTTP_";

/// Default ceiling on buffered response bodies.
const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Configures retry, timeout, pooling and pacing behavior of a client.
///
/// A snapshot is taken when the client is created; later changes to the
/// value used to build a client have no effect on it.
///
/// Durations deserialize from humantime strings such as `"250ms"` or `"30s"`.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientOptions {
    /// Minimum time to wait before a retry.
    #[serde(with = "humantime_serde")]
    pub retry_wait_min: Duration,
    /// Maximum time to wait before a retry.
    #[serde(with = "humantime_serde")]
    pub retry_wait_max: Duration,
    /// Overall request timeout. See [`ClientOptions::per_attempt_timeout`].
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Maximum number of retries after the initial attempt.
    pub retry_max: u32,
    /// Maximum number of response body bytes copied into log records.
    pub resp_read_limit: usize,
    /// Response bodies are truncated to this many bytes, `0` means no limit.
    pub max_body_size: usize,
    /// Promotes per-attempt diagnostics from `debug` to `info`.
    pub verbose: bool,
    /// Tear idle keep-alive connections down instead of pooling them.
    pub kill_idle_conn: bool,
    /// Maximum number of in-flight physical attempts, `0` means unbounded.
    pub max_pool_size: usize,
    /// Maximum number of admissions per second, `0` means unpaced.
    pub req_per_sec: u32,
}

impl ClientOptions {
    /// Preset for host spraying: many requests spread across many hosts,
    /// no connection reuse.
    pub fn spraying() -> Self {
        Self {
            retry_wait_min: Duration::from_secs(1),
            retry_wait_max: Duration::from_secs(30),
            timeout: Duration::from_secs(30),
            retry_max: 5,
            resp_read_limit: 4096,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            verbose: false,
            kill_idle_conn: true,
            max_pool_size: 100,
            req_per_sec: 10,
        }
    }

    /// Preset for single host workloads: many requests against the same
    /// host, keep-alive connections reused.
    pub fn single_host() -> Self {
        Self {
            kill_idle_conn: false,
            ..Self::spraying()
        }
    }

    /// Loads options from `RESILIENT_HTTP_*` environment variables on top of
    /// the [`ClientOptions::spraying`] preset.
    ///
    /// Recognized variables: `RETRY_WAIT_MIN`, `RETRY_WAIT_MAX`, `TIMEOUT`
    /// (humantime durations), `RETRY_MAX`, `RESP_READ_LIMIT`,
    /// `MAX_BODY_SIZE`, `MAX_POOL_SIZE`, `REQ_PER_SEC` (integers), `VERBOSE` and
    /// `KILL_IDLE_CONN` (booleans), each prefixed with `RESILIENT_HTTP_`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ClientOptions::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
                .map(|value| (format!("{ENV_PREFIX}{name}"), value))
        };

        let mut options = Self::spraying();
        if let Some((key, value)) = var("RETRY_WAIT_MIN") {
            options.retry_wait_min = parse_duration(&key, &value)?;
        }
        if let Some((key, value)) = var("RETRY_WAIT_MAX") {
            options.retry_wait_max = parse_duration(&key, &value)?;
        }
        if let Some((key, value)) = var("TIMEOUT") {
            options.timeout = parse_duration(&key, &value)?;
        }
        if let Some((key, value)) = var("RETRY_MAX") {
            options.retry_max = parse_number(&key, &value)?;
        }
        if let Some((key, value)) = var("RESP_READ_LIMIT") {
            options.resp_read_limit = parse_number(&key, &value)?;
        }
        if let Some((key, value)) = var("MAX_BODY_SIZE") {
            options.max_body_size = parse_number(&key, &value)?;
        }
        if let Some((key, value)) = var("MAX_POOL_SIZE") {
            options.max_pool_size = parse_number(&key, &value)?;
        }
        if let Some((key, value)) = var("REQ_PER_SEC") {
            options.req_per_sec = parse_number(&key, &value)?;
        }
        if let Some((key, value)) = var("VERBOSE") {
            options.verbose = parse_bool(&key, &value)?;
        }
        if let Some((key, value)) = var("KILL_IDLE_CONN") {
            options.kill_idle_conn = parse_bool(&key, &value)?;
        }
        Ok(options)
    }

    /// Timeout applied to one physical attempt.
    ///
    /// Above 15 seconds the overall timeout is split and each attempt gets
    /// 30% of it, leaving the remainder for retries. `None` when the timeout
    /// is zero.
    pub fn per_attempt_timeout(&self) -> Option<Duration> {
        if self.timeout.is_zero() {
            None
        } else if self.timeout > SPLIT_TIMEOUT_THRESHOLD {
            let share = match self.timeout.checked_mul(PER_ATTEMPT_TIMEOUT_TENTHS) {
                Some(scaled) => scaled / 10,
                None => self.timeout / 10 * PER_ATTEMPT_TIMEOUT_TENTHS,
            };
            Some(share)
        } else {
            Some(self.timeout)
        }
    }

    /// Ceiling on buffered response bodies, `None` when unlimited.
    pub fn body_limit(&self) -> Option<usize> {
        (self.max_body_size > 0).then_some(self.max_body_size)
    }

    /// Minimum spacing between two admissions, `None` when unpaced.
    pub fn pacing_interval(&self) -> Option<Duration> {
        (self.req_per_sec > 0).then(|| Duration::from_secs(1) / self.req_per_sec)
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::spraying()
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime_serde::re::humantime::parse_duration(value)
        .map_err(|err| ResilientError::Config(format!("{key}={value}: {err}")))
}

fn parse_number<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|err| ResilientError::Config(format!("{key}={value}: {err}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ResilientError::Config(format!(
            "{key}={value}: expected a boolean"
        ))),
    }
}
