use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use reqwest::{header::HeaderMap, Method, Url};
use tokio::time;

use crate::{
    dispatch::{Interrupt, Uninterruptible},
    BackoffStrategy, ClientOptions, ConcurrencyThrottle, Decision, HttpTransport, LogRecord,
    LogSink, Outcome, Request, ResilientError, Response, Result, RetryCheck, RetryPolicy,
    Transport, TransportMode,
};

type RequestHook = Arc<dyn Fn(&Request, u32) + Send + Sync>;
type ResponseHook = Arc<dyn Fn(&Response) + Send + Sync>;

/// HTTP client that retries, backs off, bounds concurrency and paces
/// requests.
///
/// Cloning is cheap: clones share the transport and the throttle, so the
/// capacity and pacing limits apply across all of them.
#[derive(Clone)]
pub struct ResilientClient {
    transport: Arc<dyn Transport>,
    throttle: Arc<ConcurrencyThrottle>,
    policy: Arc<dyn RetryCheck>,
    backoff: BackoffStrategy,
    options: ClientOptions,
    kill_idle_conn: bool,
    log_sink: Option<LogSink>,
    request_hook: Option<RequestHook>,
    response_hook: Option<ResponseHook>,
}

impl fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientClient")
            .field("options", &self.options)
            .field("retry_max", &self.options.retry_max)
            .field("backoff", &self.backoff)
            .field("kill_idle_conn", &self.kill_idle_conn)
            .field("throttle", &self.throttle)
            .field("log_sink", &self.log_sink.is_some())
            .finish_non_exhaustive()
    }
}

impl ResilientClient {
    /// Creates a client whose transport mode follows the options: spraying
    /// when `kill_idle_conn` is set, pooled reuse otherwise.
    pub fn new(options: ClientOptions) -> Result<Self> {
        Self::with_mode(TransportMode::for_options(&options), options)
    }

    /// Creates a client with an explicit transport mode and jittered
    /// exponential backoff.
    pub fn with_mode(mode: TransportMode, options: ClientOptions) -> Result<Self> {
        let transport = HttpTransport::build(mode, &options)?;
        let mut client = Self::with_transport(Arc::new(transport), options);
        client.backoff = BackoffStrategy::ExponentialJitter;
        Ok(client)
    }

    /// Creates a client around any transport, with deterministic
    /// exponential backoff.
    ///
    /// The idle-kill flag is reconciled with the transport: it is set when
    /// requested by the options or when the transport already refuses to
    /// keep connections idle.
    pub fn with_transport(transport: Arc<dyn Transport>, options: ClientOptions) -> Self {
        let kill_idle_conn = options.kill_idle_conn || transport.kills_idle_connections();
        let throttle = ConcurrencyThrottle::new(options.max_pool_size, options.pacing_interval());
        Self {
            transport,
            throttle: Arc::new(throttle),
            policy: Arc::new(RetryPolicy::new(options.retry_max)),
            backoff: BackoffStrategy::Exponential,
            options,
            kill_idle_conn,
            log_sink: None,
            request_hook: None,
            response_hook: None,
        }
    }

    /// Replaces the default [`RetryPolicy`]. `retry_max` from the options is
    /// then only enforced if the replacement does so itself.
    pub fn with_retry_policy(mut self, policy: impl RetryCheck + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Replaces the default [`RetryPolicy`] with a closure receiving each
    /// attempt's result and 0-based index.
    pub fn with_retry_check<F>(self, check: F) -> Self
    where
        F: Fn(std::result::Result<&Response, &ResilientError>, u32) -> Decision
            + Send
            + Sync
            + 'static,
    {
        self.with_retry_policy(check)
    }

    /// Calls `hook` before every physical attempt with its 0-based index; an
    /// index above zero marks a retry.
    pub fn with_request_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Request, u32) + Send + Sync + 'static,
    {
        self.request_hook = Some(Arc::new(hook));
        self
    }

    /// Calls `hook` with every physical response, including the ones that
    /// end up retried.
    pub fn with_response_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Response) + Send + Sync + 'static,
    {
        self.response_hook = Some(Arc::new(hook));
        self
    }

    /// Replaces the backoff strategy.
    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sends one [`LogRecord`] per completed logical request to `sink`.
    pub fn with_log_sink(mut self, sink: LogSink) -> Self {
        self.log_sink = Some(sink);
        self
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn throttle(&self) -> &ConcurrencyThrottle {
        &self.throttle
    }

    /// Whether idle connections are torn down rather than pooled.
    pub fn kills_idle_connections(&self) -> bool {
        self.kill_idle_conn
    }

    /// Drops idle pooled connections of the underlying transport.
    pub fn close_idle_connections(&self) {
        self.transport.close_idle_connections();
    }

    /// Runs one logical request to completion.
    pub async fn execute(&self, request: &Request) -> Outcome {
        match self.run(request, Uninterruptible).await {
            Ok(outcome) => outcome,
            Err(never) => match never {},
        }
    }

    /// Builds a [`Request`] from already-serialized parts and executes it.
    pub async fn execute_raw(
        &self,
        method: Method,
        url: impl Into<String>,
        body: Option<Bytes>,
        headers: HeaderMap,
    ) -> Outcome {
        let request = Request {
            method,
            url: url.into(),
            body,
            headers,
        };
        self.execute(&request).await
    }

    pub(crate) async fn run<I: Interrupt>(
        &self,
        request: &Request,
        interrupt: I,
    ) -> std::result::Result<Outcome, I::Cancelled> {
        interrupt.check()?;
        let outcome = match request.parse_url() {
            Ok(url) => self.attempt_loop(request, &url, &interrupt).await?,
            Err(err) => {
                let decision = self.policy.decide(Err(&err), 0);
                Outcome::new(Err(err), 1, decision)
            }
        };
        self.finish(request, &outcome);
        Ok(outcome)
    }

    async fn attempt_loop<I: Interrupt>(
        &self,
        request: &Request,
        url: &Url,
        interrupt: &I,
    ) -> std::result::Result<Outcome, I::Cancelled> {
        let per_attempt = self.options.per_attempt_timeout();
        let mut attempt = 0u32;
        loop {
            interrupt.check()?;

            let admission = self.throttle.admit().await;
            // admission may have waited arbitrarily long
            interrupt.check()?;
            if let Some(hook) = &self.request_hook {
                hook(request, attempt);
            }
            let result = self.send_once(request, url, per_attempt).await;
            drop(admission);

            if let (Some(hook), Ok(response)) = (&self.response_hook, &result) {
                hook(response);
            }

            let decision = self.policy.decide(result.as_ref(), attempt);
            if decision != Decision::Retry {
                if decision == Decision::Fail && attempt > 0 {
                    tracing::warn!(
                        url = %request.url,
                        attempts = attempt + 1,
                        "giving up after retries"
                    );
                }
                return Ok(Outcome::new(result, attempt + 1, decision));
            }

            let wait = self.backoff.wait(
                attempt + 1,
                self.options.retry_wait_min,
                self.options.retry_wait_max,
                result.as_ref().ok(),
            );
            self.log_retry(request, attempt, &result, wait);
            drop(result);

            time::sleep(wait).await;
            attempt += 1;
        }
    }

    async fn send_once(
        &self,
        request: &Request,
        url: &Url,
        per_attempt: Option<Duration>,
    ) -> Result<Response> {
        let physical = request.to_reqwest(url, per_attempt);
        match per_attempt {
            Some(limit) => time::timeout(limit, self.transport.send(physical))
                .await
                .unwrap_or(Err(ResilientError::Timeout(limit))),
            None => self.transport.send(physical).await,
        }
    }

    fn log_retry(&self, request: &Request, attempt: u32, result: &Result<Response>, wait: Duration) {
        let cause = match result {
            Ok(response) => response.status.to_string(),
            Err(err) => err.to_string(),
        };
        let wait_ms = wait.as_millis() as u64;
        if self.options.verbose {
            tracing::info!(url = %request.url, attempt, %cause, wait_ms, "retrying request");
        } else {
            tracing::debug!(url = %request.url, attempt, %cause, wait_ms, "retrying request");
        }
    }

    fn finish(&self, request: &Request, outcome: &Outcome) {
        if let Some(sink) = &self.log_sink {
            sink.emit(LogRecord::new(request, outcome, self.options.resp_read_limit));
        }
    }
}
