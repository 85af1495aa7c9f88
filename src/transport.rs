//! Connection layer: how physical attempts reach the network.

use std::{
    sync::{PoisonError, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::header::{self, HeaderMap, HeaderValue};

use crate::{ClientOptions, ResilientError, Response, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 100;

/// Sends one physical attempt.
///
/// Implementations must tolerate concurrent use: one transport is shared by
/// every logical request of a client.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends the request and buffers the whole response.
    async fn send(&self, request: reqwest::Request) -> Result<Response>;

    /// Reports whether the transport already closes connections instead of
    /// keeping them idle.
    fn kills_idle_connections(&self) -> bool {
        false
    }

    /// Drops every idle pooled connection.
    fn close_idle_connections(&self) {}
}

/// Connection reuse policy of an [`HttpTransport`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportMode {
    /// Keep-alive connections reused across requests to the same hosts.
    ///
    /// Only share such a transport across requests that target the same
    /// host population: pooling one-shot destinations leaks descriptors.
    PooledReuse,
    /// Keep-alive disabled, connections closed as soon as a response is
    /// read. Meant for requests spread across many distinct hosts.
    Spraying,
}

impl TransportMode {
    /// Spraying when the options ask for idle connections to be killed,
    /// pooled reuse otherwise.
    pub fn for_options(options: &ClientOptions) -> Self {
        if options.kill_idle_conn {
            Self::Spraying
        } else {
            Self::PooledReuse
        }
    }
}

/// [`Transport`] backed by a `reqwest` connection pool.
#[derive(Debug)]
pub struct HttpTransport {
    mode: TransportMode,
    kill_idle: bool,
    timeout: Option<Duration>,
    body_limit: Option<usize>,
    client: RwLock<reqwest::Client>,
}

impl HttpTransport {
    /// Builds a transport in `mode`.
    ///
    /// `options.kill_idle_conn` is honored in pooled mode too: the idle pool
    /// is then sized to zero. The per-attempt timeout comes from
    /// [`ClientOptions::per_attempt_timeout`], the body ceiling from
    /// [`ClientOptions::body_limit`].
    pub fn build(mode: TransportMode, options: &ClientOptions) -> Result<Self> {
        let kill_idle = options.kill_idle_conn || mode == TransportMode::Spraying;
        let timeout = options.per_attempt_timeout();
        let client = build_client(mode, kill_idle, timeout)?;
        Ok(Self {
            mode,
            kill_idle,
            timeout,
            body_limit: options.body_limit(),
            client: RwLock::new(client),
        })
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn current(&self) -> reqwest::Client {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: reqwest::Request) -> Result<Response> {
        let response = self.current().execute(request).await?;
        Response::from_reqwest(response, self.body_limit).await
    }

    fn kills_idle_connections(&self) -> bool {
        self.kill_idle
    }

    /// Swaps in a fresh connection pool. Requests already in flight keep
    /// the old pool until they finish, after which it is dropped.
    fn close_idle_connections(&self) {
        match build_client(self.mode, self.kill_idle, self.timeout) {
            Ok(client) => {
                *self.client.write().unwrap_or_else(PoisonError::into_inner) = client;
                tracing::debug!(mode = ?self.mode, "idle connections closed");
            }
            Err(err) => tracing::warn!("failed to rebuild connection pool: {err}"),
        }
    }
}

fn build_client(
    mode: TransportMode,
    kill_idle: bool,
    timeout: Option<Duration>,
) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        // probing arbitrary hosts: certificates are not verified
        .danger_accept_invalid_certs(true);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }

    builder = match mode {
        TransportMode::PooledReuse => builder
            .tcp_keepalive(TCP_KEEPALIVE)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(if kill_idle { 0 } else { POOL_MAX_IDLE_PER_HOST }),
        TransportMode::Spraying => {
            let mut headers = HeaderMap::new();
            headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
            builder.pool_max_idle_per_host(0).default_headers(headers)
        }
    };

    builder.build().map_err(ResilientError::Build)
}
