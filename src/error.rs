use std::{io, time::Duration};

/// Error type returned by this crate.
///
/// Terminal HTTP responses (including 4xx and exhausted 5xx) are not errors;
/// they are returned as [`crate::Response`] inside the [`crate::Outcome`].
#[derive(Debug, thiserror::Error)]
pub enum ResilientError {
    /// Network or request execution error from `reqwest`.
    #[error("transport error: {0}")]
    Transport(reqwest::Error),
    /// Connection-level failure reported by a custom transport.
    #[error("connection error: {0}")]
    Connection(#[source] io::Error),
    /// A single physical attempt exceeded the per-attempt timeout.
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),
    /// The request could not be built (bad URL, bad header, ...).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// A configuration value could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The underlying HTTP client could not be constructed.
    #[error("failed to build http client: {0}")]
    Build(reqwest::Error),
}

impl ResilientError {
    /// Returns `true` for failures that happened on the wire and may succeed
    /// on a later attempt.
    ///
    /// Redirect-policy and decode failures repeat identically on every
    /// attempt and are not transport errors.
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Transport(err) => is_transient_reqwest(err),
            Self::Connection(err) => is_transient_io(err),
            Self::Timeout(_) => true,
            Self::InvalidRequest(_) | Self::Config(_) | Self::Build(_) => false,
        }
    }
}

fn is_transient_reqwest(err: &reqwest::Error) -> bool {
    if err.is_builder() || err.is_redirect() || err.is_decode() {
        return false;
    }
    err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
}

fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
    )
}

impl From<reqwest::Error> for ResilientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            Self::InvalidRequest(err.to_string())
        } else {
            Self::Transport(err)
        }
    }
}
