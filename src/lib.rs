//! `resilient-http` is an async HTTP client core for workloads that fire many
//! requests at unreliable or rate-limited endpoints.
//!
//! Every logical request sent through [`ResilientClient::execute`] is
//! admitted by a [`ConcurrencyThrottle`] (bounded in-flight attempts, paced
//! issuance), sent over a [`Transport`], judged by a [`RetryPolicy`] and, when
//! transient, retried after a [`BackoffStrategy`] wait. The caller gets back
//! one immutable [`Outcome`] holding exactly what the last attempt produced.
//!
//! - [`ClientOptions::spraying`] targets many distinct hosts without
//!   connection reuse.
//! - [`ClientOptions::single_host`] targets one host population with
//!   keep-alive reuse.
//! - [`ResilientClient::dispatch`] packages a request as a cancellable
//!   [`Task`] for an external worker pool.

mod backoff;
mod client;
mod dispatch;
mod error;
mod log_sink;
mod options;
mod policy;
mod throttle;
mod transport;
mod types;

pub use backoff::BackoffStrategy;
pub use client::ResilientClient;
pub use dispatch::{NeverCancelled, Task, WorkUnit};
pub use error::ResilientError;
pub use log_sink::{LogRecord, LogSink};
pub use options::ClientOptions;
pub use policy::{is_transient_status, Decision, RetryCheck, RetryPolicy};
pub use throttle::{Admission, ConcurrencyThrottle};
pub use transport::{HttpTransport, Transport, TransportMode};
pub use types::{Outcome, Request, Response};

pub type Result<T> = std::result::Result<T, ResilientError>;
