//! Request/response log records, delivered over a channel to a task that
//! writes them through `tracing`.
//!
//! Emission never blocks the request path: when the channel is full or the
//! writer is gone, the record is dropped.

use std::collections::BTreeMap;

use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use uuid::Uuid;

use crate::{Outcome, Request};

/// One completed logical request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub request_id: Uuid,
    pub method: String,
    pub url: String,
    pub request_headers: Vec<(String, String)>,
    pub request_payload: String,
    pub status: Option<u16>,
    /// Response body, capped at the client's `resp_read_limit`.
    pub response: String,
    pub attempts: u32,
    pub error: Option<String>,
}

impl LogRecord {
    pub(crate) fn new(request: &Request, outcome: &Outcome, read_limit: usize) -> Self {
        let request_headers = request
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_owned(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let request_payload = request
            .body
            .as_ref()
            .map(|body| String::from_utf8_lossy(body).into_owned())
            .unwrap_or_default();

        Self {
            request_id: Uuid::new_v4(),
            method: request.method.to_string(),
            url: request.url.clone(),
            request_headers,
            request_payload,
            status: outcome.status().map(|status| status.as_u16()),
            response: outcome
                .response()
                .map(|response| response.text_capped(read_limit))
                .unwrap_or_default(),
            attempts: outcome.attempts(),
            error: outcome.error().map(ToString::to_string),
        }
    }

    fn headers_json(&self) -> String {
        let headers: BTreeMap<&str, &str> = self
            .request_headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        serde_json::to_string(&headers).unwrap_or_else(|_| "{}".to_owned())
    }
}

/// Sending half of the log channel. Cheap to clone.
#[derive(Clone, Debug)]
pub struct LogSink {
    tx: mpsc::Sender<LogRecord>,
}

impl LogSink {
    /// Creates a sink and the receiver a custom writer consumes.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<LogRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Creates a sink whose records are written through `tracing` by a
    /// background task. The task ends once every sink clone is dropped.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn spawn(capacity: usize) -> (Self, JoinHandle<()>) {
        let (sink, mut rx) = Self::channel(capacity);
        let writer = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                write_record(&record);
            }
        });
        (sink, writer)
    }

    /// Queues a record. Never waits.
    pub fn emit(&self, record: LogRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                tracing::trace!(request_id = %record.request_id, "log channel full, record dropped");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

fn write_record(record: &LogRecord) {
    let headers = record.headers_json();
    match &record.error {
        None => tracing::info!(
            request_id = %record.request_id,
            method = %record.method,
            url = %record.url,
            request_headers = %headers,
            request_payload = %record.request_payload,
            status = ?record.status,
            attempts = record.attempts,
            response = %record.response,
            "client response"
        ),
        Some(error) => tracing::error!(
            request_id = %record.request_id,
            method = %record.method,
            url = %record.url,
            request_headers = %headers,
            request_payload = %record.request_payload,
            status = ?record.status,
            attempts = record.attempts,
            error = %error,
            "client response"
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use bytes::Bytes;
    use reqwest::{
        header::{HeaderValue, AUTHORIZATION},
        StatusCode, Url,
    };

    use super::{LogRecord, LogSink};
    use crate::{Decision, Outcome, Request, ResilientError, Response};

    fn request() -> Request {
        Request::post("http://localhost/login", "user=admin")
            .with_header(AUTHORIZATION, HeaderValue::from_static("Basic YTpi"))
    }

    #[test]
    fn record_caps_response_body() {
        let response = Response::new(
            StatusCode::OK,
            Url::parse("http://localhost/login").expect("static url"),
        )
        .with_body(Bytes::from_static(b"welcome back, admin"));
        let outcome = Outcome::new(Ok(response), 1, Decision::Succeed);

        let record = LogRecord::new(&request(), &outcome, 7);

        assert_eq!(record.response, "welcome");
        assert_eq!(record.status, Some(200));
        assert_eq!(record.request_payload, "user=admin");
        assert_eq!(record.method, "POST");
        assert_eq!(record.error, None);
        assert_eq!(record.headers_json(), r#"{"authorization":"Basic YTpi"}"#);
    }

    #[test]
    fn record_carries_error_text() {
        let err = ResilientError::Connection(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        let outcome = Outcome::new(Err(err), 3, Decision::Fail);

        let record = LogRecord::new(&request(), &outcome, 64);

        assert_eq!(record.status, None);
        assert_eq!(record.attempts, 3);
        assert_eq!(record.error.as_deref(), Some("connection error: refused"));
    }

    #[tokio::test]
    async fn full_channel_drops_instead_of_blocking() {
        let (sink, mut rx) = LogSink::channel(1);
        let outcome = Outcome::new(
            Err(ResilientError::InvalidRequest("bad".to_owned())),
            1,
            Decision::Fail,
        );

        sink.emit(LogRecord::new(&request(), &outcome, 0));
        sink.emit(LogRecord::new(&request(), &outcome, 0));

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn emitting_after_writer_is_gone_is_silent() {
        let (sink, rx) = LogSink::channel(4);
        drop(rx);
        let outcome = Outcome::new(
            Err(ResilientError::InvalidRequest("bad".to_owned())),
            1,
            Decision::Fail,
        );
        sink.emit(LogRecord::new(&request(), &outcome, 0));
    }
}
