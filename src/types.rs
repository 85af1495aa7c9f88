use bytes::{Bytes, BytesMut};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Method, StatusCode, Url, Version,
};

use crate::{Decision, ResilientError, Result};

/// One logical request: method, target, body and headers.
///
/// The body is held as [`Bytes`] so every physical attempt can resend it
/// without copying. Headers are applied verbatim.
#[derive(Clone, Debug)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub body: Option<Bytes>,
    pub headers: HeaderMap,
}

impl Request {
    /// Creates a request without body or headers.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
            headers: HeaderMap::new(),
        }
    }

    /// Shorthand for a `GET` request.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    /// Shorthand for a `POST` request with an already-serialized body.
    pub fn post(url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new(Method::POST, url).with_body(body)
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Appends a header; repeated names keep every value in insertion order.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Replaces the whole header set.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Parses the target URL.
    pub(crate) fn parse_url(&self) -> Result<Url> {
        Url::parse(&self.url)
            .map_err(|err| ResilientError::InvalidRequest(format!("{}: {err}", self.url)))
    }

    /// Builds the physical request for one attempt.
    pub(crate) fn to_reqwest(
        &self,
        url: &Url,
        timeout: Option<std::time::Duration>,
    ) -> reqwest::Request {
        let mut request = reqwest::Request::new(self.method.clone(), url.clone());
        *request.headers_mut() = self.headers.clone();
        if let Some(body) = &self.body {
            *request.body_mut() = Some(body.clone().into());
        }
        *request.timeout_mut() = timeout;
        request
    }
}

/// A fully buffered physical response.
#[derive(Clone, Debug)]
pub struct Response {
    pub status: StatusCode,
    pub version: Version,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    /// Creates a response by hand, for custom transports and tests.
    pub fn new(status: StatusCode, url: Url) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Buffers the body of a `reqwest` response, keeping at most `limit`
    /// bytes. Reading stops once the limit is reached.
    pub async fn from_reqwest(
        mut response: reqwest::Response,
        limit: Option<usize>,
    ) -> Result<Self> {
        let status = response.status();
        let version = response.version();
        let url = response.url().clone();
        let headers = response.headers().clone();
        let body = match limit {
            None => response.bytes().await?,
            Some(limit) => {
                let mut body = BytesMut::new();
                while let Some(chunk) = response.chunk().await? {
                    let room = limit - body.len();
                    if chunk.len() >= room {
                        body.extend_from_slice(&chunk[..room]);
                        break;
                    }
                    body.extend_from_slice(&chunk);
                }
                body.freeze()
            }
        };
        Ok(Self {
            status,
            version,
            url,
            headers,
            body,
        })
    }

    /// Body decoded as UTF-8, invalid sequences replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// At most `limit` bytes of the body, decoded lossily.
    pub fn text_capped(&self, limit: usize) -> String {
        let end = self.body.len().min(limit);
        String::from_utf8_lossy(&self.body[..end]).into_owned()
    }
}

/// Final result of a logical request.
///
/// Holds exactly what the last physical attempt produced, unchanged, plus
/// the number of attempts made and the decision that ended the loop.
#[derive(Debug)]
pub struct Outcome {
    result: std::result::Result<Response, ResilientError>,
    attempts: u32,
    decision: Decision,
}

impl Outcome {
    pub(crate) fn new(
        result: std::result::Result<Response, ResilientError>,
        attempts: u32,
        decision: Decision,
    ) -> Self {
        Self {
            result,
            attempts,
            decision,
        }
    }

    /// Number of physical attempts, including the initial send.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Decision that terminated the retry loop: [`Decision::Succeed`] or
    /// [`Decision::Fail`].
    pub fn decision(&self) -> Decision {
        self.decision
    }

    /// `true` when the last attempt produced a terminal response that the
    /// policy accepted.
    pub fn is_success(&self) -> bool {
        self.decision == Decision::Succeed && self.result.is_ok()
    }

    /// `true` when the loop stopped because the retry budget was spent on a
    /// retryable result.
    pub fn retries_exhausted(&self) -> bool {
        if self.decision != Decision::Fail {
            return false;
        }
        match &self.result {
            Ok(_) => true,
            Err(err) => err.is_transport(),
        }
    }

    pub fn response(&self) -> Option<&Response> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&ResilientError> {
        self.result.as_ref().err()
    }

    /// Status of the final response, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.response().map(|response| response.status)
    }

    pub fn into_result(self) -> std::result::Result<Response, ResilientError> {
        self.result
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use reqwest::{
        header::{HeaderValue, ACCEPT, CONTENT_TYPE},
        Method, StatusCode, Url,
    };

    use super::{Request, Response};
    use crate::ResilientError;

    #[test]
    fn physical_request_carries_body_headers_and_timeout() {
        let request = Request::post("http://localhost/login", "user=a&pass=b")
            .with_header(CONTENT_TYPE, HeaderValue::from_static("text/plain"))
            .with_header(ACCEPT, HeaderValue::from_static("*/*"));
        let url = request.parse_url().expect("url must parse");

        let physical = request.to_reqwest(&url, Some(std::time::Duration::from_secs(3)));

        assert_eq!(physical.method(), Method::POST);
        assert_eq!(physical.headers().len(), 2);
        assert_eq!(physical.timeout(), Some(&std::time::Duration::from_secs(3)));
        let body = physical
            .body()
            .and_then(reqwest::Body::as_bytes)
            .expect("body must be buffered");
        assert_eq!(body, b"user=a&pass=b");
    }

    #[test]
    fn unparsable_url_is_invalid_request() {
        let err = Request::get("not a url")
            .parse_url()
            .expect_err("url must be rejected");
        assert!(matches!(err, ResilientError::InvalidRequest(_)));
    }

    #[test]
    fn text_capped_truncates_body() {
        let url = Url::parse("http://localhost/").expect("static url");
        let response = Response::new(StatusCode::OK, url).with_body(Bytes::from_static(b"abcdef"));
        assert_eq!(response.text_capped(3), "abc");
        assert_eq!(response.text_capped(100), "abcdef");
    }
}
