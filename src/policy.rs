use reqwest::StatusCode;

use crate::{ResilientError, Response};

/// What to do with the result of one physical attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Decision {
    /// Wait and send another attempt.
    Retry,
    /// Return the result to the caller as a terminal response.
    Succeed,
    /// Stop and report the last observed response or error unchanged.
    Fail,
}

/// Decides whether an attempt is retried.
///
/// Transport failures and transient statuses (429 and 500 through 504) are
/// retried until `retry_max` retries have been spent. Malformed requests are
/// never retried. Every other response is terminal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    retry_max: u32,
}

impl RetryPolicy {
    pub fn new(retry_max: u32) -> Self {
        Self { retry_max }
    }

    pub fn retry_max(&self) -> u32 {
        self.retry_max
    }

    /// `attempt` is the 0-based index of the attempt that produced `result`.
    pub fn decide(
        &self,
        result: Result<&Response, &ResilientError>,
        attempt: u32,
    ) -> Decision {
        let retryable = match result {
            Ok(response) => is_transient_status(response.status),
            Err(err) if err.is_transport() => true,
            Err(_) => return Decision::Fail,
        };

        match (retryable, attempt >= self.retry_max) {
            (false, _) => Decision::Succeed,
            (true, false) => Decision::Retry,
            (true, true) => Decision::Fail,
        }
    }
}

/// Decides the fate of one physical attempt.
///
/// [`RetryPolicy`] is the default; any
/// `Fn(Result<&Response, &ResilientError>, u32) -> Decision` closure works
/// too. `attempt` is the 0-based index of the attempt that produced
/// `result`.
pub trait RetryCheck: Send + Sync {
    fn decide(&self, result: Result<&Response, &ResilientError>, attempt: u32) -> Decision;
}

impl RetryCheck for RetryPolicy {
    fn decide(&self, result: Result<&Response, &ResilientError>, attempt: u32) -> Decision {
        RetryPolicy::decide(self, result, attempt)
    }
}

impl<F> RetryCheck for F
where
    F: Fn(Result<&Response, &ResilientError>, u32) -> Decision + Send + Sync,
{
    fn decide(&self, result: Result<&Response, &ResilientError>, attempt: u32) -> Decision {
        self(result, attempt)
    }
}

/// Statuses that usually clear up on their own.
pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || (500..=504).contains(&status.as_u16())
}

#[cfg(test)]
mod tests {
    use std::{io, time::Duration};

    use reqwest::{StatusCode, Url};

    use super::{Decision, RetryCheck, RetryPolicy};
    use crate::{ResilientError, Response};

    fn response(status: u16) -> Response {
        let status = StatusCode::from_u16(status).expect("valid status");
        Response::new(status, Url::parse("http://localhost/").expect("static url"))
    }

    #[test]
    fn transient_statuses_retry_until_budget_is_spent() {
        let policy = RetryPolicy::new(3);
        for status in [429, 500, 501, 502, 503, 504] {
            let response = response(status);
            for attempt in 0..3 {
                assert_eq!(
                    policy.decide(Ok(&response), attempt),
                    Decision::Retry,
                    "status {status} attempt {attempt}"
                );
            }
            assert_eq!(policy.decide(Ok(&response), 3), Decision::Fail);
            assert_eq!(policy.decide(Ok(&response), 7), Decision::Fail);
        }
    }

    #[test]
    fn terminal_statuses_succeed_at_any_attempt() {
        let policy = RetryPolicy::new(3);
        let terminal = (200..=299).chain(400..=428).chain(430..=499);
        for status in terminal {
            let response = response(status);
            for attempt in [0, 1, 3, 10] {
                assert_eq!(
                    policy.decide(Ok(&response), attempt),
                    Decision::Succeed,
                    "status {status} attempt {attempt}"
                );
            }
        }
    }

    #[test]
    fn server_errors_past_gateway_timeout_are_terminal() {
        let policy = RetryPolicy::new(3);
        assert_eq!(policy.decide(Ok(&response(505)), 0), Decision::Succeed);
        assert_eq!(policy.decide(Ok(&response(511)), 0), Decision::Succeed);
    }

    #[test]
    fn transport_errors_retry_then_fail() {
        let policy = RetryPolicy::new(2);
        let refused = ResilientError::Connection(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        let timeout = ResilientError::Timeout(Duration::from_millis(5));

        assert_eq!(policy.decide(Err(&refused), 0), Decision::Retry);
        assert_eq!(policy.decide(Err(&timeout), 1), Decision::Retry);
        assert_eq!(policy.decide(Err(&refused), 2), Decision::Fail);
    }

    #[test]
    fn malformed_requests_fail_on_first_attempt() {
        let policy = RetryPolicy::new(5);
        let invalid = ResilientError::InvalidRequest("relative URL without a base".to_owned());
        assert_eq!(policy.decide(Err(&invalid), 0), Decision::Fail);
    }

    #[test]
    fn zero_budget_never_retries() {
        let policy = RetryPolicy::new(0);
        assert_eq!(policy.decide(Ok(&response(503)), 0), Decision::Fail);
    }

    #[test]
    fn closures_act_as_retry_checks() {
        let only_first = |result: Result<&Response, &ResilientError>, attempt: u32| match result {
            Ok(response) if response.status == StatusCode::NOT_FOUND && attempt == 0 => {
                Decision::Retry
            }
            Ok(_) => Decision::Succeed,
            Err(_) => Decision::Fail,
        };
        let check: &dyn RetryCheck = &only_first;
        assert_eq!(check.decide(Ok(&response(404)), 0), Decision::Retry);
        assert_eq!(check.decide(Ok(&response(404)), 1), Decision::Succeed);

        let policy: &dyn RetryCheck = &RetryPolicy::new(1);
        assert_eq!(policy.decide(Ok(&response(503)), 0), Decision::Retry);
        assert_eq!(policy.decide(Ok(&response(503)), 1), Decision::Fail);
    }
}
