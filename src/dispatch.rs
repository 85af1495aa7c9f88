//! Adapts a logical request into a unit of work for an external,
//! cancellable worker pool.
//!
//! The pool decides how units are scheduled; this module only packages the
//! request and honors the pool's cancellation signal.

use std::{
    convert::Infallible,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::{Outcome, Request, ResilientClient};

/// Cancellation signal exposed by the pool running a [`Task`].
pub trait WorkUnit: Send + Sync {
    fn is_cancelled(&self) -> bool;
}

impl WorkUnit for AtomicBool {
    fn is_cancelled(&self) -> bool {
        self.load(Ordering::Acquire)
    }
}

impl<T: WorkUnit + ?Sized> WorkUnit for Arc<T> {
    fn is_cancelled(&self) -> bool {
        (**self).is_cancelled()
    }
}

/// A unit that is never cancelled.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverCancelled;

impl WorkUnit for NeverCancelled {
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// One logical request packaged for submission to a worker pool.
#[derive(Clone, Debug)]
pub struct Task {
    client: ResilientClient,
    request: Request,
}

impl Task {
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Runs the request, checking `unit` before every physical attempt.
    ///
    /// Returns `None`, with no result and no error, as soon as cancellation
    /// is observed; the retry loop is not continued.
    pub async fn run<U>(self, unit: &U) -> Option<Outcome>
    where
        U: WorkUnit + ?Sized,
    {
        self.client.run(&self.request, unit).await.ok()
    }
}

impl ResilientClient {
    /// Packages `request` as a [`Task`] sharing this client's transport and
    /// throttle.
    pub fn dispatch(&self, request: Request) -> Task {
        Task {
            client: self.clone(),
            request,
        }
    }

    /// Executes `request` directly while honoring `unit`'s cancellation.
    pub async fn execute_cancellable<U>(&self, request: &Request, unit: &U) -> Option<Outcome>
    where
        U: WorkUnit + ?Sized,
    {
        self.run(request, unit).await.ok()
    }
}

/// Checked before each physical attempt of the retry loop, both before and
/// after admission.
pub(crate) trait Interrupt: Send + Sync {
    type Cancelled;

    fn check(&self) -> Result<(), Self::Cancelled>;
}

/// Interrupt of plain `execute` calls.
pub(crate) struct Uninterruptible;

impl Interrupt for Uninterruptible {
    type Cancelled = Infallible;

    fn check(&self) -> Result<(), Infallible> {
        Ok(())
    }
}

/// Marker returned when a work unit was cancelled.
pub(crate) struct Cancelled;

impl<U: WorkUnit + ?Sized> Interrupt for &U {
    type Cancelled = Cancelled;

    fn check(&self) -> Result<(), Cancelled> {
        if (**self).is_cancelled() {
            tracing::debug!("work unit cancelled before attempt");
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use reqwest::StatusCode;

    use super::{NeverCancelled, WorkUnit};
    use crate::{ClientOptions, Request, ResilientClient, Response, Result, Transport};

    /// Answers 503 and flips the cancellation flag once `cancel_after` hits
    /// have been served.
    struct CancellingTransport {
        hits: AtomicUsize,
        cancel_after: usize,
        flag: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Transport for CancellingTransport {
        async fn send(&self, request: reqwest::Request) -> Result<Response> {
            let hit = self.hits.fetch_add(1, Ordering::SeqCst) + 1;
            if hit >= self.cancel_after {
                self.flag.store(true, Ordering::Release);
            }
            Ok(Response::new(
                StatusCode::SERVICE_UNAVAILABLE,
                request.url().clone(),
            ))
        }
    }

    fn client(
        cancel_after: usize,
        flag: Arc<AtomicBool>,
    ) -> (ResilientClient, Arc<CancellingTransport>) {
        let transport = Arc::new(CancellingTransport {
            hits: AtomicUsize::new(0),
            cancel_after,
            flag,
        });
        let options = ClientOptions {
            retry_wait_min: Duration::from_millis(1),
            retry_wait_max: Duration::from_millis(2),
            retry_max: 10,
            max_pool_size: 2,
            req_per_sec: 0,
            ..ClientOptions::single_host()
        };
        (
            ResilientClient::with_transport(transport.clone(), options),
            transport,
        )
    }

    #[tokio::test]
    async fn cancelled_unit_never_sends() {
        let flag = Arc::new(AtomicBool::new(true));
        let (client, transport) = client(usize::MAX, flag.clone());

        let task = client.dispatch(Request::get("http://127.0.0.1/"));
        let result = task.run(&flag).await;

        assert!(result.is_none());
        assert_eq!(transport.hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_stops_retry_loop_between_attempts() {
        let flag = Arc::new(AtomicBool::new(false));
        let (client, transport) = client(2, flag.clone());

        let result = client
            .execute_cancellable(&Request::get("http://127.0.0.1/"), &flag)
            .await;

        assert!(result.is_none());
        assert_eq!(transport.hits.load(Ordering::SeqCst), 2);
        assert_eq!(client.throttle().available_permits(), Some(2));
    }

    #[tokio::test]
    async fn cancellation_while_waiting_for_capacity_skips_the_send() {
        let flag = Arc::new(AtomicBool::new(false));
        let (client, transport) = client(usize::MAX, flag.clone());
        let held = [client.throttle().admit().await, client.throttle().admit().await];

        let task = client.dispatch(Request::get("http://127.0.0.1/"));
        let unit = Arc::clone(&flag);
        let handle = tokio::spawn(async move { task.run(&unit).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished(), "task must be parked on the capacity gate");

        flag.store(true, Ordering::Release);
        drop(held);
        let result = handle.await.expect("task must not panic");

        assert!(result.is_none());
        assert_eq!(transport.hits.load(Ordering::SeqCst), 0);
        assert_eq!(client.throttle().available_permits(), Some(2));
    }

    #[tokio::test]
    async fn uncancelled_task_returns_outcome() {
        let flag = Arc::new(AtomicBool::new(false));
        let (client, _transport) = client(usize::MAX, flag);

        let task = client.dispatch(Request::get("http://127.0.0.1/"));
        assert_eq!(task.request().url, "http://127.0.0.1/");
        let outcome = tokio::spawn(async move { task.run(&NeverCancelled).await })
            .await
            .expect("task must not panic")
            .expect("task was not cancelled");

        assert_eq!(outcome.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
        assert_eq!(outcome.attempts(), 11);
    }

    #[test]
    fn shared_units_forward_cancellation() {
        let flag = Arc::new(AtomicBool::new(false));
        let shared: Arc<dyn WorkUnit> = flag.clone();
        assert!(!shared.is_cancelled());
        flag.store(true, Ordering::Release);
        assert!(shared.is_cancelled());
    }
}
