//! Admission control: a capacity gate and a pacing gate shared by every
//! logical request of one client.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{Mutex, OwnedSemaphorePermit, Semaphore},
    time::{self, Interval, MissedTickBehavior},
};

/// Bounds in-flight attempts and spaces admissions in time.
///
/// The pacing tick is awaited before the capacity slot is taken, so a
/// request parked on a saturated capacity gate never holds the pacing clock.
#[derive(Debug)]
pub struct ConcurrencyThrottle {
    capacity: Option<Capacity>,
    pacing: Option<Pacing>,
}

#[derive(Debug)]
struct Pacing {
    period: Duration,
    // created on first use so the throttle can be built outside a runtime
    ticker: Mutex<Option<Interval>>,
}

#[derive(Debug)]
struct Capacity {
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl ConcurrencyThrottle {
    /// `max_in_flight == 0` disables the capacity gate, a `None` or zero
    /// interval disables pacing.
    pub fn new(max_in_flight: usize, interval: Option<Duration>) -> Self {
        let capacity = (max_in_flight > 0).then(|| Capacity {
            semaphore: Arc::new(Semaphore::new(max_in_flight)),
            size: max_in_flight,
        });
        let pacing = interval
            .filter(|period| !period.is_zero())
            .map(|period| Pacing {
                period,
                ticker: Mutex::new(None),
            });
        Self { capacity, pacing }
    }

    /// A throttle that admits everything immediately.
    pub fn unbounded() -> Self {
        Self::new(0, None)
    }

    /// Waits for a pacing tick, then for a capacity slot.
    ///
    /// The returned [`Admission`] holds the slot until it is dropped.
    pub async fn admit(&self) -> Admission {
        if let Some(pacing) = &self.pacing {
            let mut ticker = pacing.ticker.lock().await;
            ticker
                .get_or_insert_with(|| {
                    let mut ticker = time::interval(pacing.period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    ticker
                })
                .tick()
                .await;
        }

        let permit = match &self.capacity {
            Some(capacity) => Some(
                Arc::clone(&capacity.semaphore)
                    .acquire_owned()
                    .await
                    // SAFETY: the semaphore is owned by the throttle and never closed
                    .expect("admission semaphore closed unexpectedly"),
            ),
            None => None,
        };
        tracing::trace!(in_flight = self.in_flight(), "admission granted");
        Admission { _permit: permit }
    }

    /// Free capacity slots, `None` when capacity is unbounded.
    pub fn available_permits(&self) -> Option<usize> {
        self.capacity
            .as_ref()
            .map(|capacity| capacity.semaphore.available_permits())
    }

    /// Number of admissions currently held.
    pub fn in_flight(&self) -> usize {
        self.capacity.as_ref().map_or(0, |capacity| {
            capacity.size - capacity.semaphore.available_permits()
        })
    }

    pub fn is_paced(&self) -> bool {
        self.pacing.is_some()
    }
}

/// Proof of admission. Dropping it releases the capacity slot.
#[derive(Debug)]
#[must_use = "dropping an admission releases its slot immediately"]
pub struct Admission {
    _permit: Option<OwnedSemaphorePermit>,
}
