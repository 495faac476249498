#[cfg(test)]
use tokio::sync::watch;
#[cfg(test)]
use tokio::time::Duration;
use tokio::time::Instant;

/// Where timer tasks get "now" from and how they wait. Tests swap in `MockClock`, which only moves
/// when its controller says so.
#[async_trait::async_trait]
pub(crate) trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Instant;
    async fn sleep_until(&mut self, deadline: Instant);
}

#[derive(Copy, Clone, Default)]
pub(crate) struct RealClock;

#[async_trait::async_trait]
impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

#[cfg(test)]
pub(crate) fn mock_clock() -> (MockClock, MockClockController) {
    let started_at = Instant::now();
    let (tx, rx) = watch::channel(started_at);

    (
        MockClock { now: rx },
        MockClockController {
            tx,
            started_at,
            now: started_at,
        },
    )
}

#[cfg(test)]
#[derive(Clone)]
pub(crate) struct MockClock {
    now: watch::Receiver<Instant>,
}

#[cfg(test)]
#[async_trait::async_trait]
impl Clock for MockClock {
    fn now(&self) -> Instant {
        *self.now.borrow()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        while *self.now.borrow() < deadline {
            if self.now.changed().await.is_err() {
                // Controller dropped. Time is frozen.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Moves every `MockClock` cloned from the same pair.
///
/// A sleeper only promises to wake at or after its deadline, so one big `advance()` wakes a
/// periodic task once, not once per period it skipped.
#[cfg(test)]
pub(crate) struct MockClockController {
    tx: watch::Sender<Instant>,
    started_at: Instant,
    now: Instant,
}

#[cfg(test)]
impl MockClockController {
    pub(crate) fn now(&self) -> Instant {
        self.now
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.now - self.started_at
    }

    pub(crate) fn advance(&mut self, by: Duration) {
        self.now += by;
        // No clocks left is fine, nobody is sleeping.
        let _ = self.tx.send(self.now);
    }
}
