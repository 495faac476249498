use crate::actor::WeakActorClient;
use crate::replica::election::timers::time::{Clock, RealClock};
use crate::replica::ElectionTimeoutTick;
use rand::Rng;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

/// TimerGenerations hands out generation ids that are unique across every election timer a
/// replica creates, so a fire from a dropped timer can never be mistaken for the live one.
#[derive(Clone, Default)]
pub(crate) struct TimerGenerations {
    counter: Arc<AtomicU64>,
}

impl TimerGenerations {
    fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// One arming of the timer: when to fire, and the generation the fire will carry.
#[derive(Copy, Clone, Debug)]
struct Armed {
    generation: u64,
    fire_at: Instant,
}

/// ElectionTimerHandle is owned by a follower or candidate. Each `reset_timeout()` publishes a new
/// generation and deadline to the task. Dropping the handle closes the channel, which ends the task.
pub(crate) struct ElectionTimerHandle<C: Clock = RealClock> {
    armed: watch::Sender<Armed>,
    generations: TimerGenerations,
    timeout_range: RangeInclusive<Duration>,
    clock: C,
}

struct ElectionTimerTask<C: Clock> {
    armed: watch::Receiver<Armed>,
    clock: C,
    actor_client: WeakActorClient,
}

impl ElectionTimerHandle {
    pub(crate) fn spawn_timer_task(
        timeout_range: RangeInclusive<Duration>,
        generations: TimerGenerations,
        actor_client: WeakActorClient,
    ) -> Self {
        let (task, handle) = new_timer(timeout_range, generations, actor_client, RealClock);
        tokio::spawn(task.run());

        handle
    }
}

impl<C: Clock> ElectionTimerHandle<C> {
    /// Cancels the pending fire and arms the timer again with a fresh random delay. A fire that
    /// was already in flight carries the old generation and will be ignored.
    pub(crate) fn reset_timeout(&self) {
        let armed = arm(&self.generations, &self.timeout_range, &self.clock);
        // Stored even if the task is gone, so generation checks stay accurate.
        self.armed.send_replace(armed);
    }

    pub(crate) fn is_current_generation(&self, generation: u64) -> bool {
        self.armed.borrow().generation == generation
    }

    #[cfg(test)]
    pub(crate) fn current_generation(&self) -> u64 {
        self.armed.borrow().generation
    }
}

fn arm<C: Clock>(generations: &TimerGenerations, timeout_range: &RangeInclusive<Duration>, clock: &C) -> Armed {
    let delay = rand::thread_rng().gen_range(timeout_range.clone());
    Armed {
        generation: generations.next(),
        fire_at: clock.now() + delay,
    }
}

fn new_timer<C: Clock>(
    timeout_range: RangeInclusive<Duration>,
    generations: TimerGenerations,
    actor_client: WeakActorClient,
    clock: C,
) -> (ElectionTimerTask<C>, ElectionTimerHandle<C>) {
    // Armed from the start, otherwise a new follower would time out on the spot.
    let (tx, rx) = watch::channel(arm(&generations, &timeout_range, &clock));

    let task = ElectionTimerTask {
        armed: rx,
        clock: clock.clone(),
        actor_client,
    };
    let handle = ElectionTimerHandle {
        armed: tx,
        generations,
        timeout_range,
        clock,
    };

    (task, handle)
}

impl<C: Clock> ElectionTimerTask<C> {
    async fn run(mut self) {
        loop {
            let armed = *self.armed.borrow_and_update();

            tokio::select! {
                // A closed channel means the role that owned the handle is gone. Checked first so a
                // dropped timer doesn't get one last fire out.
                biased;

                rearmed = self.armed.changed() => {
                    if rearmed.is_err() {
                        return;
                    }
                }
                _ = self.clock.sleep_until(armed.fire_at) => {
                    let tick = ElectionTimeoutTick {
                        generation: armed.generation,
                    };
                    if self.actor_client.election_timeout(tick).await.is_err() {
                        return;
                    }
                    // The replica either re-arms us or drops us in response. Nothing to do until then.
                    if self.armed.changed().await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
