use crate::actor::WeakActorClient;
use crate::replica::election::timers::time::{Clock, RealClock};
use crate::replica::{LeaderTimerTick, ReplicaId, Term};
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

/// LeaderTimerHandle paces the leader's traffic to a single peer during one term. The task ticks
/// the actor whenever `heartbeat_duration` passes without anything being sent to the peer. It
/// stops when the handle is dropped, which happens when the leader steps down.
pub(crate) struct LeaderTimerHandle<C: Clock = RealClock> {
    quiet_until: watch::Sender<Instant>,
    heartbeat_duration: Duration,
    clock: C,
}

struct LeaderTimerTask<C: Clock> {
    quiet_until: watch::Receiver<Instant>,
    heartbeat_duration: Duration,
    clock: C,
    tick: LeaderTimerTick,
    actor_client: WeakActorClient,
}

impl LeaderTimerHandle {
    pub(crate) fn spawn_timer_task(
        heartbeat_duration: Duration,
        actor_client: WeakActorClient,
        peer_id: ReplicaId,
        term: Term,
    ) -> Self {
        let tick = LeaderTimerTick { peer_id, term };
        let (task, handle) = new_timer(heartbeat_duration, actor_client, tick, RealClock);
        tokio::spawn(task.run());

        handle
    }
}

impl<C: Clock> LeaderTimerHandle<C> {
    /// Something was just sent to the peer, so the next tick isn't due for another
    /// `heartbeat_duration`.
    pub(crate) fn reset_heartbeat_timer(&self) {
        // Fails only once the task has exited, and then there's nothing to postpone.
        let _ = self.quiet_until.send(self.clock.now() + self.heartbeat_duration);
    }
}

fn new_timer<C: Clock>(
    heartbeat_duration: Duration,
    actor_client: WeakActorClient,
    tick: LeaderTimerTick,
    clock: C,
) -> (LeaderTimerTask<C>, LeaderTimerHandle<C>) {
    // Quiet until "now", so a new leader ticks (and asserts itself to the peer) right away.
    let (tx, rx) = watch::channel(clock.now());

    let task = LeaderTimerTask {
        quiet_until: rx,
        heartbeat_duration,
        clock: clock.clone(),
        tick,
        actor_client,
    };
    let handle = LeaderTimerHandle {
        quiet_until: tx,
        heartbeat_duration,
        clock,
    };

    (task, handle)
}

impl<C: Clock> LeaderTimerTask<C> {
    async fn run(mut self) {
        let mut next_tick = *self.quiet_until.borrow_and_update();
        loop {
            tokio::select! {
                biased;

                postponed = self.quiet_until.changed() => {
                    if postponed.is_err() {
                        return;
                    }
                    next_tick = *self.quiet_until.borrow_and_update();
                }
                _ = self.clock.sleep_until(next_tick) => {
                    if self.actor_client.leader_timer(self.tick.clone()).await.is_err() {
                        return;
                    }
                    next_tick = self.clock.now() + self.heartbeat_duration;
                }
            }
        }
    }
}
