use crate::actor::Event;
use crate::replica::LeaderTimerTick;
use std::time::Duration;
use tokio::sync::mpsc;

// How long a timer test waits before concluding nothing was sent.
const QUIET_PERIOD: Duration = Duration::from_millis(10);
// Upper bound on waiting for an event that should already be on its way.
const SANITY_TIMEOUT: Duration = Duration::from_secs(5);

/// TestUtilActor stands in for the replica actor in timer tests. It owns the receiving end of the
/// actor queue and checks what the timer tasks pushed onto it.
pub(super) struct TestUtilActor {
    rx: mpsc::Receiver<Event>,
}

impl TestUtilActor {
    pub(super) fn new(rx: mpsc::Receiver<Event>) -> Self {
        TestUtilActor { rx }
    }

    async fn next_event(&mut self) -> Event {
        match tokio::time::timeout(SANITY_TIMEOUT, self.rx.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => panic!("Actor queue closed"),
            Err(_) => panic!("No event within {:?}", SANITY_TIMEOUT),
        }
    }

    pub(super) async fn assert_leader_heartbeat_event(&mut self, expected: LeaderTimerTick) {
        match self.next_event().await {
            Event::LeaderTimer(tick) => assert_eq!(tick, expected),
            other => panic!("Expected a leader tick, got {:?}", other),
        }
    }

    /// Returns the generation carried by the fire.
    pub(super) async fn assert_election_timeout_event(&mut self) -> u64 {
        match self.next_event().await {
            Event::ElectionTimeout(tick) => tick.generation,
            other => panic!("Expected an election timeout, got {:?}", other),
        }
    }

    pub(super) async fn assert_no_event(&mut self) {
        if let Ok(event) = tokio::time::timeout(QUIET_PERIOD, self.rx.recv()).await {
            panic!("Expected no event, got {:?}", event);
        }
    }
}
