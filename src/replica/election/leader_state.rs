use crate::actor::Callback;
use crate::commitlog::Index;
use crate::replica::election::timers::LeaderTimerHandle;
use crate::replica::{ReplicaId, SubmitCommandError, SubmitCommandOutput};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

type SubmitCallback = Callback<SubmitCommandOutput, SubmitCommandError>;

/// LeaderStateTracker is everything that only exists while we're leader: per-peer replication
/// progress, and the clients waiting on entries we appended.
pub(crate) struct LeaderStateTracker {
    peer_state: HashMap<ReplicaId, PeerState>,
    pending: BTreeMap<Index, SubmitCallback>,
}

impl LeaderStateTracker {
    pub(super) fn new(peer_state: HashMap<ReplicaId, PeerState>) -> Self {
        LeaderStateTracker {
            peer_state,
            pending: BTreeMap::new(),
        }
    }

    pub(crate) fn peer_state_mut(&mut self, peer_id: &ReplicaId) -> Option<&mut PeerState> {
        self.peer_state.get_mut(peer_id)
    }

    pub(crate) fn peers_iter(&self) -> impl Iterator<Item = &PeerState> {
        self.peer_state.values()
    }

    pub(crate) fn register_pending(&mut self, index: Index, callback: SubmitCallback) {
        if let Some(replaced) = self.pending.insert(index, callback) {
            // Can't happen unless we appended twice at the same index within one term.
            replaced.send(Err(SubmitCommandError::LeadershipLost));
        }
    }

    pub(crate) fn take_pending(&mut self, index: Index) -> Option<SubmitCallback> {
        self.pending.remove(&index)
    }

    #[cfg(test)]
    pub(crate) fn num_pending(&self) -> usize {
        self.pending.len()
    }

    /// Fails every client still waiting on this leadership.
    pub(super) fn fail_all_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for (_, callback) in pending {
            callback.send(Err(SubmitCommandError::LeadershipLost));
        }
    }

    /// Number of peers that responded to us (successfully or not) within `window` of `now`.
    pub(crate) fn peers_with_recent_ack(&self, now: Instant, window: Duration) -> usize {
        self.peer_state
            .values()
            .filter(|ps| now.saturating_duration_since(ps.last_ack) <= window)
            .count()
    }
}

pub(crate) struct PeerState {
    // Held to send heartbeats for this peer
    leader_timer_handle: LeaderTimerHandle,

    // > index of the next log entry to send to that server
    // > (initialized to leader last log index + 1)
    next: Index,
    // > index of highest log entry known to be replicated on server
    // > (initialized to 0, increases monotonically)
    matched: Option<Index>,

    // SeqNo is a logical clock over one leader's exchanges with one peer, within one term. Each
    // request takes the next SeqNo and its reply carries it back. A reply with a SeqNo at or below
    // the last one received is a duplicate or was overtaken, and is discarded.
    last_sent_seq_no: u64,
    last_received_seq_no: u64,

    // Last time the peer answered at all. Drives leader step-down.
    last_ack: Instant,
}

impl PeerState {
    pub(super) fn new(leader_timer_handle: LeaderTimerHandle, latest_index: Option<Index>) -> Self {
        PeerState {
            leader_timer_handle,
            next: latest_index.map(|i| i.plus(1)).unwrap_or_else(Index::start_index),
            matched: None,
            last_sent_seq_no: 0,
            last_received_seq_no: 0,
            // A new leader gets one full step-down window before it needs to hear back.
            last_ack: Instant::now(),
        }
    }

    pub(crate) fn next_and_previous_log_index(&self) -> (Index, Option<Index>) {
        (self.next, self.next.checked_minus(1))
    }

    pub(crate) fn matched(&self) -> Option<Index> {
        self.matched
    }

    /// A peer is caught up when it's known to hold our entire log, so a heartbeat is enough.
    pub(crate) fn is_caught_up(&self, latest_index: Option<Index>) -> bool {
        self.matched.is_some() && self.matched == latest_index
    }

    /// Returns false if the update was discarded as out of date.
    pub(crate) fn handle_append_entries_result(
        &mut self,
        logger: &slog::Logger,
        received_seq_no: u64,
        update: PeerStateUpdate,
    ) -> bool {
        if !self.ratchet_fwd_received_seq_no(received_seq_no) {
            slog::warn!(
                logger,
                "Dropping out of date seq-no({:?}): {:?}",
                received_seq_no,
                update
            );
            return false;
        }

        match update {
            PeerStateUpdate::OtherError => { /* No action */ }
            PeerStateUpdate::Acknowledged => {
                self.last_ack = Instant::now();
            }
            PeerStateUpdate::Success {
                previous_log_entry,
                num_entries_replicated,
            } => {
                self.last_ack = Instant::now();
                self.update_log(previous_log_entry, num_entries_replicated);
            }
            PeerStateUpdate::PeerLogBehind { conflict_hint } => {
                self.last_ack = Instant::now();
                self.rewind_log(logger, conflict_hint);
            }
        }

        true
    }

    fn update_log(&mut self, previous_log_entry: Option<Index>, num_entries_replicated: usize) {
        let new_matched = match (previous_log_entry, num_entries_replicated) {
            // Empty replicate against an empty prefix proves nothing.
            (None, 0) => return,
            (None, n) => Index::new_usize(n),
            (Some(prev), n) => prev.plus(n as u64),
        };

        if self.matched.map_or(true, |matched| new_matched > matched) {
            self.matched = Some(new_matched);
        }
        let new_next = new_matched.plus(1);
        if new_next > self.next {
            self.next = new_next;
        }
    }

    fn rewind_log(&mut self, logger: &slog::Logger, conflict_hint: Option<Index>) {
        let stepped_back = match self.next.checked_minus(1) {
            Some(i) => i,
            None => {
                // Don't panic here, because peer could return garbage data.
                slog::warn!(logger, "Can't rewind peer log, already at beginning of log.");
                return;
            }
        };

        // The hint lets us skip the whole conflicting term in one round trip. Never move forward
        // on a hint, and never below what the peer already acknowledged.
        let mut new_next = match conflict_hint {
            Some(hint) if hint < stepped_back => hint,
            _ => stepped_back,
        };
        let floor = self.matched.map(|m| m.plus(1)).unwrap_or_else(Index::start_index);
        if new_next < floor {
            slog::warn!(
                logger,
                "Peer reported a conflict at or below its matched index {:?}. Clamping next to {:?}.",
                self.matched,
                floor
            );
            new_next = floor;
        }

        self.next = new_next;
    }

    pub(crate) fn has_outstanding_request(&self) -> bool {
        self.last_received_seq_no < self.last_sent_seq_no
    }

    pub(crate) fn next_seq_no(&mut self) -> u64 {
        self.last_sent_seq_no += 1;
        self.last_sent_seq_no
    }

    /// returns true if the state was mutated.
    fn ratchet_fwd_received_seq_no(&mut self, received_seq_no: u64) -> bool {
        if self.last_received_seq_no < received_seq_no && received_seq_no <= self.last_sent_seq_no {
            self.last_received_seq_no = received_seq_no;
            true
        } else {
            false
        }
    }

    pub(crate) fn reset_heartbeat_timer(&self) {
        self.leader_timer_handle.reset_heartbeat_timer();
    }
}

#[derive(Debug)]
pub(crate) enum PeerStateUpdate {
    Success {
        previous_log_entry: Option<Index>,
        num_entries_replicated: usize,
    },
    /// Heartbeat accepted. Says nothing about the peer's log.
    Acknowledged,
    PeerLogBehind {
        conflict_hint: Option<Index>,
    },
    OtherError,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::replica::Term;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn peer_state(client: &ActorClient, latest_index: u64) -> PeerState {
        let timer = LeaderTimerHandle::spawn_timer_task(
            Duration::from_secs(60),
            client.weak(),
            ReplicaId::new("peer"),
            Term::new(1),
        );
        PeerState::new(timer, Index::from_u64_opt(latest_index))
    }

    fn send_and_reply(ps: &mut PeerState, update: PeerStateUpdate) -> bool {
        let seq_no = ps.next_seq_no();
        assert!(ps.has_outstanding_request());
        let accepted = ps.handle_append_entries_result(&logger(), seq_no, update);
        assert!(!ps.has_outstanding_request());
        accepted
    }

    #[tokio::test]
    async fn success_ratchets_matched_and_next() {
        let (client, _rx) = ActorClient::new(10);
        let mut ps = peer_state(&client, 3);
        assert_eq!(ps.next_and_previous_log_index(), (Index::new(4), Some(Index::new(3))));

        send_and_reply(
            &mut ps,
            PeerStateUpdate::Success {
                previous_log_entry: Some(Index::new(3)),
                num_entries_replicated: 2,
            },
        );
        assert_eq!(ps.matched(), Some(Index::new(5)));
        assert_eq!(ps.next_and_previous_log_index().0, Index::new(6));
        assert!(ps.is_caught_up(Some(Index::new(5))));
        assert!(!ps.is_caught_up(Some(Index::new(6))));

        // Empty replicate still proves the prefix matches.
        let mut fresh = peer_state(&client, 3);
        send_and_reply(
            &mut fresh,
            PeerStateUpdate::Success {
                previous_log_entry: Some(Index::new(3)),
                num_entries_replicated: 0,
            },
        );
        assert_eq!(fresh.matched(), Some(Index::new(3)));
    }

    #[tokio::test]
    async fn rewind_uses_hint_and_respects_matched() {
        let (client, _rx) = ActorClient::new(10);
        let mut ps = peer_state(&client, 9);

        // No hint: step back by one.
        send_and_reply(&mut ps, PeerStateUpdate::PeerLogBehind { conflict_hint: None });
        assert_eq!(ps.next_and_previous_log_index().0, Index::new(9));

        // Hint further back: jump.
        send_and_reply(
            &mut ps,
            PeerStateUpdate::PeerLogBehind {
                conflict_hint: Some(Index::new(4)),
            },
        );
        assert_eq!(ps.next_and_previous_log_index().0, Index::new(4));

        // Hint forward is ignored.
        send_and_reply(
            &mut ps,
            PeerStateUpdate::PeerLogBehind {
                conflict_hint: Some(Index::new(8)),
            },
        );
        assert_eq!(ps.next_and_previous_log_index().0, Index::new(3));

        // Success, then a later conflict can't rewind below matched + 1.
        send_and_reply(
            &mut ps,
            PeerStateUpdate::Success {
                previous_log_entry: Some(Index::new(2)),
                num_entries_replicated: 3,
            },
        );
        assert_eq!(ps.matched(), Some(Index::new(5)));
        send_and_reply(
            &mut ps,
            PeerStateUpdate::PeerLogBehind {
                conflict_hint: Some(Index::new(1)),
            },
        );
        assert_eq!(ps.next_and_previous_log_index().0, Index::new(6));
    }

    #[tokio::test]
    async fn stale_seq_no_is_dropped() {
        let (client, _rx) = ActorClient::new(10);
        let mut ps = peer_state(&client, 2);

        let first = ps.next_seq_no();
        let second = ps.next_seq_no();
        assert!(ps.handle_append_entries_result(&logger(), second, PeerStateUpdate::OtherError));
        assert!(!ps.handle_append_entries_result(
            &logger(),
            first,
            PeerStateUpdate::PeerLogBehind { conflict_hint: None }
        ));
        // Never sent.
        assert!(!ps.handle_append_entries_result(&logger(), 99, PeerStateUpdate::OtherError));
        assert_eq!(ps.next_and_previous_log_index().0, Index::new(3));
    }

    #[tokio::test]
    async fn pending_callbacks_fail_on_leadership_loss() {
        let (client, _rx) = ActorClient::new(10);
        let mut peers = HashMap::new();
        peers.insert(ReplicaId::new("peer"), peer_state(&client, 0));
        let mut tracker = LeaderStateTracker::new(peers);

        let (tx_1, rx_1) = tokio::sync::oneshot::channel();
        let (tx_2, rx_2) = tokio::sync::oneshot::channel();
        tracker.register_pending(Index::new(1), Callback(tx_1));
        tracker.register_pending(Index::new(2), Callback(tx_2));
        assert_eq!(tracker.num_pending(), 2);

        assert!(tracker.take_pending(Index::new(1)).is_some());
        tracker.fail_all_pending();

        assert!(rx_1.await.is_err());
        assert!(matches!(rx_2.await.unwrap(), Err(SubmitCommandError::LeadershipLost)));
        assert_eq!(tracker.num_pending(), 0);
    }

    #[tokio::test]
    async fn recent_acks_are_counted() {
        let (client, _rx) = ActorClient::new(10);
        let mut peers = HashMap::new();
        peers.insert(ReplicaId::new("a"), peer_state(&client, 0));
        peers.insert(ReplicaId::new("b"), peer_state(&client, 0));
        let mut tracker = LeaderStateTracker::new(peers);

        let window = Duration::from_millis(500);
        let now = Instant::now();
        assert_eq!(tracker.peers_with_recent_ack(now, window), 2);
        assert_eq!(tracker.peers_with_recent_ack(now + window * 2, window), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let ps = tracker.peer_state_mut(&ReplicaId::new("a")).unwrap();
        let seq_no = ps.next_seq_no();
        ps.handle_append_entries_result(&logger(), seq_no, PeerStateUpdate::Acknowledged);
        let later = Instant::now() + window - Duration::from_millis(10);
        assert_eq!(tracker.peers_with_recent_ack(later, window), 1);
    }
}
