use crate::actor::WeakActorClient;
use crate::commitlog::Index;
use crate::replica::election::state_change_listener::{self, ElectionStateChangeNotifier};
use crate::replica::election::timers::{ElectionTimerHandle, LeaderTimerHandle, TimerGenerations};
use crate::replica::election::{ElectionStateChangeListener, ElectionStateSnapshot, LeaderStateTracker, PeerState};
use crate::replica::{ReplicaId, RoleSnapshot, Term};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::RangeInclusive;
use std::time::Duration;

#[derive(Clone)]
pub(crate) struct ElectionConfig {
    pub(crate) my_replica_id: ReplicaId,
    pub(crate) leader_heartbeat_duration: Duration,
    pub(crate) election_timeout_range: RangeInclusive<Duration>,
}

impl ElectionConfig {
    /// `[0.75T, 1.25T]` around the configured election timeout `T`.
    pub(crate) fn election_timeout_range_around(election_timeout: Duration) -> RangeInclusive<Duration> {
        let quarter = election_timeout / 4;
        (election_timeout - quarter)..=(election_timeout + quarter)
    }
}

/// ElectionState is responsible for holding state specific to the stage in an election. Its
/// methods are responsible for "what" to do. It is NOT responsible for validating anything
/// specific to logs, terms, peers, etc. or knowing "when" to do something.
///
/// Every transition goes through `replace_state()`, which tears down the outgoing role (timers,
/// waiting clients) before anyone can observe the new one.
pub(crate) struct ElectionState {
    state: State,
    term: Term,
    config: ElectionConfig,
    actor_client: WeakActorClient,
    generations: TimerGenerations,
    state_change_notifier: ElectionStateChangeNotifier,
}

impl ElectionState {
    /// `new_follower()` creates a new ElectionState instance that starts out as a follower.
    pub(crate) fn new_follower(
        config: ElectionConfig,
        actor_client: WeakActorClient,
        term: Term,
    ) -> (Self, ElectionStateChangeListener) {
        let generations = TimerGenerations::default();
        let initial_state = State::Follower(FollowerState::new(
            None,
            config.election_timeout_range.clone(),
            generations.clone(),
            actor_client.clone(),
        ));
        let (notifier, listener) =
            state_change_listener::new(ElectionStateSnapshot::now(initial_state.role_snapshot(), term));

        let election_state = Self {
            state: initial_state,
            term,
            config,
            actor_client,
            generations,
            state_change_notifier: notifier,
        };

        (election_state, listener)
    }

    pub(crate) fn transition_to_follower(&mut self, term: Term, leader: Option<ReplicaId>) {
        let fs = FollowerState::new(
            leader,
            self.config.election_timeout_range.clone(),
            self.generations.clone(),
            self.actor_client.clone(),
        );
        self.replace_state(term, State::Follower(fs));
    }

    /// The caller has already incremented and persisted the term along with the self-vote.
    pub(crate) fn transition_to_candidate_and_vote_for_self(&mut self, term: Term) {
        let mut cs = CandidateState::new(
            self.config.election_timeout_range.clone(),
            self.generations.clone(),
            self.actor_client.clone(),
        );
        cs.add_received_vote(self.config.my_replica_id.clone());

        self.replace_state(term, State::Candidate(cs));
    }

    pub(crate) fn transition_to_leader(&mut self, term: Term, peer_ids: Vec<ReplicaId>, latest_index: Option<Index>) {
        let mut peer_state = HashMap::with_capacity(peer_ids.len());
        for peer_id in peer_ids {
            let leader_timer_handle = LeaderTimerHandle::spawn_timer_task(
                self.config.leader_heartbeat_duration,
                self.actor_client.clone(),
                peer_id.clone(),
                term,
            );
            peer_state.insert(peer_id, PeerState::new(leader_timer_handle, latest_index));
        }

        let ls = LeaderState {
            tracker: LeaderStateTracker::new(peer_state),
        };
        self.replace_state(term, State::Leader(ls));
    }

    fn replace_state(&mut self, term: Term, new_state: State) {
        let old_state = std::mem::replace(&mut self.state, new_state);
        if let State::Leader(mut ls) = old_state {
            ls.tracker.fail_all_pending();
        }
        self.term = term;
        self.notify_new_state();
    }

    pub(crate) fn role_snapshot(&self) -> RoleSnapshot {
        self.state.role_snapshot()
    }

    pub(crate) fn is_leader(&self) -> bool {
        matches!(self.state, State::Leader(_))
    }

    pub(crate) fn is_candidate(&self) -> bool {
        matches!(self.state, State::Candidate(_))
    }

    /// Best guess at who the leader is, for redirecting clients.
    pub(crate) fn current_leader(&self) -> Option<ReplicaId> {
        match &self.state {
            State::Leader(_) => Some(self.config.my_replica_id.clone()),
            State::Candidate(_) => None,
            State::Follower(fs) => fs.leader.clone(),
        }
    }

    fn notify_new_state(&self) {
        self.state_change_notifier
            .notify_new_state(ElectionStateSnapshot::now(self.role_snapshot(), self.term));
    }

    /// Resetting also forgets that we granted a vote, because a leader has since asserted itself.
    pub(crate) fn reset_timeout_if_follower(&mut self) {
        if let State::Follower(fs) = &mut self.state {
            fs.timer.reset_timeout();
            fs.vote_granted_since_reset = false;
        }
    }

    pub(crate) fn set_leader_if_unknown(&mut self, leader: &ReplicaId) {
        if let State::Follower(fs) = &mut self.state {
            if fs.leader.is_none() {
                fs.leader.replace(leader.clone());
                self.notify_new_state();
            }
        }
    }

    pub(crate) fn record_vote_granted_if_follower(&mut self) {
        if let State::Follower(fs) = &mut self.state {
            fs.vote_granted_since_reset = true;
        }
    }

    pub(crate) fn vote_granted_since_reset(&self) -> bool {
        match &self.state {
            State::Follower(fs) => fs.vote_granted_since_reset,
            _ => false,
        }
    }

    pub(crate) fn is_current_timer_generation(&self, generation: u64) -> bool {
        match &self.state {
            State::Leader(_) => false,
            State::Candidate(cs) => cs.timer.is_current_generation(generation),
            State::Follower(fs) => fs.timer.is_current_generation(generation),
        }
    }

    #[cfg(test)]
    pub(crate) fn live_timer_generation(&self) -> Option<u64> {
        match &self.state {
            State::Leader(_) => None,
            State::Candidate(cs) => Some(cs.timer.current_generation()),
            State::Follower(fs) => Some(fs.timer.current_generation()),
        }
    }

    /// Records that the current leader's log is known to match ours up to `index`.
    pub(crate) fn record_verified_match_if_follower(&mut self, index: Option<Index>) {
        if let State::Follower(fs) = &mut self.state {
            if index > fs.verified_match {
                fs.verified_match = index;
            }
        }
    }

    pub(crate) fn verified_match(&self) -> Option<Index> {
        match &self.state {
            State::Follower(fs) => fs.verified_match,
            _ => None,
        }
    }

    /// Return number of votes received if candidate, or None if no longer Candidate.
    pub(crate) fn add_vote_if_candidate(&mut self, vote_from: ReplicaId) -> Option<usize> {
        if let State::Candidate(cs) = &mut self.state {
            Some(cs.add_received_vote(vote_from))
        } else {
            None
        }
    }

    pub(crate) fn leader_state(&self) -> Option<&LeaderStateTracker> {
        if let State::Leader(ls) = &self.state {
            Some(&ls.tracker)
        } else {
            None
        }
    }

    pub(crate) fn leader_state_mut(&mut self) -> Option<&mut LeaderStateTracker> {
        if let State::Leader(ls) = &mut self.state {
            Some(&mut ls.tracker)
        } else {
            None
        }
    }
}

impl fmt::Debug for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Leader(_) => write!(f, "Leader"),
            State::Candidate(_) => write!(f, "Candidate"),
            State::Follower(FollowerState {
                leader: Some(leader), ..
            }) => write!(f, "Follower(Leader={})", leader),
            State::Follower(FollowerState { leader: None, .. }) => write!(f, "Follower(Leader=None)"),
        }
    }
}

enum State {
    Leader(LeaderState),
    Candidate(CandidateState),
    Follower(FollowerState),
}

impl State {
    fn role_snapshot(&self) -> RoleSnapshot {
        match self {
            State::Leader(_) => RoleSnapshot::Leader,
            State::Candidate(_) => RoleSnapshot::Candidate,
            State::Follower(fs) => RoleSnapshot::Follower {
                leader: fs.leader.clone(),
            },
        }
    }
}

struct LeaderState {
    tracker: LeaderStateTracker,
}

struct CandidateState {
    received_votes_from: HashSet<ReplicaId>,
    timer: ElectionTimerHandle,
}

struct FollowerState {
    leader: Option<ReplicaId>,
    timer: ElectionTimerHandle,
    // Volatile stand-in for "votedFor was cleared by the last reset". The durable vote stays put
    // for the whole term, so we can never vote twice in one term.
    vote_granted_since_reset: bool,
    // Highest index at which our log is known to match the current leader's, this term.
    verified_match: Option<Index>,
}

impl CandidateState {
    fn new(
        timeout_range: RangeInclusive<Duration>,
        generations: TimerGenerations,
        actor_client: WeakActorClient,
    ) -> Self {
        Self {
            received_votes_from: HashSet::with_capacity(3),
            timer: ElectionTimerHandle::spawn_timer_task(timeout_range, generations, actor_client),
        }
    }

    /// `add_received_vote()` returns the number of unique votes we've received after adding the
    /// provided `vote_from`
    fn add_received_vote(&mut self, vote_from: ReplicaId) -> usize {
        self.received_votes_from.insert(vote_from);
        self.received_votes_from.len()
    }
}

impl FollowerState {
    fn new(
        leader: Option<ReplicaId>,
        timeout_range: RangeInclusive<Duration>,
        generations: TimerGenerations,
        actor_client: WeakActorClient,
    ) -> Self {
        Self {
            leader,
            timer: ElectionTimerHandle::spawn_timer_task(timeout_range, generations, actor_client),
            vote_granted_since_reset: false,
            verified_match: None,
        }
    }
}
