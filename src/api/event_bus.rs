use crate::replica::{ElectionStateChangeListener, ElectionStateSnapshot, RoleSnapshot};
use chrono::{DateTime, Utc};

/// An event that happened, as observed by the local raft replica.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RaftEvent {
    /// A role transition or term change. Consuming this event type is subtle. It doesn't queue
    /// intermediate events. If there are multiple events between when application awaits the
    /// next event, those events will be clobbered into only the most recent event.
    Election {
        state: RaftElectionState,
        term: u64,
        observed_at: DateTime<Utc>,
    },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RaftElectionState {
    Leader,
    Candidate,
    Follower { leader: Option<String> },
}

#[derive(Clone)]
pub struct RaftEventListener {
    election_state_change_listener: ElectionStateChangeListener,
}

impl RaftEventListener {
    pub(crate) fn new(election_state_change_listener: ElectionStateChangeListener) -> Self {
        RaftEventListener {
            election_state_change_listener,
        }
    }

    /// `next_event()` returns the next event that this local raft replica observes, or None once
    /// the replica has shut down.
    pub async fn next_event(&mut self) -> Option<RaftEvent> {
        self.election_state_change_listener.next().await.map(RaftEvent::from)
    }

    /// The most recent event, without waiting.
    pub fn latest_event(&self) -> RaftEvent {
        RaftEvent::from(self.election_state_change_listener.latest())
    }
}

// ------- Conversions --------

impl From<ElectionStateSnapshot> for RaftEvent {
    fn from(snapshot: ElectionStateSnapshot) -> Self {
        let state = match snapshot.role {
            RoleSnapshot::Leader => RaftElectionState::Leader,
            RoleSnapshot::Candidate => RaftElectionState::Candidate,
            RoleSnapshot::Follower { leader } => RaftElectionState::Follower {
                leader: leader.map(|id| id.into_inner()),
            },
        };

        RaftEvent::Election {
            state,
            term: snapshot.term.as_u64(),
            observed_at: snapshot.observed_at,
        }
    }
}
