use crate::api::state_machine::{ApplicationError, CommandEncodeError};
use crate::commitlog::{index_as_u64, Index};
use crate::replica;
use crate::replica::{ReplicaId, Term};
use bytes::Bytes;
use std::io;

// Opaque type for application to match a submission with where it landed in the log.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RaftEntryId {
    pub(crate) term: Term,
    pub(crate) entry_index: Index,
}

impl RaftEntryId {
    pub fn term(&self) -> u64 {
        self.term.as_u64()
    }

    pub fn index(&self) -> u64 {
        self.entry_index.as_u64()
    }
}

#[derive(Debug)]
pub struct SubmitOutput {
    pub entry_id: RaftEntryId,
    /// What the state machine returned when it applied the command.
    pub result: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// `leader` is our best guess at who to resubmit to. None usually means an election is in
    /// progress; retry with backoff.
    #[error("I'm not leader")]
    NotLeader { leader: Option<String> },

    /// The command may or may not end up committed. Resubmit against the new leader only if the
    /// command is safe to apply twice.
    #[error("Lost leadership before the command committed")]
    LeadershipLost,

    #[error("Application error: {0}")]
    Application(ApplicationError),

    #[error("Command can't be encoded: {0}")]
    InvalidCommand(#[from] CommandEncodeError),

    #[error("Failed to persist log")]
    LocalIoError(io::Error),

    // Replica logic runs on a background task. This error is returned if the task has exited.
    #[error("Replica task has exited")]
    ReplicaExited,
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("I'm not leader")]
    NotLeader { leader: Option<String> },
    #[error("Application error: {0}")]
    Application(ApplicationError),
    #[error("Replica task has exited")]
    ReplicaExited,
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Failed to read log: {0:?}")]
    LocalIoError(io::Error),
    #[error("Replica task has exited")]
    ReplicaExited,
}

#[derive(Debug, thiserror::Error)]
#[error("Replica task has exited")]
pub struct ReplicaExited;

/// State machine contents as of `last_included_index`. Index and term are 0 for a snapshot of the
/// empty state.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub data: Bytes,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RaftRole {
    Leader,
    Candidate,
    Follower,
}

/// Point in time view of a replica. Indexes are 0 when there is no such entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReplicaStatus {
    pub role: RaftRole,
    pub term: u64,
    pub leader: Option<String>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
}

// ------- Conversions --------

fn leader_hint(leader: Option<ReplicaId>) -> Option<String> {
    leader.map(ReplicaId::into_inner)
}

impl From<replica::SubmitCommandOutput> for SubmitOutput {
    fn from(internal_output: replica::SubmitCommandOutput) -> Self {
        SubmitOutput {
            entry_id: RaftEntryId {
                term: internal_output.term,
                entry_index: internal_output.index,
            },
            result: internal_output.result,
        }
    }
}

impl From<replica::SubmitCommandError> for SubmitError {
    fn from(internal_error: replica::SubmitCommandError) -> Self {
        match internal_error {
            replica::SubmitCommandError::NotLeader { leader } => SubmitError::NotLeader {
                leader: leader_hint(leader),
            },
            replica::SubmitCommandError::LeadershipLost => SubmitError::LeadershipLost,
            replica::SubmitCommandError::Application(e) => SubmitError::Application(e),
            replica::SubmitCommandError::LocalIoError(e) => SubmitError::LocalIoError(e),
            replica::SubmitCommandError::ActorExited => SubmitError::ReplicaExited,
        }
    }
}

impl From<replica::ServeQueryError> for QueryError {
    fn from(internal_error: replica::ServeQueryError) -> Self {
        match internal_error {
            replica::ServeQueryError::NotLeader { leader } => QueryError::NotLeader {
                leader: leader_hint(leader),
            },
            replica::ServeQueryError::Application(e) => QueryError::Application(e),
            replica::ServeQueryError::ActorExited => QueryError::ReplicaExited,
        }
    }
}

impl From<replica::TakeSnapshotOutput> for Snapshot {
    fn from(internal_output: replica::TakeSnapshotOutput) -> Self {
        let (last_included_term, last_included_index) = match internal_output.last_included {
            None => (0, 0),
            Some((term, index)) => (term.as_u64(), index.as_u64()),
        };

        Snapshot {
            last_included_index,
            last_included_term,
            data: internal_output.data,
        }
    }
}

impl From<replica::TakeSnapshotError> for SnapshotError {
    fn from(internal_error: replica::TakeSnapshotError) -> Self {
        match internal_error {
            replica::TakeSnapshotError::LocalIoError(e) => SnapshotError::LocalIoError(e),
            replica::TakeSnapshotError::ActorExited => SnapshotError::ReplicaExited,
        }
    }
}

impl From<replica::ReplicaStatusOutput> for ReplicaStatus {
    fn from(internal_output: replica::ReplicaStatusOutput) -> Self {
        let (role, leader) = match internal_output.role {
            replica::RoleSnapshot::Leader => (RaftRole::Leader, None),
            replica::RoleSnapshot::Candidate => (RaftRole::Candidate, None),
            replica::RoleSnapshot::Follower { leader } => (RaftRole::Follower, leader_hint(leader)),
        };

        ReplicaStatus {
            role,
            term: internal_output.term.as_u64(),
            leader,
            commit_index: index_as_u64(internal_output.commit_index),
            last_applied: index_as_u64(internal_output.last_applied_index),
            last_log_index: index_as_u64(internal_output.latest_index),
        }
    }
}
