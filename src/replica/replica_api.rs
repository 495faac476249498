use crate::api::ApplicationError;
use crate::commitlog::Index;
use crate::replica::local_state::Term;
use crate::replica::peers::ReplicaId;
use crate::replica::write_ahead_log::EntryKind;
use bytes::Bytes;
use std::io;

#[derive(Debug)]
pub(crate) struct SubmitCommandInput {
    pub(crate) data: Bytes,
}

#[derive(Debug)]
pub(crate) struct SubmitCommandOutput {
    pub(crate) term: Term,
    pub(crate) index: Index,
    pub(crate) result: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum SubmitCommandError {
    #[error("I'm not leader")]
    NotLeader { leader: Option<ReplicaId> },

    #[error("Lost leadership before the command committed")]
    LeadershipLost,

    #[error("State machine failed to apply the command: {0}")]
    Application(ApplicationError),

    #[error("Failed to persist log")]
    LocalIoError(io::Error),

    #[error("Replica actor is dead RIP")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct QueryInput {
    pub(crate) name: String,
    pub(crate) args: Bytes,
}

#[derive(Debug)]
pub(crate) struct QueryOutput {
    pub(crate) result: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ServeQueryError {
    #[error("I'm not leader")]
    NotLeader { leader: Option<ReplicaId> },
    #[error("State machine failed to serve the query: {0}")]
    Application(ApplicationError),
    #[error("Replica actor is dead RIP")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct TakeSnapshotOutput {
    pub(crate) last_included: Option<(Term, Index)>,
    pub(crate) data: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum TakeSnapshotError {
    #[error("Failed to read log: {0:?}")]
    LocalIoError(io::Error),
    #[error("Replica actor is dead RIP")]
    ActorExited,
}

#[derive(Clone, Debug)]
pub(crate) struct ReplicaStatusOutput {
    pub(crate) role: RoleSnapshot,
    pub(crate) term: Term,
    pub(crate) commit_index: Option<Index>,
    pub(crate) last_applied_index: Option<Index>,
    pub(crate) latest_index: Option<Index>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum RoleSnapshot {
    Leader,
    Candidate,
    Follower { leader: Option<ReplicaId> },
}

#[derive(Debug)]
pub(crate) struct RequestVoteInput {
    pub(crate) candidate_term: Term,
    pub(crate) candidate_id: ReplicaId,
    pub(crate) candidate_last_log_entry: Option<(Term, Index)>,
}

#[derive(Debug)]
pub(crate) struct RequestVoteOutput {
    pub(crate) term: Term,
    pub(crate) vote_granted: bool,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum RequestVoteError {
    #[error("Candidate isn't a cluster member")]
    CandidateNotInCluster,
    #[error("Candidate's term {0:?} is behind ours")]
    RequestTermOutOfDate(TermOutOfDateInfo),
    #[error("Replica actor is dead RIP")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: ReplicaId,
    // Entry right before `new_entries` in the leader's log. None when they start at index 1.
    pub(crate) leader_previous_log_entry: Option<(Term, Index)>,
    pub(crate) leader_commit_index: Option<Index>,
    pub(crate) new_entries: Vec<AppendEntriesLogEntry>,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesLogEntry {
    pub(crate) term: Term,
    pub(crate) kind: EntryKind,
    pub(crate) data: Bytes,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesOutput {
    pub(crate) match_index: Option<Index>,
}

/// Rejections of a replicate request. Only `ServerMissingPreviousLogEntry` is part of normal log
/// reconciliation; the leader rewinds to `conflict_hint` and tries again.
#[derive(thiserror::Error, Debug)]
pub(crate) enum AppendEntriesError {
    #[error("Leader isn't a cluster member")]
    ClientNotInCluster,
    #[error("Leader's term {0:?} is behind ours")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("Our log doesn't hold the leader's previous entry. Resume from {conflict_hint:?}")]
    ServerMissingPreviousLogEntry { conflict_hint: Index },
    #[error("Two leaders claim the same term")]
    ServerIsLeader,
    #[error("Log write failed: {0:?}")]
    ServerIoError(io::Error),
    #[error("Replica actor is dead RIP")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct HeartbeatInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: ReplicaId,
    pub(crate) leader_commit_index: Option<Index>,
}

#[derive(Debug)]
pub(crate) struct HeartbeatOutput;

#[derive(thiserror::Error, Debug)]
pub(crate) enum HeartbeatError {
    #[error("Leader isn't a cluster member")]
    ClientNotInCluster,
    #[error("Leader's term {0:?} is behind ours")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("Two leaders claim the same term")]
    ServerIsLeader,
    #[error("Replica actor is dead RIP")]
    ActorExited,
}

/// Carried back to a sender whose term is stale, so it can catch up.
#[derive(Debug)]
pub(crate) struct TermOutOfDateInfo {
    pub(crate) current_term: Term,
}

#[derive(Debug)]
pub(crate) struct RequestVoteReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) result: RequestVoteResult,
}

#[derive(Debug)]
pub(crate) enum RequestVoteResult {
    VoteGranted,
    VoteNotGranted,
    StaleTerm { new_term: Term },
    RetryableFailure,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeer {
    pub(crate) descriptor: AppendEntriesReplyFromPeerDescriptor,
    pub(crate) result: Result<(), AppendEntriesReplyFromPeerError>,
}

/// What the leader sent, echoed back alongside the reply so it can be matched against the peer's
/// current `PeerState`.
#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeerDescriptor {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
    pub(crate) kind: PeerRequestKind,
    pub(crate) previous_log_entry_index: Option<Index>,
    pub(crate) num_log_entries: usize,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum PeerRequestKind {
    Replicate,
    Heartbeat,
}

#[derive(Debug)]
pub(crate) enum AppendEntriesReplyFromPeerError {
    PeerMissingPreviousLogEntry { conflict_hint: Option<Index> },
    RetryableFailure(String),
    StaleTerm { new_term: Term },
}

/// LeaderTimerTick contains info for a single tick of a leader's per-peer timer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LeaderTimerTick {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
}

/// ElectionTimeoutTick is a fired election timer. `generation` identifies which arming of the
/// timer fired, so the replica can drop fires that were superseded.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ElectionTimeoutTick {
    pub(crate) generation: u64,
}
