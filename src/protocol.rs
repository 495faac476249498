//! Transport-agnostic messages exchanged between replicas, and between a client and a replica.
//!
//! Log positions are flattened the way they would be on the wire: index `0` and term `0` mean
//! "no entry".

use bytes::Bytes;

#[derive(Clone, Debug, PartialEq)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReplicateRequest {
    pub term: u64,
    pub leader_id: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<ProtocolLogEntry>,
    pub leader_commit: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProtocolLogEntry {
    pub term: u64,
    pub kind: ProtocolEntryKind,
    pub data: Bytes,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProtocolEntryKind {
    Command,
    NoOp,
}

/// On success, `match_index` is the last index the follower now shares with the leader. On a log
/// conflict, `conflict_hint` is where the leader should resume sending from. A rejection without
/// a hint carries the follower's newer `term`.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplicateResponse {
    pub term: u64,
    pub success: bool,
    pub match_index: u64,
    pub conflict_hint: Option<u64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HeartbeatRequest {
    pub term: u64,
    pub leader_id: String,
    pub leader_commit: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HeartbeatResponse {
    pub term: u64,
    pub success: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SubmitRequest {
    pub opaque_id: String,
    /// An encoded `Command`.
    pub command: Bytes,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SubmitResponse {
    pub opaque_id: String,
    pub status: SubmitStatus,
    pub result: Option<Bytes>,
    pub error_message: Option<String>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SubmitStatus {
    Ok,
    Error,
}
