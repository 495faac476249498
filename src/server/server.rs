use crate::actor::WeakActorClient;
use crate::commitlog::{index_as_u64, Index};
use crate::protocol::{
    HeartbeatRequest, HeartbeatResponse, ProtocolEntryKind, ReplicateRequest, ReplicateResponse, SubmitRequest,
    SubmitResponse, SubmitStatus, VoteRequest, VoteResponse,
};
use crate::replica::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesLogEntry, AppendEntriesOutput, EntryKind, HeartbeatError,
    HeartbeatInput, HeartbeatOutput, ReplicaId, RequestVoteError, RequestVoteInput, RequestVoteOutput,
    SubmitCommandError, SubmitCommandInput, SubmitCommandOutput, Term,
};

/// RpcServer is the inbound side of a replica. A transport hands it decoded requests, and it
/// turns them into events for the local replica actor.
#[derive(Clone)]
pub struct RpcServer {
    logger: slog::Logger,
    local_replica: WeakActorClient,
}

/// Failures that don't fit in a protocol response.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum RpcError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Client is not a member of this cluster")]
    ClientNotInCluster,
    #[error("Server fault: {0}")]
    ServerFault(String),
}

impl RpcServer {
    pub(crate) fn new(logger: slog::Logger, local_replica: WeakActorClient) -> Self {
        RpcServer { logger, local_replica }
    }

    pub async fn handle_request_vote(&self, rpc_request: VoteRequest) -> Result<VoteResponse, RpcError> {
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let app_input = Self::convert_request_vote_input(rpc_request)?;
        let app_result = self.local_replica.request_vote(app_input).await;
        let rpc_reply = Self::convert_request_vote_result(app_result);
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_reply);

        rpc_reply
    }

    fn convert_request_vote_input(rpc_request: VoteRequest) -> Result<RequestVoteInput, RpcError> {
        let candidate_last_log_entry =
            Self::convert_log_entry_metadata(rpc_request.last_log_term, rpc_request.last_log_index)?;

        Ok(RequestVoteInput {
            candidate_term: Term::new(rpc_request.term),
            candidate_id: ReplicaId::new(rpc_request.candidate_id),
            candidate_last_log_entry,
        })
    }

    fn convert_request_vote_result(
        app_result: Result<RequestVoteOutput, RequestVoteError>,
    ) -> Result<VoteResponse, RpcError> {
        match app_result {
            Ok(ok) => Ok(VoteResponse {
                term: ok.term.as_u64(),
                vote_granted: ok.vote_granted,
            }),
            Err(RequestVoteError::RequestTermOutOfDate(term_info)) => Ok(VoteResponse {
                term: term_info.current_term.as_u64(),
                vote_granted: false,
            }),
            Err(RequestVoteError::CandidateNotInCluster) => Err(RpcError::ClientNotInCluster),
            Err(RequestVoteError::ActorExited) => Err(RpcError::ServerFault(
                "Server internal replica task has exited".to_string(),
            )),
        }
    }

    pub async fn handle_replicate(&self, rpc_request: ReplicateRequest) -> Result<ReplicateResponse, RpcError> {
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let request_term = rpc_request.term;
        let app_input = Self::convert_append_entries_input(rpc_request)?;
        let app_result = self.local_replica.append_entries(app_input).await;
        let rpc_reply = Self::convert_append_entries_result(request_term, app_result);
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_reply);

        rpc_reply
    }

    fn convert_append_entries_input(rpc_request: ReplicateRequest) -> Result<AppendEntriesInput, RpcError> {
        let leader_previous_log_entry =
            Self::convert_log_entry_metadata(rpc_request.prev_log_term, rpc_request.prev_log_index)?;

        let leader_commit_index = Self::convert_log_commit_index(rpc_request.leader_commit);

        let mut new_entries = Vec::with_capacity(rpc_request.entries.len());
        for proto_entry in rpc_request.entries {
            if proto_entry.term == 0 {
                return Err(RpcError::InvalidArgument("Log entry with term 0".to_string()));
            }
            new_entries.push(AppendEntriesLogEntry {
                term: Term::new(proto_entry.term),
                kind: match proto_entry.kind {
                    ProtocolEntryKind::Command => EntryKind::Command,
                    ProtocolEntryKind::NoOp => EntryKind::NoOp,
                },
                data: proto_entry.data,
            })
        }

        Ok(AppendEntriesInput {
            leader_term: Term::new(rpc_request.term),
            leader_id: ReplicaId::new(rpc_request.leader_id),
            leader_previous_log_entry,
            leader_commit_index,
            new_entries,
        })
    }

    fn convert_append_entries_result(
        request_term: u64,
        app_result: Result<AppendEntriesOutput, AppendEntriesError>,
    ) -> Result<ReplicateResponse, RpcError> {
        match app_result {
            // Accepting means we're on the leader's term now.
            Ok(ok) => Ok(ReplicateResponse {
                term: request_term,
                success: true,
                match_index: index_as_u64(ok.match_index),
                conflict_hint: None,
            }),
            Err(AppendEntriesError::ClientTermOutOfDate(term_info)) => Ok(ReplicateResponse {
                term: term_info.current_term.as_u64(),
                success: false,
                match_index: 0,
                conflict_hint: None,
            }),
            Err(AppendEntriesError::ServerMissingPreviousLogEntry { conflict_hint }) => Ok(ReplicateResponse {
                term: request_term,
                success: false,
                match_index: 0,
                conflict_hint: Some(conflict_hint.as_u64()),
            }),
            Err(AppendEntriesError::ClientNotInCluster) => Err(RpcError::ClientNotInCluster),
            Err(AppendEntriesError::ServerIsLeader) => {
                Err(RpcError::ServerFault("Server is leader for the same term".to_string()))
            }
            Err(AppendEntriesError::ServerIoError(_)) => Err(RpcError::ServerFault("Local IO failure".to_string())),
            Err(AppendEntriesError::ActorExited) => Err(RpcError::ServerFault(
                "Server internal replica task has exited".to_string(),
            )),
        }
    }

    pub async fn handle_heartbeat(&self, rpc_request: HeartbeatRequest) -> Result<HeartbeatResponse, RpcError> {
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let request_term = rpc_request.term;
        let app_input = HeartbeatInput {
            leader_term: Term::new(rpc_request.term),
            leader_id: ReplicaId::new(rpc_request.leader_id),
            leader_commit_index: Self::convert_log_commit_index(rpc_request.leader_commit),
        };
        let app_result = self.local_replica.heartbeat(app_input).await;
        let rpc_reply = Self::convert_heartbeat_result(request_term, app_result);
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_reply);

        rpc_reply
    }

    fn convert_heartbeat_result(
        request_term: u64,
        app_result: Result<HeartbeatOutput, HeartbeatError>,
    ) -> Result<HeartbeatResponse, RpcError> {
        match app_result {
            Ok(_) => Ok(HeartbeatResponse {
                term: request_term,
                success: true,
            }),
            Err(HeartbeatError::ClientTermOutOfDate(term_info)) => Ok(HeartbeatResponse {
                term: term_info.current_term.as_u64(),
                success: false,
            }),
            Err(HeartbeatError::ClientNotInCluster) => Err(RpcError::ClientNotInCluster),
            Err(HeartbeatError::ServerIsLeader) => {
                Err(RpcError::ServerFault("Server is leader for the same term".to_string()))
            }
            Err(HeartbeatError::ActorExited) => Err(RpcError::ServerFault(
                "Server internal replica task has exited".to_string(),
            )),
        }
    }

    /// Client entrypoint. Always answers; failures are described in the response.
    pub async fn handle_submit(&self, rpc_request: SubmitRequest) -> SubmitResponse {
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let app_result = self
            .local_replica
            .submit(SubmitCommandInput {
                data: rpc_request.command,
            })
            .await;
        let rpc_reply = Self::convert_submit_result(rpc_request.opaque_id, app_result);
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_reply);

        rpc_reply
    }

    fn convert_submit_result(
        opaque_id: String,
        app_result: Result<SubmitCommandOutput, SubmitCommandError>,
    ) -> SubmitResponse {
        match app_result {
            Ok(ok) => SubmitResponse {
                opaque_id,
                status: SubmitStatus::Ok,
                result: Some(ok.result),
                error_message: None,
            },
            Err(e) => {
                let error_message = match e {
                    SubmitCommandError::NotLeader { leader: Some(leader) } => {
                        format!("Not leader. Try {}", leader)
                    }
                    SubmitCommandError::Application(app_err) => app_err.message,
                    other => other.to_string(),
                };
                SubmitResponse {
                    opaque_id,
                    status: SubmitStatus::Error,
                    result: None,
                    error_message: Some(error_message),
                }
            }
        }
    }

    fn convert_log_entry_metadata(log_entry_term: u64, log_entry_index: u64) -> Result<Option<(Term, Index)>, RpcError> {
        match (log_entry_term, log_entry_index) {
            (0, 0) => Ok(None),
            (0, _) => Err(RpcError::InvalidArgument(
                "LogEntryTerm 0 and LogEntryIndex non-0".to_string(),
            )),
            (_, 0) => Err(RpcError::InvalidArgument(
                "LogEntryIndex 0 and LogEntryTerm non-0".to_string(),
            )),
            (term, index) => Ok(Some((Term::new(term), Index::new(index)))),
        }
    }

    fn convert_log_commit_index(log_commit_index: u64) -> Option<Index> {
        match log_commit_index {
            0 => None,
            index => Some(Index::new(index)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::TermOutOfDateInfo;

    #[test]
    fn log_entry_metadata_validation() {
        assert_eq!(RpcServer::convert_log_entry_metadata(0, 0), Ok(None));
        assert_eq!(
            RpcServer::convert_log_entry_metadata(3, 7),
            Ok(Some((Term::new(3), Index::new(7))))
        );
        assert!(matches!(
            RpcServer::convert_log_entry_metadata(0, 7),
            Err(RpcError::InvalidArgument(_))
        ));
        assert!(matches!(
            RpcServer::convert_log_entry_metadata(3, 0),
            Err(RpcError::InvalidArgument(_))
        ));
        assert_eq!(RpcServer::convert_log_commit_index(0), None);
        assert_eq!(RpcServer::convert_log_commit_index(4), Some(Index::new(4)));
    }

    #[test]
    fn append_entries_results_on_the_wire() {
        let stale = RpcServer::convert_append_entries_result(
            3,
            Err(AppendEntriesError::ClientTermOutOfDate(TermOutOfDateInfo {
                current_term: Term::new(5),
            })),
        )
        .unwrap();
        assert_eq!((stale.term, stale.success, stale.conflict_hint), (5, false, None));

        let conflict = RpcServer::convert_append_entries_result(
            3,
            Err(AppendEntriesError::ServerMissingPreviousLogEntry {
                conflict_hint: Index::new(2),
            }),
        )
        .unwrap();
        assert_eq!((conflict.term, conflict.success, conflict.conflict_hint), (3, false, Some(2)));

        let ok = RpcServer::convert_append_entries_result(
            3,
            Ok(AppendEntriesOutput {
                match_index: Some(Index::new(9)),
            }),
        )
        .unwrap();
        assert_eq!((ok.term, ok.success, ok.match_index), (3, true, 9));

        assert_eq!(
            RpcServer::convert_append_entries_result(3, Err(AppendEntriesError::ClientNotInCluster)),
            Err(RpcError::ClientNotInCluster)
        );
    }

    #[test]
    fn submit_errors_are_described() {
        let reply = RpcServer::convert_submit_result(
            "req-1".into(),
            Err(SubmitCommandError::NotLeader {
                leader: Some(ReplicaId::new("b")),
            }),
        );
        assert_eq!(reply.opaque_id, "req-1");
        assert_eq!(reply.status, SubmitStatus::Error);
        assert_eq!(reply.error_message.as_deref(), Some("Not leader. Try b"));

        let reply = RpcServer::convert_submit_result(
            "req-2".into(),
            Err(SubmitCommandError::Application(crate::api::ApplicationError::new("boom"))),
        );
        assert_eq!(reply.error_message.as_deref(), Some("boom"));
    }
}
