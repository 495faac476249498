use super::Replica;
use crate::commitlog::{index_as_u64, Index, Log};
use crate::protocol::{VoteRequest, VoteResponse};
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::peers::ReplicaId;
use crate::replica::replica_api::{
    RequestVoteError, RequestVoteInput, RequestVoteOutput, RequestVoteReplyFromPeer, RequestVoteResult,
    TermOutOfDateInfo,
};
use crate::replica::write_ahead_log::WriteAheadLogEntry;
use crate::server::RpcError;
use crate::transport::TransportError;
use std::time::Duration;

impl<L, S> Replica<L, S>
where
    L: Log<WriteAheadLogEntry> + 'static,
    S: PersistentLocalState + 'static,
{
    pub(crate) fn server_handle_request_vote(
        &mut self,
        input: RequestVoteInput,
    ) -> Result<RequestVoteOutput, RequestVoteError> {
        // Ensure candidate is known member.
        if !self.cluster_tracker.contains_member(&input.candidate_id) {
            return Err(RequestVoteError::CandidateNotInCluster);
        }

        // Read our local term/vote state as 1 atomic action.
        let (current_term, mut opt_voted_for) = self.local_state.voted_for_current_term();

        // 1. Reply false if term < currentTerm (§5.1)
        if input.candidate_term < current_term {
            slog::info!(self.logger, "Not granting vote. Candidate term is out of date.");
            return Err(RequestVoteError::RequestTermOutOfDate(TermOutOfDateInfo {
                current_term,
            }));
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        if self.local_state.store_term_if_increased(input.candidate_term) {
            self.election_state.transition_to_follower(input.candidate_term, None);
            slog::info!(
                self.logger,
                "Observed term {:?} in RequestVote call. Election state: {:?}",
                input.candidate_term,
                self.election_state
            );
            // New term, so we haven't voted for anyone yet.
            opt_voted_for = None;
        }
        let term = input.candidate_term;

        // 2. If votedFor is null or candidateId, and candidate’s log is at
        // least as up-to-date as receiver’s log, grant vote (§5.2, §5.4).

        // If votedFor is null or candidateId, and...
        if let Some(voted_for) = opt_voted_for {
            if *voted_for != input.candidate_id {
                slog::info!(self.logger, "Not granting vote. We already voted for {}.", voted_for);
                return Ok(RequestVoteOutput {
                    term,
                    vote_granted: false,
                });
            }

            // Same candidate asking again, e.g. its first reply got lost.
            self.election_state.record_vote_granted_if_follower();
            return Ok(RequestVoteOutput {
                term,
                vote_granted: true,
            });
        }

        // ...and candidate’s log is at least as up-to-date as receiver’s log...
        if !self.is_candidate_log_gte_mine(input.candidate_last_log_entry) {
            slog::info!(self.logger, "Not granting vote. Candidate log is out of date.");
            return Ok(RequestVoteOutput {
                term,
                vote_granted: false,
            });
        }

        // ...grant vote. The vote is durable once the store call returns.
        let cas_success = self
            .local_state
            .store_vote_for_term_if_unvoted(term, input.candidate_id.clone());
        if !cas_success {
            slog::warn!(self.logger, "Lost race storing vote for {}", input.candidate_id);
            return Ok(RequestVoteOutput {
                term,
                vote_granted: false,
            });
        }

        slog::info!(self.logger, "Voting for {} in term {:?}.", input.candidate_id, term);
        self.election_state.record_vote_granted_if_follower();
        Ok(RequestVoteOutput {
            term,
            vote_granted: true,
        })
    }

    fn is_candidate_log_gte_mine(&self, candidate_last_entry: Option<(Term, Index)>) -> bool {
        // > Raft determines which of two logs is more up-to-date
        // > by comparing the index and term of the last entries in the
        // > logs. If the logs have last entries with different terms, then
        // > the log with the later term is more up-to-date. If the logs
        // > end with the same term, then whichever log is longer is
        // > more up-to-date.
        match (self.write_ahead_log.latest_entry(), candidate_last_entry) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some((my_term, my_index)), Some((candidate_term, candidate_index))) => {
                (candidate_term, candidate_index) >= (my_term, my_index)
            }
        }
    }

    pub(crate) fn handle_request_vote_reply_from_peer(&mut self, reply: RequestVoteReplyFromPeer) {
        // A newer term outranks everything else, even in a reply to an election we've given up on.
        if let RequestVoteResult::StaleTerm { new_term } = reply.result {
            if self.local_state.store_term_if_increased(new_term) {
                self.election_state.transition_to_follower(new_term, None);
                slog::info!(
                    self.logger,
                    "Peer {} is on newer term {:?}. Election state: {:?}",
                    reply.peer_id,
                    new_term,
                    self.election_state
                );
            }
            return;
        }

        let current_term = self.local_state.current_term();
        if current_term != reply.term {
            slog::info!(
                self.logger,
                "Received vote for outdated term {:?}, current term: {:?}.",
                reply.term,
                current_term,
            );
            return;
        }

        match reply.result {
            RequestVoteResult::VoteGranted => {
                let num_votes_received = match self.election_state.add_vote_if_candidate(reply.peer_id) {
                    Some(v) => v,
                    None => {
                        slog::info!(
                            self.logger,
                            "Received vote for term {:?} after transitioning to a election state: {:?}",
                            reply.term,
                            self.election_state,
                        );
                        return;
                    }
                };

                slog::info!(
                    self.logger,
                    "Received {}/{} votes for term {:?}",
                    num_votes_received,
                    self.cluster_tracker.cluster_size(),
                    reply.term,
                );

                if num_votes_received >= self.cluster_tracker.majority() {
                    self.become_leader(reply.term);
                }
            }
            RequestVoteResult::VoteNotGranted => {
                slog::info!(
                    self.logger,
                    "Vote not granted from {} for term {:?}",
                    reply.peer_id,
                    reply.term,
                );
            }
            RequestVoteResult::RetryableFailure => {
                if self.election_state.is_candidate() {
                    let request = self.new_vote_request(reply.term);
                    let delay = self.leader_heartbeat_duration;
                    self.spawn_request_vote(reply.peer_id, request, reply.term, Some(delay));
                }
            }
            RequestVoteResult::StaleTerm { .. } => { /* Handled above */ }
        }
    }

    pub(super) fn new_vote_request(&self, term: Term) -> VoteRequest {
        let (last_log_term, last_log_index) = match self.write_ahead_log.latest_entry() {
            None => (0, 0),
            Some((term, index)) => (term.as_u64(), index_as_u64(Some(index))),
        };

        VoteRequest {
            term: term.as_u64(),
            candidate_id: self.my_replica_id.as_str().to_string(),
            last_log_index,
            last_log_term,
        }
    }

    pub(super) fn spawn_request_vote(
        &self,
        peer_id: ReplicaId,
        request: VoteRequest,
        term: Term,
        delay: Option<Duration>,
    ) {
        let logger = self.logger.new(slog::o!("Peer" => peer_id.to_string()));
        let transport = self.transport.clone();
        let callback = self.actor_client.clone();
        let rpc_timeout = self.append_entries_timeout;

        tokio::task::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            slog::debug!(logger, "ClientWire - {:?}", request);
            let rpc_reply = match tokio::time::timeout(rpc_timeout, transport.request_vote(peer_id.as_str(), request)).await
            {
                Ok(reply) => reply,
                Err(_) => Err(TransportError::Timeout),
            };
            slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

            let callback_input = RequestVoteReplyFromPeer {
                result: convert_vote_reply(&logger, term, rpc_reply),
                peer_id,
                term,
            };
            // Actor gone means we're shutting down.
            let _ = callback.notify_request_vote_reply_from_peer(callback_input).await;
        });
    }
}

fn convert_vote_reply(
    logger: &slog::Logger,
    term: Term,
    rpc_reply: Result<VoteResponse, TransportError>,
) -> RequestVoteResult {
    match rpc_reply {
        Ok(response) if response.term > term.as_u64() => RequestVoteResult::StaleTerm {
            new_term: Term::new(response.term),
        },
        Ok(response) if response.vote_granted => RequestVoteResult::VoteGranted,
        Ok(_) => RequestVoteResult::VoteNotGranted,
        Err(TransportError::Rpc(RpcError::ClientNotInCluster)) => {
            slog::warn!(logger, "Peer doesn't think we're in the cluster");
            RequestVoteResult::VoteNotGranted
        }
        Err(e) => {
            slog::warn!(logger, "RequestVote call failed: {}", e);
            RequestVoteResult::RetryableFailure
        }
    }
}
