use super::{Replica, SendToPeerError};
use crate::actor::WeakActorClient;
use crate::commitlog::{index_as_u64, Index, Log};
use crate::protocol::{
    HeartbeatRequest, HeartbeatResponse, ProtocolEntryKind, ProtocolLogEntry, ReplicateRequest, ReplicateResponse,
};
use crate::replica::election::{PeerState, PeerStateUpdate};
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::peers::ReplicaId;
use crate::replica::replica_api::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, AppendEntriesReplyFromPeer,
    AppendEntriesReplyFromPeerDescriptor, AppendEntriesReplyFromPeerError, HeartbeatError, HeartbeatInput,
    HeartbeatOutput, LeaderTimerTick, PeerRequestKind, TermOutOfDateInfo,
};
use crate::replica::write_ahead_log::{EntryKind, WriteAheadLog, WriteAheadLogEntry};
use crate::transport::{PeerTransport, TransportError};
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{cmp, io};

// Cap on entries per Replicate request, so a far-behind peer catches up over several round trips
// instead of one giant message.
const MAX_ENTRIES_PER_REQUEST: u64 = 64;

/// Same-term message from another replica claiming to lead our term.
struct ObservedRivalLeader;

impl<L, S> Replica<L, S>
where
    L: Log<WriteAheadLogEntry> + 'static,
    S: PersistentLocalState + 'static,
{
    pub(crate) fn server_handle_append_entries(
        &mut self,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, AppendEntriesError> {
        // Ensure leader is known member.
        if !self.cluster_tracker.contains_member(&input.leader_id) {
            return Err(AppendEntriesError::ClientNotInCluster);
        }

        // 1. Reply false if term < currentTerm (§5.1)
        let current_term = self.local_state.current_term();
        if input.leader_term < current_term {
            return Err(AppendEntriesError::ClientTermOutOfDate(TermOutOfDateInfo {
                current_term,
            }));
        }

        self.observe_leader(input.leader_term, &input.leader_id)
            .map_err(|_| AppendEntriesError::ServerIsLeader)?;

        // 2. Reply false if [my] log doesn't contain an entry at [leader's]
        // prevLogIndex whose term matches [leader's] prevLogTerm (§5.3)
        if let Some((leader_prev_entry_term, leader_prev_entry_index)) = input.leader_previous_log_entry {
            let my_term = self
                .write_ahead_log
                .term_at(leader_prev_entry_index)
                .map_err(AppendEntriesError::ServerIoError)?;
            match my_term {
                Some(term) if term == leader_prev_entry_term => {}
                Some(conflicting_term) => {
                    let conflict_hint = self
                        .first_index_of_conflicting_term(leader_prev_entry_index, conflicting_term)
                        .map_err(AppendEntriesError::ServerIoError)?;
                    slog::info!(
                        self.logger,
                        "Conflict at {:?}: leader has term {:?}, we have {:?}. Hint {:?}",
                        leader_prev_entry_index,
                        leader_prev_entry_term,
                        conflicting_term,
                        conflict_hint
                    );
                    return Err(AppendEntriesError::ServerMissingPreviousLogEntry { conflict_hint });
                }
                None => {
                    let conflict_hint = self
                        .write_ahead_log
                        .latest_index()
                        .map(|i| i.plus(1))
                        .unwrap_or_else(Index::start_index);
                    return Err(AppendEntriesError::ServerMissingPreviousLogEntry { conflict_hint });
                }
            }
        }

        // 3. If [my] existing entry conflicts with [leader's new entries]
        // (same index but different terms), delete [my] existing entry and
        // all that follow it (§5.3)
        // 4. Append any new entries not already in the log
        let num_new_entries = input.new_entries.len();
        let mut next_entry_index = match input.leader_previous_log_entry {
            None => Index::start_index(),
            Some((_, leader_prev_entry_index)) => leader_prev_entry_index.plus(1),
        };
        for new_entry in input.new_entries {
            let opt_existing_term = self
                .write_ahead_log
                .term_at(next_entry_index)
                .map_err(AppendEntriesError::ServerIoError)?;

            // 3. (if...)
            if let Some(existing_term) = opt_existing_term {
                if existing_term == new_entry.term {
                    // 4. (no-op)
                    next_entry_index = next_entry_index.plus(1);
                    continue;
                } else {
                    // 3. (delete)
                    self.write_ahead_log
                        .truncate(next_entry_index)
                        .map_err(AppendEntriesError::ServerIoError)?;
                }
            }

            // 4. (append)
            let appended_index = self
                .write_ahead_log
                .append(WriteAheadLogEntry {
                    term: new_entry.term,
                    kind: new_entry.kind,
                    data: new_entry.data.to_vec(),
                })
                .map_err(AppendEntriesError::ServerIoError)?;
            assert_eq!(
                appended_index, next_entry_index,
                "Appended log entry to unexpected index."
            );

            next_entry_index = next_entry_index.plus(1);
        }

        // Everything up to here now matches the leader. Entries past it (if any) are unverified
        // leftovers from an older term.
        let verified_match = match (input.leader_previous_log_entry, num_new_entries) {
            (None, 0) => None,
            (None, n) => Some(Index::new_usize(n)),
            (Some((_, prev)), n) => Some(prev.plus(n as u64)),
        };
        self.election_state.record_verified_match_if_follower(verified_match);

        // 5. If leaderCommit > commitIndex, set commitIndex = min(leaderCommit, index of last new entry)
        if let (Some(leader_commit), Some(verified)) = (input.leader_commit_index, verified_match) {
            self.write_ahead_log
                .ratchet_fwd_commit_index(cmp::min(leader_commit, verified));
        }
        self.apply_all_committed_entries();

        Ok(AppendEntriesOutput {
            match_index: verified_match,
        })
    }

    pub(crate) fn server_handle_heartbeat(&mut self, input: HeartbeatInput) -> Result<HeartbeatOutput, HeartbeatError> {
        if !self.cluster_tracker.contains_member(&input.leader_id) {
            return Err(HeartbeatError::ClientNotInCluster);
        }

        let current_term = self.local_state.current_term();
        if input.leader_term < current_term {
            return Err(HeartbeatError::ClientTermOutOfDate(TermOutOfDateInfo { current_term }));
        }

        self.observe_leader(input.leader_term, &input.leader_id)
            .map_err(|_| HeartbeatError::ServerIsLeader)?;

        // A heartbeat carries no log position, so the leader's commit index only applies as far as
        // we've already verified our log against this leader.
        if let (Some(leader_commit), Some(verified)) =
            (input.leader_commit_index, self.election_state.verified_match())
        {
            self.write_ahead_log
                .ratchet_fwd_commit_index(cmp::min(leader_commit, verified));
            self.apply_all_committed_entries();
        }

        Ok(HeartbeatOutput)
    }

    /// Common handling of a legitimate-looking leader message for a term >= ours.
    fn observe_leader(&mut self, leader_term: Term, leader_id: &ReplicaId) -> Result<(), ObservedRivalLeader> {
        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        if self.local_state.store_term_if_increased(leader_term) {
            self.election_state
                .transition_to_follower(leader_term, Some(leader_id.clone()));
            slog::info!(
                self.logger,
                "Observed leader {} on newer term {:?}. Election state: {:?}",
                leader_id,
                leader_term,
                self.election_state
            );
        } else if self.election_state.is_leader() {
            slog::error!(
                self.logger,
                "Replica {} claims to lead our term {:?}. Rejecting.",
                leader_id,
                leader_term
            );
            return Err(ObservedRivalLeader);
        } else if self.election_state.is_candidate() {
            // > If AppendEntries RPC received from new leader: convert to follower
            self.election_state
                .transition_to_follower(leader_term, Some(leader_id.clone()));
            slog::info!(
                self.logger,
                "Lost election for term {:?} to {}. Election state: {:?}",
                leader_term,
                leader_id,
                self.election_state
            );
        } else {
            self.election_state.set_leader_if_unknown(leader_id);
        }

        self.election_state.reset_timeout_if_follower();
        Ok(())
    }

    /// Walks back from `conflict_index` to the first entry of `conflict_term`, so the leader can
    /// skip the whole term at once. Never goes at or below our commit index.
    fn first_index_of_conflicting_term(&self, conflict_index: Index, conflict_term: Term) -> Result<Index, io::Error> {
        let floor = self
            .write_ahead_log
            .commit_index()
            .map(|ci| ci.plus(1))
            .unwrap_or_else(Index::start_index);

        let mut first = conflict_index;
        while first > floor {
            let previous = match first.checked_minus(1) {
                Some(previous) => previous,
                None => break,
            };
            if self.write_ahead_log.term_at(previous)? != Some(conflict_term) {
                break;
            }
            first = previous;
        }

        Ok(first)
    }

    pub(crate) fn handle_leader_timer(&mut self, input: LeaderTimerTick) {
        let current_term = self.local_state.current_term();
        if current_term != input.term {
            slog::warn!(
                self.logger,
                "Received leader heartbeat for outdated term {:?}, current term: {:?}",
                input.term,
                current_term
            );
            return;
        }

        if !self.has_quorum_contact() {
            slog::warn!(
                self.logger,
                "Haven't heard from a majority within {:?}. Stepping down from term {:?}.",
                self.step_down_timeout,
                current_term
            );
            self.election_state.transition_to_follower(current_term, None);
            return;
        }

        self.send_to_peer_logged(&input.peer_id, current_term);
    }

    /// Ourselves plus every peer that answered recently.
    fn has_quorum_contact(&self) -> bool {
        match self.election_state.leader_state() {
            None => true,
            Some(leader_state) => {
                let recent = leader_state.peers_with_recent_ack(Instant::now(), self.step_down_timeout);
                1 + recent >= self.cluster_tracker.majority()
            }
        }
    }

    pub(super) fn replicate_to_all_peers(&mut self, term: Term) {
        let peer_ids: Vec<ReplicaId> = self.cluster_tracker.peer_ids().cloned().collect();
        for peer_id in peer_ids.iter() {
            self.send_to_peer_logged(peer_id, term);
        }
    }

    fn send_to_peer_logged(&mut self, peer_id: &ReplicaId, term: Term) {
        match self.send_to_peer(peer_id, term) {
            Ok(_) => {}
            Err(SendToPeerError::NoLongerLeader) => {
                slog::info!(self.logger, "Wanted to contact {} but no longer leader.", peer_id)
            }
            Err(SendToPeerError::PeerConcurrencyThrottle) => {
                slog::debug!(self.logger, "Request to peer {} already outstanding", peer_id)
            }
            Err(SendToPeerError::DiskRead(ioe)) => {
                slog::error!(self.logger, "Failed to read log for peer {}: {:?}", peer_id, ioe);
            }
            Err(SendToPeerError::LeaderStateMissingPeer) => {
                slog::error!(self.logger, "Peer {} is in the cluster but not tracked as leader.", peer_id);
            }
        }
    }

    fn send_to_peer(&mut self, peer_id: &ReplicaId, current_term: Term) -> Result<(), SendToPeerError> {
        let leader_state = self
            .election_state
            .leader_state_mut()
            .ok_or(SendToPeerError::NoLongerLeader)?;
        let peer_state = leader_state
            .peer_state_mut(peer_id)
            .ok_or(SendToPeerError::LeaderStateMissingPeer)?;

        // Simplicity vs throughput tradeoff. We're just going to allow 1 outstanding request per
        // peer; no pipelining. We still batch log entries.
        if peer_state.has_outstanding_request() {
            return Err(SendToPeerError::PeerConcurrencyThrottle);
        }

        let logger = self.logger.new(slog::o!("Peer" => peer_id.to_string()));
        if peer_state.is_caught_up(self.write_ahead_log.latest_index()) {
            let seq_no = peer_state.next_seq_no();
            let request = HeartbeatRequest {
                term: current_term.as_u64(),
                leader_id: self.my_replica_id.as_str().to_string(),
                leader_commit: index_as_u64(self.write_ahead_log.commit_index()),
            };
            let descriptor = AppendEntriesReplyFromPeerDescriptor {
                peer_id: peer_id.clone(),
                term: current_term,
                seq_no,
                kind: PeerRequestKind::Heartbeat,
                previous_log_entry_index: None,
                num_log_entries: 0,
            };
            tokio::task::spawn(call_peer_heartbeat(
                logger,
                self.transport.clone(),
                request,
                self.append_entries_timeout,
                self.actor_client.clone(),
                descriptor,
            ));
        } else {
            let (request, descriptor) = new_replicate_request(
                current_term,
                &self.my_replica_id,
                peer_id,
                peer_state,
                &self.write_ahead_log,
            )
            .map_err(SendToPeerError::DiskRead)?;
            tokio::task::spawn(call_peer_replicate(
                logger,
                self.transport.clone(),
                request,
                self.append_entries_timeout,
                self.actor_client.clone(),
                descriptor,
            ));
        }

        peer_state.reset_heartbeat_timer();
        Ok(())
    }

    pub(crate) fn handle_append_entries_reply_from_peer(&mut self, reply: AppendEntriesReplyFromPeer) {
        let logger = self.logger.new(
            slog::o!("Peer" => reply.descriptor.peer_id.to_string(), "SeqNo" => reply.descriptor.seq_no),
        );
        slog::debug!(logger, "AE reply from peer result: {:?}", reply.result);

        let current_term = self.local_state.current_term();
        if current_term != reply.descriptor.term {
            slog::info!(
                logger,
                "Received AE reply for outdated term {:?}, but we're on term {:?}",
                reply.descriptor.term,
                current_term
            );
            return;
        }

        // 1. Check for stale term rejection
        let peer_log_update = match reply.result {
            Err(AppendEntriesReplyFromPeerError::StaleTerm { new_term }) => {
                slog::warn!(logger, "Rejected by peer because my term is stale.");
                if self.local_state.store_term_if_increased(new_term) {
                    self.election_state.transition_to_follower(new_term, None);
                    slog::info!(logger, "Transitioned to follower on term {:?}.", new_term);
                    return;
                }
                slog::warn!(logger, "Peer reported a stale term that isn't newer than ours. Treating as generic failure.");
                PeerStateUpdate::OtherError
            }
            Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry { conflict_hint }) => {
                slog::info!(logger, "Peer is missing previous log entry. Hint: {:?}", conflict_hint);
                PeerStateUpdate::PeerLogBehind { conflict_hint }
            }
            Err(AppendEntriesReplyFromPeerError::RetryableFailure(err_msg)) => {
                slog::warn!(logger, "AE failure: {}", err_msg);
                PeerStateUpdate::OtherError
            }
            Ok(_) => match reply.descriptor.kind {
                PeerRequestKind::Heartbeat => PeerStateUpdate::Acknowledged,
                PeerRequestKind::Replicate => PeerStateUpdate::Success {
                    previous_log_entry: reply.descriptor.previous_log_entry_index,
                    num_entries_replicated: reply.descriptor.num_log_entries,
                },
            },
        };
        let retry_on_next_tick = matches!(peer_log_update, PeerStateUpdate::OtherError);

        // 2. Update peer log tracker
        let next_index = {
            let leader_state = match self.election_state.leader_state_mut() {
                Some(leader_state) => leader_state,
                None => {
                    slog::info!(logger, "No longer leader");
                    return;
                }
            };
            let peer_state = match leader_state.peer_state_mut(&reply.descriptor.peer_id) {
                Some(peer_state) => peer_state,
                None => {
                    slog::warn!(logger, "Peer not found while handling AE reply");
                    return;
                }
            };
            if !peer_state.handle_append_entries_result(&logger, reply.descriptor.seq_no, peer_log_update) {
                return;
            }
            peer_state.next_and_previous_log_index().0
        };

        // 3. Check for majority replication and apply new commits.
        self.advance_leader_commit_index();

        // 4. Keep going while the peer is behind.
        // > If last log index ≥ nextIndex for a follower: send
        // > AppendEntries RPC with log entries starting at nextIndex
        if retry_on_next_tick {
            return;
        }
        if let Some(latest_index) = self.write_ahead_log.latest_index() {
            if latest_index >= next_index {
                self.send_to_peer_logged(&reply.descriptor.peer_id, current_term);
            }
        }
    }
}

fn new_replicate_request<L>(
    current_term: Term,
    my_id: &ReplicaId,
    peer_id: &ReplicaId,
    peer_state: &mut PeerState,
    write_ahead_log: &WriteAheadLog<L>,
) -> Result<(ReplicateRequest, AppendEntriesReplyFromPeerDescriptor), io::Error>
where
    L: Log<WriteAheadLogEntry>,
{
    let (next_index, opt_previous_index) = peer_state.next_and_previous_log_index();
    let previous_log_entry_term = match opt_previous_index {
        None => None,
        Some(previous_index) => Some(write_ahead_log.read_required(previous_index)?.term),
    };

    let mut entries = Vec::new();
    if let Some(latest_index) = write_ahead_log.latest_index() {
        let last_to_send = cmp::min(latest_index, next_index.plus(MAX_ENTRIES_PER_REQUEST - 1));
        let mut index = next_index;
        while index <= last_to_send {
            entries.push(to_protocol_entry(write_ahead_log.read_required(index)?));
            index = index.plus(1);
        }
    }

    // Only consume a seq no once the request is definitely going out.
    let seq_no = peer_state.next_seq_no();
    let descriptor = AppendEntriesReplyFromPeerDescriptor {
        peer_id: peer_id.clone(),
        term: current_term,
        seq_no,
        kind: PeerRequestKind::Replicate,
        previous_log_entry_index: opt_previous_index,
        num_log_entries: entries.len(),
    };

    let request = ReplicateRequest {
        term: current_term.as_u64(),
        leader_id: my_id.as_str().to_string(),
        prev_log_index: index_as_u64(opt_previous_index),
        prev_log_term: previous_log_entry_term.map(|t| t.as_u64()).unwrap_or(0),
        entries,
        leader_commit: index_as_u64(write_ahead_log.commit_index()),
    };

    Ok((request, descriptor))
}

fn to_protocol_entry(entry: WriteAheadLogEntry) -> ProtocolLogEntry {
    ProtocolLogEntry {
        term: entry.term.as_u64(),
        kind: match entry.kind {
            EntryKind::Command => ProtocolEntryKind::Command,
            EntryKind::NoOp => ProtocolEntryKind::NoOp,
        },
        data: Bytes::from(entry.data),
    }
}

async fn call_peer_replicate(
    logger: slog::Logger,
    transport: Arc<dyn PeerTransport>,
    rpc_request: ReplicateRequest,
    rpc_timeout: Duration,
    callback: WeakActorClient,
    descriptor: AppendEntriesReplyFromPeerDescriptor,
) {
    slog::debug!(logger, "ClientWire - {:?}", rpc_request);
    let rpc_reply = tokio::time::timeout(rpc_timeout, transport.replicate(descriptor.peer_id.as_str(), rpc_request))
        .await
        .unwrap_or(Err(TransportError::Timeout));
    slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

    let callback_input = AppendEntriesReplyFromPeer {
        result: convert_replicate_reply(descriptor.term, rpc_reply),
        descriptor,
    };
    // Actor gone means we're shutting down.
    let _ = callback.notify_append_entries_reply_from_peer(callback_input).await;
}

async fn call_peer_heartbeat(
    logger: slog::Logger,
    transport: Arc<dyn PeerTransport>,
    rpc_request: HeartbeatRequest,
    rpc_timeout: Duration,
    callback: WeakActorClient,
    descriptor: AppendEntriesReplyFromPeerDescriptor,
) {
    slog::debug!(logger, "ClientWire - {:?}", rpc_request);
    let rpc_reply = tokio::time::timeout(rpc_timeout, transport.heartbeat(descriptor.peer_id.as_str(), rpc_request))
        .await
        .unwrap_or(Err(TransportError::Timeout));
    slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

    let callback_input = AppendEntriesReplyFromPeer {
        result: convert_heartbeat_reply(descriptor.term, rpc_reply),
        descriptor,
    };
    let _ = callback.notify_append_entries_reply_from_peer(callback_input).await;
}

fn convert_replicate_reply(
    term: Term,
    rpc_reply: Result<ReplicateResponse, TransportError>,
) -> Result<(), AppendEntriesReplyFromPeerError> {
    match rpc_reply {
        Ok(response) if response.term > term.as_u64() => Err(AppendEntriesReplyFromPeerError::StaleTerm {
            new_term: Term::new(response.term),
        }),
        Ok(response) if response.success => Ok(()),
        Ok(response) => match response.conflict_hint {
            Some(hint) => Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry {
                conflict_hint: Index::from_u64_opt(hint),
            }),
            None => Err(AppendEntriesReplyFromPeerError::RetryableFailure(
                "Replicate rejected without a stale term or conflict hint".into(),
            )),
        },
        Err(e) => Err(AppendEntriesReplyFromPeerError::RetryableFailure(e.to_string())),
    }
}

fn convert_heartbeat_reply(
    term: Term,
    rpc_reply: Result<HeartbeatResponse, TransportError>,
) -> Result<(), AppendEntriesReplyFromPeerError> {
    match rpc_reply {
        Ok(response) if response.term > term.as_u64() => Err(AppendEntriesReplyFromPeerError::StaleTerm {
            new_term: Term::new(response.term),
        }),
        Ok(response) if response.success => Ok(()),
        Ok(_) => Err(AppendEntriesReplyFromPeerError::RetryableFailure(
            "Heartbeat rejected without a stale term".into(),
        )),
        Err(e) => Err(AppendEntriesReplyFromPeerError::RetryableFailure(e.to_string())),
    }
}
