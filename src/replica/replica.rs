use crate::actor::{Callback, WeakActorClient};
use crate::api::{ApplicationError, Command, StateMachine};
use crate::commitlog::{Index, Log};
use crate::replica::election::{ElectionConfig, ElectionState, ElectionStateChangeListener};
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::peers::{ClusterTracker, ReplicaId};
use crate::replica::replica_api::{
    ElectionTimeoutTick, QueryInput, QueryOutput, ReplicaStatusOutput, ServeQueryError, SubmitCommandError,
    SubmitCommandInput, SubmitCommandOutput, TakeSnapshotError, TakeSnapshotOutput,
};
use crate::replica::write_ahead_log::{EntryKind, WriteAheadLog, WriteAheadLogEntry};
use crate::transport::PeerTransport;
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use std::time::Duration;

mod replication;
mod vote;

pub(crate) struct ReplicaConfig<L, S>
where
    L: Log<WriteAheadLogEntry>,
    S: PersistentLocalState,
{
    pub(crate) logger: slog::Logger,
    pub(crate) cluster_tracker: ClusterTracker,
    pub(crate) write_ahead_log: WriteAheadLog<L>,
    pub(crate) local_state: S,
    pub(crate) state_machine: Box<dyn StateMachine>,
    pub(crate) transport: Arc<dyn PeerTransport>,
    pub(crate) actor_client: WeakActorClient,
    pub(crate) election_timeout: Duration,
    pub(crate) leader_heartbeat_duration: Duration,
    pub(crate) append_entries_timeout: Duration,
    pub(crate) step_down_timeout: Duration,
}

/// Replica is the single owner of one member's raft state. The actor hands it one event at a
/// time, so nothing in here needs to worry about interleaving.
pub(crate) struct Replica<L, S>
where
    L: Log<WriteAheadLogEntry>,
    S: PersistentLocalState,
{
    logger: slog::Logger,
    my_replica_id: ReplicaId,
    cluster_tracker: ClusterTracker,
    local_state: S,
    election_state: ElectionState,
    write_ahead_log: WriteAheadLog<L>,
    state_machine: Box<dyn StateMachine>,
    transport: Arc<dyn PeerTransport>,
    actor_client: WeakActorClient,
    leader_heartbeat_duration: Duration,
    append_entries_timeout: Duration,
    step_down_timeout: Duration,
}

impl<L, S> Replica<L, S>
where
    L: Log<WriteAheadLogEntry> + 'static,
    S: PersistentLocalState + 'static,
{
    pub(crate) fn new(config: ReplicaConfig<L, S>) -> (Self, ElectionStateChangeListener) {
        let my_replica_id = config.cluster_tracker.my_replica_id().clone();
        let (election_state, listener) = ElectionState::new_follower(
            ElectionConfig {
                my_replica_id: my_replica_id.clone(),
                leader_heartbeat_duration: config.leader_heartbeat_duration,
                election_timeout_range: ElectionConfig::election_timeout_range_around(config.election_timeout),
            },
            config.actor_client.clone(),
            config.local_state.current_term(),
        );

        let replica = Replica {
            logger: config.logger,
            my_replica_id,
            cluster_tracker: config.cluster_tracker,
            local_state: config.local_state,
            election_state,
            write_ahead_log: config.write_ahead_log,
            state_machine: config.state_machine,
            transport: config.transport,
            actor_client: config.actor_client,
            leader_heartbeat_duration: config.leader_heartbeat_duration,
            append_entries_timeout: config.append_entries_timeout,
            step_down_timeout: config.step_down_timeout,
        };

        (replica, listener)
    }

    /// The callback is resolved once the entry is applied, or failed if we stop being leader
    /// first.
    pub(crate) fn handle_submit_command(
        &mut self,
        input: SubmitCommandInput,
        callback: Callback<SubmitCommandOutput, SubmitCommandError>,
    ) {
        if !self.election_state.is_leader() {
            callback.send(Err(SubmitCommandError::NotLeader {
                leader: self.election_state.current_leader(),
            }));
            return;
        }

        // > If command received from client: append entry to local log,
        // > respond after entry applied to state machine (§5.3)
        let term = self.local_state.current_term();
        let appended_index = match self
            .write_ahead_log
            .append(WriteAheadLogEntry::command(term, input.data.to_vec()))
        {
            Ok(index) => index,
            Err(e) => {
                callback.send(Err(SubmitCommandError::LocalIoError(e)));
                return;
            }
        };
        slog::debug!(self.logger, "Appended client command at {:?}", appended_index);

        match self.election_state.leader_state_mut() {
            Some(leader_state) => leader_state.register_pending(appended_index, callback),
            None => callback.send(Err(SubmitCommandError::LeadershipLost)),
        }

        // A lone replica is its own majority.
        self.advance_leader_commit_index();
        self.replicate_to_all_peers(term);
    }

    pub(crate) fn handle_query(&self, input: QueryInput) -> Result<QueryOutput, ServeQueryError> {
        if !self.election_state.is_leader() {
            return Err(ServeQueryError::NotLeader {
                leader: self.election_state.current_leader(),
            });
        }

        self.state_machine
            .apply_query(&input.name, &input.args)
            .map(|result| QueryOutput { result })
            .map_err(ServeQueryError::Application)
    }

    /// Snapshot of the state machine as of the last applied entry.
    pub(crate) fn handle_take_snapshot(&self) -> Result<TakeSnapshotOutput, TakeSnapshotError> {
        let last_included = match self.write_ahead_log.last_applied_index() {
            None => None,
            Some(index) => {
                let entry = self
                    .write_ahead_log
                    .read_required(index)
                    .map_err(TakeSnapshotError::LocalIoError)?;
                Some((entry.term, index))
            }
        };

        Ok(TakeSnapshotOutput {
            last_included,
            data: self.state_machine.take_snapshot(),
        })
    }

    pub(crate) fn status(&self) -> ReplicaStatusOutput {
        ReplicaStatusOutput {
            role: self.election_state.role_snapshot(),
            term: self.local_state.current_term(),
            commit_index: self.write_ahead_log.commit_index(),
            last_applied_index: self.write_ahead_log.last_applied_index(),
            latest_index: self.write_ahead_log.latest_index(),
        }
    }

    pub(crate) fn handle_election_timeout(&mut self, tick: ElectionTimeoutTick) {
        if !self.election_state.is_current_timer_generation(tick.generation) {
            slog::debug!(self.logger, "Ignoring superseded election timeout {}", tick.generation);
            return;
        }

        if self.election_state.vote_granted_since_reset() {
            // We voted for someone since the last reset. Give their election a chance to finish
            // before starting our own.
            slog::info!(self.logger, "Election timeout after granting a vote. Waiting another round.");
            self.election_state.reset_timeout_if_follower();
            return;
        }

        self.start_election();
    }

    fn start_election(&mut self) {
        // Write-ahead log style: Vote for self on local state before transitioning to candidate.
        let new_term = self.local_state.increment_term_and_vote_for_self();
        self.election_state.transition_to_candidate_and_vote_for_self(new_term);
        slog::info!(
            self.logger,
            "Election timeout. Starting election for term {:?}. Election state: {:?}",
            new_term,
            self.election_state,
        );

        if 1 >= self.cluster_tracker.majority() {
            self.become_leader(new_term);
            return;
        }

        let request = self.new_vote_request(new_term);
        let peer_ids: Vec<ReplicaId> = self.cluster_tracker.peer_ids().cloned().collect();
        for peer_id in peer_ids {
            self.spawn_request_vote(peer_id, request.clone(), new_term, None);
        }
    }

    fn become_leader(&mut self, term: Term) {
        let peer_ids = self.cluster_tracker.peer_ids().cloned().collect();
        // Peers start at our current tail, which is exactly where the no-op lands.
        self.election_state
            .transition_to_leader(term, peer_ids, self.write_ahead_log.latest_index());
        slog::info!(self.logger, "Won election for term {:?}", term);

        // Commit something from our own term right away, which also commits everything before it.
        if let Err(e) = self.write_ahead_log.append(WriteAheadLogEntry::no_op(term)) {
            slog::error!(self.logger, "Failed to append leader no-op entry: {:?}", e);
        }

        // Leader timers fire as soon as they're spawned, so peers hear from us right away.
        self.advance_leader_commit_index();
    }

    /// > If there exists an N such that N > commitIndex, a majority
    /// > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
    /// > set commitIndex = N (§5.3, §5.4).
    fn advance_leader_commit_index(&mut self) {
        let leader_state = match self.election_state.leader_state() {
            Some(ls) => ls,
            None => return,
        };

        let mut matched_indexes: Vec<Option<Index>> = leader_state.peers_iter().map(|ps| ps.matched()).collect();
        matched_indexes.push(self.write_ahead_log.latest_index());

        let tentative_new_commit_index =
            match Self::get_cluster_commit_index(matched_indexes, self.cluster_tracker.majority()) {
                Some(index) => index,
                None => return,
            };

        let current_term = self.local_state.current_term();
        match self
            .write_ahead_log
            .ratchet_fwd_commit_index_if_valid(tentative_new_commit_index, current_term)
        {
            Ok(true) => {
                slog::debug!(self.logger, "Commit index is now {:?}", tentative_new_commit_index);
                self.apply_all_committed_entries();
            }
            Ok(false) => {}
            Err(ioe) => slog::warn!(
                self.logger,
                "IO failure while confirming new commit index {:?}: {:?}",
                tentative_new_commit_index,
                ioe
            ),
        }
    }

    /// `matched_indexes` has one entry per cluster member, ourselves included. The result is the
    /// highest index that at least `majority` members hold.
    fn get_cluster_commit_index(mut matched_indexes: Vec<Option<Index>>, majority: usize) -> Option<Index> {
        matched_indexes.sort();
        let quorum_idx = matched_indexes.len().checked_sub(majority)?;
        matched_indexes.get(quorum_idx).copied().flatten()
    }

    /// > If commitIndex > lastApplied: increment lastApplied, apply
    /// > log[lastApplied] to state machine (§5.3)
    fn apply_all_committed_entries(&mut self) {
        loop {
            let (index, entry) = match self.write_ahead_log.next_entry_to_apply() {
                Ok(Some(next)) => next,
                Ok(None) => return,
                Err(e) => {
                    slog::error!(self.logger, "Failed to read committed entry for apply: {:?}", e);
                    return;
                }
            };

            let result = match entry.kind {
                EntryKind::NoOp => Ok(Bytes::new()),
                EntryKind::Command => self.apply_command(&entry.data),
            };
            self.write_ahead_log.mark_applied(index);

            if let Some(leader_state) = self.election_state.leader_state_mut() {
                if let Some(callback) = leader_state.take_pending(index) {
                    callback.send(
                        result
                            .map(|result| SubmitCommandOutput {
                                term: entry.term,
                                index,
                                result,
                            })
                            .map_err(SubmitCommandError::Application),
                    );
                }
            }
        }
    }

    fn apply_command(&mut self, data: &[u8]) -> Result<Bytes, ApplicationError> {
        let command = Command::decode(data).map_err(|e| ApplicationError::new(format!("Malformed command: {}", e)))?;
        self.state_machine.apply_command(&command.name, &command.args)
    }
}

/// Errors that stop the leader from contacting a peer on this tick. None are fatal.
#[derive(Debug)]
enum SendToPeerError {
    NoLongerLeader,
    PeerConcurrencyThrottle,
    DiskRead(io::Error),
    LeaderStateMissingPeer,
}
