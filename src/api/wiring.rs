use crate::actor::{ActorClient, ReplicaActor};
use crate::api::client::RaftClient;
use crate::api::event_bus::RaftEventListener;
use crate::api::options::{RaftOptions, RaftOptionsValidated};
use crate::api::replicated_state_machine::ReplicatedStateMachine;
use crate::api::state_machine::StateMachine;
use crate::api::types::Snapshot;
use crate::commitlog::{InMemoryLog, Index, Log};
use crate::replica::{
    ClusterTracker, PersistentLocalState, Replica, ReplicaConfig, ReplicaId, Term, VolatileLocalState, WriteAheadLog,
    WriteAheadLogEntry,
};
use crate::server::RpcServer;
use crate::transport::PeerTransport;
use std::convert::TryFrom;
use std::io;
use std::sync::Arc;

// Peer replies, timer ticks and client calls all share this queue.
const ACTOR_QUEUE_DEPTH: usize = 128;

pub struct RaftClientConfig {
    pub my_replica_id: String,
    /// Every member of the (static) cluster, including `my_replica_id`.
    pub cluster_members: Vec<String>,
    pub state_machine: Box<dyn StateMachine>,
    pub transport: Arc<dyn PeerTransport>,
    pub info_logger: slog::Logger,
    pub options: RaftOptions,
    /// Application state to start from. Its index and term must be present in the log.
    pub initial_snapshot: Option<Snapshot>,
}

#[derive(Debug, thiserror::Error)]
pub enum RaftClientCreationError {
    #[error("Invalid cluster info: {0}")]
    InvalidClusterInfo(String),
    #[error("Illegal options for configuring client: {0}")]
    IllegalClientOptions(String),
    #[error("Log initialization failure: {0:?}")]
    LogInitialization(io::Error),
    #[error("Failed to restore snapshot: {0}")]
    SnapshotRestore(String),
}

/// Starts a replica backed by an in-memory log.
pub async fn try_create_raft_client(config: RaftClientConfig) -> Result<RaftClient, RaftClientCreationError> {
    let log = InMemoryLog::<WriteAheadLogEntry>::create().map_err(RaftClientCreationError::LogInitialization)?;
    try_create_raft_client_with_log(config, log).await
}

/// Starts a replica on top of `log`, which may already contain entries. Term and vote are kept in
/// memory, starting from the term of the last entry in `log`.
pub async fn try_create_raft_client_with_log<L>(
    config: RaftClientConfig,
    log: L,
) -> Result<RaftClient, RaftClientCreationError>
where
    L: Log<WriteAheadLogEntry> + Send + 'static,
{
    let local_state = VolatileLocalState::new(ReplicaId::new(config.my_replica_id.clone()));
    try_create_raft_client_with_storage(config, log, local_state).await
}

/// Starts a replica whose log and term/vote both come from the caller, e.g. to restart it from
/// what it persisted before.
pub async fn try_create_raft_client_with_storage<L, S>(
    config: RaftClientConfig,
    log: L,
    mut local_state: S,
) -> Result<RaftClient, RaftClientCreationError>
where
    L: Log<WriteAheadLogEntry> + Send + 'static,
    S: PersistentLocalState + Send + 'static,
{
    let logger = config
        .info_logger
        .new(slog::o!("ReplicaId" => config.my_replica_id.clone()));

    let options = RaftOptionsValidated::try_from(config.options)
        .map_err(|e| RaftClientCreationError::IllegalClientOptions(e.to_string()))?;

    let my_replica_id = ReplicaId::new(config.my_replica_id);
    let cluster_tracker =
        ClusterTracker::create_valid_cluster(my_replica_id, config.cluster_members.into_iter().map(ReplicaId::new))
            .map_err(|e| RaftClientCreationError::InvalidClusterInfo(e.to_string()))?;

    let mut write_ahead_log =
        WriteAheadLog::new(logger.clone(), log).map_err(RaftClientCreationError::LogInitialization)?;

    let mut state_machine = config.state_machine;
    if let Some(snapshot) = config.initial_snapshot {
        if let Some(index) = Index::from_u64_opt(snapshot.last_included_index) {
            write_ahead_log
                .restore_snapshot_point(index, Term::new(snapshot.last_included_term))
                .map_err(|e| RaftClientCreationError::SnapshotRestore(e.to_string()))?;
        }
        state_machine
            .install_snapshot(snapshot.data)
            .map_err(|e| RaftClientCreationError::SnapshotRestore(e.message))?;
        slog::info!(
            logger,
            "Restored snapshot at index {} term {}",
            snapshot.last_included_index,
            snapshot.last_included_term
        );
    }

    // Our own log can't hold entries from a term we've never heard of.
    if let Some((latest_term, _)) = write_ahead_log.latest_entry() {
        if local_state.store_term_if_increased(latest_term) {
            slog::info!(logger, "Moved up to term {:?} of the last log entry", latest_term);
        }
    }

    let (actor_client, actor_queue_rx) = ActorClient::new(ACTOR_QUEUE_DEPTH);

    let (replica, election_state_change_listener) = Replica::new(ReplicaConfig {
        logger: logger.clone(),
        cluster_tracker,
        write_ahead_log,
        local_state,
        state_machine,
        transport: config.transport,
        actor_client: actor_client.weak(),
        election_timeout: options.election_timeout,
        leader_heartbeat_duration: options.leader_heartbeat_duration,
        append_entries_timeout: options.leader_append_entries_timeout,
        step_down_timeout: options.leader_step_down_timeout,
    });

    let replica_actor = ReplicaActor::new(logger.clone(), actor_queue_rx, replica);
    tokio::spawn(replica_actor.run_event_loop());

    let rpc_server = RpcServer::new(logger, actor_client.weak());

    Ok(RaftClient {
        replicated_state_machine: ReplicatedStateMachine::new(actor_client),
        event_listener: RaftEventListener::new(election_state_change_listener),
        rpc_server,
    })
}
