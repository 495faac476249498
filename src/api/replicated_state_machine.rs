use crate::actor::ActorClient;
use crate::api::state_machine::{Command, Query};
use crate::api::types::{QueryError, ReplicaExited, ReplicaStatus, Snapshot, SnapshotError, SubmitError, SubmitOutput};
use crate::replica;
use bytes::Bytes;

/// ReplicatedStateMachine is the application's handle to the replicated state machine. Commands
/// go through the replicated log; queries and snapshots read this replica's applied state.
#[derive(Clone)]
pub struct ReplicatedStateMachine {
    actor_client: ActorClient,
}

impl ReplicatedStateMachine {
    pub(crate) fn new(actor_client: ActorClient) -> Self {
        ReplicatedStateMachine { actor_client }
    }

    /// Resolves once the command is committed and applied on this replica (which must be leader).
    pub async fn submit(&self, command: Command) -> Result<SubmitOutput, SubmitError> {
        let replica_input = replica::SubmitCommandInput {
            data: command.encode()?,
        };

        self.actor_client
            .submit(replica_input)
            .await
            .map(SubmitOutput::from)
            .map_err(SubmitError::from)
    }

    /// Served by the leader from applied state. No log append, so a deposed leader that doesn't
    /// know it yet can serve a stale read.
    pub async fn query(&self, query: Query) -> Result<Bytes, QueryError> {
        let replica_input = replica::QueryInput {
            name: query.name,
            args: query.args,
        };

        self.actor_client
            .query(replica_input)
            .await
            .map(|o| o.result)
            .map_err(QueryError::from)
    }

    pub async fn take_snapshot(&self) -> Result<Snapshot, SnapshotError> {
        self.actor_client
            .take_snapshot()
            .await
            .map(Snapshot::from)
            .map_err(SnapshotError::from)
    }

    pub async fn status(&self) -> Result<ReplicaStatus, ReplicaExited> {
        self.actor_client
            .status()
            .await
            .map(ReplicaStatus::from)
            .map_err(|_| ReplicaExited)
    }
}
