//! This mod is meant to hold most of the code for the library's client-facing API.
mod client;
mod event_bus;
mod options;
mod replicated_state_machine;
mod state_machine;
mod types;
mod wiring;

pub use client::RaftClient;
pub use event_bus::RaftElectionState;
pub use event_bus::RaftEvent;
pub use event_bus::RaftEventListener;
pub use options::RaftOptions;
pub use replicated_state_machine::ReplicatedStateMachine;
pub use state_machine::ApplicationError;
pub use state_machine::Command;
pub use state_machine::CommandDecodeError;
pub use state_machine::CommandEncodeError;
pub use state_machine::CommandRegistry;
pub use state_machine::Query;
pub use state_machine::RegisteredStateMachine;
pub use state_machine::Snapshotable;
pub use state_machine::StateMachine;
pub use types::QueryError;
pub use types::RaftEntryId;
pub use types::RaftRole;
pub use types::ReplicaExited;
pub use types::ReplicaStatus;
pub use types::Snapshot;
pub use types::SnapshotError;
pub use types::SubmitError;
pub use types::SubmitOutput;
pub use wiring::try_create_raft_client;
pub use wiring::try_create_raft_client_with_log;
pub use wiring::try_create_raft_client_with_storage;
pub use wiring::RaftClientConfig;
pub use wiring::RaftClientCreationError;
