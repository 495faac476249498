mod actor;
mod api;
mod commitlog;
mod protocol;
mod replica;
mod server;
mod transport;

pub use api::try_create_raft_client;
pub use api::try_create_raft_client_with_log;
pub use api::try_create_raft_client_with_storage;
pub use api::ApplicationError;
pub use api::Command;
pub use api::CommandDecodeError;
pub use api::CommandEncodeError;
pub use api::CommandRegistry;
pub use api::Query;
pub use api::QueryError;
pub use api::RaftClient;
pub use api::RaftClientConfig;
pub use api::RaftClientCreationError;
pub use api::RaftElectionState;
pub use api::RaftEntryId;
pub use api::RaftEvent;
pub use api::RaftEventListener;
pub use api::RaftOptions;
pub use api::RaftRole;
pub use api::RegisteredStateMachine;
pub use api::ReplicaExited;
pub use api::ReplicaStatus;
pub use api::ReplicatedStateMachine;
pub use api::Snapshot;
pub use api::SnapshotError;
pub use api::Snapshotable;
pub use api::StateMachine;
pub use api::SubmitError;
pub use api::SubmitOutput;
pub use commitlog::Entry;
pub use commitlog::InMemoryLog;
pub use commitlog::Index;
pub use commitlog::Log;
pub use protocol::HeartbeatRequest;
pub use protocol::HeartbeatResponse;
pub use protocol::ProtocolEntryKind;
pub use protocol::ProtocolLogEntry;
pub use protocol::ReplicateRequest;
pub use protocol::ReplicateResponse;
pub use protocol::SubmitRequest;
pub use protocol::SubmitResponse;
pub use protocol::SubmitStatus;
pub use protocol::VoteRequest;
pub use protocol::VoteResponse;
pub use replica::PersistentLocalState;
pub use replica::ReplicaId;
pub use replica::Term;
pub use replica::VolatileLocalState;
pub use replica::WriteAheadLogEntry;
pub use server::RpcError;
pub use server::RpcServer;
pub use transport::InMemoryNetwork;
pub use transport::InMemoryTransport;
pub use transport::PeerTransport;
pub use transport::TransportError;

// Learning 1: `create::{root_mod}` should not have any code. Just `mod` and `pub use` statements.
// Learning 2: All `mod` statements, anywhere, should not be `pub`. Only export `pub` via individual
//             use statements.
//
// This keeps the `crate::{root_mod}` root_mod only responsible for exporting types to the rest of
// crate, and allows me to organize my root_mod impl however I want.
