mod election;
mod local_state;
mod peers;
mod replica;
mod replica_api;
mod write_ahead_log;

pub(crate) use election::ElectionStateChangeListener;
pub(crate) use election::ElectionStateSnapshot;
pub use local_state::PersistentLocalState;
pub use local_state::Term;
pub use local_state::VolatileLocalState;
pub(crate) use peers::ClusterTracker;
pub(crate) use peers::ClusterTrackerError;
pub use peers::ReplicaId;
pub(crate) use replica::Replica;
pub(crate) use replica::ReplicaConfig;
pub(crate) use replica_api::*;
pub(crate) use write_ahead_log::EntryKind;
pub(crate) use write_ahead_log::WriteAheadLog;
pub use write_ahead_log::WriteAheadLogEntry;
