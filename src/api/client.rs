use crate::api::event_bus::RaftEventListener;
use crate::api::replicated_state_machine::ReplicatedStateMachine;
use crate::server::RpcServer;

/// RaftClient is everything the application gets back from creating a replica. The replica keeps
/// running for as long as `replicated_state_machine` (or a clone of it) is alive.
pub struct RaftClient {
    pub replicated_state_machine: ReplicatedStateMachine,
    pub event_listener: RaftEventListener,
    pub(crate) rpc_server: RpcServer,
}

impl RaftClient {
    /// Inbound side of this replica, for the transport to deliver peer requests to.
    pub fn rpc_server(&self) -> RpcServer {
        self.rpc_server.clone()
    }
}
