use crate::protocol::{HeartbeatRequest, HeartbeatResponse, ReplicateRequest, ReplicateResponse, VoteRequest, VoteResponse};
use crate::server::RpcServer;
use crate::transport::{PeerTransport, TransportError};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// InMemoryNetwork connects replicas that live in the same process. Calls are dispatched straight
/// to the target's `RpcServer`. Replicas can be cut off and reconnected to simulate partitions.
#[derive(Clone)]
pub struct InMemoryNetwork {
    inner: Arc<Mutex<NetworkState>>,
    call_timeout: Duration,
}

#[derive(Default)]
struct NetworkState {
    servers: HashMap<String, RpcServer>,
    isolated: HashSet<String>,
}

impl InMemoryNetwork {
    pub fn new(call_timeout: Duration) -> Self {
        InMemoryNetwork {
            inner: Arc::new(Mutex::new(NetworkState::default())),
            call_timeout,
        }
    }

    pub fn register(&self, replica_id: impl Into<String>, server: RpcServer) {
        self.state().servers.insert(replica_id.into(), server);
    }

    /// Drops every call to or from `replica_id` until `heal()`.
    pub fn isolate(&self, replica_id: &str) {
        self.state().isolated.insert(replica_id.to_string());
    }

    pub fn heal(&self, replica_id: &str) {
        self.state().isolated.remove(replica_id);
    }

    /// Outbound transport for the replica `replica_id`.
    pub fn transport_for(&self, replica_id: impl Into<String>) -> InMemoryTransport {
        InMemoryTransport {
            from: replica_id.into(),
            network: self.clone(),
        }
    }

    fn route(&self, from: &str, to: &str) -> Result<RpcServer, TransportError> {
        let state = self.state();
        if state.isolated.contains(from) || state.isolated.contains(to) {
            return Err(TransportError::Unreachable(to.to_string()));
        }

        state
            .servers
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(to.to_string()))
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        // Nothing in here can be left half-updated, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct InMemoryTransport {
    from: String,
    network: InMemoryNetwork,
}

#[async_trait::async_trait]
impl PeerTransport for InMemoryTransport {
    async fn request_vote(&self, peer_id: &str, request: VoteRequest) -> Result<VoteResponse, TransportError> {
        let server = self.network.route(&self.from, peer_id)?;
        tokio::time::timeout(self.network.call_timeout, server.handle_request_vote(request))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::from)
    }

    async fn replicate(&self, peer_id: &str, request: ReplicateRequest) -> Result<ReplicateResponse, TransportError> {
        let server = self.network.route(&self.from, peer_id)?;
        tokio::time::timeout(self.network.call_timeout, server.handle_replicate(request))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::from)
    }

    async fn heartbeat(&self, peer_id: &str, request: HeartbeatRequest) -> Result<HeartbeatResponse, TransportError> {
        let server = self.network.route(&self.from, peer_id)?;
        tokio::time::timeout(self.network.call_timeout, server.handle_heartbeat(request))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::from)
    }
}
