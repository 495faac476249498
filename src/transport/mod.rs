//! Outbound side of replica-to-replica communication. The replica only ever talks to peers
//! through `PeerTransport`, addressed by replica id.
mod in_memory;

pub use in_memory::InMemoryNetwork;
pub use in_memory::InMemoryTransport;

use crate::protocol::{HeartbeatRequest, HeartbeatResponse, ReplicateRequest, ReplicateResponse, VoteRequest, VoteResponse};
use crate::server::RpcError;

#[async_trait::async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    async fn request_vote(&self, peer_id: &str, request: VoteRequest) -> Result<VoteResponse, TransportError>;

    async fn replicate(&self, peer_id: &str, request: ReplicateRequest) -> Result<ReplicateResponse, TransportError>;

    async fn heartbeat(&self, peer_id: &str, request: HeartbeatRequest) -> Result<HeartbeatResponse, TransportError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Peer {0} is unreachable")]
    Unreachable(String),
    #[error("Call to peer timed out")]
    Timeout,
    #[error("Peer rejected call: {0}")]
    Rpc(#[from] RpcError),
}
