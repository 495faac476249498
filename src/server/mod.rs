mod server;

pub use server::RpcError;
pub use server::RpcServer;
