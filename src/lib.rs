pub mod bus;
pub mod client;
pub mod cluster;
pub mod codec;
pub mod error;
pub mod rpc;
pub mod server;
pub mod util;

pub use client::{Client, ClientEvents, Connection, ConnectionConfig, ConnectionState};
pub use cluster::ClusterClient;
pub use codec::value::Value;
pub use error::RpcError;
pub use rpc::proxy::RemoteInterface;
pub use server::{RpcServer, ServerConfig};

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
