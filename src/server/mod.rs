pub mod registry;
pub mod server;

pub use registry::{ConnectionRegistry, ServerConnection};
pub use server::{RpcServer, ServerConfig};
