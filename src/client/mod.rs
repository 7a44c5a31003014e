use std::time::Duration;

use async_trait::async_trait;
use tracing::{trace, warn};

use crate::codec::value::Value;
use crate::error::RpcError;
use crate::rpc::envelope::ErrorNotification;

pub mod config;
pub mod connection;

pub use config::ConnectionConfig;
pub use connection::Connection;

/// Where a connection currently is in its lifecycle. Observable through
///  [Connection::subscribe_state].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// terminal - the session loop has exited and will not reconnect
    ShutDown,
}

/// The caller-facing RPC surface, implemented by a single [Connection] and by
///  the cluster client alike. Calls fail fast with [RpcError::NotConnected]
///  when there is no live socket.
#[async_trait]
pub trait Client: Send + Sync {
    fn default_call_timeout(&self) -> Duration;

    async fn invoke_with_timeout(
        &self,
        path: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError>;

    async fn invoke(&self, path: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        self.invoke_with_timeout(path, params, self.default_call_timeout())
            .await
    }

    /// Sends an application frame without expecting a reply.
    async fn send_frame(&self, opcode: i32, payload: &[u8]) -> Result<(), RpcError>;
}

/// Lifecycle callbacks of a client connection. All defaults are inert; an
///  application overrides what it needs, typically `ping` (to keep the
///  server's read-idle check happy) and `after_connected` (to re-authenticate
///  after a reconnect).
#[async_trait]
pub trait ClientEvents: Send + Sync + 'static {
    async fn after_connected(&self, _conn: &Connection) {}

    async fn after_disconnect(&self, _conn: &Connection) {}

    /// Called when nothing has been written for the heartbeat interval. What
    ///  a ping looks like is application-defined, typically a small
    ///  application frame the server ignores.
    async fn ping(&self, conn: &Connection);

    fn on_error_notification(&self, notification: &ErrorNotification) {
        warn!(
            trigger_opcode = notification.trigger_opcode,
            level = notification.level,
            code = notification.code,
            "error notification from server: {}",
            notification.info
        );
    }
}

/// the default inert event handler
#[derive(Debug, Default)]
pub struct NullEvents;

#[async_trait]
impl ClientEvents for NullEvents {
    async fn ping(&self, _conn: &Connection) {
        trace!("write-idle, no ping configured");
    }
}
