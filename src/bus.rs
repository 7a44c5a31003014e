use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::codec::value::Value;

/// The boundary to the external in-process event/command dispatch bus. The
///  RPC core depends on it for exactly two things: finding out whether a
///  handler exists for a command name, and delivering decoded messages for
///  handling. How the bus schedules handlers (thread pool, inline, ...) is
///  its own business.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DispatchBus: Send + Sync + 'static {
    /// does a handler exist for this command name?
    fn has_handler(&self, command: &str) -> bool;

    /// Delivers a decoded command and resolves once the handler has filled
    ///  its synchronous result slot.
    async fn dispatch_command(&self, command: &str, params: Vec<Value>) -> anyhow::Result<Value>;

    /// Hands off a raw application frame for asynchronous handling. Never
    ///  blocks the calling I/O path.
    fn dispatch_frame(&self, opcode: i32, payload: Bytes);
}

/// Bus for peers that use the pure RPC surface only: knows no commands and
///  drops application frames.
#[derive(Debug, Default)]
pub struct NullBus;

#[async_trait]
impl DispatchBus for NullBus {
    fn has_handler(&self, _command: &str) -> bool {
        false
    }

    async fn dispatch_command(&self, command: &str, _params: Vec<Value>) -> anyhow::Result<Value> {
        anyhow::bail!("no handler registered for command: {}", command)
    }

    fn dispatch_frame(&self, opcode: i32, payload: Bytes) {
        debug!(opcode, len = payload.len(), "dropping application frame - no dispatch bus configured");
    }
}
