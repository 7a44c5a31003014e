use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::codec::frame::encode_frame;
use crate::rpc::dispatch::PeerInfo;
use crate::rpc::envelope::{ErrorNotification, ReplyEnvelope};
use crate::rpc::opcode::RpcOpCode;

/// The server-side handle for one accepted connection: the write half plus
///  the connection's identity within its group. The numeric id is unique for
///  the server's lifetime and tells apart connections that ever occupied the
///  same identity.
pub struct ServerConnection {
    id: u64,
    group: u64,
    peer_addr: SocketAddr,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    identity: RwLock<Option<String>>,
}

impl ServerConnection {
    pub fn new(
        id: u64,
        group: u64,
        peer_addr: SocketAddr,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Arc<ServerConnection> {
        Arc::new(ServerConnection {
            id,
            group,
            peer_addr,
            writer: Mutex::new(writer),
            identity: RwLock::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn group(&self) -> u64 {
        self.group
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub async fn identity(&self) -> Option<String> {
        self.identity.read().await.clone()
    }

    pub async fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            remote_addr: self.peer_addr,
            identity: self.identity().await,
        }
    }

    pub async fn send_frame(&self, opcode: i32, payload: &[u8]) -> anyhow::Result<()> {
        let frame = encode_frame(opcode, payload);
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn send_reply(&self, reply: &ReplyEnvelope) -> anyhow::Result<()> {
        let mut payload = BytesMut::new();
        reply.ser(&mut payload)?;
        self.send_frame(RpcOpCode::Reply as i32, &payload).await
    }

    pub async fn send_error(&self, notification: &ErrorNotification) -> anyhow::Result<()> {
        let mut payload = BytesMut::new();
        notification.ser(&mut payload);
        self.send_frame(RpcOpCode::ErrorNotification as i32, &payload)
            .await
    }
}

/// Identities of live connections, partitioned into groups (e.g. one group
///  per listener role). An identity is unique within its group: binding it
///  again displaces the previous holder.
#[derive(Default)]
pub struct ConnectionRegistry {
    groups: Mutex<FxHashMap<u64, FxHashMap<String, Arc<ServerConnection>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> ConnectionRegistry {
        Default::default()
    }

    /// Binds a connection to an identity within its group, releasing any
    ///  identity it held before. Returns the displaced previous holder, if
    ///  any. Re-binding the same connection to the same identity is a no-op.
    pub async fn bind(
        &self,
        conn: &Arc<ServerConnection>,
        identity: &str,
    ) -> Option<Arc<ServerConnection>> {
        let mut groups = self.groups.lock().await;
        let group = groups.entry(conn.group).or_default();

        if let Some(current) = group.get(identity) {
            if current.id == conn.id {
                return None;
            }
        }

        let previous_identity = conn.identity.read().await.clone();
        if let Some(previous) = previous_identity {
            if previous != identity {
                group.remove(&previous);
            }
        }

        let displaced = group.insert(identity.to_string(), conn.clone());
        *conn.identity.write().await = Some(identity.to_string());

        if let Some(displaced) = &displaced {
            warn!(
                identity,
                old_conn = displaced.id,
                new_conn = conn.id,
                "identity displaced by a newer connection"
            );
            *displaced.identity.write().await = None;
        } else {
            debug!(identity, conn = conn.id, "identity bound");
        }
        displaced
    }

    /// Removes a connection's binding on disconnect. Guarded by connection
    ///  id: if the identity was already taken over by a newer connection the
    ///  removal is a stale no-op.
    pub async fn remove(&self, conn: &Arc<ServerConnection>) {
        let Some(identity) = conn.identity.read().await.clone() else {
            return;
        };
        let mut groups = self.groups.lock().await;
        let Some(group) = groups.get_mut(&conn.group) else {
            return;
        };
        match group.get(&identity) {
            Some(current) if current.id == conn.id => {
                group.remove(&identity);
                debug!(identity, conn = conn.id, "identity released");
            }
            _ => {
                debug!(identity, conn = conn.id, "stale removal ignored");
            }
        }
    }

    pub async fn lookup_in(&self, group: u64, identity: &str) -> Option<Arc<ServerConnection>> {
        self.groups
            .lock()
            .await
            .get(&group)
            .and_then(|g| g.get(identity))
            .cloned()
    }

    /// First match across all groups.
    pub async fn lookup(&self, identity: &str) -> Option<Arc<ServerConnection>> {
        self.groups
            .lock()
            .await
            .values()
            .find_map(|g| g.get(identity))
            .cloned()
    }

    pub async fn count_in(&self, group: u64) -> usize {
        self.groups
            .lock()
            .await
            .get(&group)
            .map(|g| g.len())
            .unwrap_or(0)
    }

    pub async fn count_total(&self) -> usize {
        self.groups.lock().await.values().map(|g| g.len()).sum()
    }
}
