use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use crate::bus::DispatchBus;
use crate::client::{Client, ClientEvents, Connection, ConnectionConfig};
use crate::cluster::ring::{HashRing, DEFAULT_REPLICAS};
use crate::codec::value::Value;
use crate::error::RpcError;

/// One cluster member: its address and the live connection to it. Ring
///  identity is the address alone.
#[derive(Clone)]
pub struct ClusterUnit {
    address: SocketAddr,
    connection: Arc<Connection>,
}

impl ClusterUnit {
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }
}

impl Display for ClusterUnit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// A client over a whole server cluster. Every member gets its own
///  self-healing [Connection]; calls are routed by consistent hashing so the
///  same key keeps landing on the same member while the membership is stable.
///
/// Used through the [Client] trait the routing key is the call path, which
///  pins each interface method to one member.
pub struct ClusterClient {
    config: ConnectionConfig,
    bus: Arc<dyn DispatchBus>,
    events: Arc<dyn ClientEvents>,
    ring: RwLock<HashRing<ClusterUnit>>,
}

impl ClusterClient {
    pub fn new(
        config: ConnectionConfig,
        bus: Arc<dyn DispatchBus>,
        events: Arc<dyn ClientEvents>,
    ) -> ClusterClient {
        ClusterClient {
            config,
            bus,
            events,
            ring: RwLock::new(HashRing::new(DEFAULT_REPLICAS)),
        }
    }

    /// Adds a member and starts connecting to it. Idempotent per address.
    pub async fn add_unit(&self, address: SocketAddr) -> Arc<Connection> {
        let mut ring = self.ring.write().await;
        if let Some(unit) = ring.nodes().iter().find(|u| u.address == address) {
            return unit.connection.clone();
        }
        let connection = Connection::new(
            address,
            self.config.clone(),
            self.bus.clone(),
            self.events.clone(),
        );
        connection.start();
        ring.add(ClusterUnit {
            address,
            connection: connection.clone(),
        });
        info!(unit = %address, "cluster unit added");
        connection
    }

    /// Removes a member and shuts its connection down. Keys it served remap
    ///  to the remaining members.
    pub async fn remove_unit(&self, address: SocketAddr) {
        let mut ring = self.ring.write().await;
        let unit = ring
            .nodes()
            .iter()
            .find(|u| u.address == address)
            .map(|u| (*u).clone());
        if let Some(unit) = unit {
            ring.remove(&unit);
            unit.connection.shut_down();
            info!(unit = %address, "cluster unit removed");
        }
    }

    pub async fn unit_for(&self, key: &str) -> Option<Arc<Connection>> {
        self.ring
            .read()
            .await
            .route(key)
            .map(|unit| unit.connection.clone())
    }

    pub async fn any_unit(&self) -> Option<Arc<Connection>> {
        self.ring
            .read()
            .await
            .route_any()
            .map(|unit| unit.connection.clone())
    }

    /// A call routed by an explicit key instead of the call path, e.g. a
    ///  session or entity id that must stick to one member.
    pub async fn invoke_routed(
        &self,
        key: &str,
        path: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let Some(connection) = self.unit_for(key).await else {
            return Err(RpcError::NoRoute);
        };
        connection.invoke_raw(path, params, Some(timeout)).await
    }

    pub async fn shut_down(&self) {
        for unit in self.ring.read().await.nodes() {
            unit.connection.shut_down();
        }
    }
}

#[async_trait]
impl Client for ClusterClient {
    fn default_call_timeout(&self) -> Duration {
        self.config.default_call_timeout
    }

    async fn invoke_with_timeout(
        &self,
        path: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        self.invoke_routed(path, path, params, timeout).await
    }

    async fn send_frame(&self, opcode: i32, payload: &[u8]) -> Result<(), RpcError> {
        let Some(connection) = self.any_unit().await else {
            return Err(RpcError::NoRoute);
        };
        connection.send_frame(opcode, payload).await
    }
}
