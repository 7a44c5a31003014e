use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::bus::DispatchBus;
use crate::client::config::ConnectionConfig;
use crate::client::{Client, ClientEvents, ConnectionState};
use crate::codec::frame::{encode_frame, FrameDecoder};
use crate::codec::value::Value;
use crate::error::RpcError;
use crate::rpc::envelope::{CallEnvelope, ErrorNotification, ReplyEnvelope, ReplyOutcome};
use crate::rpc::invocation::{InvocationTracker, PendingCall};
use crate::rpc::opcode::RpcOpCode;

/// A self-healing client connection to one server address.
///
/// One background session loop owns the socket for the connection's whole
///  lifetime: connect, serve the connected phase, tear down, pause, connect
///  again - indefinitely, until [Connection::shut_down]. Calls made while
///  there is no live socket fail fast with [RpcError::NotConnected]; pending
///  calls survive a reconnect only until their timeout fires.
pub struct Connection {
    address: SocketAddr,
    config: ConnectionConfig,
    tracker: Arc<InvocationTracker>,
    bus: Arc<dyn DispatchBus>,
    events: Arc<dyn ClientEvents>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    last_write: Mutex<Instant>,
    sweeper: JoinHandle<()>,
}

impl Connection {
    pub fn new(
        address: SocketAddr,
        config: ConnectionConfig,
        bus: Arc<dyn DispatchBus>,
        events: Arc<dyn ClientEvents>,
    ) -> Arc<Connection> {
        let tracker = Arc::new(InvocationTracker::new(config.invocation_ttl));
        let sweeper = tracker.spawn_sweeper(config.invocation_ttl / 2);
        Arc::new(Connection {
            address,
            config,
            tracker,
            bus,
            events,
            state: watch::Sender::new(ConnectionState::Disconnected),
            shutdown: watch::Sender::new(false),
            writer: Mutex::new(None),
            last_write: Mutex::new(Instant::now()),
            sweeper,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn tracker(&self) -> &Arc<InvocationTracker> {
        &self.tracker
    }

    /// Spawns the session loop. Call once.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let conn = self.clone();
        tokio::spawn(async move { conn.run_session_loop().await })
    }

    /// Blocks until the connection is live, or fails when it is shut down.
    pub async fn wait_connected(&self) -> Result<(), RpcError> {
        let mut state = self.state.subscribe();
        loop {
            match *state.borrow_and_update() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::ShutDown => return Err(RpcError::NotConnected),
                _ => {}
            }
            if state.changed().await.is_err() {
                return Err(RpcError::NotConnected);
            }
        }
    }

    /// Permanently stops the session loop and the tracker's sweeper task.
    ///  Idempotent.
    pub fn shut_down(&self) {
        self.shutdown.send_replace(true);
        self.sweeper.abort();
    }

    async fn run_session_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            self.state.send_replace(ConnectionState::Connecting);

            match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(self.address))
                .await
            {
                Ok(Ok(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("failed to set TCP_NODELAY: {}", e);
                    }
                    let (read_half, write_half) = stream.into_split();
                    *self.writer.lock().await = Some(write_half);
                    *self.last_write.lock().await = Instant::now();
                    self.state.send_replace(ConnectionState::Connected);
                    info!(server = %self.address, "connected");
                    self.events.after_connected(&self).await;

                    if let Err(e) = self.connected_phase(read_half, &mut shutdown).await {
                        warn!(server = %self.address, "connection lost: {:#}", e);
                    }

                    *self.writer.lock().await = None;
                    self.state.send_replace(ConnectionState::Disconnected);
                    self.events.after_disconnect(&self).await;
                }
                Ok(Err(e)) => {
                    debug!(server = %self.address, "connect failed: {}", e);
                    self.state.send_replace(ConnectionState::Disconnected);
                }
                Err(_) => {
                    debug!(server = %self.address, "connect timed out");
                    self.state.send_replace(ConnectionState::Disconnected);
                }
            }

            select! {
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        *self.writer.lock().await = None;
        self.state.send_replace(ConnectionState::ShutDown);
        debug!(server = %self.address, "session loop terminated");
    }

    /// Serves one live socket until it dies or goes idle. Returning `Ok` means
    ///  an orderly teardown with reconnect (shutdown, read-idle), an error
    ///  means the socket failed.
    async fn connected_phase(
        &self,
        read_half: OwnedReadHalf,
        shutdown: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut read_half = read_half;
        let mut decoder = FrameDecoder::new(self.config.max_frame_len);
        let mut read_buf = BytesMut::with_capacity(8 * 1024);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await; // the first tick completes immediately
        let mut last_read = Instant::now();

        loop {
            select! {
                _ = shutdown.changed() => {
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    let idle_for = self.last_write.lock().await.elapsed();
                    if idle_for >= self.config.heartbeat_interval {
                        trace!("write-idle for {:?}, pinging", idle_for);
                        self.events.ping(self).await;
                    }
                }
                _ = tokio::time::sleep_until(last_read + self.config.read_timeout) => {
                    warn!(server = %self.address,
                        "nothing read for {:?}, reconnecting", self.config.read_timeout);
                    return Ok(());
                }
                read = tokio::io::AsyncReadExt::read_buf(&mut read_half, &mut read_buf) => {
                    match read {
                        Ok(0) => bail!("connection closed by peer"),
                        Ok(_) => {
                            last_read = Instant::now();
                            decoder.push(&read_buf);
                            read_buf.clear();
                            while let Some(frame) = decoder.next_frame()? {
                                self.handle_frame(frame).await;
                            }
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }

    async fn handle_frame(&self, mut frame: BytesMut) {
        let opcode = frame.get_i32();
        match RpcOpCode::try_from(opcode) {
            Ok(RpcOpCode::Reply) => {
                let reply = match ReplyEnvelope::try_deser(&mut frame) {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!("undecodable reply envelope: {:#}", e);
                        return;
                    }
                };
                let result = match reply.outcome {
                    ReplyOutcome::Success(value) => Ok(value),
                    ReplyOutcome::Failure(info) => Err(RpcError::Remote(info)),
                };
                if !self.tracker.resolve(&reply.invocation_id, result).await {
                    debug!(invocation_id = reply.invocation_id, "dropping late reply");
                }
            }
            Ok(RpcOpCode::ErrorNotification) => match ErrorNotification::try_deser(&mut frame) {
                Ok(notification) => self.events.on_error_notification(&notification),
                Err(e) => warn!("undecodable error notification: {:#}", e),
            },
            Ok(RpcOpCode::Call) => {
                warn!("dropping call frame - this side does not serve calls");
            }
            Err(_) => self.bus.dispatch_frame(opcode, frame.freeze()),
        }
    }

    async fn send_and_flush(&self, opcode: i32, payload: &[u8]) -> Result<(), RpcError> {
        // the peer would tear the connection down over an oversized frame, so
        //  reject it here before it ever hits the wire
        if 4 + payload.len() > self.config.max_frame_len {
            return Err(RpcError::Protocol(format!(
                "frame of {} bytes exceeds the configured maximum of {}",
                4 + payload.len(),
                self.config.max_frame_len
            )));
        }
        let mut writer = self.writer.lock().await;
        let Some(w) = writer.as_mut() else {
            return Err(RpcError::NotConnected);
        };
        let frame = encode_frame(opcode, payload);
        if w.write_all(&frame).await.is_err() || w.flush().await.is_err() {
            // the read side notices the dead socket and reconnects
            return Err(RpcError::NotConnected);
        }
        drop(writer);
        *self.last_write.lock().await = Instant::now();
        Ok(())
    }

    /// The core call primitive: registers the invocation and sends the call
    ///  frame, returning the awaitable handle without waiting for the reply.
    ///  `None` means no explicit timeout - the idle expiry is the only
    ///  backstop then.
    pub async fn call(
        &self,
        path: &str,
        params: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<PendingCall, RpcError> {
        let timeout = timeout.map(|t| t.min(self.config.max_call_timeout));
        let invocation_id = Uuid::new_v4().simple().to_string();

        let envelope = CallEnvelope {
            invocation_id: invocation_id.clone(),
            path: path.to_string(),
            params,
        };
        let mut payload = BytesMut::new();
        envelope
            .ser(&mut payload)
            .map_err(|e| RpcError::Protocol(format!("{:#}", e)))?;

        let pending = self.tracker.register(&invocation_id, timeout).await;
        if let Err(e) = self.send_and_flush(RpcOpCode::Call as i32, &payload).await {
            self.tracker
                .resolve(&invocation_id, Err(RpcError::NotConnected))
                .await;
            drop(pending);
            return Err(e);
        }
        Ok(pending)
    }

    pub async fn invoke_raw(
        &self,
        path: &str,
        params: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        self.call(path, params, timeout).await?.await
    }
}

#[async_trait]
impl Client for Connection {
    fn default_call_timeout(&self) -> Duration {
        self.config.default_call_timeout
    }

    async fn invoke_with_timeout(
        &self,
        path: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        self.invoke_raw(path, params, Some(timeout)).await
    }

    async fn send_frame(&self, opcode: i32, payload: &[u8]) -> Result<(), RpcError> {
        self.send_and_flush(opcode, payload).await
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    use crate::bus::NullBus;
    use crate::client::NullEvents;
    use crate::codec::frame::DEFAULT_MAX_FRAME_LEN;

    use super::*;

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: Duration::from_millis(500),
            read_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(60),
            reconnect_interval: Duration::from_millis(50),
            default_call_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    fn connection(address: SocketAddr, config: ConnectionConfig) -> Arc<Connection> {
        Connection::new(address, config, Arc::new(NullBus), Arc::new(NullEvents))
    }

    async fn read_call(stream: &mut TcpStream) -> CallEnvelope {
        let mut decoder = FrameDecoder::new(2048);
        let mut buf = [0u8; 1024];
        loop {
            if let Some(mut frame) = decoder.next_frame().unwrap() {
                assert_eq!(frame.get_i32(), RpcOpCode::Call as i32);
                return CallEnvelope::try_deser(&mut frame).unwrap();
            }
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "client closed the connection");
            decoder.push(&buf[..n]);
        }
    }

    async fn send_reply(stream: &mut TcpStream, reply: &ReplyEnvelope) {
        let mut payload = BytesMut::new();
        reply.ser(&mut payload).unwrap();
        stream
            .write_all(&encode_frame(RpcOpCode::Reply as i32, &payload))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_and_shutdown_state_transitions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let conn = connection(listener.local_addr().unwrap(), test_config());
        let mut state = conn.subscribe_state();
        conn.start();

        conn.wait_connected().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);

        conn.shut_down();
        while *state.borrow_and_update() != ConnectionState::ShutDown {
            state.changed().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let conn = connection(listener.local_addr().unwrap(), test_config());
        conn.start();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let call = read_call(&mut stream).await;
            assert_eq!(call.path, "echo");
            assert_eq!(call.params, vec![Value::Str("hi".to_string())]);
            send_reply(&mut stream, &ReplyEnvelope {
                invocation_id: call.invocation_id,
                path: call.path,
                outcome: ReplyOutcome::Success(Value::Str("hi".to_string())),
            }).await;
            stream
        });

        conn.wait_connected().await.unwrap();
        let result = conn
            .invoke("echo", vec![Value::Str("hi".to_string())])
            .await
            .unwrap();
        assert_eq!(result, Value::Str("hi".to_string()));
        assert_eq!(conn.tracker().pending_count().await, 0);

        conn.shut_down();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_detached_call_handle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let conn = connection(listener.local_addr().unwrap(), test_config());
        conn.start();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let call = read_call(&mut stream).await;
            send_reply(&mut stream, &ReplyEnvelope {
                invocation_id: call.invocation_id,
                path: call.path,
                outcome: ReplyOutcome::Success(Value::Int(42)),
            }).await;
            stream
        });

        conn.wait_connected().await.unwrap();
        // the handle can be held and awaited later
        let pending = conn.call("answer", vec![], None).await.unwrap();
        assert_eq!(pending.await.unwrap(), Value::Int(42));

        conn.shut_down();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_failure_is_distinguishable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let conn = connection(listener.local_addr().unwrap(), test_config());
        conn.start();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let call = read_call(&mut stream).await;
            send_reply(&mut stream, &ReplyEnvelope {
                invocation_id: call.invocation_id,
                path: call.path,
                outcome: ReplyOutcome::Failure("boom".to_string()),
            }).await;
            stream
        });

        conn.wait_connected().await.unwrap();
        match conn.invoke("kaboom", vec![]).await {
            Err(RpcError::Remote(info)) => assert_eq!(info, "boom"),
            other => panic!("expected remote failure, got {:?}", other),
        }

        conn.shut_down();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_fail_fast_when_disconnected() {
        // nobody listens on this address
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let conn = connection(address, test_config());
        conn.start();
        match conn.invoke("anything", vec![]).await {
            Err(RpcError::NotConnected) => {}
            other => panic!("expected fail-fast, got {:?}", other),
        }
        assert_eq!(conn.tracker().pending_count().await, 0);
        conn.shut_down();
    }

    #[tokio::test]
    async fn test_call_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let conn = connection(listener.local_addr().unwrap(), test_config());
        conn.start();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // read the call but never reply
            read_call(&mut stream).await;
            stream
        });

        conn.wait_connected().await.unwrap();
        match conn
            .invoke_with_timeout("slow", vec![], Duration::from_millis(100))
            .await
        {
            Err(RpcError::Timeout(_)) => {}
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(conn.tracker().pending_count().await, 0);

        conn.shut_down();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_sweeper_task() {
        let conn = connection("127.0.0.1:1".parse().unwrap(), test_config());
        assert!(!conn.sweeper.is_finished());

        conn.shut_down();
        for _ in 0..100 {
            if conn.sweeper.is_finished() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sweeper task still running after shutdown");
    }

    #[tokio::test]
    async fn test_oversized_outbound_frame_is_rejected_locally() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let conn = connection(listener.local_addr().unwrap(), test_config());
        conn.start();

        let (_stream, _) = listener.accept().await.unwrap();
        conn.wait_connected().await.unwrap();

        let blob = Value::Opaque(vec![0u8; 2 * DEFAULT_MAX_FRAME_LEN]);
        match conn.invoke("upload", vec![blob]).await {
            Err(RpcError::Protocol(info)) => assert!(info.contains("exceeds")),
            other => panic!("expected local protocol error, got {:?}", other),
        }
        assert_eq!(conn.tracker().pending_count().await, 0);

        match conn.send_frame(42, &vec![0u8; 2 * DEFAULT_MAX_FRAME_LEN]).await {
            Err(RpcError::Protocol(_)) => {}
            other => panic!("expected local protocol error, got {:?}", other),
        }
        conn.shut_down();
    }

    #[tokio::test]
    async fn test_reconnect_after_server_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let conn = connection(listener.local_addr().unwrap(), test_config());
        let mut state = conn.subscribe_state();
        conn.start();

        let (stream, _) = listener.accept().await.unwrap();
        conn.wait_connected().await.unwrap();
        drop(stream);

        while *state.borrow_and_update() != ConnectionState::Disconnected {
            state.changed().await.unwrap();
        }
        // the loop reconnects on its own
        let _ = listener.accept().await.unwrap();
        conn.wait_connected().await.unwrap();
        conn.shut_down();
    }

    struct PingRecorder {
        pings: AtomicUsize,
    }

    #[async_trait]
    impl ClientEvents for PingRecorder {
        async fn ping(&self, _conn: &Connection) {
            self.pings.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_write_idle_triggers_ping() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let events = Arc::new(PingRecorder { pings: AtomicUsize::new(0) });
        let config = ConnectionConfig {
            heartbeat_interval: Duration::from_millis(50),
            ..test_config()
        };
        let conn = Connection::new(
            listener.local_addr().unwrap(),
            config,
            Arc::new(NullBus),
            events.clone(),
        );
        conn.start();

        let (_stream, _) = listener.accept().await.unwrap();
        conn.wait_connected().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(events.pings.load(Ordering::SeqCst) >= 2);
        conn.shut_down();
    }

    #[tokio::test]
    async fn test_read_idle_triggers_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ConnectionConfig {
            read_timeout: Duration::from_millis(100),
            ..test_config()
        };
        let conn = connection(listener.local_addr().unwrap(), config);
        let mut state = conn.subscribe_state();
        conn.start();

        // a silent server: accepted but never writes
        let (_stream, _) = listener.accept().await.unwrap();
        conn.wait_connected().await.unwrap();

        while *state.borrow_and_update() != ConnectionState::Disconnected {
            state.changed().await.unwrap();
        }
        conn.shut_down();
    }
}
