use std::time::Duration;

use crate::codec::frame::DEFAULT_MAX_FRAME_LEN;

/// Tuning knobs for one client connection. The defaults are safe for LAN and
///  internet use alike; the timeouts interact - `heartbeat_interval` must be
///  well below the server's read-idle timeout, and `read_timeout` well above
///  the server's heartbeat response latency.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// how long a single TCP connect attempt may take
    pub connect_timeout: Duration,
    /// nothing read from the socket for this long means the link is dead:
    ///  close and reconnect
    pub read_timeout: Duration,
    /// nothing written for this long triggers an application-level ping
    pub heartbeat_interval: Duration,
    /// fixed pause between reconnect attempts, retried indefinitely
    pub reconnect_interval: Duration,
    pub max_frame_len: usize,
    /// applied when a call does not specify its own timeout
    pub default_call_timeout: Duration,
    /// hard cap on per-call timeouts, matching the invocation idle expiry
    pub max_call_timeout: Duration,
    /// idle expiry for pending invocations whose reply never arrives
    pub invocation_ttl: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(5),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            default_call_timeout: Duration::from_secs(5),
            max_call_timeout: Duration::from_secs(30 * 60),
            invocation_ttl: Duration::from_secs(30 * 60),
        }
    }
}
