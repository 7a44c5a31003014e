use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::{oneshot, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::codec::value::Value;
use crate::error::RpcError;

pub type CallResult = Result<Value, RpcError>;

/// The caller-side handle for one in-flight invocation. Awaiting it yields
///  the call's outcome; if the tracker entry disappears without a resolution
///  (shutdown) the call completes with [RpcError::Cancelled].
pub struct PendingCall {
    invocation_id: String,
    rx: oneshot::Receiver<CallResult>,
}

impl PendingCall {
    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }
}

impl Future for PendingCall {
    type Output = CallResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(RpcError::Cancelled)))
    }
}

struct PendingInvocation {
    tx: oneshot::Sender<CallResult>,
    timeout: Option<AbortHandle>,
    registered_at: Instant,
}

/// Correlates asynchronous calls with their replies: maps a generated
///  invocation id to the pending result and its timeout. An entry has exactly
///  one owner from registration until it is resolved, timed out or evicted,
///  and at most one resolution ever happens per id.
///
/// Explicit per-call timeouts ride on the tokio timer wheel (one abortable
///  task per call). The idle-expiry sweep is the backstop for ids that are
///  never resolved and never hit their explicit timeout, e.g. because the
///  reply was lost and no timeout was requested.
pub struct InvocationTracker {
    pending: Mutex<FxHashMap<String, PendingInvocation>>,
    ttl: Duration,
}

impl InvocationTracker {
    pub fn new(ttl: Duration) -> InvocationTracker {
        InvocationTracker {
            pending: Default::default(),
            ttl,
        }
    }

    /// Registers a new invocation and schedules its timeout. The returned
    ///  [PendingCall] resolves when a reply arrives, the timeout fires, or
    ///  the entry is evicted.
    pub async fn register(self: &Arc<Self>, id: &str, timeout: Option<Duration>) -> PendingCall {
        let (tx, rx) = oneshot::channel();

        let timeout_handle = timeout.map(|after| {
            let tracker = self.clone();
            let id = id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                tracker.expire(&id, RpcError::Timeout(after)).await;
            })
            .abort_handle()
        });

        self.pending.lock().await.insert(
            id.to_string(),
            PendingInvocation {
                tx,
                timeout: timeout_handle,
                registered_at: Instant::now(),
            },
        );
        trace!(invocation_id = id, "registered invocation");

        PendingCall {
            invocation_id: id.to_string(),
            rx,
        }
    }

    /// Resolves an invocation with its result, invalidating the entry and
    ///  cancelling its timeout. Returns false if the id is unknown - either
    ///  never registered, or already resolved, timed out or evicted; the
    ///  caller drops the reply silently in that case.
    pub async fn resolve(&self, id: &str, result: CallResult) -> bool {
        match self.pending.lock().await.remove(id) {
            Some(invocation) => {
                if let Some(timeout) = invocation.timeout {
                    timeout.abort();
                }
                let _ = invocation.tx.send(result);
                true
            }
            None => false,
        }
    }

    /// A timeout firing after the id was already resolved is a no-op.
    async fn expire(&self, id: &str, error: RpcError) {
        if let Some(invocation) = self.pending.lock().await.remove(id) {
            debug!(invocation_id = id, "invocation expired: {}", error);
            let _ = invocation.tx.send(Err(error));
        }
    }

    /// Evicts entries older than the configured time-to-live, completing
    ///  their futures with a timeout error. Returns the number of evictions.
    pub async fn evict_stale(&self) -> usize {
        // a ttl reaching back before the clock's own start means nothing can
        //  be stale yet
        let Some(deadline) = Instant::now().checked_sub(self.ttl) else {
            return 0;
        };
        let mut pending = self.pending.lock().await;
        let stale: Vec<String> = pending
            .iter()
            .filter(|(_, inv)| inv.registered_at <= deadline)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            if let Some(invocation) = pending.remove(id) {
                if let Some(timeout) = invocation.timeout {
                    timeout.abort();
                }
                let _ = invocation.tx.send(Err(RpcError::Timeout(self.ttl)));
            }
        }
        if !stale.is_empty() {
            debug!("evicted {} stale invocations", stale.len());
        }
        stale.len()
    }

    /// Spawns the periodic eviction sweep. One sweeper per tracker.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tracker.evict_stale().await;
            }
        })
    }

    pub async fn is_pending(&self, id: &str) -> bool {
        self.pending.lock().await.contains_key(id)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
