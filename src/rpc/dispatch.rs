use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::bus::DispatchBus;
use crate::codec::value::Value;
use crate::rpc::envelope::{try_deser_params, ReplyEnvelope, ReplyOutcome};
use crate::rpc::proxy::{RemoteInterface, RemoteMethod};
use crate::util::buf::try_get_string_u16;

/// What the server knows about the peer behind an accepted connection, for
///  pre-handler decisions and log output.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub remote_addr: SocketAddr,
    pub identity: Option<String>,
}

pub enum PreHandlerParam<'a> {
    /// the call path of a decoded call envelope, before parameter decoding
    Command(&'a str),
    /// the undecoded payload of an application frame
    Raw(&'a [u8]),
}

/// Inbound admission check, consulted before a message is decoded further or
///  handled. `Ok(false)` vetoes the message silently; an error is reported
///  back to the caller as a failed call.
pub trait PreHandler: Send + Sync + 'static {
    fn check(&self, opcode: i32, param: PreHandlerParam<'_>, peer: &PeerInfo) -> anyhow::Result<bool>;
}

pub type MethodFn = Arc<dyn Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync>;

/// One registered service: a declared interface plus a handler per method.
pub struct ServiceBinding {
    interface: RemoteInterface,
    handlers: FxHashMap<String, MethodFn>,
}

impl ServiceBinding {
    pub fn new(interface: RemoteInterface) -> ServiceBinding {
        ServiceBinding {
            interface,
            handlers: FxHashMap::default(),
        }
    }

    pub fn handler(
        mut self,
        method: &str,
        f: impl Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.handlers.insert(method.to_string(), Arc::new(f));
        self
    }

    fn resolve_method(&self, method_id: Option<i64>, name: &str, arity: usize) -> Option<&RemoteMethod> {
        if let Some(id) = method_id {
            if let Some(m) = self.interface.methods().find(|m| m.method_id == id) {
                return Some(m);
            }
        }
        // fall back to name + arity for peers that route without derived ids
        self.interface.method(name).filter(|m| m.arity == arity)
    }
}

/// All services exposed by this process, looked up by derived interface id or
///  by interface name. Built mutably at startup, then shared read-only.
#[derive(Default)]
pub struct ServiceRegistry {
    by_id: FxHashMap<i64, Arc<ServiceBinding>>,
    by_name: FxHashMap<String, Arc<ServiceBinding>>,
}

impl ServiceRegistry {
    pub fn new() -> ServiceRegistry {
        Default::default()
    }

    /// Every method of the bound interface must have a handler.
    pub fn register(&mut self, binding: ServiceBinding) -> anyhow::Result<()> {
        for m in binding.interface.methods() {
            if !binding.handlers.contains_key(&m.name) {
                bail!(
                    "service {} is missing a handler for method {}",
                    binding.interface.name(),
                    m.name
                );
            }
        }
        if self.by_name.contains_key(binding.interface.name()) {
            bail!("service {} is already registered", binding.interface.name());
        }
        let binding = Arc::new(binding);
        self.by_id.insert(binding.interface.interface_id(), binding.clone());
        self.by_name
            .insert(binding.interface.name().to_string(), binding);
        Ok(())
    }

    fn resolve(&self, interface_id: Option<i64>, name: &str) -> Option<&Arc<ServiceBinding>> {
        if let Some(id) = interface_id {
            if let Some(binding) = self.by_id.get(&id) {
                return Some(binding);
            }
        }
        self.by_name.get(name)
    }

    pub fn service_count(&self) -> usize {
        self.by_name.len()
    }
}

/// the parsed structured form `rpc:<iface>:<method>:<methodId>:<interfaceId>`
struct RpcPath<'a> {
    interface_name: &'a str,
    method_name: &'a str,
    method_id: Option<i64>,
    interface_id: Option<i64>,
}

fn parse_rpc_path(path: &str) -> Option<RpcPath<'_>> {
    let rest = path.strip_prefix("rpc:")?;
    let mut parts = rest.split(':');
    let interface_name = parts.next()?;
    let method_name = parts.next()?;
    let method_id = parts.next().and_then(|s| s.parse().ok());
    let interface_id = parts.next().and_then(|s| s.parse().ok());
    if interface_name.is_empty() || method_name.is_empty() {
        return None;
    }
    Some(RpcPath {
        interface_name,
        method_name,
        method_id,
        interface_id,
    })
}

/// Server-side handling of one decoded call frame: admission check, staged
///  payload decoding, routing to a registered service method or to the
///  dispatch bus, and mapping the outcome to a reply envelope.
pub struct RemoteDispatch {
    services: Arc<ServiceRegistry>,
    bus: Arc<dyn DispatchBus>,
    pre_handler: Option<Arc<dyn PreHandler>>,
}

impl RemoteDispatch {
    pub fn new(
        services: Arc<ServiceRegistry>,
        bus: Arc<dyn DispatchBus>,
        pre_handler: Option<Arc<dyn PreHandler>>,
    ) -> RemoteDispatch {
        RemoteDispatch {
            services,
            bus,
            pre_handler,
        }
    }

    /// Handles the payload of a call frame. Returns the reply to send back,
    ///  or `None` if the pre-handler vetoed the call (no reply at all - the
    ///  caller's timeout handles it).
    ///
    /// Decoding is staged so a vetoed call never pays for parameter decoding:
    ///  id and path first, then the admission check, then the parameters.
    pub async fn handle_call(
        &self,
        opcode: i32,
        payload: &[u8],
        peer: &PeerInfo,
    ) -> anyhow::Result<Option<ReplyEnvelope>> {
        let mut buf = payload;
        let invocation_id = try_get_string_u16(&mut buf)?;
        let path = try_get_string_u16(&mut buf)?;

        if let Some(pre) = &self.pre_handler {
            match pre.check(opcode, PreHandlerParam::Command(&path), peer) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(path, peer = %peer.remote_addr, "call vetoed by pre-handler");
                    return Ok(None);
                }
                Err(e) => {
                    return Ok(Some(failure(invocation_id, path, format!("{:#}", e))));
                }
            }
        }

        let params = match try_deser_params(&mut buf) {
            Ok(params) => params,
            Err(e) => {
                warn!(path, peer = %peer.remote_addr, "undecodable call parameters: {:#}", e);
                return Ok(Some(failure(
                    invocation_id,
                    path,
                    format!("undecodable call parameters: {:#}", e),
                )));
            }
        };

        let outcome = self.route(&path, params).await;
        Ok(Some(ReplyEnvelope {
            invocation_id,
            path,
            outcome,
        }))
    }

    async fn route(&self, path: &str, params: Vec<Value>) -> ReplyOutcome {
        if path.starts_with("rpc:") {
            let Some(parsed) = parse_rpc_path(path) else {
                return ReplyOutcome::Failure(format!("malformed rpc path: {}", path));
            };
            return self.invoke_service(&parsed, params);
        }

        if !self.bus.has_handler(path) {
            return ReplyOutcome::Failure(format!("no handler registered for command: {}", path));
        }
        match self.bus.dispatch_command(path, params).await {
            Ok(value) => ReplyOutcome::Success(value),
            Err(e) => ReplyOutcome::Failure(format!("{:#}", e)),
        }
    }

    fn invoke_service(&self, path: &RpcPath, params: Vec<Value>) -> ReplyOutcome {
        let Some(binding) = self.services.resolve(path.interface_id, path.interface_name) else {
            return ReplyOutcome::Failure(format!("unknown service: {}", path.interface_name));
        };
        let Some(method) = binding.resolve_method(path.method_id, path.method_name, params.len())
        else {
            return ReplyOutcome::Failure(format!(
                "service {} has no method {} taking {} parameters",
                path.interface_name,
                path.method_name,
                params.len()
            ));
        };
        if method.arity != params.len() {
            return ReplyOutcome::Failure(format!(
                "method {} expects {} parameters, got {}",
                method.name,
                method.arity,
                params.len()
            ));
        }
        let Some(handler) = binding.handlers.get(&method.name) else {
            return ReplyOutcome::Failure(format!("no handler bound for method {}", method.name));
        };
        match handler(params) {
            Ok(value) => ReplyOutcome::Success(value),
            Err(e) => ReplyOutcome::Failure(format!("{:#}", e)),
        }
    }

    /// Admission check for application frames, which are not decoded by the
    ///  RPC layer at all.
    pub fn check_raw(&self, opcode: i32, payload: &[u8], peer: &PeerInfo) -> anyhow::Result<bool> {
        match &self.pre_handler {
            Some(pre) => pre.check(opcode, PreHandlerParam::Raw(payload), peer),
            None => Ok(true),
        }
    }
}

fn failure(invocation_id: String, path: String, info: String) -> ReplyEnvelope {
    ReplyEnvelope {
        invocation_id,
        path,
        outcome: ReplyOutcome::Failure(info),
    }
}
