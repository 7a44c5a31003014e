use std::time::Duration;

use anyhow::bail;
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};

use crate::client::Client;
use crate::codec::value::Value;
use crate::error::RpcError;

/// Derives a stable numeric identifier from a name or normalized signature
///  string. Collisions are possible in principle but negligible for realistic
///  interface sizes, and [RemoteInterfaceBuilder::build] rejects them.
pub fn stable_id(s: &str) -> i64 {
    let digest = Sha256::digest(s.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(prefix)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteMethod {
    pub name: String,
    /// hash of the de-qualified normalized signature, e.g. `"int add(int,int)"`
    pub method_id: i64,
    pub arity: usize,
    pub signature: String,
}

/// The client-side stand-in for a declared remote interface: a per-method
///  dispatch table built once at declaration time, consulted by the generic
///  [RemoteInterface::invoke] routine. Replaces runtime interface proxying
///  with explicit declaration.
#[derive(Debug, Clone)]
pub struct RemoteInterface {
    name: String,
    interface_id: i64,
    methods: FxHashMap<String, RemoteMethod>,
}

impl RemoteInterface {
    pub fn declare(name: &str) -> RemoteInterfaceBuilder {
        RemoteInterfaceBuilder {
            name: name.to_string(),
            methods: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interface_id(&self) -> i64 {
        self.interface_id
    }

    pub fn method(&self, name: &str) -> Option<&RemoteMethod> {
        self.methods.get(name)
    }

    pub fn methods(&self) -> impl Iterator<Item = &RemoteMethod> {
        self.methods.values()
    }

    /// The structured call path for one of this interface's methods:
    ///  `rpc:<interfaceName>:<methodName>:<methodId>:<interfaceId>`.
    pub fn rpc_path(&self, method: &RemoteMethod) -> String {
        format!(
            "rpc:{}:{}:{}:{}",
            self.name, method.name, method.method_id, self.interface_id
        )
    }

    /// Turns a method invocation into a routed, encoded call with the
    ///  client's default timeout, and unwraps the remote result.
    pub async fn invoke(
        &self,
        client: &dyn Client,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Value, RpcError> {
        self.invoke_with_timeout(client, method, params, client.default_call_timeout())
            .await
    }

    pub async fn invoke_with_timeout(
        &self,
        client: &dyn Client,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let Some(m) = self.methods.get(method) else {
            return Err(RpcError::UnknownMethod(format!("{}.{}", self.name, method)));
        };
        if m.arity != params.len() {
            return Err(RpcError::ParameterMismatch {
                method: format!("{}.{}", self.name, method),
                expected: m.arity,
                actual: params.len(),
            });
        }
        client
            .invoke_with_timeout(&self.rpc_path(m), params, timeout)
            .await
    }
}

pub struct RemoteInterfaceBuilder {
    name: String,
    methods: Vec<RemoteMethod>,
}

impl RemoteInterfaceBuilder {
    /// Declares one method. The signature is normalized to the de-qualified
    ///  form `<returnType> <name>(<paramType>,...)` before hashing, so the
    ///  derived id is stable across declaring interfaces.
    pub fn method(mut self, name: &str, param_types: &[&str], return_type: &str) -> Self {
        let signature = format!("{} {}({})", return_type, name, param_types.join(","));
        self.methods.push(RemoteMethod {
            name: name.to_string(),
            method_id: stable_id(&signature),
            arity: param_types.len(),
            signature,
        });
        self
    }

    /// Inherits all methods of a parent interface, ids included.
    pub fn extends(mut self, parent: &RemoteInterface) -> Self {
        self.methods.extend(parent.methods.values().cloned());
        self
    }

    /// Rejects method-id collisions and duplicate method names at declaration
    ///  time rather than misrouting calls later.
    pub fn build(self) -> anyhow::Result<RemoteInterface> {
        let mut by_id: FxHashMap<i64, &str> = FxHashMap::default();
        let mut methods = FxHashMap::default();
        for m in &self.methods {
            if let Some(prior) = by_id.insert(m.method_id, &m.signature) {
                bail!(
                    "method id collision in interface {}: '{}' and '{}' both hash to {}",
                    self.name,
                    prior,
                    m.signature,
                    m.method_id
                );
            }
            if methods.insert(m.name.clone(), m.clone()).is_some() {
                bail!("duplicate method name in interface {}: {}", self.name, m.name);
            }
        }
        Ok(RemoteInterface {
            interface_id: stable_id(&self.name),
            name: self.name,
            methods,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_stable_id_is_deterministic() {
        assert_eq!(stable_id("int add(int,int)"), stable_id("int add(int,int)"));
        assert_ne!(stable_id("int add(int,int)"), stable_id("int add(int,long)"));
    }

    #[test]
    fn test_rpc_path_format() {
        let interface = RemoteInterface::declare("demo.CalcService")
            .method("add", &["int", "int"], "int")
            .build()
            .unwrap();
        let m = interface.method("add").unwrap();
        assert_eq!(
            interface.rpc_path(m),
            format!("rpc:demo.CalcService:add:{}:{}", m.method_id, interface.interface_id())
        );
        assert_eq!(m.arity, 2);
        assert_eq!(m.method_id, stable_id("int add(int,int)"));
        assert_eq!(interface.interface_id(), stable_id("demo.CalcService"));
    }

    #[test]
    fn test_inherited_methods_keep_their_ids() {
        let base = RemoteInterface::declare("demo.Base")
            .method("ping", &[], "void")
            .build()
            .unwrap();
        let derived = RemoteInterface::declare("demo.Derived")
            .extends(&base)
            .method("add", &["int", "int"], "int")
            .build()
            .unwrap();

        assert_eq!(
            derived.method("ping").unwrap().method_id,
            base.method("ping").unwrap().method_id
        );
        assert_ne!(derived.interface_id(), base.interface_id());
    }

    #[test]
    fn test_duplicate_signature_is_rejected() {
        let result = RemoteInterface::declare("demo.Broken")
            .method("add", &["int", "int"], "int")
            .method("add", &["int", "int"], "int")
            .build();
        assert!(result.is_err());
    }
}
