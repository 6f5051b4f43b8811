//! Object registry and remote handles.
//!
//! Objects are registered under stable names and published in the name
//! directory. The same name resolves on every node, so a remote object is
//! a typed `(node, name)` handle rather than a proxy instance.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::debug;
use vmgrid_auth::Handshake;
use vmgrid_cluster::{Endpoint, NameDirectory, Target, Transport};
use vmgrid_core::{GridError, GridResult};

use crate::object::{CallArgs, RpcObject};

pub struct ObjectRegistry {
    objects: RwLock<BTreeMap<String, Arc<dyn RpcObject>>>,
    directory: Arc<NameDirectory>,
}

impl ObjectRegistry {
    pub fn new(directory: Arc<NameDirectory>) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            directory,
        }
    }

    /// Register `object` under `name`. Registering a taken name keeps the
    /// existing object; returns whether `object` was added.
    pub fn register(&self, name: &str, object: Arc<dyn RpcObject>) -> bool {
        let Ok(mut objects) = self.objects.write() else {
            return false;
        };
        if objects.contains_key(name) {
            return false;
        }
        objects.insert(name.to_string(), object);
        self.directory.publish(name);
        debug!(%name, "object registered");
        true
    }

    pub fn deregister(&self, name: &str) -> bool {
        let removed = self
            .objects
            .write()
            .map(|mut objects| objects.remove(name).is_some())
            .unwrap_or(false);
        if removed {
            self.directory.unpublish(name);
            debug!(%name, "object deregistered");
        }
        removed
    }

    pub fn get(&self, name: &str) -> GridResult<Arc<dyn RpcObject>> {
        self.objects
            .read()
            .ok()
            .and_then(|objects| objects.get(name).cloned())
            .ok_or_else(|| GridError::not_found(format!("no object named '{name}'")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.objects.read().is_ok_and(|objects| objects.contains_key(name))
    }

    pub fn names(&self) -> Vec<String> {
        self.objects
            .read()
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Handle to `name` on `node`, calling with `credentials`.
    pub fn remote(&self, node: &str, name: &str, credentials: Handshake) -> GridResult<RemoteHandle> {
        let (endpoint, uri) = self.directory.lookup(node, name)?;
        Ok(RemoteHandle {
            endpoint,
            object: name.to_string(),
            uri,
            credentials,
        })
    }
}

/// A named object on one node, with the credentials used to call it.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteHandle {
    pub endpoint: Endpoint,
    pub object: String,
    pub uri: String,
    pub credentials: Handshake,
}

impl RemoteHandle {
    pub fn node(&self) -> &str {
        &self.endpoint.node
    }

    pub async fn call(&self, transport: &dyn Transport, method: &str, args: CallArgs) -> GridResult<Value> {
        let request = args
            .into_request(&self.object, method)
            .with_handshake(self.credentials.clone());
        transport.call(&Target::new(self.endpoint.clone()), request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CallContext;
    use crate::object::MethodSpec;
    use vmgrid_core::{BoxFuture, ErrorKind};

    struct Echo;

    impl RpcObject for Echo {
        fn type_name(&self) -> &'static str {
            "Echo"
        }

        fn methods(&self) -> &'static [MethodSpec] {
            const METHODS: &[MethodSpec] = &[MethodSpec::read("echo")];
            METHODS
        }

        fn call<'a>(&'a self, _ctx: &'a CallContext, _method: &'a str, args: CallArgs) -> BoxFuture<'a, GridResult<Value>> {
            Box::pin(async move { Ok(Value::Array(args.args)) })
        }
    }

    #[test]
    fn registration_is_idempotent_and_published() {
        let directory = Arc::new(NameDirectory::new());
        let registry = ObjectRegistry::new(Arc::clone(&directory));

        assert!(registry.register("echo", Arc::new(Echo)));
        assert!(!registry.register("echo", Arc::new(Echo)));
        assert!(directory.is_published("echo"));
        assert_eq!(registry.get("echo").unwrap().type_name(), "Echo");

        assert!(registry.deregister("echo"));
        assert!(!directory.is_published("echo"));
        assert_eq!(registry.get("echo").err().unwrap().kind, ErrorKind::ObjectNotFound);
    }

    #[test]
    fn remote_handle_resolves_through_directory() {
        let directory = Arc::new(NameDirectory::new());
        directory.set_node(Endpoint::new("beta", "10.0.0.2", 8089));
        let registry = ObjectRegistry::new(Arc::clone(&directory));
        registry.register("echo", Arc::new(Echo));

        let handle = registry
            .remote("beta", "echo", Handshake::session("admin", "s1"))
            .unwrap();
        assert_eq!(handle.node(), "beta");
        assert_eq!(handle.uri, "vmgrid://10.0.0.2:8089/echo");

        let err = registry.remote("gamma", "echo", Handshake::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::PeerUnreachable);
    }
}
