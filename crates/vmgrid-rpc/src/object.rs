//! Exposed objects and their method declarations.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use vmgrid_cluster::RpcRequest;
use vmgrid_core::{BoxFuture, GridError, GridResult, Permission};

use crate::context::CallContext;

/// Keyword arguments consumed by the dispatcher rather than the method.
pub const NODES_KWARG: &str = "nodes";
pub const IGNORE_FAILED_NODES_KWARG: &str = "ignore_failed_nodes";

/// How one method is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSpec {
    pub name: &'static str,
    /// Runs as a task under the cluster lock.
    pub locking: bool,
    /// Replayed on every target node.
    pub remote_nodes: bool,
    /// Method that reverts this one on a node where it succeeded.
    pub undo: Option<&'static str>,
    /// Checked before dispatch, scoped to the object's VM if it has one.
    pub permission: Option<Permission>,
}

impl MethodSpec {
    /// A read: runs in place, no lock.
    pub const fn read(name: &'static str) -> Self {
        Self {
            name,
            locking: false,
            remote_nodes: false,
            undo: None,
            permission: None,
        }
    }

    /// A locking call that runs once, on this node.
    pub const fn write(name: &'static str) -> Self {
        Self {
            locking: true,
            ..Self::read(name)
        }
    }

    /// A locking call replayed on every target node, reverted by `undo`.
    pub const fn fan_out(name: &'static str, undo: Option<&'static str>) -> Self {
        Self {
            locking: true,
            remote_nodes: true,
            undo,
            ..Self::read(name)
        }
    }

    pub const fn requires(mut self, permission: Permission) -> Self {
        self.permission = Some(permission);
        self
    }
}

/// Positional and keyword arguments of one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_request(request: &RpcRequest) -> Self {
        Self {
            args: request.args.clone(),
            kwargs: request.kwargs.clone(),
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.to_string(), value.into());
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.kwargs.insert(key.to_string(), value.into());
    }

    fn raw(&self, index: usize, name: &str) -> Option<&Value> {
        self.kwargs
            .get(name)
            .or_else(|| self.args.get(index))
            .filter(|v| !v.is_null())
    }

    /// Argument `name`, passed by keyword or at position `index`.
    pub fn get<T: DeserializeOwned>(&self, index: usize, name: &str) -> GridResult<T> {
        self.opt(index, name)?
            .ok_or_else(|| GridError::invalid_argument(format!("missing argument '{name}'")))
    }

    pub fn opt<T: DeserializeOwned>(&self, index: usize, name: &str) -> GridResult<Option<T>> {
        self.raw(index, name)
            .map(|v| {
                serde_json::from_value(v.clone())
                    .map_err(|e| GridError::invalid_argument(format!("argument '{name}': {e}")))
            })
            .transpose()
    }

    /// A keyword-only argument.
    pub fn keyword<T: DeserializeOwned>(&self, name: &str) -> GridResult<Option<T>> {
        self.kwargs
            .get(name)
            .filter(|v| !v.is_null())
            .map(|v| {
                serde_json::from_value(v.clone())
                    .map_err(|e| GridError::invalid_argument(format!("argument '{name}': {e}")))
            })
            .transpose()
    }

    pub fn required_keyword<T: DeserializeOwned>(&self, name: &str) -> GridResult<T> {
        self.keyword(name)?
            .ok_or_else(|| GridError::invalid_argument(format!("missing argument '{name}'")))
    }

    /// A keyword-only boolean, false when absent.
    pub fn flag(&self, name: &str) -> bool {
        self.kwargs.get(name).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Explicit fan-out targets, if the caller named any.
    pub fn nodes(&self) -> GridResult<Option<Vec<String>>> {
        match self.kwargs.get(NODES_KWARG) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(|e| GridError::invalid_argument(format!("argument 'nodes': {e}"))),
        }
    }

    pub fn ignore_failed_nodes(&self) -> bool {
        self.flag(IGNORE_FAILED_NODES_KWARG)
    }

    /// The arguments a replay on one node receives.
    pub fn for_replay(&self) -> Self {
        let mut replay = self.clone();
        replay.kwargs.remove(NODES_KWARG);
        replay.kwargs.remove(IGNORE_FAILED_NODES_KWARG);
        replay
    }

    pub fn into_request(self, object: &str, method: &str) -> RpcRequest {
        let mut request = RpcRequest::new(object, method);
        request.args = self.args;
        request.kwargs = self.kwargs;
        request
    }
}

/// An object exposed over RPC under a stable name.
pub trait RpcObject: Send + Sync {
    /// Type name for the audit log.
    fn type_name(&self) -> &'static str;

    fn methods(&self) -> &'static [MethodSpec];

    /// The VM this object stands for, used to scope permission checks.
    fn vm_scope(&self) -> Option<&str> {
        None
    }

    /// Runs once on the originating node before a fan-out, so every node
    /// receives the same generated ids, hashes and defaults.
    fn prepare<'a>(&'a self, _ctx: &'a CallContext, _method: &'a str, args: CallArgs) -> BoxFuture<'a, GridResult<CallArgs>> {
        Box::pin(async move { Ok(args) })
    }

    /// Apply `method` on this node only.
    fn call<'a>(&'a self, ctx: &'a CallContext, method: &'a str, args: CallArgs) -> BoxFuture<'a, GridResult<Value>>;
}

/// Look up `method` among `object`'s declarations.
pub fn method_spec(object: &dyn RpcObject, method: &str) -> GridResult<MethodSpec> {
    object
        .methods()
        .iter()
        .find(|m| m.name == method)
        .copied()
        .ok_or_else(|| GridError::not_found(format!("{} has no method '{method}'", object.type_name())))
}

/// Error for a method that is declared but not handled.
pub fn unknown_method(type_name: &str, method: &str) -> GridError {
    GridError::bug(format!("{type_name}.{method} is declared but not implemented"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keyword_wins_over_position() {
        let args = CallArgs::new().arg("positional").kwarg("name", "keyword");
        let name: String = args.get(0, "name").unwrap();
        assert_eq!(name, "keyword");

        let args = CallArgs::new().arg("positional");
        let name: String = args.get(0, "name").unwrap();
        assert_eq!(name, "positional");
    }

    #[test]
    fn missing_and_mistyped_arguments_are_invalid() {
        let args = CallArgs::new().kwarg("size", "big");
        let err = args.get::<u64>(0, "size").unwrap_err();
        assert_eq!(err.kind, vmgrid_core::ErrorKind::InvalidArgument);
        assert!(args.get::<String>(1, "name").is_err());
        assert_eq!(args.opt::<String>(1, "name").unwrap(), None);
    }

    #[test]
    fn replay_strips_dispatcher_kwargs() {
        let args = CallArgs::new()
            .arg("x")
            .kwarg(NODES_KWARG, json!(["beta"]))
            .kwarg(IGNORE_FAILED_NODES_KWARG, true);
        assert_eq!(args.nodes().unwrap(), Some(vec!["beta".to_string()]));
        assert!(args.ignore_failed_nodes());

        let replay = args.for_replay();
        assert_eq!(replay.nodes().unwrap(), None);
        assert!(!replay.ignore_failed_nodes());
        assert_eq!(replay.args, vec![json!("x")]);
    }

    #[test]
    fn spec_builders() {
        const SPEC: MethodSpec = MethodSpec::fan_out("create", Some("delete")).requires(Permission::CreateVm);
        assert!(SPEC.locking && SPEC.remote_nodes);
        assert_eq!(SPEC.undo, Some("delete"));
        assert_eq!(SPEC.permission, Some(Permission::CreateVm));
        assert!(!MethodSpec::read("list").locking);
    }
}
