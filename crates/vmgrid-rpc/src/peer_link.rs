//! The scheduler's `PeerLink` over the environment: the local node is
//! handled in process, peers through the `node_lock` object.

use std::sync::Arc;

use serde_json::{Value, json};
use vmgrid_auth::Handshake;
use vmgrid_core::{BoxFuture, GridError, GridResult};
use vmgrid_scheduler::{LockHolder, PeerLink};

use crate::env::Environment;
use crate::lock_service::LOCK_SERVICE;
use crate::object::CallArgs;

pub struct EnvPeerLink {
    env: Arc<Environment>,
}

impl EnvPeerLink {
    pub fn new(env: Arc<Environment>) -> Self {
        Self { env }
    }

    fn is_local(&self, node: &str) -> bool {
        node == self.env.node()
    }

    async fn remote(&self, node: &str, method: &str, arg: Value) -> GridResult<Value> {
        let args = CallArgs::new().arg(arg);
        self.env
            .call_peer(node, LOCK_SERVICE, method, args, &Handshake::default())
            .await
    }
}

impl PeerLink for EnvPeerLink {
    fn lock_node<'a>(&'a self, node: &'a str, holder: &'a LockHolder) -> BoxFuture<'a, GridResult<u32>> {
        Box::pin(async move {
            if self.is_local(node) {
                self.env.scheduler().lock_node(holder)?;
                return Ok(self.env.document().version()?);
            }
            let version = self.remote(node, "lock_node", serde_json::to_value(holder)?).await?;
            serde_json::from_value(version)
                .map_err(|e| GridError::bug(format!("lock_node on {node} returned no version: {e}")))
        })
    }

    fn unlock_node<'a>(&'a self, node: &'a str, holder: &'a LockHolder) -> BoxFuture<'a, GridResult<()>> {
        Box::pin(async move {
            if self.is_local(node) {
                self.env.scheduler().unlock_node(holder)?;
                return Ok(());
            }
            self.remote(node, "unlock_node", serde_json::to_value(holder)?).await?;
            Ok(())
        })
    }

    fn create_task_pointer<'a>(&'a self, node: &'a str, holder: &'a LockHolder) -> BoxFuture<'a, GridResult<()>> {
        Box::pin(async move {
            if self.is_local(node) {
                return self.env.scheduler().create_pointer(holder);
            }
            self.remote(node, "create_task_pointer", serde_json::to_value(holder)?).await?;
            Ok(())
        })
    }

    fn release_task_pointer<'a>(&'a self, node: &'a str, task_id: &'a str) -> BoxFuture<'a, GridResult<()>> {
        Box::pin(async move {
            if self.is_local(node) {
                self.env.scheduler().release_pointer(task_id)?;
                return Ok(());
            }
            self.remote(node, "release_task_pointer", json!(task_id)).await?;
            Ok(())
        })
    }

    fn cancel_task_pointer<'a>(&'a self, node: &'a str, task_id: &'a str) -> BoxFuture<'a, GridResult<()>> {
        Box::pin(async move {
            if self.is_local(node) {
                self.env.scheduler().cancel_pointer(task_id)?;
                return Ok(());
            }
            self.remote(node, "cancel_task_pointer", json!(task_id)).await?;
            Ok(())
        })
    }
}
