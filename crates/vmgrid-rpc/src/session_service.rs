//! The `session` object.
//!
//! The handshake already minted (or renewed) a session before any of these
//! methods run; `login` just hands its id back to the client. Peers log in
//! here once and reuse the session for later calls.

use serde_json::{Value, json};
use tracing::info;
use vmgrid_core::{BoxFuture, GridError, GridResult};

use crate::context::CallContext;
use crate::object::{CallArgs, MethodSpec, RpcObject, unknown_method};

pub const SESSION_SERVICE: &str = "session";

const METHODS: &[MethodSpec] = &[
    MethodSpec::read("login"),
    MethodSpec::read("logout"),
    MethodSpec::read("whoami"),
];

pub struct SessionService;

impl RpcObject for SessionService {
    fn type_name(&self) -> &'static str {
        "Session"
    }

    fn methods(&self) -> &'static [MethodSpec] {
        METHODS
    }

    fn call<'a>(&'a self, ctx: &'a CallContext, method: &'a str, _args: CallArgs) -> BoxFuture<'a, GridResult<Value>> {
        Box::pin(async move {
            let auth = ctx.auth();
            match method {
                "login" => {
                    let session = auth
                        .session
                        .as_deref()
                        .ok_or_else(|| GridError::unauthenticated("internal calls have no session"))?;
                    info!(user = %auth.username, "login");
                    Ok(json!(session))
                }
                "logout" => {
                    let ended = match &auth.session {
                        Some(id) => ctx.env().sessions().logout(id)?,
                        None => false,
                    };
                    Ok(json!(ended))
                }
                "whoami" => Ok(json!({
                    "username": auth.username,
                    "effective_user": auth.effective_user,
                    "user_type": auth.user_type,
                    "node": ctx.node(),
                })),
                other => Err(unknown_method(self.type_name(), other)),
            }
        })
    }
}
