//! The `drbd` object: cluster-wide replication settings.

use serde_json::{Value, json};
use tracing::info;
use vmgrid_auth::random_token;
use vmgrid_core::{BoxFuture, GridError, GridResult, Permission};
use vmgrid_rpc::object::unknown_method;
use vmgrid_rpc::{CallArgs, CallContext, MethodSpec, RpcObject};
use vmgrid_state::DrbdConfig;

use crate::{capture, captured};

const METHODS: &[MethodSpec] = &[
    MethodSpec::read("get_config"),
    MethodSpec::fan_out("enable", Some("drbd_from_user_config")).requires(Permission::ManageDrbd),
    MethodSpec::fan_out("set_sync_rate", Some("drbd_from_user_config")).requires(Permission::ManageDrbd),
    MethodSpec::fan_out("drbd_from_user_config", None).requires(Permission::ManageCluster),
];

pub struct DrbdService;

/// `10M`, `512K`, `1G`: a number followed by a unit suffix.
fn validate_sync_rate(rate: &str) -> GridResult<()> {
    let (digits, unit) = rate.split_at(rate.len().saturating_sub(1));
    let valid = !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
        && matches!(unit, "K" | "M" | "G");
    if !valid {
        return Err(GridError::invalid_argument(format!("invalid sync rate '{rate}'")));
    }
    Ok(())
}

impl RpcObject for DrbdService {
    fn type_name(&self) -> &'static str {
        "Drbd"
    }

    fn methods(&self) -> &'static [MethodSpec] {
        METHODS
    }

    fn prepare<'a>(&'a self, ctx: &'a CallContext, method: &'a str, mut args: CallArgs) -> BoxFuture<'a, GridResult<CallArgs>> {
        Box::pin(async move {
            let current = ctx.config()?.drbd;
            match method {
                "enable" => {
                    if current.enabled {
                        return Err(GridError::already_exists("DRBD is already enabled"));
                    }
                    // Every node must share one secret.
                    if args.opt::<String>(0, "secret")?.is_none() {
                        args.set("secret", random_token()?);
                    }
                    capture(&mut args, "drbd", &current)?;
                }
                "set_sync_rate" => {
                    validate_sync_rate(&args.get::<String>(0, "rate")?)?;
                    capture(&mut args, "drbd", &current)?;
                }
                _ => {}
            }
            Ok(args)
        })
    }

    fn call<'a>(&'a self, ctx: &'a CallContext, method: &'a str, args: CallArgs) -> BoxFuture<'a, GridResult<Value>> {
        Box::pin(async move {
            match method {
                "get_config" => {
                    let drbd = ctx.config()?.drbd;
                    Ok(json!({"enabled": drbd.enabled, "sync_rate": drbd.sync_rate}))
                }
                "enable" => {
                    let secret: String = args.get(0, "secret")?;
                    ctx.env().update_config("enable DRBD", |cfg| {
                        cfg.drbd.enabled = true;
                        cfg.drbd.secret = Some(secret);
                        Ok(())
                    })?;
                    info!("DRBD enabled");
                    Ok(Value::Null)
                }
                "set_sync_rate" => {
                    let rate: String = args.get(0, "rate")?;
                    ctx.env().update_config(&format!("set DRBD sync rate {rate}"), |cfg| {
                        cfg.drbd.sync_rate = rate.clone();
                        Ok(())
                    })?;
                    info!(%rate, "DRBD sync rate changed");
                    Ok(Value::Null)
                }
                "drbd_from_user_config" => {
                    let (_, drbd): (String, DrbdConfig) = captured(&args)?;
                    ctx.env().update_config("install DRBD settings", |cfg| {
                        cfg.drbd = drbd;
                        Ok(())
                    })?;
                    Ok(Value::Null)
                }
                other => Err(unknown_method(self.type_name(), other)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_rates() {
        for ok in ["10M", "512K", "1G"] {
            assert!(validate_sync_rate(ok).is_ok(), "{ok}");
        }
        for bad in ["", "M", "10", "10MB", "ten"] {
            assert!(validate_sync_rate(bad).is_err(), "{bad}");
        }
    }
}
