//! The `network_factory` object: network name → bridge interface, defined
//! identically on every node.

use serde_json::{Value, json};
use tracing::info;
use vmgrid_core::validate::validate_network_name;
use vmgrid_core::{BoxFuture, ErrorKind, GridError, GridResult, Permission};
use vmgrid_rpc::object::unknown_method;
use vmgrid_rpc::{CallArgs, CallContext, MethodSpec, RpcObject};

use crate::{capture, captured};

const METHODS: &[MethodSpec] = &[
    MethodSpec::read("list"),
    MethodSpec::fan_out("create", Some("delete")).requires(Permission::ManageHostNetworks),
    MethodSpec::fan_out("delete", Some("network_from_user_config")).requires(Permission::ManageHostNetworks),
    MethodSpec::fan_out("network_from_user_config", Some("remove_network_config"))
        .requires(Permission::ManageCluster),
    MethodSpec::fan_out("remove_network_config", None).requires(Permission::ManageCluster),
];

pub struct NetworkFactory;

impl NetworkFactory {
    async fn create(ctx: &CallContext, name: &str, interface: &str) -> GridResult<()> {
        validate_network_name(name)?;
        if ctx.config()?.networks.contains_key(name) {
            return Err(GridError::already_exists(format!("network '{name}' already exists")));
        }
        ctx.env().hypervisor().define_network(name, interface).await?;
        ctx.env().update_config(&format!("create network {name}"), |cfg| {
            cfg.networks.insert(name.to_string(), interface.to_string());
            Ok(())
        })?;
        info!(network = %name, %interface, "network created");
        Ok(())
    }

    async fn delete(ctx: &CallContext, name: &str) -> GridResult<()> {
        let config = ctx.config()?;
        if !config.networks.contains_key(name) {
            return Err(GridError::not_found(format!("network '{name}' does not exist")));
        }
        if let Some(vm) = config
            .virtual_machines
            .values()
            .find(|vm| vm.network_interfaces.values().any(|n| n == name))
        {
            return Err(GridError::new(
                ErrorKind::NetworkUtilised,
                format!("network '{name}' is used by VM '{}'", vm.name),
            ));
        }
        ctx.env().hypervisor().undefine_network(name).await?;
        ctx.env().update_config(&format!("delete network {name}"), |cfg| {
            cfg.networks.remove(name);
            Ok(())
        })?;
        info!(network = %name, "network deleted");
        Ok(())
    }

    /// Install a network exactly as another node has it.
    async fn install(ctx: &CallContext, name: &str, interface: &str) -> GridResult<()> {
        match ctx.config()?.networks.get(name) {
            Some(existing) if existing == interface => Ok(()),
            Some(existing) => Err(GridError::already_exists(format!(
                "network '{name}' is bound to '{existing}' here"
            ))),
            None => Self::create(ctx, name, interface).await,
        }
    }

    async fn uninstall(ctx: &CallContext, name: &str) -> GridResult<()> {
        if !ctx.config()?.networks.contains_key(name) {
            return Ok(());
        }
        ctx.env().hypervisor().undefine_network(name).await?;
        ctx.env().update_config(&format!("remove network {name}"), |cfg| {
            cfg.networks.remove(name);
            Ok(())
        })?;
        Ok(())
    }
}

impl RpcObject for NetworkFactory {
    fn type_name(&self) -> &'static str {
        "NetworkFactory"
    }

    fn methods(&self) -> &'static [MethodSpec] {
        METHODS
    }

    fn prepare<'a>(&'a self, ctx: &'a CallContext, method: &'a str, mut args: CallArgs) -> BoxFuture<'a, GridResult<CallArgs>> {
        Box::pin(async move {
            match method {
                "create" => validate_network_name(&args.get::<String>(0, "name")?)?,
                "delete" => {
                    let name: String = args.get(0, "name")?;
                    let config = ctx.config()?;
                    let interface = config
                        .networks
                        .get(&name)
                        .ok_or_else(|| GridError::not_found(format!("network '{name}' does not exist")))?;
                    capture(&mut args, &name, interface)?;
                }
                _ => {}
            }
            Ok(args)
        })
    }

    fn call<'a>(&'a self, ctx: &'a CallContext, method: &'a str, args: CallArgs) -> BoxFuture<'a, GridResult<Value>> {
        Box::pin(async move {
            match method {
                "list" => Ok(serde_json::to_value(ctx.config()?.networks)?),
                "create" => {
                    let name: String = args.get(0, "name")?;
                    let interface: String = args.get(1, "interface")?;
                    Self::create(ctx, &name, &interface).await?;
                    Ok(json!(name))
                }
                "delete" => {
                    Self::delete(ctx, &args.get::<String>(0, "name")?).await?;
                    Ok(Value::Null)
                }
                "network_from_user_config" => {
                    let (name, interface): (String, String) = captured(&args)?;
                    Self::install(ctx, &name, &interface).await?;
                    Ok(Value::Null)
                }
                "remove_network_config" => {
                    Self::uninstall(ctx, &args.get::<String>(0, crate::KEY)?).await?;
                    Ok(Value::Null)
                }
                other => Err(unknown_method(self.type_name(), other)),
            }
        })
    }
}
