//! `storage_management` portmanteau tool — `spec.md` §4.G.
//!
//! Action set: `list_controllers`, `create_controller`, `remove_controller`,
//! `list_disks`, `create_disk`, `attach_disk`. `list_disks` has no dedicated
//! orchestrator method of its own; it flattens the medium attachments
//! already present on `storage_list_controllers`'s result.

use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use vbox_mcp_shared::errors::McpResult;

use crate::vbox::types::{Bus, MediumType, VmIdentifier};

use super::envelope::{parse_params, require_action, ToolEnvelope};
use super::ServerContext;

pub const ACTIONS: &[&str] = &["list_controllers", "create_controller", "remove_controller", "list_disks", "create_disk", "attach_disk"];

pub async fn dispatch(ctx: ServerContext, arguments: Value) -> ToolEnvelope {
    let action = match require_action(&arguments, ACTIONS, ACTIONS) {
        Ok(a) => a,
        Err(e) => return ToolEnvelope::err(e),
    };
    match run(&ctx, &action, &arguments).await {
        Ok(envelope) => envelope,
        Err(e) => ToolEnvelope::err(e),
    }
}

async fn run(ctx: &ServerContext, action: &str, arguments: &Value) -> McpResult<ToolEnvelope> {
    match action {
        "list_controllers" => {
            #[derive(Deserialize)]
            struct Params {
                vm_name: String,
            }
            let params: Params = parse_params(arguments)?;
            let controllers = ctx
                .orchestrator
                .storage_list_controllers(&VmIdentifier::parse(&params.vm_name), CancellationToken::new())
                .await?;
            Ok(ToolEnvelope::ok(controllers))
        }
        "create_controller" => {
            #[derive(Deserialize)]
            struct Params {
                vm_name: String,
                name: String,
                bus: Bus,
            }
            let params: Params = parse_params(arguments)?;
            let controller = ctx
                .orchestrator
                .storage_create_controller(&VmIdentifier::parse(&params.vm_name), &params.name, params.bus, CancellationToken::new())
                .await?;
            Ok(ToolEnvelope::ok(controller))
        }
        "remove_controller" => {
            #[derive(Deserialize)]
            struct Params {
                vm_name: String,
                name: String,
            }
            let params: Params = parse_params(arguments)?;
            ctx.orchestrator
                .storage_remove_controller(&VmIdentifier::parse(&params.vm_name), &params.name, CancellationToken::new())
                .await?;
            Ok(ToolEnvelope::ok(serde_json::json!({ "removed": params.name })))
        }
        "list_disks" => {
            #[derive(Deserialize)]
            struct Params {
                vm_name: String,
            }
            let params: Params = parse_params(arguments)?;
            let controllers = ctx
                .orchestrator
                .storage_list_controllers(&VmIdentifier::parse(&params.vm_name), CancellationToken::new())
                .await?;
            let disks: Vec<_> = controllers
                .into_iter()
                .flat_map(|controller| {
                    let controller_name = controller.name.clone();
                    controller.attached_media.into_iter().map(move |medium| {
                        serde_json::json!({
                            "controller_name": controller_name,
                            "port": medium.port,
                            "device": medium.device,
                            "medium_type": medium.medium_type,
                            "medium_path": medium.medium_path,
                            "read_only": medium.read_only,
                        })
                    })
                })
                .collect();
            Ok(ToolEnvelope::ok(disks))
        }
        "create_disk" => {
            #[derive(Deserialize)]
            struct Params {
                path: String,
                size_mb: u64,
                #[serde(default = "default_format")]
                format: String,
            }
            let params: Params = parse_params(arguments)?;
            let path = ctx
                .orchestrator
                .storage_create_medium(&params.path, params.size_mb, &params.format, CancellationToken::new())
                .await?;
            Ok(ToolEnvelope::ok(serde_json::json!({ "path": path })))
        }
        "attach_disk" => {
            #[derive(Deserialize)]
            struct Params {
                vm_name: String,
                controller: String,
                port: u32,
                device: u32,
                medium_type: MediumType,
                #[serde(default)]
                path: Option<String>,
            }
            let params: Params = parse_params(arguments)?;
            ctx.orchestrator
                .storage_attach(
                    &VmIdentifier::parse(&params.vm_name),
                    &params.controller,
                    params.port,
                    params.device,
                    params.medium_type,
                    params.path.as_deref(),
                    CancellationToken::new(),
                )
                .await?;
            Ok(ToolEnvelope::ok_empty())
        }
        _ => unreachable!("validated by require_action"),
    }
}

fn default_format() -> String {
    "VDI".to_string()
}
