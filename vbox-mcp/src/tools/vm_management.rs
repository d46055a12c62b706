//! `vm_management` portmanteau tool — `spec.md` §4.G.
//!
//! Action set: `list`, `create`, `start`, `stop`, `delete`, `clone`, `reset`,
//! `pause`, `resume`, `info`. `jobs_status`/`jobs_cancel` are a supplemental
//! pair of actions (not in the distilled action list) that surface
//! `clone`'s job here, since this is the tool that started it.

use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vbox_mcp_shared::errors::McpResult;

use crate::vbox::types::{CloneMode, Firmware, NicType, StartMode, StopMode, VmIdentifier};

use super::envelope::{parse_params, require_action, ToolEnvelope};
use super::ServerContext;

/// The §4.G-declared action set, enumerated verbatim in the `InvalidArgument`
/// message when an unknown action is requested.
pub const DECLARED_ACTIONS: &[&str] =
    &["list", "create", "start", "stop", "delete", "clone", "reset", "pause", "resume", "info"];

/// Every action this tool actually dispatches, including the job-tracker
/// sub-actions layered on top of the declared set.
pub const ACTIONS: &[&str] = &[
    "list",
    "create",
    "start",
    "stop",
    "delete",
    "clone",
    "reset",
    "pause",
    "resume",
    "info",
    "jobs_status",
    "jobs_cancel",
];

pub async fn dispatch(ctx: ServerContext, arguments: Value) -> ToolEnvelope {
    let action = match require_action(&arguments, ACTIONS, DECLARED_ACTIONS) {
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
        "list" => {
            #[derive(Deserialize, Default)]
            struct Params {
                #[serde(default)]
                details: bool,
            }
            let params: Params = parse_params(arguments)?;
            let vms = ctx.orchestrator.list_vms(params.details, CancellationToken::new()).await?;
            Ok(ToolEnvelope::ok(vms))
        }
        "create" => {
            #[derive(Deserialize)]
            struct Params {
                name: String,
                os_type: String,
                memory_mb: u64,
                cpu_count: u32,
                disk_size_mb: u64,
                #[serde(default)]
                firmware: Option<Firmware>,
                #[serde(default)]
                network_type: Option<NicType>,
            }
            let params: Params = parse_params(arguments)?;
            let (record, warning) = ctx
                .orchestrator
                .create_vm(
                    &params.name,
                    &params.os_type,
                    params.memory_mb,
                    params.cpu_count,
                    params.disk_size_mb,
                    params.firmware.unwrap_or_default(),
                    params.network_type.unwrap_or(NicType::Nat),
                    CancellationToken::new(),
                )
                .await?;
            let mut data = serde_json::to_value(record)?;
            if let Some(warning) = warning {
                data["warning"] = Value::String(warning);
            }
            Ok(ToolEnvelope {
                success: true,
                data: Some(data),
                error: None,
            })
        }
        "start" => {
            #[derive(Deserialize)]
            struct Params {
                vm_name: String,
                #[serde(default)]
                mode: Option<StartMode>,
            }
            let params: Params = parse_params(arguments)?;
            let record = ctx
                .orchestrator
                .start_vm(
                    &VmIdentifier::parse(&params.vm_name),
                    params.mode.unwrap_or(StartMode::Headless),
                    CancellationToken::new(),
                )
                .await?;
            Ok(ToolEnvelope::ok(record))
        }
        "stop" => {
            #[derive(Deserialize)]
            struct Params {
                vm_name: String,
                mode: StopMode,
            }
            let params: Params = parse_params(arguments)?;
            let record = ctx
                .orchestrator
                .stop_vm(&VmIdentifier::parse(&params.vm_name), params.mode, CancellationToken::new())
                .await?;
            Ok(ToolEnvelope::ok(record))
        }
        "delete" => {
            #[derive(Deserialize)]
            struct Params {
                vm_name: String,
                #[serde(default)]
                delete_media: bool,
            }
            let params: Params = parse_params(arguments)?;
            ctx.orchestrator
                .delete_vm(&VmIdentifier::parse(&params.vm_name), params.delete_media, CancellationToken::new())
                .await?;
            Ok(ToolEnvelope::ok(serde_json::json!({ "deleted": true })))
        }
        "clone" => {
            #[derive(Deserialize)]
            struct Params {
                vm_name: String,
                new_name: String,
                #[serde(default)]
                mode: Option<CloneMode>,
                #[serde(default)]
                snapshot: Option<String>,
            }
            let params: Params = parse_params(arguments)?;
            let job_id = ctx.orchestrator.clone_vm(
                &ctx.jobs,
                VmIdentifier::parse(&params.vm_name),
                params.new_name,
                params.mode.unwrap_or(CloneMode::Full),
                params.snapshot,
            )?;
            Ok(ToolEnvelope::ok(serde_json::json!({ "job_id": job_id, "state": "running" })))
        }
        "reset" => {
            #[derive(Deserialize)]
            struct Params {
                vm_name: String,
            }
            let params: Params = parse_params(arguments)?;
            let record = ctx
                .orchestrator
                .reset_vm(&VmIdentifier::parse(&params.vm_name), CancellationToken::new())
                .await?;
            Ok(ToolEnvelope::ok(record))
        }
        "pause" => {
            #[derive(Deserialize)]
            struct Params {
                vm_name: String,
            }
            let params: Params = parse_params(arguments)?;
            let record = ctx
                .orchestrator
                .pause_vm(&VmIdentifier::parse(&params.vm_name), CancellationToken::new())
                .await?;
            Ok(ToolEnvelope::ok(record))
        }
        "resume" => {
            #[derive(Deserialize)]
            struct Params {
                vm_name: String,
            }
            let params: Params = parse_params(arguments)?;
            let record = ctx
                .orchestrator
                .resume_vm(&VmIdentifier::parse(&params.vm_name), CancellationToken::new())
                .await?;
            Ok(ToolEnvelope::ok(record))
        }
        "info" => {
            #[derive(Deserialize)]
            struct Params {
                vm_name: String,
            }
            let params: Params = parse_params(arguments)?;
            let record = ctx
                .orchestrator
                .get_vm_info(&VmIdentifier::parse(&params.vm_name), CancellationToken::new())
                .await?;
            Ok(ToolEnvelope::ok(record))
        }
        "jobs_status" => {
            #[derive(Deserialize)]
            struct Params {
                job_id: Uuid,
            }
            let params: Params = parse_params(arguments)?;
            let job = ctx.jobs.status(params.job_id).await?;
            Ok(ToolEnvelope::ok(job))
        }
        "jobs_cancel" => {
            #[derive(Deserialize)]
            struct Params {
                job_id: Uuid,
            }
            let params: Params = parse_params(arguments)?;
            let job = ctx.jobs.cancel(params.job_id).await?;
            Ok(ToolEnvelope::ok(job))
        }
        _ => unreachable!("validated by require_action"),
    }
}
