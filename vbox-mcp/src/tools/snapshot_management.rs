//! `snapshot_management` portmanteau tool — `spec.md` §4.G.
//!
//! Action set: `list`, `create`, `restore`, `delete`. `jobs_status`/
//! `jobs_cancel` surface `delete`'s job, mirroring `vm_management`'s
//! handling of `clone`'s job.

use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vbox_mcp_shared::errors::McpResult;

use crate::vbox::types::VmIdentifier;

use super::envelope::{parse_params, require_action, ToolEnvelope};
use super::ServerContext;

/// The §4.G-declared action set, enumerated verbatim in the `InvalidArgument`
/// message when an unknown action is requested.
pub const DECLARED_ACTIONS: &[&str] = &["list", "create", "restore", "delete"];

/// Every action this tool actually dispatches, including the job-tracker
/// sub-actions layered on top of the declared set.
pub const ACTIONS: &[&str] = &["list", "create", "restore", "delete", "jobs_status", "jobs_cancel"];

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
            #[derive(Deserialize)]
            struct Params {
                vm_name: String,
            }
            let params: Params = parse_params(arguments)?;
            let tree = ctx
                .orchestrator
                .list_snapshots(&VmIdentifier::parse(&params.vm_name), CancellationToken::new())
                .await?;
            Ok(ToolEnvelope::ok(tree))
        }
        "create" => {
            #[derive(Deserialize)]
            struct Params {
                vm_name: String,
                name: String,
                #[serde(default)]
                description: Option<String>,
                #[serde(default)]
                live: bool,
            }
            let params: Params = parse_params(arguments)?;
            let node = ctx
                .orchestrator
                .create_snapshot(
                    &VmIdentifier::parse(&params.vm_name),
                    &params.name,
                    params.description.as_deref(),
                    params.live,
                    CancellationToken::new(),
                )
                .await?;
            Ok(ToolEnvelope::ok(node))
        }
        "restore" => {
            #[derive(Deserialize)]
            struct Params {
                vm_name: String,
                snapshot: String,
            }
            let params: Params = parse_params(arguments)?;
            ctx.orchestrator
                .restore_snapshot(&VmIdentifier::parse(&params.vm_name), &params.snapshot, CancellationToken::new())
                .await?;
            Ok(ToolEnvelope::ok(serde_json::json!({ "restored": params.snapshot })))
        }
        "delete" => {
            #[derive(Deserialize)]
            struct Params {
                vm_name: String,
                snapshot: String,
            }
            let params: Params = parse_params(arguments)?;
            let job_id = ctx
                .orchestrator
                .delete_snapshot(&ctx.jobs, VmIdentifier::parse(&params.vm_name), params.snapshot);
            Ok(ToolEnvelope::ok(serde_json::json!({ "job_id": job_id, "state": "running" })))
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
