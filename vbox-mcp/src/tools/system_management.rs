//! `system_management` portmanteau tool — `spec.md` §4.G.
//!
//! Action set: `host_info`, `vbox_version`, `ostypes`, `metrics`,
//! `screenshot`.

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use vbox_mcp_shared::errors::McpResult;

use crate::vbox::types::VmIdentifier;

use super::envelope::{parse_params, require_action, ToolEnvelope};
use super::ServerContext;

pub const ACTIONS: &[&str] = &["host_info", "vbox_version", "ostypes", "metrics", "screenshot"];

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
        "host_info" => {
            let info = ctx.orchestrator.host_info(CancellationToken::new()).await?;
            Ok(ToolEnvelope::ok(info))
        }
        "vbox_version" => {
            let version = ctx.orchestrator.vbox_version(CancellationToken::new()).await?;
            Ok(ToolEnvelope::ok(serde_json::json!({ "version": version })))
        }
        "ostypes" => {
            let types = ctx.orchestrator.list_os_types(CancellationToken::new()).await?;
            Ok(ToolEnvelope::ok(types))
        }
        "metrics" => {
            #[derive(Deserialize, Default)]
            struct Params {
                #[serde(default)]
                vm_name: Option<String>,
            }
            let params: Params = parse_params(arguments)?;
            let id = params.vm_name.as_deref().map(VmIdentifier::parse);
            let metrics = ctx.orchestrator.get_metrics(id.as_ref(), CancellationToken::new()).await?;
            Ok(ToolEnvelope::ok(metrics))
        }
        "screenshot" => {
            #[derive(Deserialize)]
            struct Params {
                vm_name: String,
                path: PathBuf,
            }
            let params: Params = parse_params(arguments)?;
            ctx.orchestrator
                .screenshot(&VmIdentifier::parse(&params.vm_name), &params.path, CancellationToken::new())
                .await?;
            Ok(ToolEnvelope::ok(serde_json::json!({ "path": params.path })))
        }
        _ => unreachable!("validated by require_action"),
    }
}
