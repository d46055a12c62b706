//! `hyperv_management` — structural stub (`SPEC_FULL.md` "Supplemental
//! feature: Hyper-V adjunct"). Action set mirrors `vm_management`'s shape:
//! `list`, `info`. Only registered when [`crate::hyperv::is_available`]
//! returned true at registry construction time.

use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use vbox_mcp_shared::errors::{McpError, McpResult};

use super::envelope::{parse_params, require_action, ToolEnvelope};
use super::ServerContext;

pub const ACTIONS: &[&str] = &["list", "info"];

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
    let hyperv = ctx
        .hyperv
        .as_ref()
        .ok_or_else(|| McpError::internal("Hyper-V adjunct is not available on this host"))?;
    match action {
        "list" => Ok(ToolEnvelope::ok(hyperv.list_vms(CancellationToken::new()).await?)),
        "info" => {
            #[derive(Deserialize)]
            struct Params {
                vm_name: String,
            }
            let params: Params = parse_params(arguments)?;
            Ok(ToolEnvelope::ok(hyperv.get_vm_info(&params.vm_name, CancellationToken::new()).await?))
        }
        _ => unreachable!("validated by require_action"),
    }
}
