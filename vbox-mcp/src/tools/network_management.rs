//! `network_management` portmanteau tool — `spec.md` §4.G.
//!
//! Action set: `list_networks`, `create_network`, `remove_network`,
//! `list_adapters`, `configure_adapter`. `configure_adapter` folds NIC
//! reconfiguration and NAT port-forward add/remove into one call, since a
//! client adjusting a NIC commonly wants both in the same round trip
//! (`spec.md` §8 scenario 5).

use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use vbox_mcp_shared::errors::McpResult;

use crate::vbox::types::{NatProtocol, NatRule, NicType, VmIdentifier};

use super::envelope::{parse_params, require_action, ToolEnvelope};
use super::ServerContext;

pub const ACTIONS: &[&str] = &["list_networks", "create_network", "remove_network", "list_adapters", "configure_adapter"];

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

#[derive(Deserialize)]
struct PortForwardInput {
    name: String,
    protocol: NatProtocol,
    #[serde(default)]
    host_ip: Option<String>,
    host_port: u16,
    #[serde(default)]
    guest_ip: Option<String>,
    guest_port: u16,
}

impl From<PortForwardInput> for NatRule {
    fn from(input: PortForwardInput) -> Self {
        NatRule {
            name: input.name,
            protocol: input.protocol,
            host_ip: input.host_ip,
            host_port: input.host_port,
            guest_ip: input.guest_ip,
            guest_port: input.guest_port,
        }
    }
}

async fn run(ctx: &ServerContext, action: &str, arguments: &Value) -> McpResult<ToolEnvelope> {
    match action {
        "list_networks" => {
            let networks = ctx.orchestrator.list_hostonly_networks(CancellationToken::new()).await?;
            Ok(ToolEnvelope::ok(networks))
        }
        "create_network" => {
            let network = ctx.orchestrator.create_hostonly_network(CancellationToken::new()).await?;
            Ok(ToolEnvelope::ok(network))
        }
        "remove_network" => {
            #[derive(Deserialize)]
            struct Params {
                name: String,
            }
            let params: Params = parse_params(arguments)?;
            ctx.orchestrator.remove_hostonly_network(&params.name, CancellationToken::new()).await?;
            Ok(ToolEnvelope::ok(serde_json::json!({ "removed": params.name })))
        }
        "list_adapters" => {
            #[derive(Deserialize)]
            struct Params {
                vm_name: String,
            }
            let params: Params = parse_params(arguments)?;
            let record = ctx
                .orchestrator
                .get_vm_info(&VmIdentifier::parse(&params.vm_name), CancellationToken::new())
                .await?;
            Ok(ToolEnvelope::ok(record.network_adapters))
        }
        "configure_adapter" => {
            #[derive(Deserialize)]
            struct Params {
                vm_name: String,
                slot: u8,
                #[serde(default)]
                nic_type: Option<NicType>,
                #[serde(default)]
                backing: Option<String>,
                #[serde(default)]
                mac: Option<String>,
                #[serde(default)]
                cable_connected: Option<bool>,
                #[serde(default)]
                add_port_forward: Option<PortForwardInput>,
                #[serde(default)]
                remove_port_forward: Option<String>,
            }
            let params: Params = parse_params(arguments)?;
            let id = VmIdentifier::parse(&params.vm_name);

            if let Some(nic_type) = params.nic_type {
                ctx.orchestrator
                    .configure_nic(
                        &id,
                        params.slot,
                        nic_type,
                        params.backing.as_deref(),
                        params.mac.as_deref(),
                        params.cable_connected,
                        CancellationToken::new(),
                    )
                    .await?;
            }
            if let Some(rule) = params.add_port_forward {
                ctx.orchestrator.add_port_forward(&id, params.slot, rule.into(), CancellationToken::new()).await?;
            }
            if let Some(rule_name) = params.remove_port_forward {
                ctx.orchestrator.remove_port_forward(&id, params.slot, &rule_name, CancellationToken::new()).await?;
            }

            let record = ctx.orchestrator.get_vm_info(&id, CancellationToken::new()).await?;
            let adapter = record.network_adapters.into_iter().find(|adapter| adapter.slot == params.slot);
            Ok(ToolEnvelope::ok(adapter))
        }
        _ => unreachable!("validated by require_action"),
    }
}
