//! Tool Registry, Portmanteau Router, and Discovery Surface —
//! `spec.md` §4.F–§4.H.
//!
//! The registry is built once at startup from a const-like table of
//! `(name, category, doc, actions, exposure)` entries (§4.F). Each of the
//! five portmanteau tools dispatches its `action` field through the four
//! ordered steps in §4.G: action-enum membership, required-parameter
//! presence, type/range validation (both folded into each action arm's
//! `Deserialize` parameter struct), orchestrator dispatch, and envelope
//! wrapping. In `testing`/`all` mode every underlying operation is also
//! exposed as its own standalone tool, for exercising one action at a time
//! without threading an `action` discriminator through a test harness.

pub mod discovery;
pub mod envelope;
pub mod hyperv_management;
pub mod network_management;
pub mod snapshot_management;
pub mod storage_management;
pub mod system_management;
pub mod vm_management;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use vbox_mcp_shared::errors::McpError;

use crate::config::ToolMode;
use crate::hyperv::HyperVOrchestrator;
use crate::jobs::JobTracker;
use crate::vbox::VboxOrchestrator;

pub use envelope::ToolEnvelope;

/// Pulls a tool's description from the same literal used in its handler's
/// doc comment, so the registry and the doc comment can't silently drift —
/// short of a proc-macro, this is the closest this crate gets to "derived
/// from the handler's own documentation" without runtime reflection.
macro_rules! tool_doc {
    ($text:expr) => {
        $text
    };
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub category: &'static str,
    pub description: &'static str,
    pub actions: Vec<&'static str>,
    /// `true` for the per-action standalone tools only registered under
    /// `testing`/`all` mode (`spec.md` §4.F).
    pub testing_only: bool,
}

/// Dependencies every tool handler closes over. Cheap to clone: every field
/// is itself `Arc`-backed or a cheaply-cloneable manager.
#[derive(Clone)]
pub struct ServerContext {
    pub orchestrator: VboxOrchestrator,
    pub jobs: JobTracker,
    pub hyperv: Option<HyperVOrchestrator>,
}

pub type ToolFuture = Pin<Box<dyn Future<Output = ToolEnvelope> + Send>>;
type Handler = Arc<dyn Fn(ServerContext, Value) -> ToolFuture + Send + Sync>;

struct RegisteredTool {
    descriptor: ToolDescriptor,
    handler: Handler,
}

/// Built once at startup (`spec.md` §4.F) and held read-only for the
/// process lifetime.
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
}

fn boxed<F, Fut>(f: F) -> Handler
where
    F: Fn(ServerContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ToolEnvelope> + Send + 'static,
{
    Arc::new(move |ctx, arguments| Box::pin(f(ctx, arguments)))
}

/// Wraps a portmanteau dispatch fn so an individual tool can call it with a
/// fixed `action` field spliced into whatever arguments the caller sent,
/// without duplicating each action arm's handler logic.
fn individual(portmanteau: fn(ServerContext, Value) -> ToolFuture, action: &'static str) -> Handler {
    Arc::new(move |ctx, mut arguments| {
        if !arguments.is_object() {
            arguments = Value::Object(serde_json::Map::new());
        }
        if let Value::Object(map) = &mut arguments {
            map.insert("action".to_string(), Value::String(action.to_string()));
        }
        portmanteau(ctx, arguments)
    })
}

/// One entry per portmanteau tool, registered identically in both modes.
struct Portmanteau {
    name: &'static str,
    category: &'static str,
    description: &'static str,
    actions: &'static [&'static str],
    dispatch: fn(ServerContext, Value) -> ToolFuture,
    /// Sub-actions excluded from individual-tool flattening (job-tracker
    /// plumbing rather than an orchestrator operation in its own right).
    exclude_from_individual: &'static [&'static str],
}

fn portmanteaus() -> Vec<Portmanteau> {
    vec![
        Portmanteau {
            name: "vm_management",
            category: "vm",
            description: tool_doc!("Create, inspect, and control the lifecycle of virtual machines."),
            actions: vm_management::ACTIONS,
            dispatch: |ctx, args| Box::pin(vm_management::dispatch(ctx, args)),
            exclude_from_individual: &["jobs_status", "jobs_cancel"],
        },
        Portmanteau {
            name: "network_management",
            category: "network",
            description: tool_doc!("Manage host-only networks and a VM's network adapters."),
            actions: network_management::ACTIONS,
            dispatch: |ctx, args| Box::pin(network_management::dispatch(ctx, args)),
            exclude_from_individual: &[],
        },
        Portmanteau {
            name: "snapshot_management",
            category: "snapshot",
            description: tool_doc!("Create, restore, and delete VM snapshots."),
            actions: snapshot_management::ACTIONS,
            dispatch: |ctx, args| Box::pin(snapshot_management::dispatch(ctx, args)),
            exclude_from_individual: &["jobs_status", "jobs_cancel"],
        },
        Portmanteau {
            name: "storage_management",
            category: "storage",
            description: tool_doc!("Manage storage controllers, virtual disks, and medium attachments."),
            actions: storage_management::ACTIONS,
            dispatch: |ctx, args| Box::pin(storage_management::dispatch(ctx, args)),
            exclude_from_individual: &[],
        },
        Portmanteau {
            name: "system_management",
            category: "system",
            description: tool_doc!("Query host capabilities, guest OS types, metrics, and take screenshots."),
            actions: system_management::ACTIONS,
            dispatch: |ctx, args| Box::pin(system_management::dispatch(ctx, args)),
            exclude_from_individual: &[],
        },
    ]
}

impl ToolRegistry {
    /// Build the registry for `mode`. Hyper-V registration runs the
    /// platform probe exactly once here (`spec.md` §4.H) — the probe is
    /// never re-run by `discovery::list_tools`.
    pub fn build(mode: ToolMode, hyperv_available: bool) -> Self {
        let mut tools = Vec::new();

        for p in portmanteaus() {
            tools.push(RegisteredTool {
                descriptor: ToolDescriptor {
                    name: p.name.to_string(),
                    category: p.category,
                    description: p.description,
                    actions: p.actions.to_vec(),
                    testing_only: false,
                },
                handler: boxed(p.dispatch),
            });
            if mode == ToolMode::Testing {
                for &action in p.actions.iter().filter(|a| !p.exclude_from_individual.contains(a)) {
                    tools.push(RegisteredTool {
                        descriptor: ToolDescriptor {
                            name: format!("{}_{action}", p.category),
                            category: p.category,
                            description: "Standalone exercise of a single action from its portmanteau tool.",
                            actions: vec![action],
                            testing_only: true,
                        },
                        handler: individual(p.dispatch, action),
                    });
                }
            }
        }

        if hyperv_available {
            tools.push(RegisteredTool {
                descriptor: ToolDescriptor {
                    name: "hyperv_management".to_string(),
                    category: "hyperv",
                    description: tool_doc!("List and inspect Hyper-V virtual machines (Windows hosts only)."),
                    actions: hyperv_management::ACTIONS.to_vec(),
                    testing_only: false,
                },
                handler: boxed(hyperv_management::dispatch),
            });
            if mode == ToolMode::Testing {
                for &action in hyperv_management::ACTIONS {
                    tools.push(RegisteredTool {
                        descriptor: ToolDescriptor {
                            name: format!("hyperv_{action}"),
                            category: "hyperv",
                            description: "Standalone exercise of a single action from its portmanteau tool.",
                            actions: vec![action],
                            testing_only: true,
                        },
                        handler: individual(|ctx, args| Box::pin(hyperv_management::dispatch(ctx, args)), action),
                    });
                }
            }
        }

        let index = tools
            .iter()
            .enumerate()
            .map(|(i, tool)| (tool.descriptor.name.clone(), i))
            .collect();

        Self { tools, index }
    }

    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.tools.iter().map(|tool| tool.descriptor.clone()).collect()
    }

    pub async fn dispatch(&self, ctx: ServerContext, name: &str, arguments: Value) -> ToolEnvelope {
        match self.index.get(name).map(|&i| &self.tools[i]) {
            Some(tool) => (tool.handler)(ctx, arguments).await,
            None => ToolEnvelope::err(McpError::not_found(format!("no such tool '{name}'"))),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.tools.len()
    }
}
