//! VirtualBox management server — exposes a tool-dispatch surface over a
//! line-delimited JSON transport (`spec.md` §1–§2).
//!
//! Module map mirrors the leaves-first component table in `spec.md` §2:
//! `config`/`logging` are the ambient stack; `process` is the Process
//! Runner; `vbox` holds the Output Parser, Error Classifier, lock
//! primitives, data model, and the Orchestrator built on top of them;
//! `jobs` is the Job Tracker; `hyperv` is the supplemental adjunct; `tools`
//! is the Tool Registry, Portmanteau Router, and Discovery Surface.

pub mod config;
pub mod hyperv;
pub mod jobs;
pub mod logging;
pub mod process;
pub mod tools;
pub mod vbox;

use std::sync::Arc;

use config::Config;
use hyperv::HyperVOrchestrator;
use jobs::JobTracker;
use process::ProcessRunner;
use tools::{ServerContext, ToolRegistry};
use vbox::VboxOrchestrator;

/// Everything the stdio harness needs to serve requests: the registry and
/// the context its handlers close over. Built once at startup and held for
/// the process lifetime (`spec.md` §5, "Shared mutable state").
pub struct Server {
    pub registry: ToolRegistry,
    pub context: ServerContext,
}

impl Server {
    /// Wire up the orchestrator, job tracker, and tool registry from
    /// configuration and a concrete [`ProcessRunner`]. Runs the Hyper-V
    /// capability probe exactly once, at construction time.
    pub fn new(config: &Config, runner: Arc<dyn ProcessRunner>) -> Self {
        let orchestrator = VboxOrchestrator::from_config(config, runner.clone());
        let jobs = JobTracker::new();
        jobs.spawn_retention_sweep();

        let hyperv_available = hyperv::is_available();
        let hyperv_orchestrator = hyperv_available.then(|| HyperVOrchestrator::new(runner));

        let registry = ToolRegistry::build(config.tool_mode, hyperv_available);
        let context = ServerContext {
            orchestrator,
            jobs,
            hyperv: hyperv_orchestrator,
        };

        Self { registry, context }
    }

    /// Dispatch one tool call by name, matching the stdio harness's
    /// `{"tool": "<name>", "arguments": {...}}` request shape (`spec.md`
    /// §6). `"$/list_tools"` is a reserved pseudo-tool name for discovery.
    pub async fn handle(&self, tool: &str, arguments: serde_json::Value) -> tools::ToolEnvelope {
        if tool == "$/list_tools" {
            return tools::ToolEnvelope::ok(tools::discovery::list_tools(&self.registry));
        }
        self.registry.dispatch(self.context.clone(), tool, arguments).await
    }
}
