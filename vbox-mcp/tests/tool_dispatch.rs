//! End-to-end coverage through the actual tool-call surface: `ToolRegistry`
//! dispatch and `ToolEnvelope` wire shape, rather than the orchestrator
//! directly. Complements `orchestrator_scenarios.rs`, which bypasses the
//! router entirely.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;
use vbox_mcp::config::ToolMode;
use vbox_mcp::jobs::JobTracker;
use vbox_mcp::process::ProcessRunner;
use vbox_mcp::tools::{ServerContext, ToolRegistry};
use vbox_mcp::vbox::VboxOrchestrator;
use vbox_mcp_shared::errors::ErrorKind;
use vbox_mcp_testutil::{fixtures, FakeProcessRunner, ScriptedCall};

fn context(runner: FakeProcessRunner) -> ServerContext {
    let runner: Arc<dyn ProcessRunner> = Arc::new(runner);
    ServerContext {
        orchestrator: VboxOrchestrator::new(PathBuf::from("VBoxManage"), runner),
        jobs: JobTracker::new(),
        hyperv: None,
    }
}

#[tokio::test]
async fn vm_management_list_round_trips_through_the_envelope() {
    let id = Uuid::new_v4();
    let runner = FakeProcessRunner::new().script([ScriptedCall::ok(fixtures::list_vms(&[("web-01", id)]))]);
    let registry = ToolRegistry::build(ToolMode::Production, false);
    let ctx = context(runner);

    let envelope = registry
        .dispatch(ctx, "vm_management", json!({"action": "list", "details": false}))
        .await;

    assert!(envelope.success);
    let data = envelope.data.expect("list returns data");
    assert!(data.is_array());
    assert_eq!(data[0]["name"], "web-01");
}

#[tokio::test]
async fn unknown_action_enumerates_the_declared_set_for_every_portmanteau() {
    let registry = ToolRegistry::build(ToolMode::Production, false);

    for (tool, declared) in [
        ("vm_management", vbox_mcp::tools::vm_management::DECLARED_ACTIONS),
        ("network_management", vbox_mcp::tools::network_management::ACTIONS),
        ("snapshot_management", vbox_mcp::tools::snapshot_management::DECLARED_ACTIONS),
        ("storage_management", vbox_mcp::tools::storage_management::ACTIONS),
        ("system_management", vbox_mcp::tools::system_management::ACTIONS),
    ] {
        let ctx = context(FakeProcessRunner::new());
        let envelope = registry.dispatch(ctx, tool, json!({"action": "not_a_real_action"})).await;

        assert!(!envelope.success, "{tool} should reject an unknown action");
        let error = envelope.error.expect("error payload present");
        assert_eq!(error.kind, ErrorKind::InvalidArgument);
        for action in declared {
            assert!(
                error.message.contains(action),
                "{tool}'s error message `{}` should enumerate `{action}`",
                error.message
            );
        }
        assert!(
            !error.message.contains("jobs_status"),
            "{tool}'s error message `{}` should not enumerate the job-tracker sub-actions",
            error.message
        );
    }
}

#[tokio::test]
async fn missing_action_field_is_invalid_argument_not_a_panic() {
    let registry = ToolRegistry::build(ToolMode::Production, false);
    let ctx = context(FakeProcessRunner::new());

    let envelope = registry.dispatch(ctx, "vm_management", json!({})).await;
    assert!(!envelope.success);
    assert_eq!(envelope.error.unwrap().kind, ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn dispatch_to_an_unregistered_tool_name_is_not_found() {
    let registry = ToolRegistry::build(ToolMode::Production, false);
    let ctx = context(FakeProcessRunner::new());

    let envelope = registry.dispatch(ctx, "does_not_exist", json!({})).await;
    assert!(!envelope.success);
    assert_eq!(envelope.error.unwrap().kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn discovery_surface_lists_every_registered_tool_without_touching_vboxmanage() {
    let registry = ToolRegistry::build(ToolMode::Production, false);
    let descriptors = vbox_mcp::tools::discovery::list_tools(&registry);

    assert_eq!(descriptors.len(), 5);
    let names: Vec<&str> = descriptors.iter().map(|d| d.name.as_str()).collect();
    assert!(names.contains(&"vm_management"));
    assert!(names.contains(&"system_management"));
}

#[tokio::test]
async fn testing_mode_exposes_a_standalone_tool_per_flattened_action() {
    let runner = FakeProcessRunner::new().script([ScriptedCall::ok(fixtures::version())]);
    let registry = ToolRegistry::build(ToolMode::Testing, false);
    let ctx = context(runner);

    // `system_vbox_version` is the flattened standalone form of
    // `system_management`'s `vbox_version` action.
    let envelope = registry.dispatch(ctx, "system_vbox_version", json!({})).await;
    assert!(envelope.success);
}

#[tokio::test]
async fn jobs_status_and_cancel_are_not_flattened_into_standalone_tools() {
    let registry = ToolRegistry::build(ToolMode::Testing, false);
    let descriptors = vbox_mcp::tools::discovery::list_tools(&registry);
    let names: Vec<&str> = descriptors.iter().map(|d| d.name.as_str()).collect();

    assert!(!names.contains(&"vm_jobs_status"));
    assert!(!names.contains(&"vm_jobs_cancel"));
    assert!(!names.contains(&"snapshot_jobs_status"));
    assert!(!names.contains(&"snapshot_jobs_cancel"));
}
