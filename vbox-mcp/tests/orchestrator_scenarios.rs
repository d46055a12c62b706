//! End-to-end orchestrator scenarios driven through a scripted
//! `VBoxManage`, covering the concrete scenarios in `spec.md` §8.

use std::path::PathBuf;
use std::sync::Arc;

use uuid::Uuid;
use vbox_mcp::jobs::{JobState, JobTracker};
use vbox_mcp::process::ProcessRunner;
use vbox_mcp::vbox::types::{CloneMode, NatProtocol, NatRule, NicType, StartMode, StopMode, VmIdentifier, VmState};
use vbox_mcp::vbox::VboxOrchestrator;
use vbox_mcp_shared::errors::ErrorKind;
use vbox_mcp_testutil::{fixtures, FakeProcessRunner, ScriptedCall};

fn orchestrator(runner: FakeProcessRunner) -> VboxOrchestrator {
    let runner: Arc<dyn ProcessRunner> = Arc::new(runner);
    VboxOrchestrator::new(PathBuf::from("VBoxManage"), runner)
}

fn cancel() -> tokio_util::sync::CancellationToken {
    tokio_util::sync::CancellationToken::new()
}

// ============================================================================
// Scenario 1: create -> start -> snapshot -> stop -> restore
// ============================================================================

/// A `showvminfo --machinereadable` dump with one named, current snapshot,
/// state-parameterized since the cycle below needs both a running and a
/// powered-off view of the same snapshot.
fn showvminfo_with_named_snapshot(id: Uuid, name: &str, state: &str, snapshot_id: Uuid, snapshot_name: &str) -> String {
    format!(
        "UUID=\"{id}\"\n\
         name=\"{name}\"\n\
         VMState=\"{state}\"\n\
         ostype=\"Ubuntu_64\"\n\
         memory=2048\n\
         cpus=2\n\
         firmware=\"BIOS\"\n\
         nic1=\"nat\"\n\
         cableconnected1=\"on\"\n\
         SnapshotName-0=\"{snapshot_name}\"\n\
         SnapshotUUID-0=\"{snapshot_id}\"\n\
         CurrentSnapshotUUID=\"{snapshot_id}\"\n"
    )
}

#[tokio::test]
async fn create_start_snapshot_stop_restore_cycle() {
    let id = Uuid::new_v4();
    let name = "spec-vm-1";
    let snapshot_id = Uuid::new_v4();

    let runner = FakeProcessRunner::new().script([
        // create_vm: createvm --register
        ScriptedCall::ok(""),
        // create_vm: resolve_vm_id(Name) -> list vms
        ScriptedCall::ok(fixtures::list_vms(&[(name, id)])),
        // create_vm: showvminfo to discover the CfgFile folder
        ScriptedCall::ok(fixtures::showvminfo_basic(id, name)),
        // create_vm: modifyvm memory/cpus/firmware/nic1
        ScriptedCall::ok(""),
        // create_vm: createmedium disk
        ScriptedCall::ok(""),
        // create_vm: storagectl --add
        ScriptedCall::ok(""),
        // create_vm: storageattach
        ScriptedCall::ok(""),
        // create_vm: get_vm_info after create
        ScriptedCall::ok(fixtures::showvminfo_basic(id, name)),
        // start_vm(Uuid): get_vm_info (pre-guard), PoweredOff -> allowed
        ScriptedCall::ok(fixtures::showvminfo_basic(id, name)),
        // start_vm: startvm --type headless
        ScriptedCall::ok(""),
        // start_vm: get_vm_info after start
        ScriptedCall::ok(fixtures::showvminfo_running_with_snapshot(id, name, Uuid::new_v4())),
        // create_snapshot(Uuid): snapshot take
        ScriptedCall::ok(""),
        // create_snapshot: list_snapshots afterward, names the new snapshot "s1"
        ScriptedCall::ok(showvminfo_with_named_snapshot(id, name, "running", snapshot_id, "s1")),
        // stop_vm(Uuid, poweroff): get_vm_info (pre-guard), Running -> allowed
        ScriptedCall::ok(showvminfo_with_named_snapshot(id, name, "running", snapshot_id, "s1")),
        // stop_vm: controlvm poweroff
        ScriptedCall::ok(""),
        // stop_vm: get_vm_info after stop
        ScriptedCall::ok(showvminfo_with_named_snapshot(id, name, "poweroff", snapshot_id, "s1")),
        // restore_snapshot(Uuid): get_vm_info (pre-guard), PoweredOff -> allowed
        ScriptedCall::ok(showvminfo_with_named_snapshot(id, name, "poweroff", snapshot_id, "s1")),
        // restore_snapshot: snapshot restore
        ScriptedCall::ok(""),
    ]);
    let orch = orchestrator(runner);

    let (record, warning) = orch
        .create_vm(name, "Ubuntu_64", 2048, 2, 10_240, Default::default(), NicType::Nat, cancel())
        .await
        .unwrap();
    assert_eq!(record.name, name);
    assert_eq!(record.memory_mb, 2048);
    assert_eq!(record.cpu_count, 2);
    assert!(warning.is_none());

    let vm_id = VmIdentifier::Uuid(record.id);
    let started = orch.start_vm(&vm_id, StartMode::Headless, cancel()).await.unwrap();
    assert_eq!(started.state, VmState::Running);

    let snapshot = orch.create_snapshot(&vm_id, "s1", None, false, cancel()).await.unwrap();
    assert_eq!(snapshot.name, "s1");

    let stopped = orch.stop_vm(&vm_id, StopMode::Poweroff, cancel()).await.unwrap();
    assert_eq!(stopped.state, VmState::PoweredOff);

    orch.restore_snapshot(&vm_id, "s1", cancel()).await.unwrap();
}

// ============================================================================
// Scenario 3: state-machine guard rejects restore on a running VM
// ============================================================================

#[tokio::test]
async fn restore_snapshot_on_running_vm_is_invalid_state_without_invoking_vboxmanage() {
    let id = Uuid::new_v4();
    let name = "spec-vm-2";

    let runner = FakeProcessRunner::new().script([
        // resolve_vm_id
        ScriptedCall::ok(fixtures::list_vms(&[(name, id)])),
        // get_vm_info (pre-guard) reports Running
        ScriptedCall::ok(fixtures::showvminfo_running_with_snapshot(id, name, Uuid::new_v4())),
    ]);
    let runner = Arc::new(runner);
    let orch = VboxOrchestrator::new(PathBuf::from("VBoxManage"), runner.clone());

    let err = orch
        .restore_snapshot(&VmIdentifier::parse(name), "s0", cancel())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidState);

    // No `snapshot ... restore` invocation should have been recorded — only
    // the resolve + guard-check reads.
    assert_eq!(runner.call_count(), 2);
}

// ============================================================================
// Scenario: stop(poweroff) on an already-PoweredOff VM is not idempotent
// ============================================================================

#[tokio::test]
async fn stop_poweroff_on_powered_off_vm_is_invalid_state() {
    let id = Uuid::new_v4();
    let name = "spec-vm-idempotence";

    let runner = FakeProcessRunner::new().script([
        ScriptedCall::ok(fixtures::list_vms(&[(name, id)])),
        ScriptedCall::ok(fixtures::showvminfo_basic(id, name)),
    ]);
    let orch = orchestrator(runner);

    let err = orch
        .stop_vm(&VmIdentifier::parse(name), StopMode::Poweroff, cancel())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidState);
}

// ============================================================================
// Error classification: unknown machine name surfaces NotFound
// ============================================================================

#[tokio::test]
async fn unknown_vm_name_resolves_to_not_found() {
    let runner = FakeProcessRunner::new().script([ScriptedCall::ok(fixtures::list_vms(&[]))]);
    let orch = orchestrator(runner);

    let err = orch.get_vm_info(&VmIdentifier::parse("ghost"), cancel()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn ambiguous_name_is_rejected_before_any_writer_runs() {
    let id_a = Uuid::new_v4();
    let id_b = Uuid::new_v4();
    let runner = FakeProcessRunner::new().script([ScriptedCall::ok(fixtures::list_vms(&[("dup", id_a), ("dup", id_b)]))]);
    let orch = orchestrator(runner);

    let err = orch.get_vm_info(&VmIdentifier::parse("dup"), cancel()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Ambiguous);
}

// ============================================================================
// Boundary behaviors (spec.md §8)
// ============================================================================

#[tokio::test]
async fn memory_below_minimum_is_rejected_pre_dispatch() {
    let runner = FakeProcessRunner::new();
    let orch = orchestrator(runner);
    let err = orch
        .create_vm("x", "Ubuntu_64", 1, 1, 1024, Default::default(), NicType::Nat, cancel())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn nic_slot_out_of_range_is_rejected_pre_dispatch() {
    let runner = FakeProcessRunner::new().script([ScriptedCall::ok(fixtures::list_vms(&[(
        "x",
        Uuid::new_v4(),
    )]))]);
    let orch = orchestrator(runner);
    let err = orch
        .configure_nic(&VmIdentifier::parse("x"), 4, NicType::Nat, None, None, None, cancel())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn snapshot_name_with_path_separator_is_rejected_pre_dispatch() {
    let runner = FakeProcessRunner::new();
    let orch = orchestrator(runner);
    let err = orch
        .create_snapshot(&VmIdentifier::parse("x"), "a/b", None, false, cancel())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn oversubscribed_cpu_count_is_accepted_with_a_warning() {
    let id = Uuid::new_v4();
    let name = "spec-vm-oversub";
    let host_cpus = num_cpus::get() as u32;

    let runner = FakeProcessRunner::new().script([
        ScriptedCall::ok(""),
        ScriptedCall::ok(fixtures::list_vms(&[(name, id)])),
        ScriptedCall::ok(fixtures::showvminfo_basic(id, name)),
        ScriptedCall::ok(""),
        ScriptedCall::ok(""),
        ScriptedCall::ok(""),
        ScriptedCall::ok(""),
        ScriptedCall::ok(fixtures::showvminfo_basic(id, name)),
    ]);
    let orch = orchestrator(runner);

    let (_record, warning) = orch
        .create_vm(name, "Ubuntu_64", 2048, host_cpus + 4, 10_240, Default::default(), NicType::Nat, cancel())
        .await
        .unwrap();
    assert!(warning.is_some());
}

// ============================================================================
// Linked clone pre-validation (Open Questions, spec.md §9)
// ============================================================================

#[tokio::test]
async fn linked_clone_without_snapshot_is_rejected_before_any_vboxmanage_call() {
    let runner = FakeProcessRunner::new();
    let runner = Arc::new(runner);
    let orch = VboxOrchestrator::new(PathBuf::from("VBoxManage"), runner.clone());
    let jobs = JobTracker::new();

    let err = orch
        .clone_vm(&jobs, VmIdentifier::parse("x"), "clone".to_string(), CloneMode::Linked, None)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);
    assert_eq!(runner.call_count(), 0);
}

// ============================================================================
// Job tracker: clone runs as a background job and reports progress
// ============================================================================

#[tokio::test]
async fn full_clone_runs_as_a_job_and_reaches_succeeded() {
    let id = Uuid::new_v4();
    let name = "spec-vm-clone-src";
    let clone_name = "spec-vm-clone-dst";

    let runner = FakeProcessRunner::new().script([
        ScriptedCall::ok(fixtures::list_vms(&[(name, id)])),
        ScriptedCall::ok(fixtures::progress_complete()),
        ScriptedCall::ok(fixtures::list_vms(&[(name, id), (clone_name, Uuid::new_v4())])),
        ScriptedCall::ok(fixtures::showvminfo_basic(id, clone_name)),
    ]);
    let orch = orchestrator(runner);
    let jobs = JobTracker::new();

    let job_id = orch
        .clone_vm(&jobs, VmIdentifier::parse(name), clone_name.to_string(), CloneMode::Full, None)
        .unwrap();

    for _ in 0..50 {
        let job = jobs.status(job_id).await.unwrap();
        if job.state.is_terminal() {
            assert_eq!(job.state, JobState::Succeeded);
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("clone job did not reach a terminal state in time");
}

// ============================================================================
// NAT rule uniqueness is enforced pre-dispatch, never round-tripping to
// VBoxManage to discover a duplicate rule name on the same adapter.
// ============================================================================

#[tokio::test]
async fn duplicate_nat_rule_name_on_the_same_adapter_is_rejected_without_invoking_vboxmanage() {
    let id = Uuid::new_v4();
    let name = "spec-vm-nat";

    // `showvminfo` reports an existing `ssh` rule on adapter slot 0
    // (`natpf1="ssh,tcp,,2222,,22"`); no second invocation should follow.
    let runner = FakeProcessRunner::new().script([ScriptedCall::ok(fixtures::showvminfo_running_with_snapshot(
        id,
        name,
        Uuid::new_v4(),
    ))]);
    let runner = Arc::new(runner);
    let orch = VboxOrchestrator::new(PathBuf::from("VBoxManage"), runner.clone());

    let rule = NatRule {
        name: "ssh".to_string(),
        protocol: NatProtocol::Tcp,
        host_ip: None,
        host_port: 2222,
        guest_ip: None,
        guest_port: 22,
    };
    let err = orch.add_port_forward(&VmIdentifier::Uuid(id), 0, rule, cancel()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::AlreadyExists);
    assert_eq!(runner.call_count(), 1, "no modifyvm call should follow the pre-dispatch rejection");
}
