//! A scripted [`ProcessRunner`] and a handful of golden `VBoxManage`
//! fixtures, so the orchestrator can be exercised without a real
//! VirtualBox install.
//!
//! Tests queue one [`ScriptedCall`] per expected invocation with
//! [`FakeProcessRunner::script`], in the exact order the orchestrator is
//! expected to issue them, then assert on [`FakeProcessRunner::recorded`]
//! to check the argument vectors it actually built.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vbox_mcp::process::{ProcessOutput, ProcessRunner};
use vbox_mcp_shared::errors::{ErrorKind, McpError, McpResult};

/// One scripted response to the next `run()` call.
#[derive(Debug, Clone)]
pub struct ScriptedCall {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ScriptedCall {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self { exit_code: 0, stdout: stdout.into(), stderr: String::new() }
    }

    pub fn failure(stderr: impl Into<String>) -> Self {
        Self { exit_code: 1, stdout: String::new(), stderr: stderr.into() }
    }
}

/// An invocation as the orchestrator actually issued it.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub binary: String,
    pub args: Vec<String>,
}

/// A [`ProcessRunner`] that replays a queue of [`ScriptedCall`]s in FIFO
/// order instead of spawning `VBoxManage`. Panics if more calls are made
/// than were scripted, since an unexpected extra invocation almost always
/// means the orchestrator changed behavior under test.
#[derive(Default)]
pub struct FakeProcessRunner {
    queue: Mutex<VecDeque<ScriptedCall>>,
    recorded: Mutex<Vec<RecordedCall>>,
}

impl FakeProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue responses in call order.
    pub fn script(self, calls: impl IntoIterator<Item = ScriptedCall>) -> Self {
        self.queue.lock().unwrap().extend(calls);
        self
    }

    pub fn recorded(&self) -> Vec<RecordedCall> {
        self.recorded.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.recorded.lock().unwrap().len()
    }
}

#[async_trait]
impl ProcessRunner for FakeProcessRunner {
    async fn run(
        &self,
        binary: &Path,
        args: &[String],
        _stdin: Option<&[u8]>,
        _timeout: Duration,
        cancel: CancellationToken,
    ) -> McpResult<ProcessOutput> {
        if cancel.is_cancelled() {
            return Err(McpError::new(ErrorKind::Cancelled, "VBoxManage invocation was cancelled"));
        }

        self.recorded.lock().unwrap().push(RecordedCall {
            binary: binary.display().to_string(),
            args: args.to_vec(),
        });

        let scripted = self.queue.lock().unwrap().pop_front().unwrap_or_else(|| {
            panic!("FakeProcessRunner: no scripted response queued for `{} {}`", binary.display(), args.join(" "))
        });

        Ok(ProcessOutput {
            exit_code: scripted.exit_code,
            stdout: scripted.stdout.into_bytes(),
            stderr: scripted.stderr.into_bytes(),
            duration: Duration::from_millis(1),
        })
    }
}

/// Golden `VBoxManage` output fixtures, one function per verb, kept
/// literal strings rather than files since each is a one-liner and a
/// fixture directory would just add indirection for a handful of cases.
pub mod fixtures {
    use super::Uuid;

    /// `showvminfo --machinereadable` for a single-disk, single-NIC,
    /// powered-off VM with no snapshots.
    pub fn showvminfo_basic(id: Uuid, name: &str) -> String {
        format!(
            "UUID=\"{id}\"\n\
             name=\"{name}\"\n\
             VMState=\"poweroff\"\n\
             ostype=\"Ubuntu_64\"\n\
             memory=2048\n\
             cpus=2\n\
             firmware=\"BIOS\"\n\
             nic1=\"nat\"\n\
             cableconnected1=\"on\"\n\
             storagecontrollername0=\"SATA\"\n\
             storagecontrollertype0=\"IntelAhci\"\n\
             storagecontrollermaxportcount0=\"4\"\n\
             SATA-0-0=\"/vms/{name}/{name}.vdi\"\n\
             SATA-ImageUUID-0-0=\"{id}\"\n"
        )
    }

    /// `showvminfo --machinereadable` for a running VM with one snapshot.
    pub fn showvminfo_running_with_snapshot(id: Uuid, name: &str, snapshot_id: Uuid) -> String {
        format!(
            "UUID=\"{id}\"\n\
             name=\"{name}\"\n\
             VMState=\"running\"\n\
             ostype=\"Ubuntu_64\"\n\
             memory=2048\n\
             cpus=2\n\
             firmware=\"BIOS\"\n\
             nic1=\"nat\"\n\
             cableconnected1=\"on\"\n\
             natpf1=\"ssh,tcp,,2222,,22\"\n\
             SnapshotName-0=\"baseline\"\n\
             SnapshotUUID-0=\"{snapshot_id}\"\n\
             CurrentSnapshotUUID=\"{snapshot_id}\"\n"
        )
    }

    /// `list vms` output for two registered machines.
    pub fn list_vms(entries: &[(&str, Uuid)]) -> String {
        entries.iter().map(|(name, id)| format!("\"{name}\" {{{id}}}\n")).collect()
    }

    /// `list hostonlyifs` tabular output for a single host-only interface.
    pub fn hostonlyifs(name: &str, ip: &str, netmask: &str) -> String {
        format!("Name:            {name}\nIPAddress:       {ip}\nNetworkMask:     {netmask}\nDHCP:            Disabled\n\n")
    }

    /// `createhostonlyif` stdout, which embeds the interface name that
    /// `error_classifier`'s caller must extract with a regex since it
    /// isn't a machinereadable or tabular dump.
    pub fn createhostonlyif(name: &str) -> String {
        format!("Interface '{name}' was successfully created\n")
    }

    /// `clonevm`/`createmedium` progress output, text-only with embedded
    /// percentages.
    pub fn progress_complete() -> String {
        "0%...10%...50%...100%\nMachine has been successfully cloned\n".to_string()
    }

    /// `list ostypes` tabular output for two guest OS types.
    pub fn list_ostypes() -> String {
        "ID:          Ubuntu_64\nDescription: Ubuntu (64-bit)\n64 bit:      true\n\n\
         ID:          Windows11_64\nDescription: Windows 11 (64-bit)\n64 bit:      true\n\n"
            .to_string()
    }

    /// `VBoxManage --version`.
    pub fn version() -> String {
        "7.0.14r161095\n".to_string()
    }
}

/// Builders for data-model values, so tests don't repeat every field of a
/// struct they don't care about for the case at hand.
pub mod builders {
    use vbox_mcp::vbox::types::{Firmware, NetworkAdapter, NicType, VmRecord, VmState};
    use vbox_mcp::vbox::types::{SnapshotNode, SnapshotTree};

    use super::Uuid;

    pub fn vm_record(name: &str) -> VmRecord {
        VmRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            state: VmState::PoweredOff,
            os_type: "Ubuntu_64".to_string(),
            memory_mb: 2048,
            cpu_count: 2,
            disk_paths: vec![format!("/vms/{name}/{name}.vdi")],
            network_adapters: vec![NetworkAdapter {
                slot: 0,
                nic_type: NicType::Nat,
                backing: None,
                mac: None,
                cable_connected: true,
                nat_rules: Vec::new(),
            }],
            firmware: Firmware::Bios,
            current_snapshot_id: None,
        }
    }

    pub fn snapshot_node(name: &str) -> SnapshotNode {
        SnapshotNode {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: String::new(),
            creation_time: chrono::Utc::now(),
            parent_id: None,
            children: Vec::new(),
        }
    }

    pub fn snapshot_tree_with_one_root(name: &str) -> SnapshotTree {
        let root = snapshot_node(name);
        let current = root.id;
        SnapshotTree { roots: vec![root], current_snapshot_id: Some(current) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_calls_replay_in_order() {
        let runner = FakeProcessRunner::new().script([ScriptedCall::ok("first"), ScriptedCall::ok("second")]);

        let out1 = runner
            .run(Path::new("VBoxManage"), &["list".to_string(), "vms".to_string()], None, Duration::from_secs(1), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out1.stdout_str(), "first");

        let out2 = runner
            .run(Path::new("VBoxManage"), &["--version".to_string()], None, Duration::from_secs(1), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out2.stdout_str(), "second");

        assert_eq!(runner.call_count(), 2);
        assert_eq!(runner.recorded()[1].args, vec!["--version".to_string()]);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_before_consuming_the_queue() {
        let runner = FakeProcessRunner::new().script([ScriptedCall::ok("unused")]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = runner.run(Path::new("VBoxManage"), &[], None, Duration::from_secs(1), cancel).await;
        assert!(result.is_err());
        assert_eq!(runner.call_count(), 0);
    }

    #[tokio::test]
    #[should_panic(expected = "no scripted response queued")]
    async fn unscripted_call_panics() {
        let runner = FakeProcessRunner::new();
        let _ = runner.run(Path::new("VBoxManage"), &[], None, Duration::from_secs(1), CancellationToken::new()).await;
    }
}
