//! VBox Orchestrator — `spec.md` §4.D.
//!
//! One method per logical VBoxManage operation. Each method validates its
//! inputs, assembles an argument vector, invokes the [`ProcessRunner`],
//! parses the result, and classifies failures — steps (a)-(e) from §4.D.
//! Readers run unrestricted; writers on a given VM serialize through
//! [`VmLockTable`]; writers on host-network resources serialize through
//! [`HostNetworkLock`]. Name→UUID resolution always happens before lock
//! acquisition.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vbox_mcp_shared::constants::timeouts;
use vbox_mcp_shared::errors::{ErrorKind, McpError, McpResult};

use crate::config::Config;
use crate::jobs::{JobId, JobKind, JobTracker};
use crate::process::{ProcessOutput, ProcessRunner};

use super::error_classifier::classify;
use super::locks::{HostNetworkLock, VmLockTable};
use super::parser;
use super::types::*;

/// Fronts the Process Runner, Output Parser, and Error Classifier with a
/// typed API. Cheap to clone: every field is `Arc`-backed, which is what
/// lets a job's spawned future hold its own copy while the request that
/// kicked it off returns immediately.
#[derive(Clone)]
pub struct VboxOrchestrator {
    binary: Arc<std::path::PathBuf>,
    runner: Arc<dyn ProcessRunner>,
    vm_locks: Arc<VmLockTable>,
    host_lock: Arc<HostNetworkLock>,
}

impl VboxOrchestrator {
    pub fn new(binary: std::path::PathBuf, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            binary: Arc::new(binary),
            runner,
            vm_locks: Arc::new(VmLockTable::new()),
            host_lock: Arc::new(HostNetworkLock::new()),
        }
    }

    pub fn from_config(config: &Config, runner: Arc<dyn ProcessRunner>) -> Self {
        Self::new(config.vboxmanage_binary(), runner)
    }

    fn query_timeout(&self) -> Duration {
        Duration::from_secs(timeouts::QUERY_SECS)
    }

    fn write_timeout(&self) -> Duration {
        Duration::from_secs(timeouts::WRITE_SECS)
    }

    /// Run a VBoxManage invocation and classify a non-zero exit into the
    /// error taxonomy (`spec.md` §4.C). Every argument is a distinct vector
    /// element; nothing here ever builds a shell command line.
    async fn invoke(
        &self,
        args: Vec<String>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> McpResult<ProcessOutput> {
        let output = self.runner.run(&self.binary, &args, None, timeout, cancel).await?;
        if output.exit_code != 0 {
            tracing::warn!(exit_code = output.exit_code, ?args, "VBoxManage exited non-zero");
            return Err(classify(output.exit_code, &output.stdout_str(), &output.stderr_str()));
        }
        Ok(output)
    }

    // ---- validation helpers (pre-dispatch, never invoke VBoxManage) ----

    fn validate_memory(memory_mb: u64) -> McpResult<()> {
        if memory_mb < 4 {
            return Err(McpError::invalid_argument("memory_mb must be at least 4"));
        }
        Ok(())
    }

    fn validate_nic_slot(slot: u8) -> McpResult<()> {
        if slot > 3 {
            return Err(McpError::invalid_argument("nic slot must be in 0..=3"));
        }
        Ok(())
    }

    fn validate_snapshot_name(name: &str) -> McpResult<()> {
        if name.contains('/') || name.contains('\\') {
            return Err(McpError::invalid_argument(
                "snapshot name must not contain a path separator",
            ));
        }
        Ok(())
    }

    // ---- name resolution ----

    /// Resolve a [`VmIdentifier`] to a UUID. UUIDs pass through untouched
    /// (`spec.md` §3 "the orchestrator accepts either form"); names are
    /// resolved via `list vms`, failing `NotFound`/`Ambiguous` per the
    /// `VMIdentifier` invariant.
    pub async fn resolve_vm_id(&self, id: &VmIdentifier, cancel: CancellationToken) -> McpResult<Uuid> {
        match id {
            VmIdentifier::Uuid(uuid) => Ok(*uuid),
            VmIdentifier::Name(name) => {
                let out = self
                    .invoke(vec!["list".into(), "vms".into()], self.query_timeout(), cancel)
                    .await?;
                let rows = parser::parse_list_vms(&out.stdout_str());
                let matches: Vec<Uuid> = rows.into_iter().filter(|(n, _)| n == name).map(|(_, id)| id).collect();
                match matches.len() {
                    0 => Err(McpError::not_found(format!("no registered machine named '{name}'"))),
                    1 => Ok(matches[0]),
                    n => Err(McpError::ambiguous(format!("{n} machines are named '{name}'"))),
                }
            }
        }
    }

    // ---- VM lifecycle ----

    pub async fn list_vms(&self, details: bool, cancel: CancellationToken) -> McpResult<Vec<VmSummary>> {
        let out = self
            .invoke(vec!["list".into(), "vms".into()], self.query_timeout(), cancel.clone())
            .await?;
        let rows = parser::parse_list_vms(&out.stdout_str());

        let mut running = std::collections::HashSet::new();
        if details {
            let running_out = self
                .invoke(
                    vec!["list".into(), "runningvms".into()],
                    self.query_timeout(),
                    cancel.clone(),
                )
                .await?;
            running.extend(parser::parse_list_vms(&running_out.stdout_str()).into_iter().map(|(_, id)| id));
        }

        let mut summaries = Vec::with_capacity(rows.len());
        for (name, id) in rows {
            let state = if details {
                match self.get_vm_info(&VmIdentifier::Uuid(id), cancel.clone()).await {
                    Ok(record) => Some(record.state),
                    Err(_) if running.contains(&id) => Some(VmState::Running),
                    Err(_) => None,
                }
            } else {
                None
            };
            summaries.push(VmSummary { id, name, state });
        }
        Ok(summaries)
    }

    pub async fn get_vm_info(&self, id: &VmIdentifier, cancel: CancellationToken) -> McpResult<VmRecord> {
        let resolved = self.resolve_vm_id(id, cancel.clone()).await?;
        let out = self
            .invoke(
                vec!["showvminfo".into(), resolved.to_string(), "--machinereadable".into()],
                self.query_timeout(),
                cancel,
            )
            .await?;
        let map = parser::parse_machinereadable(&out.stdout_str());
        parser::build_vm_record(&map)
    }

    /// `spec.md` §4.D `create_vm`. Runs the `createvm` / `modifyvm` /
    /// `createmedium` / `storagectl` / `storageattach` sequence; on any
    /// intermediate failure, unregisters the partially created VM
    /// (Design Notes §9, "Rollback discipline"). Returns the final record
    /// plus an advisory warning when `cpu_count` oversubscribes the host.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_vm(
        &self,
        name: &str,
        os_type: &str,
        memory_mb: u64,
        cpu_count: u32,
        disk_size_mb: u64,
        firmware: Firmware,
        network_type: NicType,
        cancel: CancellationToken,
    ) -> McpResult<(VmRecord, Option<String>)> {
        Self::validate_memory(memory_mb)?;
        if cpu_count == 0 {
            return Err(McpError::invalid_argument("cpu_count must be at least 1"));
        }

        let host_cpus = num_cpus::get() as u32;
        let warning = (cpu_count > host_cpus).then(|| {
            format!("cpu_count {cpu_count} exceeds host logical CPU count {host_cpus}; VirtualBox allows oversubscription")
        });

        self.invoke(
            vec![
                "createvm".into(),
                "--name".into(),
                name.to_string(),
                "--ostype".into(),
                os_type.to_string(),
                "--register".into(),
            ],
            self.write_timeout(),
            cancel.clone(),
        )
        .await?;

        let id = self.resolve_vm_id(&VmIdentifier::Name(name.to_string()), cancel.clone()).await?;
        let _guard = self.vm_locks.lock(id).await;

        let info_out = self
            .invoke(
                vec!["showvminfo".into(), id.to_string(), "--machinereadable".into()],
                self.query_timeout(),
                cancel.clone(),
            )
            .await?;
        let cfg_map = parser::parse_machinereadable(&info_out.stdout_str());
        let folder = parser::get_present(&cfg_map, "CfgFile")
            .and_then(|cfg| Path::new(&cfg).parent().map(|p| p.to_path_buf()))
            .unwrap_or_else(std::env::temp_dir);
        let disk_path = folder.join(format!("{name}.vdi"));

        let firmware_arg = match firmware {
            Firmware::Bios => "bios",
            Firmware::Efi => "efi",
        };
        let modify_result = self
            .invoke(
                vec![
                    "modifyvm".into(),
                    id.to_string(),
                    "--memory".into(),
                    memory_mb.to_string(),
                    "--cpus".into(),
                    cpu_count.to_string(),
                    "--firmware".into(),
                    firmware_arg.to_string(),
                    "--nic1".into(),
                    network_type.as_vboxmanage_arg().to_string(),
                ],
                self.write_timeout(),
                cancel.clone(),
            )
            .await;
        if let Err(e) = modify_result {
            self.cleanup_partial_vm(id, cancel.clone()).await;
            return Err(e);
        }

        let medium_result = self
            .invoke(
                vec![
                    "createmedium".into(),
                    "disk".into(),
                    "--filename".into(),
                    disk_path.display().to_string(),
                    "--size".into(),
                    disk_size_mb.to_string(),
                ],
                self.write_timeout(),
                cancel.clone(),
            )
            .await;
        if let Err(e) = medium_result {
            self.cleanup_partial_vm(id, cancel.clone()).await;
            return Err(e);
        }

        let controller_result = self
            .invoke(
                vec![
                    "storagectl".into(),
                    id.to_string(),
                    "--name".into(),
                    "SATA".to_string(),
                    "--add".into(),
                    "sata".to_string(),
                    "--controller".into(),
                    "IntelAhci".to_string(),
                ],
                self.write_timeout(),
                cancel.clone(),
            )
            .await;
        if let Err(e) = controller_result {
            self.cleanup_partial_vm(id, cancel.clone()).await;
            return Err(e);
        }

        let attach_result = self
            .invoke(
                vec![
                    "storageattach".into(),
                    id.to_string(),
                    "--storagectl".into(),
                    "SATA".to_string(),
                    "--port".into(),
                    "0".to_string(),
                    "--device".into(),
                    "0".to_string(),
                    "--type".into(),
                    "hdd".to_string(),
                    "--medium".into(),
                    disk_path.display().to_string(),
                ],
                self.write_timeout(),
                cancel.clone(),
            )
            .await;
        if let Err(e) = attach_result {
            self.cleanup_partial_vm(id, cancel.clone()).await;
            return Err(e);
        }

        let record = self.get_vm_info(&VmIdentifier::Uuid(id), cancel).await?;
        Ok((record, warning))
    }

    /// Best-effort compensation for a failed `create_vm`: unregister and
    /// delete whatever media were attached so far. Failures here are
    /// logged, never surfaced over the primary error (Design Notes §9).
    pub async fn cleanup_partial_vm(&self, id: Uuid, cancel: CancellationToken) {
        if let Err(e) = self
            .invoke(
                vec!["unregistervm".into(), id.to_string(), "--delete".into()],
                self.write_timeout(),
                cancel,
            )
            .await
        {
            tracing::error!(vm_id = %id, error = %e, "rollback: failed to unregister partially created VM");
        }
    }

    /// Idempotent cleanup helper for a failed `storage_attach`: detach
    /// whatever landed on the slot so a retry starts clean.
    pub async fn cleanup_partial_attachment(
        &self,
        id: Uuid,
        controller: &str,
        port: u32,
        device: u32,
        cancel: CancellationToken,
    ) {
        let args = vec![
            "storageattach".into(),
            id.to_string(),
            "--storagectl".into(),
            controller.to_string(),
            "--port".into(),
            port.to_string(),
            "--device".into(),
            device.to_string(),
            "--medium".into(),
            "none".into(),
        ];
        if let Err(e) = self.invoke(args, self.write_timeout(), cancel).await {
            tracing::error!(vm_id = %id, error = %e, "rollback: failed to detach partial medium attachment");
        }
    }

    pub async fn start_vm(&self, id: &VmIdentifier, mode: StartMode, cancel: CancellationToken) -> McpResult<VmRecord> {
        let resolved = self.resolve_vm_id(id, cancel.clone()).await?;
        let _guard = self.vm_locks.lock(resolved).await;
        let current = self.get_vm_info(&VmIdentifier::Uuid(resolved), cancel.clone()).await?;
        if !current.state.can_transition_to(VmTransition::Start) {
            return Err(McpError::invalid_state(format!(
                "cannot start a VM in state {}",
                current.state
            )));
        }
        self.invoke(
            vec![
                "startvm".into(),
                resolved.to_string(),
                "--type".into(),
                mode.as_vboxmanage_type().to_string(),
            ],
            self.write_timeout(),
            cancel.clone(),
        )
        .await?;
        self.get_vm_info(&VmIdentifier::Uuid(resolved), cancel).await
    }

    pub async fn stop_vm(&self, id: &VmIdentifier, mode: StopMode, cancel: CancellationToken) -> McpResult<VmRecord> {
        let resolved = self.resolve_vm_id(id, cancel.clone()).await?;
        let _guard = self.vm_locks.lock(resolved).await;
        let current = self.get_vm_info(&VmIdentifier::Uuid(resolved), cancel.clone()).await?;

        if !current.state.can_transition_to(VmTransition::Stop(mode)) {
            return Err(McpError::invalid_state(format!(
                "cannot stop(mode={mode:?}) a VM in state {}",
                current.state
            )));
        }

        let args = match mode {
            StopMode::Acpi => vec!["controlvm".into(), resolved.to_string(), "acpipowerbutton".into()],
            StopMode::Poweroff => vec!["controlvm".into(), resolved.to_string(), "poweroff".into()],
            StopMode::Save => vec!["controlvm".into(), resolved.to_string(), "savestate".into()],
        };
        self.invoke(args, self.write_timeout(), cancel.clone()).await?;
        self.get_vm_info(&VmIdentifier::Uuid(resolved), cancel).await
    }

    pub async fn pause_vm(&self, id: &VmIdentifier, cancel: CancellationToken) -> McpResult<VmRecord> {
        let resolved = self.resolve_vm_id(id, cancel.clone()).await?;
        let _guard = self.vm_locks.lock(resolved).await;
        let current = self.get_vm_info(&VmIdentifier::Uuid(resolved), cancel.clone()).await?;
        if !current.state.can_transition_to(VmTransition::Pause) {
            return Err(McpError::invalid_state(format!(
                "cannot pause a VM in state {}",
                current.state
            )));
        }
        self.invoke(
            vec!["controlvm".into(), resolved.to_string(), "pause".into()],
            self.write_timeout(),
            cancel.clone(),
        )
        .await?;
        self.get_vm_info(&VmIdentifier::Uuid(resolved), cancel).await
    }

    pub async fn resume_vm(&self, id: &VmIdentifier, cancel: CancellationToken) -> McpResult<VmRecord> {
        let resolved = self.resolve_vm_id(id, cancel.clone()).await?;
        let _guard = self.vm_locks.lock(resolved).await;
        let current = self.get_vm_info(&VmIdentifier::Uuid(resolved), cancel.clone()).await?;
        if !current.state.can_transition_to(VmTransition::Resume) {
            return Err(McpError::invalid_state(format!(
                "cannot resume a VM in state {}",
                current.state
            )));
        }
        match current.state {
            VmState::Paused => {
                self.invoke(
                    vec!["controlvm".into(), resolved.to_string(), "resume".into()],
                    self.write_timeout(),
                    cancel.clone(),
                )
                .await?;
            }
            VmState::Saved => {
                self.invoke(
                    vec![
                        "startvm".into(),
                        resolved.to_string(),
                        "--type".into(),
                        StartMode::Headless.as_vboxmanage_type().to_string(),
                    ],
                    self.write_timeout(),
                    cancel.clone(),
                )
                .await?;
            }
            _ => unreachable!("can_transition_to(Resume) only admits Paused and Saved"),
        }
        self.get_vm_info(&VmIdentifier::Uuid(resolved), cancel).await
    }

    pub async fn reset_vm(&self, id: &VmIdentifier, cancel: CancellationToken) -> McpResult<VmRecord> {
        let resolved = self.resolve_vm_id(id, cancel.clone()).await?;
        let _guard = self.vm_locks.lock(resolved).await;
        let current = self.get_vm_info(&VmIdentifier::Uuid(resolved), cancel.clone()).await?;
        if !current.state.can_transition_to(VmTransition::Reset) {
            return Err(McpError::invalid_state(format!(
                "cannot reset a VM in state {}",
                current.state
            )));
        }
        self.invoke(
            vec!["controlvm".into(), resolved.to_string(), "reset".into()],
            self.write_timeout(),
            cancel.clone(),
        )
        .await?;
        self.get_vm_info(&VmIdentifier::Uuid(resolved), cancel).await
    }

    /// Not idempotent (`spec.md` §8): a second call against the same id
    /// naturally surfaces `NotFound` once VBoxManage no longer knows the
    /// machine, with no special-casing needed here.
    pub async fn delete_vm(&self, id: &VmIdentifier, delete_media: bool, cancel: CancellationToken) -> McpResult<()> {
        let resolved = self.resolve_vm_id(id, cancel.clone()).await?;
        let _guard = self.vm_locks.lock(resolved).await;
        let mut args = vec!["unregistervm".into(), resolved.to_string()];
        if delete_media {
            args.push("--delete".into());
        }
        self.invoke(args, self.write_timeout(), cancel).await?;
        Ok(())
    }

    /// `spec.md` §4.D `clone_vm`. Linked clones require a snapshot —
    /// pre-validated here rather than left to VBoxManage (Open Questions
    /// §9). Registers a [`Job`](crate::jobs::Job) and returns immediately;
    /// the clone itself runs on the job's background task.
    pub fn clone_vm(
        &self,
        jobs: &JobTracker,
        id: VmIdentifier,
        new_name: String,
        mode: CloneMode,
        snapshot: Option<String>,
    ) -> McpResult<JobId> {
        if mode == CloneMode::Linked && snapshot.is_none() {
            return Err(McpError::invalid_argument("linked clones require a snapshot"));
        }

        let this = self.clone();
        let job_id = jobs.submit(JobKind::CloneVm, move |handle| async move {
            let resolved = this.resolve_vm_id(&id, handle.cancel_token()).await?;
            let _guard = this.vm_locks.lock(resolved).await;

            let mut args = vec![
                "clonevm".into(),
                resolved.to_string(),
                "--name".into(),
                new_name.clone(),
                "--register".into(),
            ];
            if mode == CloneMode::Linked {
                args.push("--options".into());
                args.push("link".into());
            }
            if let Some(snap) = &snapshot {
                args.push("--snapshot".into());
                args.push(snap.clone());
            }

            let out = this.invoke(args, Duration::from_secs(timeouts::WRITE_SECS), handle.cancel_token()).await?;
            handle.set_percent(parser::parse_progress(&out.stdout_str()).max(50)).await;

            let record = this
                .get_vm_info(&VmIdentifier::Name(new_name), handle.cancel_token())
                .await?;
            Ok(serde_json::to_value(record)?)
        });
        Ok(job_id)
    }

    // ---- snapshots ----

    pub async fn create_snapshot(
        &self,
        id: &VmIdentifier,
        name: &str,
        description: Option<&str>,
        live: bool,
        cancel: CancellationToken,
    ) -> McpResult<SnapshotNode> {
        Self::validate_snapshot_name(name)?;
        let resolved = self.resolve_vm_id(id, cancel.clone()).await?;
        let _guard = self.vm_locks.lock(resolved).await;

        let mut args = vec!["snapshot".into(), resolved.to_string(), "take".into(), name.to_string()];
        if let Some(desc) = description {
            args.push("--description".into());
            args.push(desc.to_string());
        }
        if live {
            args.push("--live".into());
        }
        self.invoke(args, self.write_timeout(), cancel.clone()).await?;

        let tree = self.list_snapshots(&VmIdentifier::Uuid(resolved), cancel).await?;
        find_snapshot_by_name(&tree.roots, name)
            .ok_or_else(|| McpError::internal("snapshot created but not found in the resulting tree"))
    }

    /// Refuses on a `Running` VM (`spec.md` §4.D `restore_snapshot`).
    pub async fn restore_snapshot(&self, id: &VmIdentifier, snapshot: &str, cancel: CancellationToken) -> McpResult<()> {
        let resolved = self.resolve_vm_id(id, cancel.clone()).await?;
        let _guard = self.vm_locks.lock(resolved).await;
        let current = self.get_vm_info(&VmIdentifier::Uuid(resolved), cancel.clone()).await?;
        if !current.state.can_transition_to(VmTransition::RestoreSnapshot) {
            return Err(McpError::invalid_state("cannot restore a snapshot on a running VM"));
        }
        self.invoke(
            vec!["snapshot".into(), resolved.to_string(), "restore".into(), snapshot.to_string()],
            self.write_timeout(),
            cancel,
        )
        .await?;
        Ok(())
    }

    /// Long-running if differencing disks must merge (`spec.md` §4.D).
    pub fn delete_snapshot(&self, jobs: &JobTracker, id: VmIdentifier, snapshot: String) -> JobId {
        let this = self.clone();
        jobs.submit(JobKind::SnapshotMerge, move |handle| async move {
            let resolved = this.resolve_vm_id(&id, handle.cancel_token()).await?;
            let _guard = this.vm_locks.lock(resolved).await;
            let out = this
                .invoke(
                    vec!["snapshot".into(), resolved.to_string(), "delete".into(), snapshot.clone()],
                    Duration::from_secs(timeouts::WRITE_SECS),
                    handle.cancel_token(),
                )
                .await?;
            handle.set_percent(parser::parse_progress(&out.stdout_str()).max(50)).await;
            Ok(serde_json::json!({ "vm_id": resolved, "deleted_snapshot": snapshot }))
        })
    }

    pub async fn list_snapshots(&self, id: &VmIdentifier, cancel: CancellationToken) -> McpResult<SnapshotTree> {
        let resolved = self.resolve_vm_id(id, cancel.clone()).await?;
        let out = self
            .invoke(
                vec!["showvminfo".into(), resolved.to_string(), "--machinereadable".into()],
                self.query_timeout(),
                cancel,
            )
            .await?;
        Ok(parser::build_snapshot_tree(&parser::parse_machinereadable(&out.stdout_str())))
    }

    // ---- networking ----

    #[allow(clippy::too_many_arguments)]
    pub async fn configure_nic(
        &self,
        id: &VmIdentifier,
        slot: u8,
        nic_type: NicType,
        backing: Option<&str>,
        mac: Option<&str>,
        cable_connected: Option<bool>,
        cancel: CancellationToken,
    ) -> McpResult<NetworkAdapter> {
        Self::validate_nic_slot(slot)?;
        let resolved = self.resolve_vm_id(id, cancel.clone()).await?;
        let _guard = self.vm_locks.lock(resolved).await;
        let n = slot + 1;

        let mut args = vec![
            "modifyvm".into(),
            resolved.to_string(),
            format!("--nic{n}"),
            nic_type.as_vboxmanage_arg().to_string(),
        ];
        if let Some(value) = backing {
            let flag = match nic_type {
                NicType::Bridged => format!("--bridgeadapter{n}"),
                NicType::Hostonly => format!("--hostonlyadapter{n}"),
                NicType::Intnet => format!("--intnet{n}"),
                NicType::Natnetwork => format!("--nat-network{n}"),
                NicType::Nat | NicType::Null => {
                    return Err(McpError::invalid_argument(
                        "backing is only valid for bridged/hostonly/intnet/natnetwork adapters",
                    ));
                }
            };
            args.push(flag);
            args.push(value.to_string());
        }
        if let Some(value) = mac {
            args.push(format!("--macaddress{n}"));
            args.push(value.to_string());
        }
        if let Some(connected) = cable_connected {
            args.push(format!("--cableconnected{n}"));
            args.push(if connected { "on".into() } else { "off".into() });
        }

        self.invoke(args, self.write_timeout(), cancel.clone()).await?;
        let record = self.get_vm_info(&VmIdentifier::Uuid(resolved), cancel).await?;
        record
            .network_adapters
            .into_iter()
            .find(|a| a.slot == slot)
            .ok_or_else(|| McpError::internal("adapter not found after configuration"))
    }

    pub async fn add_port_forward(
        &self,
        id: &VmIdentifier,
        slot: u8,
        rule: NatRule,
        cancel: CancellationToken,
    ) -> McpResult<()> {
        Self::validate_nic_slot(slot)?;
        let resolved = self.resolve_vm_id(id, cancel.clone()).await?;
        let _guard = self.vm_locks.lock(resolved).await;

        let requested = NatRuleKey::new(slot, rule.name.as_str());
        let current = self.get_vm_info(&VmIdentifier::Uuid(resolved), cancel.clone()).await?;
        let duplicate = current.network_adapters.iter().find(|a| a.slot == slot).is_some_and(|adapter| {
            adapter.nat_rules.iter().any(|r| NatRuleKey::new(slot, r.name.as_str()) == requested)
        });
        if duplicate {
            return Err(McpError::already_exists(format!(
                "NAT rule '{}' already exists on adapter {slot}",
                rule.name
            )));
        }

        let n = slot + 1;
        self.invoke(
            vec!["modifyvm".into(), resolved.to_string(), format!("--natpf{n}"), rule.to_vboxmanage_spec()],
            self.write_timeout(),
            cancel,
        )
        .await?;
        Ok(())
    }

    pub async fn remove_port_forward(
        &self,
        id: &VmIdentifier,
        slot: u8,
        rule_name: &str,
        cancel: CancellationToken,
    ) -> McpResult<()> {
        Self::validate_nic_slot(slot)?;
        let resolved = self.resolve_vm_id(id, cancel.clone()).await?;
        let _guard = self.vm_locks.lock(resolved).await;
        let n = slot + 1;
        self.invoke(
            vec![
                "modifyvm".into(),
                resolved.to_string(),
                format!("--natpf{n}"),
                "delete".to_string(),
                rule_name.to_string(),
            ],
            self.write_timeout(),
            cancel,
        )
        .await?;
        Ok(())
    }

    /// Serialized globally with all other host-network writers
    /// (`spec.md` §4.D / §5).
    pub async fn list_hostonly_networks(&self, cancel: CancellationToken) -> McpResult<Vec<HostOnlyNetwork>> {
        let out = self
            .invoke(vec!["list".into(), "hostonlyifs".into()], self.query_timeout(), cancel)
            .await?;
        Ok(parser::parse_tabular(&out.stdout_str())
            .iter()
            .filter_map(parser::build_hostonly_network)
            .collect())
    }

    pub async fn create_hostonly_network(&self, cancel: CancellationToken) -> McpResult<HostOnlyNetwork> {
        let _guard = self.host_lock.lock().await;
        let out = self
            .invoke(vec!["hostonlyif".into(), "create".into()], self.write_timeout(), cancel.clone())
            .await?;
        let name = extract_hostonlyif_name(&out.stdout_str())
            .ok_or_else(|| McpError::new(ErrorKind::ParseError, "could not parse created host-only interface name"))?;
        self.list_hostonly_networks(cancel)
            .await?
            .into_iter()
            .find(|network| network.name == name)
            .ok_or_else(|| McpError::internal("host-only interface created but not present in `list hostonlyifs`"))
    }

    pub async fn remove_hostonly_network(&self, name: &str, cancel: CancellationToken) -> McpResult<()> {
        let _guard = self.host_lock.lock().await;
        self.invoke(
            vec!["hostonlyif".into(), "remove".into(), name.to_string()],
            self.write_timeout(),
            cancel,
        )
        .await?;
        Ok(())
    }

    // ---- storage ----

    pub async fn storage_list_controllers(&self, id: &VmIdentifier, cancel: CancellationToken) -> McpResult<Vec<StorageController>> {
        let resolved = self.resolve_vm_id(id, cancel.clone()).await?;
        let out = self
            .invoke(
                vec!["showvminfo".into(), resolved.to_string(), "--machinereadable".into()],
                self.query_timeout(),
                cancel,
            )
            .await?;
        Ok(parser::build_storage_controllers(&parser::parse_machinereadable(&out.stdout_str())))
    }

    pub async fn storage_create_controller(
        &self,
        id: &VmIdentifier,
        name: &str,
        bus: Bus,
        cancel: CancellationToken,
    ) -> McpResult<StorageController> {
        let resolved = self.resolve_vm_id(id, cancel.clone()).await?;
        let _guard = self.vm_locks.lock(resolved).await;
        let controller_type = match bus {
            Bus::Ide => "PIIX4",
            Bus::Sata => "IntelAhci",
            Bus::Scsi => "LsiLogic",
            Bus::Nvme => "NVMe",
            Bus::Usb => "USB",
            Bus::Floppy => "I82078",
        };
        self.invoke(
            vec![
                "storagectl".into(),
                resolved.to_string(),
                "--name".into(),
                name.to_string(),
                "--add".into(),
                bus.as_vboxmanage_arg().to_string(),
                "--controller".into(),
                controller_type.to_string(),
            ],
            self.write_timeout(),
            cancel.clone(),
        )
        .await?;
        self.storage_list_controllers(&VmIdentifier::Uuid(resolved), cancel)
            .await?
            .into_iter()
            .find(|c| c.name == name)
            .ok_or_else(|| McpError::internal("controller created but not found afterward"))
    }

    pub async fn storage_remove_controller(&self, id: &VmIdentifier, name: &str, cancel: CancellationToken) -> McpResult<()> {
        let resolved = self.resolve_vm_id(id, cancel.clone()).await?;
        let _guard = self.vm_locks.lock(resolved).await;
        self.invoke(
            vec!["storagectl".into(), resolved.to_string(), "--name".into(), name.to_string(), "--remove".into()],
            self.write_timeout(),
            cancel,
        )
        .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn storage_attach(
        &self,
        id: &VmIdentifier,
        controller: &str,
        port: u32,
        device: u32,
        medium_type: MediumType,
        path: Option<&str>,
        cancel: CancellationToken,
    ) -> McpResult<()> {
        if let Some(p) = path
            && !Path::new(p).is_absolute()
        {
            return Err(McpError::invalid_argument("medium path must be absolute"));
        }
        let resolved = self.resolve_vm_id(id, cancel.clone()).await?;
        let _guard = self.vm_locks.lock(resolved).await;

        let type_arg = match medium_type {
            MediumType::Hdd => "hdd",
            MediumType::Dvd => "dvddrive",
            MediumType::Floppy => "fdd",
        };
        let medium_arg = path.map(str::to_string).unwrap_or_else(|| "none".to_string());

        let result = self
            .invoke(
                vec![
                    "storageattach".into(),
                    resolved.to_string(),
                    "--storagectl".into(),
                    controller.to_string(),
                    "--port".into(),
                    port.to_string(),
                    "--device".into(),
                    device.to_string(),
                    "--type".into(),
                    type_arg.to_string(),
                    "--medium".into(),
                    medium_arg,
                ],
                self.write_timeout(),
                cancel.clone(),
            )
            .await;
        if let Err(e) = result {
            self.cleanup_partial_attachment(resolved, controller, port, device, cancel).await;
            return Err(e);
        }
        Ok(())
    }

    pub async fn storage_create_medium(&self, path: &str, size_mb: u64, format: &str, cancel: CancellationToken) -> McpResult<String> {
        let target = Path::new(path);
        if !target.is_absolute() {
            return Err(McpError::invalid_argument("medium path must be absolute"));
        }
        if let Some(parent) = target.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            return Err(McpError::invalid_argument(format!(
                "parent directory {} does not exist",
                parent.display()
            )));
        }
        self.invoke(
            vec![
                "createmedium".into(),
                "disk".into(),
                "--filename".into(),
                path.to_string(),
                "--size".into(),
                size_mb.to_string(),
                "--format".into(),
                format.to_string(),
            ],
            self.write_timeout(),
            cancel,
        )
        .await?;
        Ok(path.to_string())
    }

    // ---- system ----

    pub async fn vbox_version(&self, cancel: CancellationToken) -> McpResult<String> {
        let out = self.invoke(vec!["--version".into()], self.query_timeout(), cancel).await?;
        Ok(out.stdout_str().trim().to_string())
    }

    pub async fn host_info(&self, cancel: CancellationToken) -> McpResult<HostInfo> {
        let vbox_version = self.vbox_version(cancel.clone()).await?;
        let out = self
            .invoke(vec!["list".into(), "hostinfo".into()], self.query_timeout(), cancel)
            .await?;
        let record = parser::parse_tabular(&out.stdout_str()).into_iter().next().unwrap_or_default();

        let logical_cpu_count = record
            .get("Processor count")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or_else(|| num_cpus::get() as u32);
        let memory_total_mb = record
            .get("Memory size")
            .and_then(|v| v.split_whitespace().next())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let os = record
            .get("Operating system")
            .cloned()
            .unwrap_or_else(|| std::env::consts::OS.to_string());

        Ok(HostInfo {
            vbox_version,
            os,
            logical_cpu_count,
            memory_total_mb,
        })
    }

    pub async fn list_os_types(&self, cancel: CancellationToken) -> McpResult<Vec<OsTypeInfo>> {
        let out = self
            .invoke(vec!["list".into(), "ostypes".into()], self.query_timeout(), cancel)
            .await?;
        Ok(parser::parse_tabular(&out.stdout_str())
            .iter()
            .filter_map(|record| {
                let id = record.get("ID")?.clone();
                let description = record.get("Description").cloned().unwrap_or_default();
                let is_64_bit = record.get("64 bit").map(|v| v.eq_ignore_ascii_case("true")).unwrap_or(false);
                Some(OsTypeInfo { id, description, is_64_bit })
            })
            .collect())
    }

    pub async fn get_metrics(&self, id: Option<&VmIdentifier>, cancel: CancellationToken) -> McpResult<Metrics> {
        let target = match id {
            Some(vm_id) => self.resolve_vm_id(vm_id, cancel.clone()).await?.to_string(),
            None => "host".to_string(),
        };
        let out = self
            .invoke(
                vec![
                    "metrics".into(),
                    "query".into(),
                    target,
                    "CPU/Load/User,RAM/Usage/Used,Disk/Usage/Used,Net/Rate/Rx,Net/Rate/Tx".into(),
                ],
                self.query_timeout(),
                cancel,
            )
            .await?;
        Ok(parse_metrics(&out.stdout_str()))
    }

    /// Defaults to PNG per Open Questions (§9); validates the parent
    /// directory exists before invoking VBoxManage (§6 "Host filesystem").
    pub async fn screenshot(&self, id: &VmIdentifier, path: &Path, cancel: CancellationToken) -> McpResult<()> {
        if !path.is_absolute() {
            return Err(McpError::invalid_argument("screenshot path must be absolute"));
        }
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| McpError::invalid_argument("screenshot path has no parent directory"))?;
        if !parent.exists() {
            return Err(McpError::invalid_argument(format!(
                "parent directory {} does not exist",
                parent.display()
            )));
        }
        let resolved = self.resolve_vm_id(id, cancel.clone()).await?;
        self.invoke(
            vec!["controlvm".into(), resolved.to_string(), "screenshotpng".into(), path.display().to_string()],
            self.query_timeout(),
            cancel,
        )
        .await?;
        Ok(())
    }
}

fn find_snapshot_by_name(nodes: &[SnapshotNode], name: &str) -> Option<SnapshotNode> {
    for node in nodes {
        if node.name == name {
            return Some(node.clone());
        }
        if let Some(found) = find_snapshot_by_name(&node.children, name) {
            return Some(found);
        }
    }
    None
}

static HOSTONLYIF_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"Interface '([^']+)' was successfully created").unwrap());

fn extract_hostonlyif_name(stdout: &str) -> Option<String> {
    HOSTONLYIF_NAME.captures(stdout).map(|c| c[1].to_string())
}

/// Parse `VBoxManage metrics query` output. The exact column layout is
/// locale- and version-sensitive, so this keeps to the stable substrings in
/// the metric's own name (the counter path, e.g. `CPU/Load/User`) rather
/// than depending on column alignment; anything unrecognized lands in
/// `Metrics::extra` instead of being dropped.
fn parse_metrics(text: &str) -> Metrics {
    let mut metrics = Metrics::default();
    for line in text.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = rest.trim().to_string();

        if key.contains("CPU/Load") {
            metrics.cpu_load_percent = first_number(&value);
        } else if key.contains("RAM/Usage") {
            metrics.ram_usage_mb = first_number(&value);
        } else if key.contains("Disk/Usage") {
            metrics.disk_usage_mb = first_number(&value);
        } else if key.contains("Net/Rate/Rx") {
            metrics.network_rx_bytes = first_number(&value);
        } else if key.contains("Net/Rate/Tx") {
            metrics.network_tx_bytes = first_number(&value);
        } else if !key.is_empty() {
            metrics.extra.insert(key.to_string(), value);
        }
    }
    metrics
}

fn first_number<T: std::str::FromStr>(value: &str) -> Option<T> {
    value.split_whitespace().next()?.trim_end_matches('%').parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostonlyif_name_is_extracted_from_create_output() {
        let stdout = "Interface 'vboxnet3' was successfully created\n";
        assert_eq!(extract_hostonlyif_name(stdout), Some("vboxnet3".to_string()));
    }

    #[test]
    fn metrics_parses_known_counters_and_keeps_the_rest() {
        let text = "CPU/Load/User: 12%\nRAM/Usage/Used: 2048 kB\nUnknown/Counter: 7\n";
        let metrics = parse_metrics(text);
        assert_eq!(metrics.cpu_load_percent, Some(12.0));
        assert_eq!(metrics.ram_usage_mb, Some(2048));
        assert_eq!(metrics.extra.get("Unknown/Counter").unwrap(), "7");
    }

    #[test]
    fn find_snapshot_by_name_walks_children() {
        let child = SnapshotNode {
            id: Uuid::new_v4(),
            name: "child".to_string(),
            description: String::new(),
            creation_time: chrono::Utc::now(),
            parent_id: None,
            children: Vec::new(),
        };
        let root = SnapshotNode {
            id: Uuid::new_v4(),
            name: "root".to_string(),
            description: String::new(),
            creation_time: chrono::Utc::now(),
            parent_id: None,
            children: vec![child],
        };
        let found = find_snapshot_by_name(&[root], "child");
        assert!(found.is_some());
    }
}
