//! Core data model: `spec.md` §3.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Either a human name (unique per host) or a UUID (globally unique,
/// immutable). The orchestrator normalizes to UUID internally when
/// possible by resolving through `list_vms`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VmIdentifier {
    Uuid(Uuid),
    Name(String),
}

impl VmIdentifier {
    pub fn parse(raw: &str) -> Self {
        match Uuid::parse_str(raw) {
            Ok(uuid) => VmIdentifier::Uuid(uuid),
            Err(_) => VmIdentifier::Name(raw.to_string()),
        }
    }

    /// The literal string VBoxManage expects on the command line.
    pub fn as_arg(&self) -> String {
        match self {
            VmIdentifier::Uuid(id) => id.to_string(),
            VmIdentifier::Name(name) => name.clone(),
        }
    }
}

impl fmt::Display for VmIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_arg())
    }
}

/// VM power/lifecycle state (`spec.md` §3, `VMRecord.state`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum VmState {
    PoweredOff,
    Running,
    Paused,
    Saved,
    Aborted,
    Starting,
    Stopping,
    Other,
}

impl VmState {
    /// Parse VBoxManage's `VMState` machinereadable value.
    pub fn from_vboxmanage(raw: &str) -> Self {
        match raw {
            "poweroff" => VmState::PoweredOff,
            "running" => VmState::Running,
            "paused" => VmState::Paused,
            "saved" => VmState::Saved,
            "aborted" => VmState::Aborted,
            "starting" | "restoring" => VmState::Starting,
            "stopping" | "savingstate" | "poweringoff" => VmState::Stopping,
            _ => VmState::Other,
        }
    }

    /// Whether the VM is currently consuming host resources. Used by the
    /// state-machine guard table in `spec.md` §4.D.
    pub fn is_active(&self) -> bool {
        matches!(self, VmState::Running | VmState::Starting | VmState::Stopping)
    }

    /// Whether `transition` is legal from this state, per the §4.D
    /// state-machine guard table. The orchestrator checks this before
    /// issuing the underlying `VBoxManage` call rather than relying on
    /// VBoxManage to reject the disallowed transition itself.
    pub fn can_transition_to(&self, transition: VmTransition) -> bool {
        match transition {
            VmTransition::Start => !matches!(self, VmState::Running | VmState::Starting | VmState::Stopping),
            VmTransition::Stop(StopMode::Acpi | StopMode::Poweroff) => {
                matches!(self, VmState::Running | VmState::Paused)
            }
            VmTransition::Stop(StopMode::Save) => *self == VmState::Running,
            VmTransition::Pause => *self == VmState::Running,
            VmTransition::Resume => matches!(self, VmState::Paused | VmState::Saved),
            VmTransition::Reset => *self == VmState::Running,
            VmTransition::RestoreSnapshot => *self != VmState::Running,
        }
    }
}

/// The lifecycle transitions guarded by [`VmState::can_transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmTransition {
    Start,
    Stop(StopMode),
    Pause,
    Resume,
    Reset,
    RestoreSnapshot,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// `BIOS` or `EFI` firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Firmware {
    Bios,
    Efi,
}

impl Default for Firmware {
    fn default() -> Self {
        Firmware::Bios
    }
}

/// VM startup mode (`spec.md` GLOSSARY "Headless / GUI / SDL mode").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartMode {
    Headless,
    Gui,
    Sdl,
}

impl StartMode {
    pub fn as_vboxmanage_type(&self) -> &'static str {
        match self {
            StartMode::Headless => "headless",
            StartMode::Gui => "gui",
            StartMode::Sdl => "sdl",
        }
    }
}

/// How to stop a running VM (`spec.md` §4.D `stop_vm`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopMode {
    Acpi,
    Poweroff,
    Save,
}

/// `full` or `linked` clone (`spec.md` GLOSSARY "Linked clone").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloneMode {
    Full,
    Linked,
}

/// A fully parsed VM record (`spec.md` §3, `VMRecord`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    pub id: Uuid,
    pub name: String,
    pub state: VmState,
    pub os_type: String,
    pub memory_mb: u64,
    pub cpu_count: u32,
    pub disk_paths: Vec<String>,
    pub network_adapters: Vec<NetworkAdapter>,
    pub firmware: Firmware,
    pub current_snapshot_id: Option<Uuid>,
}

/// Lightweight row used by `list_vms` before a full `showvminfo` merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSummary {
    pub id: Uuid,
    pub name: String,
    pub state: Option<VmState>,
}

/// Storage bus kind (`spec.md` §3, `StorageController`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Bus {
    Ide,
    Sata,
    Scsi,
    #[serde(rename = "NVMe")]
    Nvme,
    Usb,
    Floppy,
}

impl Bus {
    pub fn as_vboxmanage_arg(&self) -> &'static str {
        match self {
            Bus::Ide => "ide",
            Bus::Sata => "sata",
            Bus::Scsi => "scsi",
            Bus::Nvme => "pcie",
            Bus::Usb => "usb",
            Bus::Floppy => "floppy",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageController {
    pub name: String,
    pub bus: Bus,
    pub port_count: u32,
    pub attached_media: Vec<MediumAttachment>,
}

/// `hdd` | `dvd` | `floppy` (`spec.md` §3, `MediumAttachment`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediumType {
    Hdd,
    Dvd,
    Floppy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediumAttachment {
    pub controller_name: String,
    pub port: u32,
    pub device: u32,
    pub medium_type: MediumType,
    pub medium_path: Option<String>,
    pub read_only: bool,
}

/// NIC backing kind (`spec.md` §3, `NetworkAdapter`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NicType {
    Nat,
    Bridged,
    Hostonly,
    Intnet,
    Natnetwork,
    Null,
}

impl NicType {
    pub fn from_vboxmanage(raw: &str) -> Self {
        match raw {
            "bridged" => NicType::Bridged,
            "hostonly" => NicType::Hostonly,
            "intnet" => NicType::Intnet,
            "natnetwork" => NicType::Natnetwork,
            "none" | "null" => NicType::Null,
            _ => NicType::Nat,
        }
    }

    pub fn as_vboxmanage_arg(&self) -> &'static str {
        match self {
            NicType::Nat => "nat",
            NicType::Bridged => "bridged",
            NicType::Hostonly => "hostonly",
            NicType::Intnet => "intnet",
            NicType::Natnetwork => "natnetwork",
            NicType::Null => "null",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatProtocol {
    Tcp,
    Udp,
}

/// A single NAT port-forwarding rule (`spec.md` §3, "NAT rule").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatRule {
    pub name: String,
    pub protocol: NatProtocol,
    pub host_ip: Option<String>,
    pub host_port: u16,
    pub guest_ip: Option<String>,
    pub guest_port: u16,
}

impl NatRule {
    /// Render as the `name,protocol,hostip,hostport,guestip,guestport`
    /// rule string VBoxManage's `--natpf` expects.
    pub fn to_vboxmanage_spec(&self) -> String {
        format!(
            "{},{},{},{},{},{}",
            self.name,
            match self.protocol {
                NatProtocol::Tcp => "tcp",
                NatProtocol::Udp => "udp",
            },
            self.host_ip.as_deref().unwrap_or(""),
            self.host_port,
            self.guest_ip.as_deref().unwrap_or(""),
            self.guest_port,
        )
    }
}

/// Adapter slot + rule name — the §3 "rule names unique per adapter"
/// identity of a NAT rule. Lets the orchestrator reject a duplicate before
/// ever invoking `VBoxManage`, rather than round-tripping to find out.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NatRuleKey {
    pub slot: u8,
    pub name: String,
}

impl NatRuleKey {
    pub fn new(slot: u8, name: impl Into<String>) -> Self {
        Self { slot, name: name.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkAdapter {
    pub slot: u8,
    pub nic_type: NicType,
    pub backing: Option<String>,
    pub mac: Option<String>,
    pub cable_connected: bool,
    pub nat_rules: Vec<NatRule>,
}

/// Host-level shared network resource (`spec.md` §3, `HostOnlyNetwork`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostOnlyNetwork {
    pub name: String,
    pub ipv4_address: Option<String>,
    pub ipv4_netmask: Option<String>,
    pub dhcp_enabled: bool,
}

/// A node in the snapshot forest (`spec.md` §3, `SnapshotNode`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotNode {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub creation_time: chrono::DateTime<chrono::Utc>,
    pub parent_id: Option<Uuid>,
    pub children: Vec<SnapshotNode>,
}

/// The reconstructed snapshot forest for a VM, plus which node is current.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotTree {
    pub roots: Vec<SnapshotNode>,
    pub current_snapshot_id: Option<Uuid>,
}

impl SnapshotTree {
    pub fn empty() -> Self {
        Self {
            roots: Vec::new(),
            current_snapshot_id: None,
        }
    }

    /// Flatten the forest into a flat set of node ids, used by the
    /// round-trip invariant in `spec.md` §8 (2).
    pub fn node_ids(&self) -> std::collections::HashSet<Uuid> {
        fn walk(node: &SnapshotNode, out: &mut std::collections::HashSet<Uuid>) {
            out.insert(node.id);
            for child in &node.children {
                walk(child, out);
            }
        }
        let mut out = std::collections::HashSet::new();
        for root in &self.roots {
            walk(root, &mut out);
        }
        out
    }
}

/// Host-wide static information (`spec.md` §4.D `host_info`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostInfo {
    pub vbox_version: String,
    pub os: String,
    pub logical_cpu_count: u32,
    pub memory_total_mb: u64,
}

/// A single guest-OS type VirtualBox knows how to provision
/// (`spec.md` §4.D `list_os_types`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OsTypeInfo {
    pub id: String,
    pub description: String,
    pub is_64_bit: bool,
}

/// Point-in-time resource metrics (`spec.md` §4.D `get_metrics`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub cpu_load_percent: Option<f64>,
    pub ram_usage_mb: Option<u64>,
    pub disk_usage_mb: Option<u64>,
    pub network_rx_bytes: Option<u64>,
    pub network_tx_bytes: Option<u64>,
    /// Raw counters VBoxManage reported that weren't mapped to a named
    /// field above; kept for forward compatibility.
    pub extra: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_is_only_legal_when_not_already_active() {
        assert!(VmState::PoweredOff.can_transition_to(VmTransition::Start));
        assert!(VmState::Saved.can_transition_to(VmTransition::Start));
        assert!(!VmState::Running.can_transition_to(VmTransition::Start));
        assert!(!VmState::Starting.can_transition_to(VmTransition::Start));
    }

    #[test]
    fn save_state_requires_running_but_acpi_also_accepts_paused() {
        assert!(VmState::Running.can_transition_to(VmTransition::Stop(StopMode::Save)));
        assert!(!VmState::Paused.can_transition_to(VmTransition::Stop(StopMode::Save)));
        assert!(VmState::Paused.can_transition_to(VmTransition::Stop(StopMode::Acpi)));
    }

    #[test]
    fn resume_admits_paused_and_saved_only() {
        assert!(VmState::Paused.can_transition_to(VmTransition::Resume));
        assert!(VmState::Saved.can_transition_to(VmTransition::Resume));
        assert!(!VmState::PoweredOff.can_transition_to(VmTransition::Resume));
    }

    #[test]
    fn restore_snapshot_refuses_a_running_vm() {
        assert!(!VmState::Running.can_transition_to(VmTransition::RestoreSnapshot));
        assert!(VmState::PoweredOff.can_transition_to(VmTransition::RestoreSnapshot));
    }

    #[test]
    fn nat_rule_key_distinguishes_by_slot_as_well_as_name() {
        let a = NatRuleKey::new(0, "ssh");
        let b = NatRuleKey::new(1, "ssh");
        assert_ne!(a, b);
        assert_eq!(a, NatRuleKey::new(0, "ssh".to_string()));
    }
}
