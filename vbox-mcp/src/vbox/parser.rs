//! Output Parser — `spec.md` §4.B.
//!
//! Three parsing modes: `--machinereadable` key=value dumps, tabular
//! `Key: value` blocks, and free-form progress/status text. Per the
//! module's invariants, unknown keys are tolerated and a `ParseError` is
//! only raised when a *mandatory* field is structurally absent — these
//! functions themselves never panic on malformed input.

use indexmap::IndexMap;
use uuid::Uuid;
use vbox_mcp_shared::errors::{ErrorKind, McpError, McpResult};

use super::types::*;

/// Parse a `--machinereadable` dump into an ordered key→value mapping.
///
/// Keys may repeat (e.g. `nic1`, `nic2`, ...); later duplicate keys
/// overwrite earlier ones, matching how VBoxManage never actually repeats
/// a *scalar* key (only the numeric suffix varies).
pub fn parse_machinereadable(text: &str) -> IndexMap<String, String> {
    let mut out = IndexMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(eq) = line.find('=') else {
            continue;
        };
        let key = line[..eq].trim().to_string();
        let mut value = line[eq + 1..].trim();

        if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
            value = &value[1..value.len() - 1];
        }
        let unescaped = value.replace("\\\"", "\"").replace("\\\\", "\\");

        // "none" and empty values are normalized to absent per spec.md §4.B.
        if unescaped.is_empty() || unescaped == "none" {
            out.insert(key, String::new());
        } else {
            out.insert(key, unescaped);
        }
    }
    out
}

/// Get a machinereadable value, treating empty string (the normalized form
/// of `"none"`/empty) as absent.
pub fn get_present(map: &IndexMap<String, String>, key: &str) -> Option<String> {
    map.get(key).filter(|v| !v.is_empty()).cloned()
}

/// Parse VBoxManage's blank-line-separated `Key: value` tabular output
/// (`list runningvms`, `list hostonlyifs`, ...) into one mapping per record.
pub fn parse_tabular(text: &str) -> Vec<IndexMap<String, String>> {
    let mut records = Vec::new();
    let mut current = IndexMap::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if !current.is_empty() {
                records.push(std::mem::take(&mut current));
            }
            continue;
        }
        if let Some(colon) = trimmed.find(':') {
            let key = trimmed[..colon].trim().to_string();
            let value = trimmed[colon + 1..].trim().to_string();
            current.insert(key, value);
        }
    }
    if !current.is_empty() {
        records.push(current);
    }
    records
}

/// Extract the highest monotonic percent seen in free-form progress text
/// (`spec.md` §4.B mode 3, and Design Notes §9: "rely on percent numerals
/// only").
pub fn parse_progress(text: &str) -> u8 {
    let mut highest = 0u8;
    let mut digits = String::new();

    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
        } else {
            if ch == '%'
                && let Ok(value) = digits.parse::<u32>()
            {
                highest = highest.max(value.min(100) as u8);
            }
            digits.clear();
        }
    }
    highest
}

/// Build a [`VmRecord`] from a `showvminfo --machinereadable` dump.
///
/// Fails with `ParseError` only if `UUID` or `name` — the two fields the
/// record cannot exist without — are missing; every other field defaults.
pub fn build_vm_record(map: &IndexMap<String, String>) -> McpResult<VmRecord> {
    let id = map
        .get("UUID")
        .ok_or_else(|| McpError::new(ErrorKind::ParseError, "showvminfo output missing UUID"))
        .and_then(|raw| {
            Uuid::parse_str(raw)
                .map_err(|e| McpError::new(ErrorKind::ParseError, format!("invalid UUID: {e}")))
        })?;

    let name = map
        .get("name")
        .cloned()
        .ok_or_else(|| McpError::new(ErrorKind::ParseError, "showvminfo output missing name"))?;

    let state = map
        .get("VMState")
        .map(|s| VmState::from_vboxmanage(s))
        .unwrap_or(VmState::Other);

    let os_type = get_present(map, "ostype").unwrap_or_default();
    let memory_mb = get_present(map, "memory")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let cpu_count = get_present(map, "cpus")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);

    let firmware = match get_present(map, "firmware").as_deref() {
        Some("EFI") | Some("efi") => Firmware::Efi,
        _ => Firmware::Bios,
    };

    // `showvminfo --machinereadable` names per-slot medium keys
    // `<Controller>-ImageUUID-<port>-<device>`; only the `-0-0` (primary
    // master) slot holds a disk image path for the common single-disk case.
    let mut disk_paths: Vec<String> = map
        .iter()
        .filter(|(key, value)| key.ends_with("-ImageUUID-0-0") && !value.is_empty())
        .map(|(_, value)| value.clone())
        .collect();
    disk_paths.sort();

    let network_adapters = build_network_adapters(map);

    let current_snapshot_id = get_present(map, "CurrentSnapshotUUID").and_then(|v| Uuid::parse_str(&v).ok());

    Ok(VmRecord {
        id,
        name,
        state,
        os_type,
        memory_mb,
        cpu_count,
        disk_paths,
        network_adapters,
        firmware,
        current_snapshot_id,
    })
}

/// Build the up-to-4 network adapters from `nicN`/`macaddressN`/
/// `cableconnectedN`/`natpfN` keys. A slot with `type="null"` contributes
/// no adapter (`spec.md` §4.B).
pub fn build_network_adapters(map: &IndexMap<String, String>) -> Vec<NetworkAdapter> {
    let mut adapters = Vec::new();

    for slot in 0u8..4 {
        let n = slot + 1;
        let Some(nic_raw) = get_present(map, &format!("nic{n}")) else {
            continue;
        };
        let nic_type = NicType::from_vboxmanage(&nic_raw);
        if nic_type == NicType::Null {
            continue;
        }

        let backing = get_present(map, &format!("bridgeadapter{n}"))
            .or_else(|| get_present(map, &format!("hostonlyadapter{n}")))
            .or_else(|| get_present(map, &format!("intnet{n}")))
            .or_else(|| get_present(map, &format!("natnet{n}")));

        let mac = get_present(map, &format!("macaddress{n}"));
        let cable_connected = get_present(map, &format!("cableconnected{n}"))
            .map(|v| v == "on")
            .unwrap_or(true);

        let nat_prefix = format!("natpf{n}");
        let mut nat_rules: Vec<NatRule> = map
            .iter()
            .filter(|(key, _)| key.starts_with(&nat_prefix))
            .filter_map(|(_, value)| parse_nat_rule(value))
            .collect();
        nat_rules.sort_by(|a, b| a.name.cmp(&b.name));

        adapters.push(NetworkAdapter {
            slot,
            nic_type,
            backing,
            mac,
            cable_connected,
            nat_rules,
        });
    }

    adapters
}

/// Parse a single `name,protocol,hostip,hostport,guestip,guestport` NAT
/// rule string as emitted by `showvminfo --machinereadable`'s `natpfN`
/// keys (or accepted back on `--natpf`).
pub fn parse_nat_rule(raw: &str) -> Option<NatRule> {
    let parts: Vec<&str> = raw.split(',').collect();
    if parts.len() != 6 {
        return None;
    }
    let protocol = match parts[1].to_ascii_lowercase().as_str() {
        "tcp" => NatProtocol::Tcp,
        "udp" => NatProtocol::Udp,
        _ => return None,
    };
    let host_port = parts[3].parse().ok()?;
    let guest_port = parts[5].parse().ok()?;
    Some(NatRule {
        name: parts[0].to_string(),
        protocol,
        host_ip: (!parts[2].is_empty()).then(|| parts[2].to_string()),
        host_port,
        guest_ip: (!parts[4].is_empty()).then(|| parts[4].to_string()),
        guest_port,
    })
}

/// Reconstruct the snapshot forest from `showvminfo --machinereadable`'s
/// `SnapshotName-N`, `SnapshotUUID-N`, `SnapshotParentUUID-N`, and
/// `CurrentSnapshotUUID` keys (`spec.md` §4.D `list_snapshots`).
pub fn build_snapshot_tree(map: &IndexMap<String, String>) -> SnapshotTree {
    let mut flat: Vec<(Uuid, SnapshotNode)> = Vec::new();

    for i in 0.. {
        let Some(name) = get_present(map, &format!("SnapshotName-{i}")) else {
            break;
        };
        let Some(id) = get_present(map, &format!("SnapshotUUID-{i}")).and_then(|v| Uuid::parse_str(&v).ok())
        else {
            break;
        };
        let description = get_present(map, &format!("SnapshotDescription-{i}")).unwrap_or_default();
        let parent_id = get_present(map, &format!("SnapshotParentUUID-{i}")).and_then(|v| Uuid::parse_str(&v).ok());
        let creation_time = get_present(map, &format!("SnapshotTimestamp-{i}"))
            .and_then(|v| chrono::DateTime::parse_from_rfc3339(&v).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(chrono::Utc::now);

        flat.push((
            id,
            SnapshotNode {
                id,
                name,
                description,
                creation_time,
                parent_id,
                children: Vec::new(),
            },
        ));
    }

    let current_snapshot_id =
        get_present(map, "CurrentSnapshotUUID").and_then(|v| Uuid::parse_str(&v).ok());

    assemble_forest(flat, current_snapshot_id)
}

fn assemble_forest(flat: Vec<(Uuid, SnapshotNode)>, current_snapshot_id: Option<Uuid>) -> SnapshotTree {
    use std::collections::HashMap;

    let mut by_id: HashMap<Uuid, SnapshotNode> = flat.into_iter().collect();
    let ids: Vec<Uuid> = by_id.keys().copied().collect();
    let mut children_of: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    let mut roots = Vec::new();

    for id in &ids {
        let parent = by_id.get(id).and_then(|n| n.parent_id);
        match parent {
            Some(parent_id) if by_id.contains_key(&parent_id) => {
                children_of.entry(parent_id).or_default().push(*id);
            }
            _ => roots.push(*id),
        }
    }

    fn build(id: Uuid, by_id: &mut std::collections::HashMap<Uuid, SnapshotNode>, children_of: &std::collections::HashMap<Uuid, Vec<Uuid>>) -> SnapshotNode {
        let mut node = by_id.remove(&id).expect("node present by construction");
        if let Some(child_ids) = children_of.get(&id) {
            for child_id in child_ids {
                node.children.push(build(*child_id, by_id, children_of));
            }
        }
        node
    }

    let root_nodes = roots
        .into_iter()
        .map(|id| build(id, &mut by_id, &children_of))
        .collect();

    SnapshotTree {
        roots: root_nodes,
        current_snapshot_id,
    }
}

/// Build the VM's storage controllers from `showvminfo --machinereadable`'s
/// `storagecontrollername<N>` / `storagecontrollertype<N>` /
/// `storagecontrollermaxportcount<N>` keys, plus the per-port/device medium
/// attachments nested under each controller's name prefix
/// (`spec.md` §3 `StorageController` / `MediumAttachment`).
pub fn build_storage_controllers(map: &IndexMap<String, String>) -> Vec<StorageController> {
    let mut controllers = Vec::new();

    for i in 0.. {
        let Some(name) = get_present(map, &format!("storagecontrollername{i}")) else {
            break;
        };
        let bus = match get_present(map, &format!("storagecontrollertype{i}")).as_deref() {
            Some("IntelAhci") => Bus::Sata,
            Some("PIIX3") | Some("PIIX4") => Bus::Ide,
            Some("LsiLogic") | Some("LsiLogicSas") | Some("BusLogic") => Bus::Scsi,
            Some("NVMe") => Bus::Nvme,
            Some("USB") => Bus::Usb,
            Some("I82078") => Bus::Floppy,
            _ => Bus::Sata,
        };
        let port_count = get_present(map, &format!("storagecontrollermaxportcount{i}"))
            .or_else(|| get_present(map, &format!("storagecontrollerportcount{i}")))
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);

        let attached_media = build_medium_attachments(map, &name);
        controllers.push(StorageController {
            name,
            bus,
            port_count,
            attached_media,
        });
    }

    controllers
}

fn build_medium_attachments(map: &IndexMap<String, String>, controller_name: &str) -> Vec<MediumAttachment> {
    let mut out = Vec::new();
    for port in 0u32..16 {
        for device in 0u32..2 {
            let path_key = format!("{controller_name}-{port}-{device}");
            let Some(path) = get_present(map, &path_key) else {
                continue;
            };
            let type_key = format!("{controller_name}-ImageUUID-{port}-{device}");
            let medium_type = if map.contains_key(&type_key) { MediumType::Hdd } else { MediumType::Dvd };
            out.push(MediumAttachment {
                controller_name: controller_name.to_string(),
                port,
                device,
                medium_type,
                medium_path: Some(path),
                read_only: medium_type == MediumType::Dvd,
            });
        }
    }
    out
}

/// Parse `VBoxManage list vms` / `list runningvms` output: one
/// `"name" {uuid}` line per machine. Neither form is a `--machinereadable`
/// dump nor a `Key: value` table, so it gets its own tiny line grammar.
pub fn parse_list_vms(text: &str) -> Vec<(String, Uuid)> {
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        let Some(name_end) = line.strip_prefix('"').and_then(|rest| rest.find('"')) else {
            continue;
        };
        let name = line[1..1 + name_end].to_string();
        let rest = line[2 + name_end..].trim();
        let Some(uuid_raw) = rest.strip_prefix('{').and_then(|r| r.strip_suffix('}')) else {
            continue;
        };
        if let Ok(id) = Uuid::parse_str(uuid_raw) {
            out.push((name, id));
        }
    }
    out
}

/// Build a [`HostOnlyNetwork`] from a `list hostonlyifs`-style tabular
/// record (`spec.md` §4.B mode 2).
pub fn build_hostonly_network(record: &IndexMap<String, String>) -> Option<HostOnlyNetwork> {
    let name = record.get("Name").cloned()?;
    Some(HostOnlyNetwork {
        name,
        ipv4_address: record.get("IPAddress").filter(|v| !v.is_empty()).cloned(),
        ipv4_netmask: record.get("NetworkMask").filter(|v| !v.is_empty()).cloned(),
        dhcp_enabled: record
            .get("DHCP")
            .map(|v| v.eq_ignore_ascii_case("enabled"))
            .unwrap_or(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machinereadable_parses_quoted_and_bare_values() {
        let input = "name=\"my-vm\"\nmemory=2048\nostype=\"Ubuntu_64\"\n";
        let map = parse_machinereadable(input);
        assert_eq!(map.get("name").unwrap(), "my-vm");
        assert_eq!(map.get("memory").unwrap(), "2048");
    }

    #[test]
    fn machinereadable_normalizes_none_and_empty() {
        let input = "usbattached=\"none\"\nemptyval=\"\"\n";
        let map = parse_machinereadable(input);
        assert_eq!(get_present(&map, "usbattached"), None);
        assert_eq!(get_present(&map, "emptyval"), None);
    }

    #[test]
    fn machinereadable_ignores_lines_without_equals() {
        let input = "not a kv line\nkey=value\n";
        let map = parse_machinereadable(input);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn machinereadable_unescapes_quotes() {
        let input = r#"description="a \"quoted\" value""#;
        let map = parse_machinereadable(input);
        assert_eq!(map.get("description").unwrap(), "a \"quoted\" value");
    }

    #[test]
    fn tabular_splits_on_blank_lines() {
        let input = "Name: vboxnet0\nIPAddress: 192.168.56.1\n\nName: vboxnet1\nIPAddress: 192.168.57.1\n";
        let records = parse_tabular(input);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("Name").unwrap(), "vboxnet0");
        assert_eq!(records[1].get("Name").unwrap(), "vboxnet1");
    }

    #[test]
    fn progress_tracks_running_maximum() {
        assert_eq!(parse_progress("0%...10%...25%...9%...100%"), 100);
        assert_eq!(parse_progress("Progress state: VBOX_E_FAIL"), 0);
    }

    #[test]
    fn build_vm_record_requires_uuid_and_name() {
        let map = parse_machinereadable("memory=1024\n");
        assert!(build_vm_record(&map).is_err());
    }

    #[test]
    fn build_vm_record_defaults_missing_fields() {
        let uuid = Uuid::new_v4();
        let input = format!("UUID=\"{uuid}\"\nname=\"demo\"\n");
        let map = parse_machinereadable(&input);
        let record = build_vm_record(&map).unwrap();
        assert_eq!(record.id, uuid);
        assert_eq!(record.name, "demo");
        assert_eq!(record.memory_mb, 0);
        assert_eq!(record.state, VmState::Other);
    }

    #[test]
    fn network_adapter_null_type_is_skipped() {
        let input = "nic1=\"null\"\nnic2=\"nat\"\nmacaddress2=\"080027000000\"\n";
        let map = parse_machinereadable(input);
        let adapters = build_network_adapters(&map);
        assert_eq!(adapters.len(), 1);
        assert_eq!(adapters[0].slot, 1);
    }

    #[test]
    fn nat_rule_round_trips_through_vboxmanage_spec() {
        let rule = NatRule {
            name: "ssh".to_string(),
            protocol: NatProtocol::Tcp,
            host_ip: None,
            host_port: 2222,
            guest_ip: None,
            guest_port: 22,
        };
        assert_eq!(rule.to_vboxmanage_spec(), "ssh,tcp,,2222,,22");
        let parsed = parse_nat_rule(&rule.to_vboxmanage_spec()).unwrap();
        assert_eq!(parsed.host_port, 2222);
        assert_eq!(parsed.guest_port, 22);
    }

    #[test]
    fn storage_controllers_parse_with_nested_attachments() {
        let input = "storagecontrollername0=\"SATA\"\nstoragecontrollertype0=\"IntelAhci\"\nstoragecontrollermaxportcount0=\"4\"\nSATA-0-0=\"/vms/demo/demo.vdi\"\n";
        let map = parse_machinereadable(input);
        let controllers = build_storage_controllers(&map);
        assert_eq!(controllers.len(), 1);
        assert_eq!(controllers[0].bus, Bus::Sata);
        assert_eq!(controllers[0].attached_media.len(), 1);
        assert_eq!(controllers[0].attached_media[0].medium_path.as_deref(), Some("/vms/demo/demo.vdi"));
    }

    #[test]
    fn list_vms_parses_quoted_name_and_braced_uuid() {
        let uuid = Uuid::new_v4();
        let input = format!("\"spec-vm-1\" {{{uuid}}}\n\"spec-vm-2\" {{{uuid}}}\n");
        let rows = parse_list_vms(&input);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "spec-vm-1");
        assert_eq!(rows[0].1, uuid);
    }

    #[test]
    fn snapshot_tree_assembles_forest() {
        let root_id = Uuid::new_v4();
        let child_id = Uuid::new_v4();
        let input = format!(
            "SnapshotName-0=\"root\"\nSnapshotUUID-0=\"{root_id}\"\nSnapshotName-1=\"child\"\nSnapshotUUID-1=\"{child_id}\"\nSnapshotParentUUID-1=\"{root_id}\"\nCurrentSnapshotUUID=\"{child_id}\"\n"
        );
        let map = parse_machinereadable(&input);
        let tree = build_snapshot_tree(&map);
        assert_eq!(tree.roots.len(), 1);
        assert_eq!(tree.roots[0].id, root_id);
        assert_eq!(tree.roots[0].children.len(), 1);
        assert_eq!(tree.roots[0].children[0].id, child_id);
        assert_eq!(tree.current_snapshot_id, Some(child_id));
    }
}
