//! Hyper-V adjunct (`SPEC_FULL.md` "Supplemental feature: Hyper-V
//! adjunct"). A structural analogue of the [`crate::vbox::VboxOrchestrator`]
//! over PowerShell instead of VBoxManage: same [`ProcessRunner`] contract,
//! same error taxonomy, its own tiny output parser. Gated entirely behind a
//! Windows build and a runtime capability probe — this crate's primary
//! target is VirtualBox, so the whole module is inert everywhere else.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use vbox_mcp_shared::errors::{McpError, McpResult};

use crate::process::ProcessRunner;

#[derive(Debug, Clone, Serialize)]
pub struct HyperVVmSummary {
    pub name: String,
    pub state: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HyperVVmRecord {
    pub name: String,
    pub state: String,
    pub memory_assigned_mb: Option<u64>,
    pub cpu_count: Option<u32>,
    pub generation: Option<u32>,
}

/// Runtime probe for Hyper-V availability, run once at `ToolRegistry`
/// construction time (`spec.md` §4.H) and never again — `list_tools`
/// stays a pure read over the already-decided registration.
#[cfg(target_os = "windows")]
pub fn is_available() -> bool {
    std::process::Command::new("powershell.exe")
        .args(["-NoProfile", "-NonInteractive", "-Command", "Get-Command Get-VM"])
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

#[cfg(not(target_os = "windows"))]
pub fn is_available() -> bool {
    false
}

fn unsupported() -> McpError {
    McpError::internal("Hyper-V support is only available on Windows hosts")
}

#[derive(Clone)]
pub struct HyperVOrchestrator {
    #[allow(dead_code)]
    runner: Arc<dyn ProcessRunner>,
}

impl HyperVOrchestrator {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }

    #[cfg(target_os = "windows")]
    pub async fn list_vms(&self, cancel: CancellationToken) -> McpResult<Vec<HyperVVmSummary>> {
        let out = self
            .runner
            .run(
                std::path::Path::new("powershell.exe"),
                &[
                    "-NoProfile".into(),
                    "-NonInteractive".into(),
                    "-Command".into(),
                    "Get-VM | ConvertTo-Json -Depth 2".into(),
                ],
                None,
                std::time::Duration::from_secs(vbox_mcp_shared::constants::timeouts::QUERY_SECS),
                cancel,
            )
            .await?;
        parse_vm_list(&out.stdout_str())
    }

    #[cfg(not(target_os = "windows"))]
    pub async fn list_vms(&self, _cancel: CancellationToken) -> McpResult<Vec<HyperVVmSummary>> {
        Err(unsupported())
    }

    #[cfg(target_os = "windows")]
    pub async fn get_vm_info(&self, name: &str, cancel: CancellationToken) -> McpResult<HyperVVmRecord> {
        let out = self
            .runner
            .run(
                std::path::Path::new("powershell.exe"),
                &[
                    "-NoProfile".into(),
                    "-NonInteractive".into(),
                    "-Command".into(),
                    format!("Get-VM -Name '{}' | ConvertTo-Json -Depth 2", name.replace('\'', "''")),
                ],
                None,
                std::time::Duration::from_secs(vbox_mcp_shared::constants::timeouts::QUERY_SECS),
                cancel,
            )
            .await?;
        parse_vm_record(&out.stdout_str())
    }

    #[cfg(not(target_os = "windows"))]
    pub async fn get_vm_info(&self, _name: &str, _cancel: CancellationToken) -> McpResult<HyperVVmRecord> {
        Err(unsupported())
    }
}

/// PowerShell's `ConvertTo-Json` renders a single-element result as a bare
/// object rather than a one-element array; both shapes are accepted here.
#[cfg(target_os = "windows")]
fn parse_vm_list(text: &str) -> McpResult<Vec<HyperVVmSummary>> {
    let value: Value = serde_json::from_str(text)?;
    let rows = match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        single => vec![single],
    };
    Ok(rows
        .iter()
        .map(|row| HyperVVmSummary {
            name: row.get("Name").and_then(Value::as_str).unwrap_or_default().to_string(),
            state: row.get("State").map(|v| v.to_string()).unwrap_or_default(),
        })
        .collect())
}

#[cfg(target_os = "windows")]
fn parse_vm_record(text: &str) -> McpResult<HyperVVmRecord> {
    let row: Value = serde_json::from_str(text)?;
    Ok(HyperVVmRecord {
        name: row.get("Name").and_then(Value::as_str).unwrap_or_default().to_string(),
        state: row.get("State").map(|v| v.to_string()).unwrap_or_default(),
        memory_assigned_mb: row.get("MemoryAssigned").and_then(Value::as_u64).map(|bytes| bytes / (1024 * 1024)),
        cpu_count: row.get("ProcessorCount").and_then(Value::as_u64).map(|v| v as u32),
        generation: row.get("Generation").and_then(Value::as_u64).map(|v| v as u32),
    })
}

#[cfg(all(test, target_os = "windows"))]
mod tests {
    use super::*;

    #[test]
    fn parses_single_vm_object_as_one_row() {
        let rows = parse_vm_list(r#"{"Name":"demo","State":3}"#).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "demo");
    }

    #[test]
    fn parses_vm_array() {
        let rows = parse_vm_list(r#"[{"Name":"a","State":3},{"Name":"b","State":2}]"#).unwrap();
        assert_eq!(rows.len(), 2);
    }
}
