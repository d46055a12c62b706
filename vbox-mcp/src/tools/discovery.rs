//! Discovery Surface — `spec.md` §4.H.

use super::{ToolDescriptor, ToolRegistry};

/// Pure read over an already-built registry. Never invokes VBoxManage and
/// never re-probes Hyper-V — that only happens once, inside
/// [`ToolRegistry::build`] — so calling this repeatedly has no side effects.
pub fn list_tools(registry: &ToolRegistry) -> Vec<ToolDescriptor> {
    registry.list_tools()
}
