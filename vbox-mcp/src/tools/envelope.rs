//! The uniform result envelope every tool call returns (`spec.md` §6).

use serde::Serialize;
use serde_json::Value;
use vbox_mcp_shared::errors::{ErrorDetail, ErrorKind, McpError, McpResult};

/// `{success, data?, error?}` exactly as specified on the wire in §6.
#[derive(Debug, Clone, Serialize)]
pub struct ToolEnvelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<ErrorDetail>,
}

impl ToolEnvelope {
    pub fn ok(data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self {
                success: true,
                data: Some(value),
                error: None,
            },
            Err(e) => Self::err(McpError::from(e)),
        }
    }

    pub fn ok_empty() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }

    pub fn err(error: McpError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorPayload {
                kind: error.kind,
                message: error.message,
                detail: error.detail,
            }),
        }
    }

    pub fn from_result<T: Serialize>(result: McpResult<T>) -> Self {
        match result {
            Ok(value) => Self::ok(value),
            Err(e) => Self::err(e),
        }
    }
}

/// Step 1 of the router's four-step contract (`spec.md` §4.G): validate
/// `action` against the dispatchable set before anything else runs, failing
/// `InvalidArgument` with the §4.G-declared allowed list per the closure
/// property in §8 (3).
///
/// `dispatchable` and `declared` are the same slice for every portmanteau
/// except `vm_management`/`snapshot_management`, where `dispatchable` also
/// admits the job-tracker sub-actions (`jobs_status`/`jobs_cancel`) that
/// `spec.md` §4.G doesn't count as part of the tool's declared action set —
/// those stay callable but don't appear in the enumerated error message.
pub fn require_action(value: &Value, dispatchable: &[&str], declared: &[&str]) -> McpResult<String> {
    let action = value
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| McpError::invalid_argument("missing required `action` parameter"))?;
    if !dispatchable.contains(&action) {
        return Err(McpError::invalid_argument(format!(
            "action must be one of [{}]",
            declared.join(", ")
        )));
    }
    Ok(action.to_string())
}

/// Step 2-3 of the router's contract: extract and type/range-validate the
/// parameters for the already-validated action. Extra fields in
/// `arguments` that the target action's parameter struct doesn't declare
/// are ignored by serde's default behavior, matching §4.G's "extra
/// parameters are ignored" rule; a missing required field surfaces as
/// `InvalidArgument` rather than a raw deserialization error.
pub fn parse_params<T: serde::de::DeserializeOwned>(value: &Value) -> McpResult<T> {
    serde_json::from_value(value.clone()).map_err(|e| McpError::invalid_argument(format!("invalid parameters: {e}")))
}
