//! Stdio transport harness (`spec.md` §6, "concrete (non-normative,
//! supplied-for-completeness) stdio harness").
//!
//! Reads one JSON object per line from stdin: `{"tool": "<name>",
//! "arguments": {...}}`. Writes one envelope per line to stdout. Never lets
//! a malformed request or a handler failure escape as a process exit or
//! unhandled panic — both become `{"success": false, "error": {...}}` on
//! the same transport (`spec.md` §7).

use std::io::Write;
use std::sync::Arc;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use vbox_mcp::config::Config;
use vbox_mcp::process::TokioProcessRunner;
use vbox_mcp::tools::ToolEnvelope;
use vbox_mcp::{logging, Server};
use vbox_mcp_shared::errors::McpError;

#[derive(Debug, Deserialize)]
struct Request {
    tool: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();
    logging::init(config.log_level);

    let runner: Arc<dyn vbox_mcp::process::ProcessRunner> = Arc::new(TokioProcessRunner::new());
    let server = Server::new(&config, runner);

    tracing::info!(mode = ?config.tool_mode, "vbox-mcp-server starting");

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    let stdout = std::io::stdout();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }

        let envelope = match serde_json::from_str::<Request>(&line) {
            Ok(request) => server.handle(&request.tool, request.arguments).await,
            Err(e) => ToolEnvelope::err(McpError::invalid_argument(format!("malformed request: {e}"))),
        };

        let mut out = stdout.lock();
        if let Ok(rendered) = serde_json::to_string(&envelope) {
            let _ = writeln!(out, "{rendered}");
            let _ = out.flush();
        }
    }
}
