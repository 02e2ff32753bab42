//! Line-delimited JSON-RPC transport exposing the tool registry on
//! stdin/stdout. The transport does no argument validation of its own;
//! the registry owns that.

use crate::tools::ToolRegistry;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

const PROTOCOL_VERSION: &str = "2024-11-05";

/// Serve requests until stdin closes.
pub async fn serve_stdio(registry: Arc<ToolRegistry>) -> std::io::Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let Some(response) = handle_line(&registry, &line).await else {
            continue;
        };
        let mut bytes = response.to_string().into_bytes();
        bytes.push(b'\n');
        stdout.write_all(&bytes).await?;
        stdout.flush().await?;
    }
    Ok(())
}

/// Handle one request line; `None` for notifications and unparseable input.
pub async fn handle_line(registry: &ToolRegistry, line: &str) -> Option<Value> {
    let request: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(err) => {
            debug!(event = "rpc_parse_error", error = %err);
            return None;
        }
    };
    let id = request.get("id").cloned();
    let method = request.get("method").and_then(Value::as_str)?;
    // Notifications carry no id and get no response.
    let id = id?;

    let result = match method {
        "initialize" => json!({
            "protocolVersion": PROTOCOL_VERSION,
            "serverInfo": {
                "name": "daibug",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {"tools": {}},
        }),
        "tools/list" => json!({"tools": registry.list()}),
        "tools/call" => {
            let params = request.get("params").cloned().unwrap_or(Value::Null);
            let Some(name) = params.get("name").and_then(Value::as_str) else {
                return Some(error_response(id, -32602, "missing tool name"));
            };
            let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
            let text = registry.call(name, &arguments).await;
            let is_error = serde_json::from_str::<Value>(&text)
                .ok()
                .is_some_and(|v| v.get("error").is_some());
            json!({
                "content": [{"type": "text", "text": text}],
                "isError": is_error,
            })
        }
        other => {
            debug!(event = "rpc_unknown_method", method = other);
            return Some(error_response(id, -32601, "method not found"));
        }
    };

    Some(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message},
    })
}
