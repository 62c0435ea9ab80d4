//! MCP (Model Context Protocol) JSON-RPC handler.
//!
//! Implements the [MCP specification](https://spec.modelcontextprotocol.io/)
//! over stdio — reads JSON-RPC 2.0 requests from stdin (one per line) and
//! writes responses to stdout. Logging goes exclusively to stderr; stdout
//! carries nothing but the protocol stream.
//!
//! ## Supported methods
//!
//! | Method              | Description                      |
//! |---------------------|----------------------------------|
//! | `initialize`        | Handshake, returns capabilities  |
//! | `tools/list`        | List available tool definitions  |
//! | `tools/call`        | Execute a tool and return result |
//! | `ping`              | Liveness check                   |
//!
//! `tools/call` requests run as spawned tasks so the read loop keeps
//! consuming notifications while a call is in flight; a
//! `notifications/cancelled` for an active request fires its cancellation
//! token and the handler answers with a `cancelled` envelope.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::registry::AppContext;
use crate::tools;

const SERVER_NAME: &str = "mcp-fleet";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");
const PROTOCOL_VERSION: &str = "2024-11-05";

/// Cancellation tokens for in-flight tool calls, keyed by the canonical JSON
/// of the request id.
type InflightMap = Arc<Mutex<HashMap<String, CancellationToken>>>;

fn id_key(id: &Value) -> String {
    id.to_string()
}

/// Run the MCP server on stdio, processing JSON-RPC requests until EOF.
pub async fn run_stdio(ctx: Arc<AppContext>) {
    let stdin = tokio::io::stdin();
    let mut reader = BufReader::new(stdin);
    let mut line = String::new();

    // All responses funnel through one writer task so concurrent tool calls
    // cannot interleave partial lines on stdout.
    let (tx, mut rx) = mpsc::channel::<Value>(32);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(response) = rx.recv().await {
            write_response(&mut stdout, &response).await;
        }
    });

    let inflight: InflightMap = Arc::new(Mutex::new(HashMap::new()));

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "stdin read error");
                break;
            }
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                let response = json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": {
                        "code": -32700,
                        "message": format!("Parse error: {}", e)
                    }
                });
                let _ = tx.send(response).await;
                continue;
            }
        };

        let id = request.get("id").cloned();
        let method = request.get("method").and_then(Value::as_str).unwrap_or("");

        // Notifications carry no id and get no response.
        let Some(id) = id else {
            match method {
                "notifications/initialized" => {}
                "notifications/cancelled" => {
                    handle_cancelled(&request, &inflight).await;
                }
                other => {
                    tracing::debug!(method = other, "unknown notification");
                }
            }
            continue;
        };

        match method {
            "initialize" => {
                let _ = tx.send(inject_id(handle_initialize(), id)).await;
            }
            "tools/list" => {
                let response = json!({
                    "jsonrpc": "2.0",
                    "result": { "tools": tools::tool_definitions() }
                });
                let _ = tx.send(inject_id(response, id)).await;
            }
            "tools/call" => {
                spawn_tool_call(&request, id, ctx.clone(), inflight.clone(), tx.clone()).await;
            }
            "ping" => {
                let _ = tx
                    .send(json!({ "jsonrpc": "2.0", "id": id, "result": {} }))
                    .await;
            }
            other => {
                let response = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {
                        "code": -32601,
                        "message": format!("Method not found: {}", other)
                    }
                });
                let _ = tx.send(response).await;
            }
        }
    }

    drop(tx);
    let _ = writer.await;
}

/// Handle `initialize` — protocol version, capabilities, and server info.
fn handle_initialize() -> Value {
    json!({
        "jsonrpc": "2.0",
        "result": {
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "tools": {}
            },
            "serverInfo": {
                "name": SERVER_NAME,
                "version": SERVER_VERSION
            }
        }
    })
}

/// Fire the cancellation token of an in-flight request, if it is still
/// running.
async fn handle_cancelled(request: &Value, inflight: &InflightMap) {
    let Some(request_id) = request.pointer("/params/requestId") else {
        return;
    };
    let key = id_key(request_id);
    if let Some(token) = inflight.lock().await.get(&key) {
        token.cancel();
        tracing::info!(request_id = %key, "cancellation requested");
    }
}

/// Run a `tools/call` as its own task so the read loop stays responsive. The
/// cancellation token is registered before the task starts, so a cancel
/// notification can never race past its own request.
async fn spawn_tool_call(
    request: &Value,
    id: Value,
    ctx: Arc<AppContext>,
    inflight: InflightMap,
    tx: mpsc::Sender<Value>,
) {
    let params = request.get("params").cloned().unwrap_or(json!({}));
    let key = id_key(&id);
    let token = CancellationToken::new();
    inflight.lock().await.insert(key.clone(), token.clone());

    tokio::spawn(async move {
        let name = params.get("name").and_then(Value::as_str).unwrap_or("");
        let args = params.get("arguments").cloned().unwrap_or(json!({}));
        let result = tools::handle_tool_call(name, &args, &ctx, token).await;

        inflight.lock().await.remove(&key);

        let mut response_result = json!({ "content": result.content });
        if result.is_error {
            response_result["isError"] = json!(true);
        }
        let response = json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": response_result
        });
        let _ = tx.send(response).await;
    });
}

/// Inject the request `id` into a response object.
fn inject_id(mut response: Value, id: Value) -> Value {
    response["id"] = id;
    response
}

/// Write a JSON-RPC response to stdout (one line, flushed immediately).
async fn write_response(stdout: &mut tokio::io::Stdout, response: &Value) {
    let mut output = serde_json::to_string(response).unwrap_or_default();
    output.push('\n');
    if let Err(e) = stdout.write_all(output.as_bytes()).await {
        tracing::error!(error = %e, "stdout write error");
    }
    if let Err(e) = stdout.flush().await {
        tracing::error!(error = %e, "stdout flush error");
    }
}
