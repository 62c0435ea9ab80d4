//! MCP tool definitions, dispatch, and the timing/logging facade.
//!
//! Each tool is defined as a JSON schema (returned by [`tool_definitions`])
//! and handled by an async function dispatched from [`handle_tool_call`].
//! The facade wraps every call with a monotonic timer and emits exactly one
//! structured log line per invocation; any failure becomes a serialized
//! envelope — handlers never panic out and no exception type names are
//! emitted.
//!
//! ## Tools
//!
//! | Tool | Extra args |
//! |------|------------|
//! | `check_node_pool_pressure` | — |
//! | `get_pod_health` | `namespace?`, `status_filter` |
//! | `get_kubernetes_upgrade_status` | — |
//! | `get_upgrade_progress` | `node_pool?` |
//! | `get_upgrade_duration_metrics` | `node_pool`, `history_count` |
//! | `check_pdb_upgrade_risk` | `node_pool?`, `mode` |
//!
//! Every tool takes `cluster`: a composite ID (`<env>-<region>`) or `all`.

pub mod classify;
pub mod node_pools;
pub mod pdb_check;
pub mod pod_health;
pub mod upgrade_metrics;
pub mod upgrade_progress;
pub mod upgrade_status;

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::envelope::{ErrorEnvelope, HandlerError, ToolError};
use crate::registry::AppContext;

/// Returns all six tool definitions.
pub fn tool_definitions() -> Vec<Value> {
    vec![
        json!({
            "name": "check_node_pool_pressure",
            "description": "Check CPU and memory pressure levels for node pools in an AKS cluster. Returns per-pool request ratios, live usage when available, pending pod counts, and a pressure level (ok/warning/critical). Use this when investigating node resource exhaustion or autoscaler headroom.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "cluster": {
                        "type": "string",
                        "description": "Cluster ID (e.g. 'prod-eastus') or 'all' for a fleet-wide query."
                    }
                },
                "required": ["cluster"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "get_pod_health",
            "description": "Get diagnostics for failed and pending pods in an AKS cluster. Returns pods grouped by failure category (scheduling/runtime/registry/config), with restart counts, event context, and OOMKill detection. Results are capped at 50 pods.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "cluster": {
                        "type": "string",
                        "description": "Cluster ID (e.g. 'prod-eastus') or 'all' for a fleet-wide query."
                    },
                    "namespace": {
                        "type": "string",
                        "description": "Filter to a specific namespace. Omit for all namespaces."
                    },
                    "status_filter": {
                        "type": "string",
                        "description": "Filter by pod status. Default 'all'.",
                        "enum": ["pending", "failed", "all"]
                    }
                },
                "required": ["cluster"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "get_kubernetes_upgrade_status",
            "description": "Get Kubernetes version and upgrade status for AKS clusters. Returns control plane version, per-node-pool versions, available upgrades, support status, and end-of-support warnings. Detects active in-flight upgrades.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "cluster": {
                        "type": "string",
                        "description": "Cluster ID (e.g. 'prod-eastus') or 'all' for a fleet-wide version table."
                    }
                },
                "required": ["cluster"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "get_upgrade_progress",
            "description": "Track per-node progress during an in-flight AKS upgrade. Returns each node's state (upgraded/upgrading/cordoned/pdb_blocked/pending/stalled), elapsed and estimated remaining time, anomaly detection, and a rollup of pods disrupted by the upgrade.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "cluster": {
                        "type": "string",
                        "description": "Cluster ID (e.g. 'prod-eastus') or 'all' for a fleet-wide query."
                    },
                    "node_pool": {
                        "type": "string",
                        "description": "Filter to a specific node pool. Omit for all upgrading pools."
                    }
                },
                "required": ["cluster"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "get_upgrade_duration_metrics",
            "description": "Get upgrade duration metrics: current-run per-node timing from the events stream, plus historical upgrade durations from the cloud audit log with mean, P90, min, and max. Flags runs exceeding the expected baseline.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "cluster": {
                        "type": "string",
                        "description": "Cluster ID (e.g. 'prod-eastus') or 'all' for a fleet-wide query."
                    },
                    "node_pool": {
                        "type": "string",
                        "description": "The node pool to query duration metrics for."
                    },
                    "history_count": {
                        "type": "integer",
                        "description": "Number of historical records to retrieve (1-50). Default 5."
                    }
                },
                "required": ["cluster", "node_pool"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "check_pdb_upgrade_risk",
            "description": "Check PodDisruptionBudget risks that could block AKS upgrades. In preflight mode, evaluates all PDBs for drain-block risk before an upgrade starts. In live mode, identifies PDBs currently blocking eviction on cordoned nodes, with block durations.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "cluster": {
                        "type": "string",
                        "description": "Cluster ID (e.g. 'prod-eastus') or 'all' for a fleet-wide query."
                    },
                    "node_pool": {
                        "type": "string",
                        "description": "Filter to PDBs affecting pods on this pool. Omit for cluster-wide."
                    },
                    "mode": {
                        "type": "string",
                        "description": "'preflight' to evaluate risk before an upgrade, 'live' for active block detection. Default 'preflight'.",
                        "enum": ["preflight", "live"]
                    }
                },
                "required": ["cluster"],
                "additionalProperties": false
            }
        }),
    ]
}

/// Result of an MCP tool call, ready to be serialized into a JSON-RPC
/// response.
pub struct ToolResult {
    /// MCP content blocks (a single `{"type":"text","text":"..."}` entry).
    pub content: Vec<Value>,
    /// Whether the call failed outright (maps to `isError`).
    pub is_error: bool,
}

impl ToolResult {
    fn success(value: Value) -> Self {
        let text = serde_json::to_string_pretty(&value).unwrap_or_default();
        Self {
            content: vec![json!({ "type": "text", "text": text })],
            is_error: false,
        }
    }

    fn failure(value: Value) -> Self {
        let mut result = Self::success(value);
        result.is_error = true;
        result
    }

    fn error(message: String) -> Self {
        Self {
            content: vec![json!({ "type": "text", "text": message })],
            is_error: true,
        }
    }

    fn first_text(&self) -> &str {
        self.content
            .first()
            .and_then(|c| c.get("text"))
            .and_then(Value::as_str)
            .unwrap_or("")
    }
}

/// Serialize a payload, scrub it, and wrap it as a successful result.
/// Serialization goes through `serde_json::Value`, whose object maps are
/// ordered, so two identical invocations produce byte-identical JSON.
fn respond<T: Serialize>(ctx: &AppContext, payload: &T) -> ToolResult {
    match serde_json::to_value(payload) {
        Ok(mut value) => {
            ctx.scrubber.scrub_value(&mut value);
            ToolResult::success(value)
        }
        Err(_) => ToolResult::error("Internal serialization failure".to_string()),
    }
}

/// A handler failed without producing payload: single-error envelope.
fn respond_handler_error(ctx: &AppContext, cluster: &str, err: &HandlerError) -> ToolResult {
    let envelope = ErrorEnvelope::single(cluster, err.to_tool_error(cluster));
    match serde_json::to_value(&envelope) {
        Ok(mut value) => {
            ctx.scrubber.scrub_value(&mut value);
            ToolResult::failure(value)
        }
        Err(_) => ToolResult::error("Internal serialization failure".to_string()),
    }
}

/// A validation failure: reported before any client is invoked.
fn respond_validation(ctx: &AppContext, cluster: &str, message: String) -> ToolResult {
    let envelope = ErrorEnvelope::single(cluster, ToolError::validation(cluster, message));
    match serde_json::to_value(&envelope) {
        Ok(mut value) => {
            ctx.scrubber.scrub_value(&mut value);
            ToolResult::failure(value)
        }
        Err(_) => ToolResult::error("Internal serialization failure".to_string()),
    }
}

fn cancelled_result(ctx: &AppContext, cluster: &str) -> ToolResult {
    let envelope = ErrorEnvelope::single(cluster, ToolError::cancelled(cluster));
    match serde_json::to_value(&envelope) {
        Ok(mut value) => {
            ctx.scrubber.scrub_value(&mut value);
            ToolResult::failure(value)
        }
        Err(_) => ToolResult::error("Internal serialization failure".to_string()),
    }
}

/// Handle a tool call: dispatch, honor cancellation, time the invocation, and
/// emit the structured log line.
pub async fn handle_tool_call(
    name: &str,
    args: &Value,
    ctx: &Arc<AppContext>,
    cancel: CancellationToken,
) -> ToolResult {
    let started = Instant::now();
    let cluster = args
        .get("cluster")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let fut = dispatch(name, args, ctx);
    tokio::pin!(fut);
    let result = tokio::select! {
        biased;
        () = cancel.cancelled() => cancelled_result(ctx, &cluster),
        result = &mut fut => result,
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    if result.is_error {
        let error = ctx.scrubber.scrub_text(result.first_text());
        tracing::error!(tool = name, cluster = %cluster, elapsed_ms, outcome = "error", error = %error);
    } else {
        tracing::info!(tool = name, cluster = %cluster, elapsed_ms, outcome = "ok");
    }
    result
}

async fn dispatch(name: &str, args: &Value, ctx: &Arc<AppContext>) -> ToolResult {
    match name {
        "check_node_pool_pressure" => node_pools::run(ctx, args).await,
        "get_pod_health" => pod_health::run(ctx, args).await,
        "get_kubernetes_upgrade_status" => upgrade_status::run(ctx, args).await,
        "get_upgrade_progress" => upgrade_progress::run(ctx, args).await,
        "get_upgrade_duration_metrics" => upgrade_metrics::run(ctx, args).await,
        "check_pdb_upgrade_risk" => pdb_check::run(ctx, args).await,
        _ => ToolResult::error(format!("Unknown tool: {name}")),
    }
}

/// Pull the required `cluster` argument out of the call.
fn cluster_arg(args: &Value) -> Result<&str, ToolResult> {
    args.get("cluster")
        .and_then(Value::as_str)
        .ok_or_else(|| ToolResult::error("Missing required parameter: cluster".to_string()))
}


#[cfg(test)]
mod tests {
    use super::testutil::{context_with, payload};
    use super::*;
    use crate::clients::mock::StaticSources;

    #[test]
    fn definitions_cover_all_six_tools() {
        let names: Vec<String> = tool_definitions()
            .iter()
            .map(|d| d["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "check_node_pool_pressure",
                "get_pod_health",
                "get_kubernetes_upgrade_status",
                "get_upgrade_progress",
                "get_upgrade_duration_metrics",
                "check_pdb_upgrade_risk",
            ]
        );
        for def in tool_definitions() {
            assert!(def["inputSchema"]["properties"]["cluster"].is_object());
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let ctx = context_with(vec![("dev-eastus", StaticSources::default())]);
        let result = handle_tool_call(
            "does_not_exist",
            &serde_json::json!({}),
            &ctx,
            CancellationToken::new(),
        )
        .await;
        assert!(result.is_error);
        assert!(result.first_text().contains("Unknown tool"));
    }

    #[tokio::test]
    async fn pre_cancelled_call_returns_cancelled_envelope() {
        let ctx = context_with(vec![("dev-eastus", StaticSources::default())]);
        let token = CancellationToken::new();
        token.cancel();
        let result = handle_tool_call(
            "check_node_pool_pressure",
            &serde_json::json!({"cluster": "dev-eastus"}),
            &ctx,
            token,
        )
        .await;
        assert!(result.is_error);
        let value = payload(&result);
        assert_eq!(value["errors"][0]["source"], "cancelled");
        assert_eq!(value["partial_data"], false);
    }

    #[tokio::test]
    async fn missing_cluster_parameter_is_an_error() {
        let ctx = context_with(vec![("dev-eastus", StaticSources::default())]);
        let result = handle_tool_call(
            "check_node_pool_pressure",
            &serde_json::json!({}),
            &ctx,
            CancellationToken::new(),
        )
        .await;
        assert!(result.is_error);
        assert!(result.first_text().contains("cluster"));
    }
}
