//! `check_node_pool_pressure` — request ratios and pressure levels per pool.
//!
//! Pools are graded on four ratios (CPU/memory requests against allocatable,
//! plus live CPU/memory usage when the metrics endpoint answers) and the
//! pending pod count. The pool's pressure level is the highest severity any
//! signal reaches. A metrics outage degrades to requests-only data with a
//! `metrics-api` error in the envelope rather than failing the call.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

use super::{cluster_arg, respond, respond_handler_error, ToolResult};
use crate::config::Thresholds;
use crate::envelope::{merge_fleet, HandlerError, ToolError};
use crate::fanout::{fan_out, ClusterTarget};
use crate::model::{NodeRecord, Pressure};
use crate::registry::AppContext;
use crate::units::round_percent;

/// Nodes with neither pool label are grouped here.
const UNKNOWN_POOL: &str = "unknown-pool";

/// Pressure data for a single node pool.
#[derive(Debug, Serialize)]
pub struct NodePoolResult {
    pub pool_name: String,
    pub cpu_requests_percent: Option<f64>,
    pub memory_requests_percent: Option<f64>,
    pub cpu_usage_percent: Option<f64>,
    pub memory_usage_percent: Option<f64>,
    pub pending_pods: i64,
    pub ready_nodes: usize,
    pub pressure_level: Pressure,
}

/// Envelope for one cluster.
#[derive(Debug, Serialize)]
pub struct NodePoolPressureOutput {
    pub cluster: String,
    pub pools: Vec<NodePoolResult>,
    /// Pending pods the scheduler has not placed on any node. These belong to
    /// no pool and are reported at cluster level only.
    pub unassigned_pending: i64,
    pub summary: String,
    pub timestamp: String,
    pub errors: Vec<ToolError>,
    pub partial_data: bool,
}

pub async fn run(ctx: &Arc<AppContext>, args: &Value) -> ToolResult {
    let cluster = match cluster_arg(args) {
        Ok(cluster) => cluster,
        Err(result) => return result,
    };
    match ClusterTarget::parse(cluster) {
        ClusterTarget::All => {
            let results = fan_out(ctx, handler).await;
            respond(ctx, &merge_fleet(results))
        }
        ClusterTarget::One(id) => match handler(ctx.clone(), id.clone()).await {
            Ok(output) => respond(ctx, &output),
            Err(err) => respond_handler_error(ctx, &id, &err),
        },
    }
}

/// Severity of one ratio signal against its warning/critical thresholds.
fn ratio_level(value: Option<f64>, warning: f64, critical: f64) -> Pressure {
    match value {
        Some(v) if v >= critical => Pressure::Critical,
        Some(v) if v >= warning => Pressure::Warning,
        _ => Pressure::Ok,
    }
}

/// Pool pressure is the highest severity across all five signals.
fn classify_pressure(
    cpu_requests: Option<f64>,
    memory_requests: Option<f64>,
    cpu_usage: Option<f64>,
    memory_usage: Option<f64>,
    pending_pods: i64,
    thresholds: &Thresholds,
) -> Pressure {
    let pending_level = if pending_pods > thresholds.pending_pods_critical {
        Pressure::Critical
    } else if pending_pods >= thresholds.pending_pods_warning {
        Pressure::Warning
    } else {
        Pressure::Ok
    };

    [
        ratio_level(cpu_requests, thresholds.cpu_warning, thresholds.cpu_critical),
        ratio_level(cpu_usage, thresholds.cpu_warning, thresholds.cpu_critical),
        ratio_level(
            memory_requests,
            thresholds.memory_warning,
            thresholds.memory_critical,
        ),
        ratio_level(
            memory_usage,
            thresholds.memory_warning,
            thresholds.memory_critical,
        ),
        pending_level,
    ]
    .into_iter()
    .max()
    .unwrap_or(Pressure::Ok)
}

async fn handler(
    ctx: Arc<AppContext>,
    cluster_id: String,
) -> Result<NodePoolPressureOutput, HandlerError> {
    let handle = ctx.registry.resolve(&cluster_id)?;
    let clients = &handle.clients;
    let now = Utc::now();
    let mut errors: Vec<ToolError> = Vec::new();

    let nodes = clients.nodes.list_nodes().await?;
    let pods = clients.nodes.list_pods(None).await?;

    // Usage is optional: a metrics outage degrades the answer, never kills it.
    let metrics_by_node: HashMap<String, (f64, f64)> = match clients.metrics.list_node_metrics().await
    {
        Ok(metrics) => metrics
            .into_iter()
            .map(|m| (m.name, (m.cpu_millis, m.memory_bytes)))
            .collect(),
        Err(err) => {
            errors.push(ToolError::new(
                &cluster_id,
                err.source(),
                "Metrics endpoint not reachable; usage data omitted",
                true,
            ));
            HashMap::new()
        }
    };

    // Group nodes by pool; the sorted map keeps output order deterministic.
    let mut pools: BTreeMap<String, Vec<&NodeRecord>> = BTreeMap::new();
    let mut node_to_pool: HashMap<&str, &str> = HashMap::new();
    let mut missing_label = false;
    for node in &nodes {
        let pool = match node.pool.as_deref() {
            Some(pool) => pool,
            None => {
                missing_label = true;
                UNKNOWN_POOL
            }
        };
        pools.entry(pool.to_string()).or_default().push(node);
        node_to_pool.insert(node.name.as_str(), pool);
    }
    if missing_label {
        errors.push(ToolError::new(
            &cluster_id,
            "core-api",
            "One or more nodes carry no pool label; grouped as unknown-pool",
            true,
        ));
    }

    // Requests attribute to the pool of the node the pod runs on; terminal
    // pods have released their requests and are skipped.
    let mut pool_requests: HashMap<&str, (f64, f64)> = HashMap::new();
    let mut pool_pending: HashMap<&str, i64> = HashMap::new();
    let mut unassigned_pending: i64 = 0;
    for pod in &pods {
        let assigned_pool = pod
            .node_name
            .as_deref()
            .and_then(|n| node_to_pool.get(n).copied());
        if pod.phase == "Pending" {
            match assigned_pool {
                Some(pool) => *pool_pending.entry(pool).or_default() += 1,
                None => unassigned_pending += 1,
            }
        }
        if matches!(pod.phase.as_str(), "Succeeded" | "Failed") {
            continue;
        }
        if let Some(pool) = assigned_pool {
            let entry = pool_requests.entry(pool).or_default();
            entry.0 += pod.requests_cpu_millis;
            entry.1 += pod.requests_memory_bytes;
        }
    }

    let mut pool_results = Vec::with_capacity(pools.len());
    for (pool_name, pool_nodes) in &pools {
        let ready_nodes = pool_nodes.iter().filter(|n| n.ready).count();
        let alloc_cpu: f64 = pool_nodes.iter().map(|n| n.allocatable_cpu_millis).sum();
        let alloc_memory: f64 = pool_nodes.iter().map(|n| n.allocatable_memory_bytes).sum();
        let (req_cpu, req_memory) = pool_requests
            .get(pool_name.as_str())
            .copied()
            .unwrap_or((0.0, 0.0));

        let mut usage_cpu = 0.0;
        let mut usage_memory = 0.0;
        let mut has_metrics = false;
        for node in pool_nodes {
            if let Some((cpu, memory)) = metrics_by_node.get(&node.name) {
                has_metrics = true;
                usage_cpu += cpu;
                usage_memory += memory;
            }
        }

        let percent = |numerator: f64, denominator: f64| {
            (denominator > 0.0).then(|| numerator / denominator * 100.0)
        };
        let cpu_requests_percent = percent(req_cpu, alloc_cpu);
        let memory_requests_percent = percent(req_memory, alloc_memory);
        let cpu_usage_percent = has_metrics
            .then(|| percent(usage_cpu, alloc_cpu))
            .flatten();
        let memory_usage_percent = has_metrics
            .then(|| percent(usage_memory, alloc_memory))
            .flatten();

        let pending_pods = pool_pending.get(pool_name.as_str()).copied().unwrap_or(0);
        // Classify on the raw ratios; rounding is for display only.
        let pressure_level = classify_pressure(
            cpu_requests_percent,
            memory_requests_percent,
            cpu_usage_percent,
            memory_usage_percent,
            pending_pods,
            &ctx.thresholds,
        );

        pool_results.push(NodePoolResult {
            pool_name: pool_name.clone(),
            cpu_requests_percent: cpu_requests_percent.map(round_percent),
            memory_requests_percent: memory_requests_percent.map(round_percent),
            cpu_usage_percent: cpu_usage_percent.map(round_percent),
            memory_usage_percent: memory_usage_percent.map(round_percent),
            pending_pods,
            ready_nodes,
            pressure_level,
        });
    }

    let under_pressure = pool_results
        .iter()
        .filter(|p| p.pressure_level != Pressure::Ok)
        .count();
    let total = pool_results.len();
    let summary = if under_pressure > 0 {
        format!("{under_pressure} of {total} node pools in {cluster_id} under pressure")
    } else {
        format!("All {total} node pools in {cluster_id} are healthy")
    };

    let partial_data = !errors.is_empty();
    Ok(NodePoolPressureOutput {
        cluster: cluster_id,
        pools: pool_results,
        unassigned_pending,
        summary,
        timestamp: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        errors,
        partial_data,
    })
}
