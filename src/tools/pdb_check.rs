//! `check_pdb_upgrade_risk` — preflight and live PDB drain-blocker detection.
//!
//! Preflight answers "would any PDB block a drain started right now?" without
//! requiring cordoned nodes; live answers "is the in-flight upgrade blocked?"
//! and attributes each block to the pod and cordoned node it pins, with the
//! block duration measured from the node's cordon event. Satisfiability is
//! always derived from the live ready count.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

use super::{cluster_arg, respond, respond_handler_error, respond_validation, ToolResult};
use crate::envelope::{merge_fleet, HandlerError, ToolError};
use crate::fanout::{fan_out, ClusterTarget};
use crate::model::{NodeEventKind, PdbRecord, PdbThreshold, PodRecord};
use crate::registry::AppContext;
use crate::validation::{validate_node_pool, PdbMode};

/// A PDB that poses upgrade risk. Preflight entries carry replica counts;
/// live entries carry the blocked pod, node, and block duration.
#[derive(Debug, Serialize)]
pub struct PdbRisk {
    pub pdb_name: String,
    pub namespace: String,
    pub workload: String,
    pub reason: String,
    pub ready_replicas: Option<i64>,
    pub desired_replicas: Option<i64>,
    pub affected_pod: Option<String>,
    pub affected_node: Option<String>,
    pub block_duration_seconds: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct PdbCheckOutput {
    pub cluster: String,
    pub mode: String,
    pub risks: Vec<PdbRisk>,
    pub summary: String,
    pub timestamp: String,
    pub errors: Vec<ToolError>,
    pub partial_data: bool,
}

#[derive(Clone)]
struct PdbArgs {
    node_pool: Option<String>,
    mode: PdbMode,
}

pub async fn run(ctx: &Arc<AppContext>, args: &Value) -> ToolResult {
    let cluster = match cluster_arg(args) {
        Ok(cluster) => cluster,
        Err(result) => return result,
    };
    let node_pool = args
        .get("node_pool")
        .and_then(Value::as_str)
        .map(str::to_string);
    if let Err(message) = validate_node_pool(node_pool.as_deref()) {
        return respond_validation(ctx, cluster, message);
    }
    let mode = match PdbMode::parse(args.get("mode").and_then(Value::as_str).unwrap_or("preflight"))
    {
        Ok(mode) => mode,
        Err(message) => return respond_validation(ctx, cluster, message),
    };
    let tool_args = PdbArgs { node_pool, mode };

    match ClusterTarget::parse(cluster) {
        ClusterTarget::All => {
            let results = fan_out(ctx, move |ctx, id| {
                let tool_args = tool_args.clone();
                async move { handler(ctx, id, tool_args).await }
            })
            .await;
            respond(ctx, &merge_fleet(results))
        }
        ClusterTarget::One(id) => match handler(ctx.clone(), id.clone(), tool_args).await {
            Ok(output) => respond(ctx, &output),
            Err(err) => respond_handler_error(ctx, &id, &err),
        },
    }
}

/// Workload attribution from selector labels: the informal `app` convention
/// first, then the structured well-known label, then the raw selector.
fn workload_from_selector(pdb: &PdbRecord) -> String {
    if let Some(app) = pdb.selector.get("app") {
        return app.clone();
    }
    if let Some(name) = pdb.selector.get("app.kubernetes.io/name") {
        return name.clone();
    }
    if pdb.selector.is_empty() {
        "unknown".to_string()
    } else {
        pdb.selector
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// The preflight rule that flags a PDB, if any. `max_unavailable=0` is a hard
/// block regardless of health; otherwise the resolved `min_available` leaving
/// no headroom above the live ready count flags it.
fn preflight_block_reason(pdb: &PdbRecord) -> Option<String> {
    if matches!(
        pdb.max_unavailable,
        Some(PdbThreshold::Count(0)) | Some(PdbThreshold::Percent(0))
    ) {
        return Some("max_unavailable == 0".to_string());
    }
    let resolved = pdb.resolved_min_available()?;
    (resolved >= pdb.current_healthy).then(|| "min_available == ready_replicas".to_string())
}

async fn handler(
    ctx: Arc<AppContext>,
    cluster_id: String,
    args: PdbArgs,
) -> Result<PdbCheckOutput, HandlerError> {
    let handle = ctx.registry.resolve(&cluster_id)?;
    let clients = &handle.clients;
    let now = Utc::now();
    let mut errors: Vec<ToolError> = Vec::new();

    let pdbs = clients.policy.list_pdbs().await?;

    let risks = match args.mode {
        PdbMode::Preflight => {
            preflight_risks(clients, &cluster_id, &pdbs, args.node_pool.as_deref(), &mut errors)
                .await?
        }
        PdbMode::Live => {
            live_risks(clients, &cluster_id, &pdbs, args.node_pool.as_deref(), now, &mut errors)
                .await?
        }
    };

    let summary = match (args.mode, risks.len()) {
        (PdbMode::Preflight, 0) => format!("No PDB drain risks in {cluster_id}"),
        (PdbMode::Preflight, n) => {
            let plural = if n == 1 { "" } else { "s" };
            format!("{n} PDB{plural} would block drain in {cluster_id}")
        }
        (PdbMode::Live, 0) => format!("No active PDB blocks detected in {cluster_id}"),
        (PdbMode::Live, n) => {
            let plural = if n == 1 { "" } else { "s" };
            format!("{n} active eviction block{plural} in {cluster_id}")
        }
    };

    let partial_data = !errors.is_empty();
    Ok(PdbCheckOutput {
        cluster: cluster_id,
        mode: args.mode.as_str().to_string(),
        risks,
        summary,
        timestamp: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        errors,
        partial_data,
    })
}

async fn preflight_risks(
    clients: &crate::clients::ClientSet,
    cluster_id: &str,
    pdbs: &[PdbRecord],
    node_pool: Option<&str>,
    errors: &mut Vec<ToolError>,
) -> Result<Vec<PdbRisk>, HandlerError> {
    // With a pool filter, only PDBs whose selector matches pods currently
    // scheduled on that pool stay in scope.
    let pool_scope: Option<Vec<PodRecord>> = match node_pool {
        Some(pool) => {
            let nodes = clients.nodes.list_nodes().await?;
            let pool_nodes: std::collections::HashSet<&str> = nodes
                .iter()
                .filter(|n| n.pool.as_deref() == Some(pool))
                .map(|n| n.name.as_str())
                .collect();
            let pods = match clients.nodes.list_pods(None).await {
                Ok(pods) => pods,
                Err(err) => {
                    // Without pods the pool filter cannot narrow anything;
                    // report everything rather than hiding risks.
                    errors.push(ToolError::degraded(cluster_id, &err));
                    vec![]
                }
            };
            Some(
                pods.into_iter()
                    .filter(|p| {
                        p.node_name
                            .as_deref()
                            .is_some_and(|n| pool_nodes.contains(n))
                    })
                    .collect(),
            )
        }
        None => None,
    };

    let mut risks = Vec::new();
    for pdb in pdbs {
        if let Some(scope) = &pool_scope {
            if !scope.is_empty() && !scope.iter().any(|pod| pdb.matches(pod)) {
                continue;
            }
        }
        if let Some(reason) = preflight_block_reason(pdb) {
            risks.push(PdbRisk {
                pdb_name: pdb.name.clone(),
                namespace: pdb.namespace.clone(),
                workload: workload_from_selector(pdb),
                reason,
                ready_replicas: Some(pdb.current_healthy),
                desired_replicas: Some(pdb.desired_healthy),
                affected_pod: None,
                affected_node: None,
                block_duration_seconds: None,
            });
        }
    }
    Ok(risks)
}

async fn live_risks(
    clients: &crate::clients::ClientSet,
    cluster_id: &str,
    pdbs: &[PdbRecord],
    node_pool: Option<&str>,
    now: DateTime<Utc>,
    errors: &mut Vec<ToolError>,
) -> Result<Vec<PdbRisk>, HandlerError> {
    let nodes = clients.nodes.list_nodes().await?;
    let cordoned: Vec<_> = nodes
        .iter()
        .filter(|n| n.unschedulable)
        .filter(|n| node_pool.map_or(true, |pool| n.pool.as_deref() == Some(pool)))
        .collect();
    if cordoned.is_empty() {
        return Ok(vec![]);
    }

    let pods = clients.nodes.list_pods(None).await?;

    // Cordon timestamps from the event stream give each block its duration.
    let cordon_times: HashMap<String, DateTime<Utc>> =
        match clients.events.list_node_events().await {
            Ok(events) => {
                let mut times = HashMap::new();
                for event in events {
                    if event.kind != NodeEventKind::Cordon {
                        continue;
                    }
                    let Some(ts) = event.timestamp else { continue };
                    times
                        .entry(event.node)
                        .and_modify(|existing| {
                            if ts > *existing {
                                *existing = ts;
                            }
                        })
                        .or_insert(ts);
                }
                times
            }
            Err(err) => {
                errors.push(ToolError::degraded(cluster_id, &err));
                HashMap::new()
            }
        };

    let zero_budget: Vec<&PdbRecord> =
        pdbs.iter().filter(|p| p.disruptions_allowed == 0).collect();

    let mut risks = Vec::new();
    for node in &cordoned {
        let node_pods = pods
            .iter()
            .filter(|p| p.node_name.as_deref() == Some(node.name.as_str()));
        for pod in node_pods {
            for pdb in zero_budget.iter().filter(|pdb| pdb.matches(pod)) {
                let block_duration_seconds = cordon_times
                    .get(&node.name)
                    .map(|t| (now - *t).num_milliseconds() as f64 / 1000.0);
                risks.push(PdbRisk {
                    pdb_name: pdb.name.clone(),
                    namespace: pdb.namespace.clone(),
                    workload: workload_from_selector(pdb),
                    reason: "disruptions_allowed == 0".to_string(),
                    ready_replicas: Some(pdb.current_healthy),
                    desired_replicas: Some(pdb.desired_healthy),
                    affected_pod: Some(pod.name.clone()),
                    affected_node: Some(node.name.clone()),
                    block_duration_seconds,
                });
            }
        }
    }
    risks.sort_by(|a, b| {
        (&a.pdb_name, &a.namespace, &a.affected_pod).cmp(&(&b.pdb_name, &b.namespace, &b.affected_pod))
    });
    Ok(risks)
}
