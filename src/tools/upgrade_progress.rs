//! `get_upgrade_progress` — per-node state during an in-flight upgrade.
//!
//! Each node in the upgrading pool(s) lands in exactly one of six states.
//! PDB attribution is per node: a blocker only explains a node when its
//! affected-nodes set (derived from the pods its selector matches) contains
//! that node; the first cluster-wide blocker is used only when no blocker has
//! node attribution at all. Elapsed time is wall-clock from the earliest
//! `NodeUpgrade` event in the run — per-node durations are never summed, that
//! would overcount parallel drains.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

use super::classify::{categorize_failure, is_unhealthy, phase_rank};
use super::{cluster_arg, respond, respond_handler_error, respond_validation, ToolResult};
use crate::envelope::{merge_fleet, HandlerError, ToolError};
use crate::fanout::{fan_out, ClusterTarget};
use crate::model::{NodeEvent, NodeEventKind, NodeRecord, NodeState, PdbRecord, PodRecord};
use crate::registry::AppContext;
use crate::validation::validate_node_pool;

const POD_TRANSITION_CAP: usize = 20;

/// State of a single node during the upgrade.
#[derive(Debug, Serialize)]
pub struct NodeProgress {
    pub name: String,
    pub state: NodeState,
    pub version: String,
    pub blocking_pdb: Option<String>,
    pub blocking_pdb_namespace: Option<String>,
}

/// A pod disrupted by an upgrade-related node transition.
#[derive(Debug, Serialize)]
pub struct AffectedPod {
    pub name: String,
    pub namespace: String,
    pub phase: String,
    pub reason: Option<String>,
    pub node_name: Option<String>,
}

/// Rollup of pod churn on nodes actively involved in the upgrade.
#[derive(Debug, Default, Serialize)]
pub struct PodTransitionSummary {
    pub pending_count: usize,
    pub failed_count: usize,
    pub by_category: BTreeMap<String, usize>,
    pub affected_pods: Vec<AffectedPod>,
    pub total_affected: usize,
}

#[derive(Debug, Serialize)]
pub struct UpgradeProgressOutput {
    pub cluster: String,
    pub upgrade_in_progress: bool,
    pub node_pool: Option<String>,
    pub target_version: Option<String>,
    pub nodes: Vec<NodeProgress>,
    pub nodes_total: Option<usize>,
    pub nodes_upgraded: Option<usize>,
    pub nodes_remaining: Option<usize>,
    pub elapsed_seconds: Option<f64>,
    pub estimated_remaining_seconds: Option<f64>,
    /// True when the run has outlived the anomaly threshold and no PDB block
    /// explains the delay. Null when no upgrade is active.
    pub anomaly: Option<bool>,
    pub pod_transitions: Option<PodTransitionSummary>,
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
    let node_pool = args
        .get("node_pool")
        .and_then(Value::as_str)
        .map(str::to_string);
    if let Err(message) = validate_node_pool(node_pool.as_deref()) {
        return respond_validation(ctx, cluster, message);
    }

    match ClusterTarget::parse(cluster) {
        ClusterTarget::All => {
            let results = fan_out(ctx, move |ctx, id| {
                let node_pool = node_pool.clone();
                async move { handler(ctx, id, node_pool).await }
            })
            .await;
            respond(ctx, &merge_fleet(results))
        }
        ClusterTarget::One(id) => match handler(ctx.clone(), id.clone(), node_pool).await {
            Ok(output) => respond(ctx, &output),
            Err(err) => respond_handler_error(ctx, &id, &err),
        },
    }
}

/// A PDB that currently allows zero disruptions, with the nodes it is known
/// to affect (the nodes hosting pods its selector matches).
struct Blocker {
    name: String,
    namespace: String,
    affected_nodes: BTreeSet<String>,
}

fn compute_blockers(pdbs: &[PdbRecord], pods: &[PodRecord]) -> Vec<Blocker> {
    pdbs.iter()
        .filter(|pdb| pdb.disruptions_allowed == 0)
        .map(|pdb| {
            let affected_nodes = pods
                .iter()
                .filter(|pod| pdb.matches(pod))
                .filter_map(|pod| pod.node_name.clone())
                .collect();
            Blocker {
                name: pdb.name.clone(),
                namespace: pdb.namespace.clone(),
                affected_nodes,
            }
        })
        .collect()
}

/// Find the blocker explaining a cordoned node. Node-specific attribution
/// wins; the first cluster-wide blocker applies only when no blocker carries
/// node attribution at all.
fn blocker_for_node<'a>(blockers: &'a [Blocker], node: &str) -> Option<&'a Blocker> {
    if let Some(specific) = blockers.iter().find(|b| b.affected_nodes.contains(node)) {
        return Some(specific);
    }
    if !blockers.is_empty() && blockers.iter().all(|b| b.affected_nodes.is_empty()) {
        return blockers.first();
    }
    None
}

struct NodeContext<'a> {
    target_version: &'a str,
    upgrade_start: Option<DateTime<Utc>>,
    anomaly_minutes: i64,
    now: DateTime<Utc>,
}

/// Classify one node into exactly one of the six states.
fn classify_node<'a>(
    node: &NodeRecord,
    events: &[&NodeEvent],
    blockers: &'a [Blocker],
    ctx: &NodeContext<'_>,
) -> (NodeState, Option<&'a Blocker>) {
    let last_upgrade_ts = events
        .iter()
        .filter(|e| e.kind == NodeEventKind::Upgrade)
        .filter_map(|e| e.timestamp)
        .max();
    let has_upgrade_event = events.iter().any(|e| e.kind == NodeEventKind::Upgrade);
    let latest_kind = events
        .iter()
        .filter(|e| e.timestamp.is_some())
        .max_by_key(|e| e.timestamp)
        .map(|e| e.kind);

    // Terminal state first: latest word from the kubelet is Ready and the
    // version already matches the target.
    if latest_kind == Some(NodeEventKind::Ready) && node.version == ctx.target_version {
        return (NodeState::Upgraded, None);
    }

    // NodeUpgrade fired and no NodeReady followed: the node is mid-flight.
    // Only here can a zero-budget PDB explain the node; a node cordoned
    // before its own NodeUpgrade event is plain cordoned below.
    let ready_after_upgrade = match last_upgrade_ts {
        Some(upgrade_ts) => events
            .iter()
            .any(|e| e.kind == NodeEventKind::Ready && e.timestamp >= Some(upgrade_ts)),
        None => false,
    };
    if has_upgrade_event && !ready_after_upgrade {
        if node.unschedulable {
            if let Some(blocker) = blocker_for_node(blockers, &node.name) {
                return (NodeState::PdbBlocked, Some(blocker));
            }
        }
        if let Some(start) = ctx.upgrade_start {
            let elapsed_minutes = (ctx.now - start).num_seconds() / 60;
            if elapsed_minutes > ctx.anomaly_minutes {
                return (NodeState::Stalled, None);
            }
        }
        return (NodeState::Upgrading, None);
    }

    if node.unschedulable {
        return (NodeState::Cordoned, None);
    }

    (NodeState::Pending, None)
}

fn collect_pod_transitions(
    pods: &[PodRecord],
    node_states: &[NodeProgress],
) -> PodTransitionSummary {
    let active_nodes: BTreeSet<&str> = node_states
        .iter()
        .filter(|n| n.state.is_active())
        .map(|n| n.name.as_str())
        .collect();
    if active_nodes.is_empty() {
        return PodTransitionSummary::default();
    }

    let mut affected: Vec<&PodRecord> = pods
        .iter()
        .filter(|p| {
            p.node_name
                .as_deref()
                .is_some_and(|n| active_nodes.contains(n))
                && is_unhealthy(p)
        })
        .collect();

    let pending_count = affected.iter().filter(|p| p.phase == "Pending").count();
    // Running pods with bad container states count toward the failed side.
    let failed_count = affected.len() - pending_count;

    let mut by_category: BTreeMap<String, usize> = BTreeMap::new();
    for pod in &affected {
        *by_category
            .entry(categorize_failure(pod).as_str().to_string())
            .or_default() += 1;
    }

    affected.sort_by(|a, b| {
        phase_rank(&a.phase)
            .cmp(&phase_rank(&b.phase))
            .then_with(|| a.name.cmp(&b.name))
    });

    let affected_pods = affected
        .iter()
        .take(POD_TRANSITION_CAP)
        .map(|p| AffectedPod {
            name: p.name.clone(),
            namespace: p.namespace.clone(),
            phase: p.phase.clone(),
            reason: p.reason.clone(),
            node_name: p.node_name.clone(),
        })
        .collect();

    PodTransitionSummary {
        pending_count,
        failed_count,
        by_category,
        affected_pods,
        total_affected: affected.len(),
    }
}

fn idle_output(
    cluster_id: String,
    summary: String,
    now: DateTime<Utc>,
    errors: Vec<ToolError>,
) -> UpgradeProgressOutput {
    let partial_data = !errors.is_empty();
    UpgradeProgressOutput {
        cluster: cluster_id,
        upgrade_in_progress: false,
        node_pool: None,
        target_version: None,
        nodes: vec![],
        nodes_total: None,
        nodes_upgraded: None,
        nodes_remaining: None,
        elapsed_seconds: None,
        estimated_remaining_seconds: None,
        anomaly: None,
        pod_transitions: None,
        summary,
        timestamp: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        errors,
        partial_data,
    }
}

async fn handler(
    ctx: Arc<AppContext>,
    cluster_id: String,
    node_pool: Option<String>,
) -> Result<UpgradeProgressOutput, HandlerError> {
    let handle = ctx.registry.resolve(&cluster_id)?;
    let clients = &handle.clients;
    let now = Utc::now();
    let mut errors: Vec<ToolError> = Vec::new();

    // A control-plane outage must not abort: answer "state unknown" with one
    // error rather than failing the whole call.
    let description = match clients.control_plane.describe_cluster().await {
        Ok(description) => description,
        Err(err) => {
            errors.push(ToolError::degraded(&cluster_id, &err));
            return Ok(idle_output(
                cluster_id.clone(),
                format!("Unable to determine upgrade state for {cluster_id}"),
                now,
                errors,
            ));
        }
    };

    let upgrading_pools: Vec<_> = description
        .pools
        .iter()
        .filter(|p| p.is_upgrading())
        .filter(|p| node_pool.as_deref().map_or(true, |wanted| p.name == wanted))
        .collect();

    if upgrading_pools.is_empty() {
        return Ok(idle_output(
            cluster_id.clone(),
            format!("No upgrade in progress for {cluster_id}"),
            now,
            errors,
        ));
    }

    let target_pool = upgrading_pools[0];
    let target_version = target_pool
        .target_version
        .clone()
        .unwrap_or_else(|| "unknown".to_string());
    let pool_names: BTreeSet<&str> = upgrading_pools.iter().map(|p| p.name.as_str()).collect();

    // Nodes and events are required for per-node classification.
    let nodes: Vec<NodeRecord> = clients
        .nodes
        .list_nodes()
        .await?
        .into_iter()
        .filter(|n| {
            n.pool
                .as_deref()
                .is_some_and(|pool| pool_names.contains(pool))
        })
        .collect();
    let node_events = clients.events.list_node_events().await?;

    // PDBs are read before classification so node-by-node attribution is
    // deterministic; a policy outage degrades to no attribution.
    let pdbs = match clients.policy.list_pdbs().await {
        Ok(pdbs) => pdbs,
        Err(err) => {
            errors.push(ToolError::degraded(&cluster_id, &err));
            vec![]
        }
    };

    // Pods power both blocker attribution and the transition rollup.
    let pods = match clients.nodes.list_pods(None).await {
        Ok(pods) => pods,
        Err(err) => {
            errors.push(ToolError::degraded(&cluster_id, &err));
            vec![]
        }
    };

    let blockers = compute_blockers(&pdbs, &pods);

    let mut events_by_node: HashMap<&str, Vec<&NodeEvent>> = HashMap::new();
    for event in &node_events {
        events_by_node.entry(event.node.as_str()).or_default().push(event);
    }

    // The run started at the earliest NodeUpgrade event anywhere in the wave.
    let upgrade_start = node_events
        .iter()
        .filter(|e| e.kind == NodeEventKind::Upgrade)
        .filter_map(|e| e.timestamp)
        .min();

    let node_ctx = NodeContext {
        target_version: &target_version,
        upgrade_start,
        anomaly_minutes: ctx.thresholds.upgrade_anomaly_minutes,
        now,
    };

    let mut node_states = Vec::with_capacity(nodes.len());
    for node in &nodes {
        let events = events_by_node
            .get(node.name.as_str())
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let (state, blocker) = classify_node(node, events, &blockers, &node_ctx);
        node_states.push(NodeProgress {
            name: node.name.clone(),
            state,
            version: node.version.clone(),
            blocking_pdb: blocker.map(|b| b.name.clone()),
            blocking_pdb_namespace: blocker.map(|b| b.namespace.clone()),
        });
    }

    let nodes_total = node_states.len();
    let nodes_upgraded = node_states
        .iter()
        .filter(|n| n.state == NodeState::Upgraded)
        .count();
    let nodes_remaining = nodes_total - nodes_upgraded;

    let elapsed_seconds = upgrade_start.map(|start| (now - start).num_milliseconds() as f64 / 1000.0);
    let estimated_remaining_seconds = match elapsed_seconds {
        Some(elapsed) if nodes_upgraded > 0 && nodes_remaining > 0 => {
            Some(elapsed / nodes_upgraded as f64 * nodes_remaining as f64)
        }
        _ => None,
    };

    // A run past the threshold is anomalous unless a PDB block explains it.
    let has_pdb_block = node_states.iter().any(|n| n.state == NodeState::PdbBlocked);
    let over_threshold = elapsed_seconds
        .is_some_and(|e| e > (ctx.thresholds.upgrade_anomaly_minutes * 60) as f64);
    let anomaly = Some(over_threshold && !has_pdb_block);

    let pod_transitions = collect_pod_transitions(&pods, &node_states);

    let progress = if nodes_remaining > 0 {
        "upgrade in progress"
    } else {
        "upgrade complete"
    };
    let summary = format!("{cluster_id}: {nodes_upgraded}/{nodes_total} nodes upgraded, {progress}");

    let partial_data = !errors.is_empty();
    Ok(UpgradeProgressOutput {
        cluster: cluster_id,
        upgrade_in_progress: true,
        node_pool: Some(target_pool.name.clone()),
        target_version: Some(target_version),
        nodes: node_states,
        nodes_total: Some(nodes_total),
        nodes_upgraded: Some(nodes_upgraded),
        nodes_remaining: Some(nodes_remaining),
        elapsed_seconds,
        estimated_remaining_seconds,
        anomaly,
        pod_transitions: Some(pod_transitions),
        summary,
        timestamp: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        errors,
        partial_data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::mock::{node, node_event, pod, StaticSources};
    use crate::clients::ClientError;
    use crate::model::{ClusterDescription, PoolDescription};
    use crate::tools::testutil::context_with;
    use chrono::Duration;

    fn upgrading_description() -> ClusterDescription {
        ClusterDescription {
            control_plane_version: "1.30.0".into(),
            provisioning_state: Some("Succeeded".into()),
            fqdn: None,
            pools: vec![PoolDescription {
                name: "userpool".into(),
                count: 3,
                current_version: Some("1.29.8".into()),
                target_version: Some("1.30.0".into()),
                provisioning_state: Some("Upgrading".into()),
            }],
        }
    }

    fn zero_budget_pdb(name: &str, namespace: &str, app: &str) -> PdbRecord {
        PdbRecord {
            name: name.into(),
            namespace: namespace.into(),
            selector: BTreeMap::from([("app".to_string(), app.to_string())]),
            disruptions_allowed: 0,
            current_healthy: 2,
            desired_healthy: 2,
            expected_pods: 2,
            ..Default::default()
        }
    }

    fn labeled_pod(name: &str, namespace: &str, app: &str, node: &str) -> PodRecord {
        let mut p = pod(name, namespace, "Running", Some(node));
        p.labels = BTreeMap::from([("app".to_string(), app.to_string())]);
        p
    }

    fn upgraded_node(name: &str) -> NodeRecord {
        let mut n = node(name, "userpool");
        n.version = "1.30.0".into();
        n
    }

    async fn run_handler(sources: StaticSources) -> UpgradeProgressOutput {
        let ctx = context_with(vec![("prod-eastus", sources)]);
        handler(ctx, "prod-eastus".into(), None).await.unwrap()
    }

    #[tokio::test]
    async fn no_upgrade_leaves_pool_fields_null() {
        let mut description = upgrading_description();
        description.pools[0].current_version = Some("1.30.0".into());
        description.pools[0].provisioning_state = Some("Succeeded".into());
        let out = run_handler(StaticSources {
            description: Ok(description),
            ..Default::default()
        })
        .await;
        assert!(!out.upgrade_in_progress);
        assert!(out.nodes_total.is_none());
        assert!(out.anomaly.is_none());
        assert!(out.pod_transitions.is_none());
        assert!(out.summary.contains("No upgrade in progress"));
    }

    #[tokio::test]
    async fn control_plane_outage_reports_error_without_aborting() {
        let out = run_handler(StaticSources {
            description: Err(ClientError::CloudUnavailable),
            ..Default::default()
        })
        .await;
        assert!(!out.upgrade_in_progress);
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.errors[0].source, "cloud-api");
        assert!(out.summary.contains("Unable to determine upgrade state"));
    }

    #[tokio::test]
    async fn nodes_classify_into_expected_states() {
        let now = Utc::now();
        let out = run_handler(StaticSources {
            description: Ok(upgrading_description()),
            nodes: Ok(vec![
                upgraded_node("done"),
                node("midflight", "userpool"),
                {
                    let mut n = node("fenced", "userpool");
                    n.unschedulable = true;
                    n
                },
                node("waiting", "userpool"),
            ]),
            node_events: Ok(vec![
                node_event("done", NodeEventKind::Upgrade, now - Duration::minutes(20)),
                node_event("done", NodeEventKind::Ready, now - Duration::minutes(10)),
                node_event("midflight", NodeEventKind::Upgrade, now - Duration::minutes(5)),
            ]),
            ..Default::default()
        })
        .await;

        let state_of = |name: &str| {
            out.nodes
                .iter()
                .find(|n| n.name == name)
                .map(|n| n.state)
                .unwrap()
        };
        assert_eq!(state_of("done"), NodeState::Upgraded);
        assert_eq!(state_of("midflight"), NodeState::Upgrading);
        assert_eq!(state_of("fenced"), NodeState::Cordoned);
        assert_eq!(state_of("waiting"), NodeState::Pending);
        assert_eq!(out.nodes_upgraded, Some(1));
        assert_eq!(out.nodes_remaining, Some(3));
        assert_eq!(out.anomaly, Some(false));
    }

    #[tokio::test]
    async fn pdb_attribution_is_per_node() {
        // Two mid-flight cordoned nodes, each hosting pods guarded by its
        // own zero-budget PDB: attribution must pair them up, no fallback.
        let now = Utc::now();
        let mut n1 = node("n1", "userpool");
        n1.unschedulable = true;
        let mut n2 = node("n2", "userpool");
        n2.unschedulable = true;
        let out = run_handler(StaticSources {
            description: Ok(upgrading_description()),
            nodes: Ok(vec![n1, n2]),
            node_events: Ok(vec![
                node_event("n1", NodeEventKind::Upgrade, now - Duration::minutes(5)),
                node_event("n2", NodeEventKind::Upgrade, now - Duration::minutes(4)),
            ]),
            pdbs: Ok(vec![
                zero_budget_pdb("pdb-a", "payments", "api"),
                zero_budget_pdb("pdb-b", "search", "indexer"),
            ]),
            pods: Ok(vec![
                labeled_pod("api-0", "payments", "api", "n1"),
                labeled_pod("indexer-0", "search", "indexer", "n2"),
            ]),
            ..Default::default()
        })
        .await;

        let progress_of = |name: &str| out.nodes.iter().find(|n| n.name == name).unwrap();
        assert_eq!(progress_of("n1").state, NodeState::PdbBlocked);
        assert_eq!(progress_of("n1").blocking_pdb.as_deref(), Some("pdb-a"));
        assert_eq!(progress_of("n2").state, NodeState::PdbBlocked);
        assert_eq!(progress_of("n2").blocking_pdb.as_deref(), Some("pdb-b"));
    }

    #[tokio::test]
    async fn cordoned_before_upgrade_event_stays_cordoned_despite_blocker() {
        // Pre-drain cordon: unschedulable, a zero-budget PDB attributes to
        // this very node, but its own NodeUpgrade event has not fired yet.
        // That is cordoned, not pdb_blocked.
        let now = Utc::now();
        let mut early = node("early", "userpool");
        early.unschedulable = true;
        let out = run_handler(StaticSources {
            description: Ok(upgrading_description()),
            nodes: Ok(vec![node("other", "userpool"), early]),
            // The wave has started elsewhere; "early" itself has no events.
            node_events: Ok(vec![node_event(
                "other",
                NodeEventKind::Upgrade,
                now - Duration::minutes(10),
            )]),
            pdbs: Ok(vec![zero_budget_pdb("pdb-a", "payments", "api")]),
            pods: Ok(vec![labeled_pod("api-0", "payments", "api", "early")]),
            ..Default::default()
        })
        .await;
        let early_node = out.nodes.iter().find(|n| n.name == "early").unwrap();
        assert_eq!(early_node.state, NodeState::Cordoned);
        assert!(early_node.blocking_pdb.is_none());
    }

    #[tokio::test]
    async fn unattributable_blocker_does_not_leak_onto_mid_flight_node() {
        // A blocker with known attribution elsewhere must not leak onto a
        // draining node it does not affect.
        let now = Utc::now();
        let mut n3 = node("n3", "userpool");
        n3.unschedulable = true;
        let out = run_handler(StaticSources {
            description: Ok(upgrading_description()),
            nodes: Ok(vec![n3]),
            node_events: Ok(vec![node_event(
                "n3",
                NodeEventKind::Upgrade,
                now - Duration::minutes(5),
            )]),
            pdbs: Ok(vec![zero_budget_pdb("pdb-a", "payments", "api")]),
            pods: Ok(vec![labeled_pod("api-0", "payments", "api", "other-node")]),
            ..Default::default()
        })
        .await;
        assert_eq!(out.nodes[0].state, NodeState::Upgrading);
        assert!(out.nodes[0].blocking_pdb.is_none());
    }

    #[tokio::test]
    async fn stalled_run_sets_anomaly() {
        // 75 minutes elapsed, no PDB block, one node never came back: the
        // node is stalled and the envelope is anomalous.
        let now = Utc::now();
        let out = run_handler(StaticSources {
            description: Ok(upgrading_description()),
            nodes: Ok(vec![node("slow", "userpool")]),
            node_events: Ok(vec![node_event(
                "slow",
                NodeEventKind::Upgrade,
                now - Duration::minutes(75),
            )]),
            ..Default::default()
        })
        .await;
        assert_eq!(out.nodes[0].state, NodeState::Stalled);
        assert_eq!(out.anomaly, Some(true));
    }

    #[tokio::test]
    async fn pdb_block_suppresses_anomaly() {
        // Same 75-minute run, but the cordoned node is explained by a PDB:
        // the delay is expected, not anomalous.
        let now = Utc::now();
        let mut blocked = node("blocked", "userpool");
        blocked.unschedulable = true;
        let out = run_handler(StaticSources {
            description: Ok(upgrading_description()),
            nodes: Ok(vec![blocked]),
            node_events: Ok(vec![node_event(
                "blocked",
                NodeEventKind::Upgrade,
                now - Duration::minutes(75),
            )]),
            pdbs: Ok(vec![zero_budget_pdb("pdb-a", "payments", "api")]),
            pods: Ok(vec![labeled_pod("api-0", "payments", "api", "blocked")]),
            ..Default::default()
        })
        .await;
        assert_eq!(out.nodes[0].state, NodeState::PdbBlocked);
        assert_eq!(out.anomaly, Some(false));
    }

    #[tokio::test]
    async fn estimated_remaining_extrapolates_mean_per_completed_node() {
        let now = Utc::now();
        let out = run_handler(StaticSources {
            description: Ok(upgrading_description()),
            nodes: Ok(vec![
                upgraded_node("done"),
                node("waiting-1", "userpool"),
                node("waiting-2", "userpool"),
            ]),
            node_events: Ok(vec![
                node_event("done", NodeEventKind::Upgrade, now - Duration::minutes(10)),
                node_event("done", NodeEventKind::Ready, now - Duration::minutes(2)),
            ]),
            ..Default::default()
        })
        .await;
        let elapsed = out.elapsed_seconds.unwrap();
        let estimated = out.estimated_remaining_seconds.unwrap();
        // One node done, two remaining: estimate is elapsed * 2.
        assert!((estimated - elapsed * 2.0).abs() < 1.0);
    }

    #[tokio::test]
    async fn pod_transitions_cover_only_active_nodes_and_cap_at_twenty() {
        let now = Utc::now();
        let mut cordoned = node("churn", "userpool");
        cordoned.unschedulable = true;
        let mut pods = Vec::new();
        for i in 0..30 {
            pods.push(pod(&format!("pending-{i:02}"), "default", "Pending", Some("churn")));
        }
        for i in 0..5 {
            pods.push(pod(&format!("failed-{i}"), "default", "Failed", Some("churn")));
        }
        // Unhealthy pod on an upgraded node: excluded from the rollup.
        pods.push(pod("elsewhere", "default", "Failed", Some("done")));

        let out = run_handler(StaticSources {
            description: Ok(upgrading_description()),
            nodes: Ok(vec![upgraded_node("done"), cordoned]),
            node_events: Ok(vec![
                node_event("done", NodeEventKind::Upgrade, now - Duration::minutes(30)),
                node_event("done", NodeEventKind::Ready, now - Duration::minutes(20)),
            ]),
            pods: Ok(pods),
            ..Default::default()
        })
        .await;

        let transitions = out.pod_transitions.unwrap();
        assert_eq!(transitions.total_affected, 35);
        assert_eq!(transitions.pending_count, 30);
        assert_eq!(transitions.failed_count, 5);
        assert_eq!(transitions.affected_pods.len(), POD_TRANSITION_CAP);
        assert_eq!(transitions.by_category.values().sum::<usize>(), 35);
        // Failed entries sort ahead of Pending in the capped list.
        assert!(transitions.affected_pods[..5]
            .iter()
            .all(|p| p.phase == "Failed"));
    }

    #[tokio::test]
    async fn policy_outage_degrades_to_no_attribution() {
        let mut fenced = node("fenced", "userpool");
        fenced.unschedulable = true;
        let out = run_handler(StaticSources {
            description: Ok(upgrading_description()),
            nodes: Ok(vec![fenced]),
            pdbs: Err(ClientError::PolicyUnavailable),
            ..Default::default()
        })
        .await;
        assert_eq!(out.nodes[0].state, NodeState::Cordoned);
        assert!(out.errors.iter().any(|e| e.source == "policy-api"));
        assert!(out.partial_data);
    }
}
