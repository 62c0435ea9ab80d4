//! `get_upgrade_duration_metrics` — current-run timing and historical
//! baselines.
//!
//! Current-run durations come from pairing each node's earliest `NodeUpgrade`
//! event with its latest `NodeReady`; the events stream only survives about an
//! hour, so history comes from the control-plane audit log instead (~90-day
//! retention). The two sources are never mixed in one statistic.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

use super::{cluster_arg, respond, respond_handler_error, respond_validation, ToolResult};
use crate::envelope::{merge_fleet, HandlerError, ToolError};
use crate::fanout::{fan_out, ClusterTarget};
use crate::model::NodeEventKind;
use crate::registry::AppContext;
use crate::validation::{validate_history_count, validate_node_pool};

/// Timing for the in-progress upgrade, from the events stream.
#[derive(Debug, Serialize)]
pub struct CurrentRunMetrics {
    /// Wall-clock from the earliest NodeUpgrade event — never a sum of
    /// per-node durations, which would overcount parallel drains.
    pub elapsed_seconds: f64,
    pub estimated_remaining_seconds: Option<f64>,
    pub nodes_completed: usize,
    pub nodes_total: usize,
    pub mean_seconds_per_node: f64,
    pub min_seconds_per_node: f64,
    pub max_seconds_per_node: f64,
    pub fastest_node: Option<String>,
    pub slowest_node: Option<String>,
}

/// One historical upgrade from the audit log.
#[derive(Debug, Serialize)]
pub struct HistoricalRecord {
    pub date: Option<String>,
    pub version_path: String,
    pub total_duration_seconds: f64,
    pub node_count: Option<i64>,
}

/// Statistics over the historical durations.
#[derive(Debug, Serialize)]
pub struct HistoricalStats {
    pub mean_duration_seconds: f64,
    /// Nearest-rank P90 over the ascending durations.
    pub p90_duration_seconds: f64,
    pub min_duration_seconds: f64,
    pub max_duration_seconds: f64,
    pub all_within_baseline: bool,
}

#[derive(Debug, Serialize)]
pub struct UpgradeDurationOutput {
    pub cluster: String,
    pub node_pool: String,
    pub current_run: Option<CurrentRunMetrics>,
    pub historical: Vec<HistoricalRecord>,
    pub stats: Option<HistoricalStats>,
    pub anomaly_flag: Option<String>,
    pub summary: String,
    pub timestamp: String,
    pub errors: Vec<ToolError>,
    pub partial_data: bool,
}

#[derive(Clone)]
struct DurationArgs {
    node_pool: String,
    history_count: usize,
}

pub async fn run(ctx: &Arc<AppContext>, args: &Value) -> ToolResult {
    let cluster = match cluster_arg(args) {
        Ok(cluster) => cluster,
        Err(result) => return result,
    };
    let Some(node_pool) = args.get("node_pool").and_then(Value::as_str) else {
        return respond_validation(
            ctx,
            cluster,
            "Missing required parameter: node_pool".to_string(),
        );
    };
    if let Err(message) = validate_node_pool(Some(node_pool)) {
        return respond_validation(ctx, cluster, message);
    }
    let history_count = match validate_history_count(
        args.get("history_count").and_then(Value::as_i64).unwrap_or(5),
    ) {
        Ok(count) => count,
        Err(message) => return respond_validation(ctx, cluster, message),
    };
    let tool_args = DurationArgs {
        node_pool: node_pool.to_string(),
        history_count,
    };

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

/// Nearest-rank percentile index over an ascending list:
/// `ceil(q * n) - 1`, clamped into range.
fn nearest_rank_index(n: usize, q: f64) -> usize {
    let rank = (q * n as f64).ceil() as usize;
    rank.saturating_sub(1).min(n - 1)
}

fn current_run_metrics(
    upgrade_times: &HashMap<String, DateTime<Utc>>,
    ready_times: &HashMap<String, DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<CurrentRunMetrics> {
    let mut completed: Vec<(&str, f64)> = upgrade_times
        .iter()
        .filter_map(|(node, start)| {
            let end = ready_times.get(node)?;
            // A stale NodeReady preceding the upgrade event would produce a
            // negative duration; skip those pairs.
            (end > start).then(|| (node.as_str(), (*end - *start).num_milliseconds() as f64 / 1000.0))
        })
        .collect();
    if completed.is_empty() {
        return None;
    }
    completed.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));

    let durations: Vec<f64> = completed.iter().map(|(_, d)| *d).collect();
    let mean = durations.iter().sum::<f64>() / durations.len() as f64;
    let nodes_in_progress = upgrade_times.len() - completed.len();
    let estimated_remaining = (nodes_in_progress > 0).then(|| mean * nodes_in_progress as f64);

    let earliest_start = upgrade_times.values().min().copied()?;
    let elapsed = (now - earliest_start).num_milliseconds() as f64 / 1000.0;

    Some(CurrentRunMetrics {
        elapsed_seconds: elapsed,
        estimated_remaining_seconds: estimated_remaining,
        nodes_completed: completed.len(),
        nodes_total: upgrade_times.len(),
        mean_seconds_per_node: mean,
        min_seconds_per_node: durations[0],
        max_seconds_per_node: durations[durations.len() - 1],
        fastest_node: completed.first().map(|(n, _)| n.to_string()),
        slowest_node: completed.last().map(|(n, _)| n.to_string()),
    })
}

async fn handler(
    ctx: Arc<AppContext>,
    cluster_id: String,
    args: DurationArgs,
) -> Result<UpgradeDurationOutput, HandlerError> {
    let handle = ctx.registry.resolve(&cluster_id)?;
    let clients = &handle.clients;
    let now = Utc::now();
    let mut errors: Vec<ToolError> = Vec::new();

    // Scope events to the requested pool via node membership. Losing the node
    // list degrades to unscoped timing rather than failing the call.
    let pool_nodes: Option<std::collections::HashSet<String>> =
        match clients.nodes.list_nodes().await {
            Ok(nodes) => Some(
                nodes
                    .into_iter()
                    .filter(|n| n.pool.as_deref() == Some(args.node_pool.as_str()))
                    .map(|n| n.name)
                    .collect(),
            ),
            Err(err) => {
                errors.push(ToolError::degraded(&cluster_id, &err));
                None
            }
        };

    // Current-run timing from the events stream.
    let mut upgrade_times: HashMap<String, DateTime<Utc>> = HashMap::new();
    let mut ready_times: HashMap<String, DateTime<Utc>> = HashMap::new();
    match clients.events.list_node_events().await {
        Ok(events) => {
            for event in events {
                let Some(ts) = event.timestamp else { continue };
                if let Some(members) = &pool_nodes {
                    if !members.contains(&event.node) {
                        continue;
                    }
                }
                match event.kind {
                    // A node can emit several upgrade events; the first marks
                    // when the drain actually began.
                    NodeEventKind::Upgrade => {
                        upgrade_times
                            .entry(event.node)
                            .and_modify(|existing| {
                                if ts < *existing {
                                    *existing = ts;
                                }
                            })
                            .or_insert(ts);
                    }
                    // Kubelet can fire NodeReady repeatedly while conditions
                    // stabilize; the last one is when it truly rejoined.
                    NodeEventKind::Ready => {
                        ready_times
                            .entry(event.node)
                            .and_modify(|existing| {
                                if ts > *existing {
                                    *existing = ts;
                                }
                            })
                            .or_insert(ts);
                    }
                    _ => {}
                }
            }
        }
        Err(err) => {
            errors.push(ToolError::degraded(&cluster_id, &err));
        }
    }
    let current_run = current_run_metrics(&upgrade_times, &ready_times, now);

    // Historical baselines from the audit log.
    let historical: Vec<HistoricalRecord> = match clients
        .control_plane
        .historical_upgrades(args.history_count)
        .await
    {
        Ok(records) => records
            .into_iter()
            .map(|r| HistoricalRecord {
                date: r
                    .completed_at
                    .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
                version_path: r.version_path,
                total_duration_seconds: r.duration_seconds,
                node_count: r.node_count,
            })
            .collect(),
        Err(err) => {
            errors.push(ToolError::degraded(&cluster_id, &err));
            vec![]
        }
    };

    let baseline_seconds = (ctx.thresholds.upgrade_anomaly_minutes * 60) as f64;
    let stats = if historical.is_empty() {
        None
    } else {
        let mut durations: Vec<f64> = historical
            .iter()
            .map(|h| h.total_duration_seconds)
            .collect();
        durations.sort_by(f64::total_cmp);
        let mean = durations.iter().sum::<f64>() / durations.len() as f64;
        let p90 = durations[nearest_rank_index(durations.len(), 0.9)];
        Some(HistoricalStats {
            mean_duration_seconds: mean,
            p90_duration_seconds: p90,
            min_duration_seconds: durations[0],
            max_duration_seconds: durations[durations.len() - 1],
            all_within_baseline: durations.iter().all(|d| *d <= baseline_seconds),
        })
    };

    // Flag early: the projected total (elapsed plus estimate) breaching the
    // baseline is more useful than a post-mortem alert.
    let anomaly_flag = current_run.as_ref().and_then(|run| {
        let estimated_total =
            run.elapsed_seconds + run.estimated_remaining_seconds.unwrap_or(0.0);
        (estimated_total > baseline_seconds).then(|| {
            format!(
                "Estimated duration ({}m) exceeds the {}-minute expected baseline",
                (estimated_total / 60.0) as i64,
                ctx.thresholds.upgrade_anomaly_minutes
            )
        })
    });

    let mut parts: Vec<String> = Vec::new();
    match &current_run {
        Some(run) => parts.push(format!(
            "Current run: {} nodes completed, {:.0}s mean per node",
            run.nodes_completed, run.mean_seconds_per_node
        )),
        None => parts.push("No active upgrade".to_string()),
    }
    if historical.is_empty() {
        parts.push("no historical data".to_string());
    } else if historical.len() < args.history_count {
        parts.push(format!(
            "{} of {} requested historical records found",
            historical.len(),
            args.history_count
        ));
    } else {
        parts.push(format!("{} historical records", historical.len()));
    }

    let partial_data = !errors.is_empty();
    Ok(UpgradeDurationOutput {
        cluster: cluster_id,
        node_pool: args.node_pool,
        current_run,
        historical,
        stats,
        anomaly_flag,
        summary: parts.join("; "),
        timestamp: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        errors,
        partial_data,
    })
}
