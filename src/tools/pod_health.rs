//! `get_pod_health` — failed and pending pod diagnostics with failure
//! grouping.
//!
//! Unhealthy pods are filtered by namespace and status, categorized with the
//! shared taxonomy, enriched with the most recent pod event as root-cause
//! context, and capped at 50 entries. The per-category counts always cover
//! every matching pod, not just the capped list.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

use super::classify::{categorize_failure, is_unhealthy, oomkill_info, phase_rank};
use super::{cluster_arg, respond, respond_handler_error, respond_validation, ToolResult};
use crate::envelope::{merge_fleet, HandlerError, ToolError};
use crate::fanout::{fan_out, ClusterTarget};
use crate::model::FailureCategory;
use crate::registry::AppContext;
use crate::validation::{validate_namespace, StatusFilter};

const RESULT_CAP: usize = 50;

/// Detail for a single unhealthy pod.
#[derive(Debug, Serialize)]
pub struct PodDetail {
    pub name: String,
    pub namespace: String,
    pub phase: String,
    pub reason: Option<String>,
    pub failure_category: FailureCategory,
    pub restart_count: i64,
    /// Most recent event message for the pod, when the events API answered.
    pub last_event: Option<String>,
    /// OOM-killed container name, when the failure was an OOM kill.
    pub container_name: Option<String>,
    /// Memory limit of the OOM-killed container.
    pub memory_limit: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PodHealthOutput {
    pub cluster: String,
    pub pods: Vec<PodDetail>,
    /// Failure-category counts over all matching pods.
    pub groups: BTreeMap<String, usize>,
    pub total_matching: usize,
    pub truncated: bool,
    pub summary: String,
    pub timestamp: String,
    pub errors: Vec<ToolError>,
    pub partial_data: bool,
}

#[derive(Clone)]
struct PodHealthArgs {
    namespace: Option<String>,
    status_filter: StatusFilter,
}

pub async fn run(ctx: &Arc<AppContext>, args: &Value) -> ToolResult {
    let cluster = match cluster_arg(args) {
        Ok(cluster) => cluster,
        Err(result) => return result,
    };
    let namespace = args
        .get("namespace")
        .and_then(Value::as_str)
        .map(str::to_string);
    if let Err(message) = validate_namespace(namespace.as_deref()) {
        return respond_validation(ctx, cluster, message);
    }
    let status_filter = match StatusFilter::parse(
        args.get("status_filter").and_then(Value::as_str).unwrap_or("all"),
    ) {
        Ok(filter) => filter,
        Err(message) => return respond_validation(ctx, cluster, message),
    };
    let tool_args = PodHealthArgs {
        namespace,
        status_filter,
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

async fn handler(
    ctx: Arc<AppContext>,
    cluster_id: String,
    args: PodHealthArgs,
) -> Result<PodHealthOutput, HandlerError> {
    let handle = ctx.registry.resolve(&cluster_id)?;
    let clients = &handle.clients;
    let now = Utc::now();
    let mut errors: Vec<ToolError> = Vec::new();

    let pods = clients.nodes.list_pods(args.namespace.as_deref()).await?;

    // Event context is best-effort; without it pods still classify.
    let events = match clients.events.list_pod_events(args.namespace.as_deref()).await {
        Ok(events) => events,
        Err(err) => {
            errors.push(ToolError::degraded(&cluster_id, &err));
            vec![]
        }
    };

    // Most recent event per pod; events arrive timestamp-sorted but the guard
    // keeps this correct regardless.
    let mut event_map: HashMap<(String, String), (Option<DateTime<Utc>>, String)> = HashMap::new();
    for event in events {
        let key = (event.namespace.clone(), event.pod.clone());
        match event_map.get(&key) {
            Some((existing, _)) if *existing >= event.timestamp => {}
            _ => {
                event_map.insert(key, (event.timestamp, event.message));
            }
        }
    }

    let mut matching: Vec<_> = pods
        .iter()
        .filter(|p| is_unhealthy(p))
        .filter(|p| match args.status_filter {
            StatusFilter::Pending => p.phase == "Pending",
            StatusFilter::Failed => p.phase == "Failed",
            StatusFilter::All => true,
        })
        .collect();

    let total_matching = matching.len();

    // Category counts cover every match, not just the capped display list.
    let mut groups: BTreeMap<String, usize> = BTreeMap::new();
    for pod in &matching {
        *groups
            .entry(categorize_failure(pod).as_str().to_string())
            .or_default() += 1;
    }

    // Failed before Pending, then most recent event first; name breaks ties
    // so identical invocations serialize identically.
    matching.sort_by(|a, b| {
        let ts = |p: &&crate::model::PodRecord| {
            event_map
                .get(&(p.namespace.clone(), p.name.clone()))
                .and_then(|(ts, _)| *ts)
        };
        phase_rank(&a.phase)
            .cmp(&phase_rank(&b.phase))
            .then_with(|| ts(b).cmp(&ts(a)))
            .then_with(|| a.name.cmp(&b.name))
    });

    let truncated = total_matching > RESULT_CAP;
    let mut pod_details = Vec::with_capacity(matching.len().min(RESULT_CAP));
    for pod in matching.iter().take(RESULT_CAP) {
        let category = categorize_failure(pod);
        let (container_name, memory_limit, restart_count) = match oomkill_info(pod) {
            Some((name, limit, restarts)) => (Some(name), limit, restarts),
            None => (
                None,
                None,
                pod.containers.iter().map(|c| c.restart_count).sum(),
            ),
        };
        pod_details.push(PodDetail {
            name: pod.name.clone(),
            namespace: pod.namespace.clone(),
            phase: pod.phase.clone(),
            reason: pod.reason.clone(),
            failure_category: category,
            restart_count,
            last_event: event_map
                .get(&(pod.namespace.clone(), pod.name.clone()))
                .map(|(_, message)| message.clone()),
            container_name,
            memory_limit,
        });
    }

    let summary = if truncated {
        format!("Showing {RESULT_CAP} of {total_matching} matching pods in {cluster_id}")
    } else if total_matching > 0 {
        let plural = if total_matching == 1 { "" } else { "s" };
        format!("{total_matching} unhealthy pod{plural} in {cluster_id}")
    } else {
        format!("No unhealthy pods in {cluster_id}")
    };

    let partial_data = !errors.is_empty();
    Ok(PodHealthOutput {
        cluster: cluster_id,
        pods: pod_details,
        groups,
        total_matching,
        truncated,
        summary,
        timestamp: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        errors,
        partial_data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::mock::{pod, waiting_container, StaticSources};
    use crate::clients::ClientError;
    use crate::model::{ContainerStatus, PodEvent};
    use crate::tools::testutil::{context_with, payload};
    use serde_json::json;

    fn crashing_pod(name: &str) -> crate::model::PodRecord {
        let mut p = pod(name, "default", "Running", Some("n1"));
        p.containers = vec![waiting_container("app", "CrashLoopBackOff")];
        p
    }

    #[tokio::test]
    async fn unhealthy_pods_are_categorized_and_counted() {
        let mut image_pod = pod("img", "default", "Pending", Some("n1"));
        image_pod.containers = vec![waiting_container("app", "ImagePullBackOff")];
        let sources = StaticSources {
            pods: Ok(vec![
                crashing_pod("crash"),
                image_pod,
                pod("healthy", "default", "Running", Some("n1")),
            ]),
            ..Default::default()
        };
        let ctx = context_with(vec![("dev-eastus", sources)]);
        let out = handler(
            ctx,
            "dev-eastus".into(),
            PodHealthArgs {
                namespace: None,
                status_filter: StatusFilter::All,
            },
        )
        .await
        .unwrap();
        assert_eq!(out.total_matching, 2);
        assert_eq!(out.groups.get("runtime"), Some(&1));
        assert_eq!(out.groups.get("registry"), Some(&1));
        assert!(!out.truncated);
    }

    #[tokio::test]
    async fn status_filter_narrows_to_phase() {
        let sources = StaticSources {
            pods: Ok(vec![
                pod("stuck", "default", "Pending", None),
                pod("dead", "default", "Failed", Some("n1")),
            ]),
            ..Default::default()
        };
        let ctx = context_with(vec![("dev-eastus", sources)]);
        let out = handler(
            ctx,
            "dev-eastus".into(),
            PodHealthArgs {
                namespace: None,
                status_filter: StatusFilter::Pending,
            },
        )
        .await
        .unwrap();
        assert_eq!(out.total_matching, 1);
        assert_eq!(out.pods[0].name, "stuck");
    }

    #[tokio::test]
    async fn cap_applies_but_groups_cover_everything() {
        let pods: Vec<_> = (0..60)
            .map(|i| pod(&format!("pending-{i:02}"), "default", "Pending", None))
            .collect();
        let sources = StaticSources {
            pods: Ok(pods),
            ..Default::default()
        };
        let ctx = context_with(vec![("dev-eastus", sources)]);
        let out = handler(
            ctx,
            "dev-eastus".into(),
            PodHealthArgs {
                namespace: None,
                status_filter: StatusFilter::All,
            },
        )
        .await
        .unwrap();
        assert_eq!(out.pods.len(), RESULT_CAP);
        assert!(out.truncated);
        assert_eq!(out.total_matching, 60);
        assert_eq!(out.groups.values().sum::<usize>(), 60);
        assert!(out.summary.contains("Showing 50 of 60"));
    }

    #[tokio::test]
    async fn failed_pods_sort_before_pending() {
        let sources = StaticSources {
            pods: Ok(vec![
                pod("b-pending", "default", "Pending", None),
                pod("a-failed", "default", "Failed", Some("n1")),
            ]),
            ..Default::default()
        };
        let ctx = context_with(vec![("dev-eastus", sources)]);
        let out = handler(
            ctx,
            "dev-eastus".into(),
            PodHealthArgs {
                namespace: None,
                status_filter: StatusFilter::All,
            },
        )
        .await
        .unwrap();
        assert_eq!(out.pods[0].name, "a-failed");
        assert_eq!(out.pods[1].name, "b-pending");
    }

    #[tokio::test]
    async fn oomkilled_pod_reports_container_and_limit() {
        let mut p = pod("oom", "default", "Running", Some("n1"));
        p.containers = vec![ContainerStatus {
            name: "worker".into(),
            restart_count: 4,
            last_terminated_reason: Some("OOMKilled".into()),
            memory_limit: Some("256Mi".into()),
            ..Default::default()
        }];
        let sources = StaticSources {
            pods: Ok(vec![p]),
            ..Default::default()
        };
        let ctx = context_with(vec![("dev-eastus", sources)]);
        let out = handler(
            ctx,
            "dev-eastus".into(),
            PodHealthArgs {
                namespace: None,
                status_filter: StatusFilter::All,
            },
        )
        .await
        .unwrap();
        assert_eq!(out.pods[0].container_name.as_deref(), Some("worker"));
        assert_eq!(out.pods[0].memory_limit.as_deref(), Some("256Mi"));
        assert_eq!(out.pods[0].restart_count, 4);
    }

    #[tokio::test]
    async fn event_context_attaches_most_recent_message() {
        let sources = StaticSources {
            pods: Ok(vec![pod("stuck", "default", "Pending", None)]),
            pod_events: Ok(vec![
                PodEvent {
                    pod: "stuck".into(),
                    namespace: "default".into(),
                    reason: "FailedScheduling".into(),
                    message: "older message".into(),
                    timestamp: Some(Utc::now() - chrono::Duration::minutes(10)),
                },
                PodEvent {
                    pod: "stuck".into(),
                    namespace: "default".into(),
                    reason: "FailedScheduling".into(),
                    message: "0/3 nodes are available".into(),
                    timestamp: Some(Utc::now()),
                },
            ]),
            ..Default::default()
        };
        let ctx = context_with(vec![("dev-eastus", sources)]);
        let out = handler(
            ctx,
            "dev-eastus".into(),
            PodHealthArgs {
                namespace: None,
                status_filter: StatusFilter::All,
            },
        )
        .await
        .unwrap();
        assert_eq!(out.pods[0].last_event.as_deref(), Some("0/3 nodes are available"));
    }

    #[tokio::test]
    async fn events_outage_degrades_with_envelope_error() {
        let sources = StaticSources {
            pods: Ok(vec![pod("stuck", "default", "Pending", None)]),
            pod_events: Err(ClientError::EventsUnavailable),
            ..Default::default()
        };
        let ctx = context_with(vec![("dev-eastus", sources)]);
        let out = handler(
            ctx,
            "dev-eastus".into(),
            PodHealthArgs {
                namespace: None,
                status_filter: StatusFilter::All,
            },
        )
        .await
        .unwrap();
        assert_eq!(out.errors[0].source, "events-api");
        assert!(out.partial_data);
        assert_eq!(out.total_matching, 1);
    }

    #[tokio::test]
    async fn invalid_namespace_is_rejected_before_any_client_call() {
        let ctx = context_with(vec![("dev-eastus", StaticSources::default())]);
        let result = run(
            &ctx,
            &json!({"cluster": "dev-eastus", "namespace": "Not-Valid"}),
        )
        .await;
        assert!(result.is_error);
        let value = payload(&result);
        assert_eq!(value["errors"][0]["source"], "validation");
        assert_eq!(value["partial_data"], false);
    }

    #[tokio::test]
    async fn invalid_status_filter_is_rejected() {
        let ctx = context_with(vec![("dev-eastus", StaticSources::default())]);
        let result = run(
            &ctx,
            &json!({"cluster": "dev-eastus", "status_filter": "broken"}),
        )
        .await;
        assert!(result.is_error);
        let value = payload(&result);
        assert_eq!(value["errors"][0]["source"], "validation");
    }
}
