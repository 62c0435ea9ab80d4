//! Kubernetes-backed implementations of the in-cluster sources.
//!
//! One [`KubeApi`] per cluster serves nodes/pods, node metrics, events, and
//! PodDisruptionBudgets. The underlying `kube::Client` is built lazily from
//! the kubeconfig context named in the cluster config; construction is guarded
//! by a `OnceCell` so concurrent first calls share one initialization. The
//! kubeconfig read is the only blocking I/O and runs on the blocking pool.
//!
//! SDK responses are flattened into the plain records in [`crate::model`] at
//! this boundary; error details are logged here and never propagated.

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, Node, Pod};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Api;
use tokio::sync::OnceCell;

use crate::clients::{ClientError, EventSource, MetricsSource, NodePodSource, PolicySource};
use crate::config::ClusterConfig;
use crate::model::{
    ContainerStatus, NodeEvent, NodeEventKind, NodeMetrics, NodeRecord, PdbRecord, PdbThreshold,
    PodEvent, PodRecord,
};
use crate::units::{parse_cpu_millicores, parse_memory_bytes};

// AKS exposes the pool name under two label generations.
const PRIMARY_POOL_LABEL: &str = "agentpool";
const FALLBACK_POOL_LABEL: &str = "kubernetes.azure.com/agentpool";

/// Kubernetes API access for a single cluster.
pub struct KubeApi {
    config: ClusterConfig,
    client: OnceCell<kube::Client>,
}

impl KubeApi {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            client: OnceCell::new(),
        }
    }

    /// Lazily build the client for this cluster's kubeconfig context. The
    /// `OnceCell` serializes concurrent first calls, so exactly one
    /// construction runs even under fleet fan-out.
    async fn client(&self) -> Result<kube::Client, String> {
        let context = self.config.kube_context.clone();
        let client = self
            .client
            .get_or_try_init(|| async {
                let kubeconfig = tokio::task::spawn_blocking(Kubeconfig::read)
                    .await
                    .map_err(|e| format!("kubeconfig load task failed: {e}"))?
                    .map_err(|e| format!("kubeconfig load failed: {e}"))?;
                let options = KubeConfigOptions {
                    context: Some(context),
                    ..Default::default()
                };
                let config = kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| format!("kubeconfig context failed: {e}"))?;
                kube::Client::try_from(config).map_err(|e| format!("client build failed: {e}"))
            })
            .await?;
        Ok(client.clone())
    }
}

#[async_trait]
impl NodePodSource for KubeApi {
    async fn list_nodes(&self) -> Result<Vec<NodeRecord>, ClientError> {
        let client = self.client().await.map_err(|detail| {
            tracing::error!(cluster = %self.config.cluster_id, detail = %detail, "failed to build cluster client");
            ClientError::CoreUnavailable
        })?;
        let nodes: Api<Node> = Api::all(client);
        let list = nodes.list(&ListParams::default()).await.map_err(|e| {
            tracing::error!(cluster = %self.config.cluster_id, error = %e, "failed to list nodes");
            ClientError::CoreUnavailable
        })?;

        let now = Utc::now();
        Ok(list.items.into_iter().map(|node| node_record(node, now)).collect())
    }

    async fn list_pods(&self, namespace: Option<&str>) -> Result<Vec<PodRecord>, ClientError> {
        let client = self.client().await.map_err(|detail| {
            tracing::error!(cluster = %self.config.cluster_id, detail = %detail, "failed to build cluster client");
            ClientError::CoreUnavailable
        })?;
        let pods: Api<Pod> = match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };
        let list = pods.list(&ListParams::default()).await.map_err(|e| {
            tracing::error!(
                cluster = %self.config.cluster_id,
                namespace = namespace.unwrap_or("*"),
                error = %e,
                "failed to list pods"
            );
            ClientError::CoreUnavailable
        })?;

        Ok(list.items.into_iter().map(pod_record).collect())
    }
}

#[async_trait]
impl MetricsSource for KubeApi {
    async fn list_node_metrics(&self) -> Result<Vec<NodeMetrics>, ClientError> {
        let client = self
            .client()
            .await
            .map_err(|_| ClientError::MetricsUnavailable)?;

        // metrics.k8s.io is an aggregated API group with no typed client;
        // query it raw and pick the usage quantities out of the JSON.
        let request = http::Request::get("/apis/metrics.k8s.io/v1beta1/nodes")
            .body(Vec::new())
            .map_err(|_| ClientError::MetricsUnavailable)?;
        let response: serde_json::Value =
            client.request(request).await.map_err(|e| {
                tracing::warn!(cluster = %self.config.cluster_id, error = %e, "metrics endpoint unavailable");
                ClientError::MetricsUnavailable
            })?;

        let items = response
            .get("items")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(items
            .iter()
            .filter_map(|item| {
                let name = item.pointer("/metadata/name")?.as_str()?.to_string();
                let usage = item.get("usage")?;
                Some(NodeMetrics {
                    name,
                    cpu_millis: parse_cpu_millicores(usage.get("cpu")?.as_str().unwrap_or("0")),
                    memory_bytes: parse_memory_bytes(
                        usage.get("memory")?.as_str().unwrap_or("0"),
                    ),
                })
            })
            .collect())
    }
}

#[async_trait]
impl EventSource for KubeApi {
    async fn list_node_events(&self) -> Result<Vec<NodeEvent>, ClientError> {
        let client = self
            .client()
            .await
            .map_err(|_| ClientError::EventsUnavailable)?;
        let events: Api<Event> = Api::all(client);
        let params = ListParams::default().fields("involvedObject.kind=Node");
        let list = events.list(&params).await.map_err(|e| {
            tracing::error!(cluster = %self.config.cluster_id, error = %e, "failed to list node events");
            ClientError::EventsUnavailable
        })?;

        let mut records: Vec<NodeEvent> = list
            .items
            .into_iter()
            .filter_map(|event| {
                let node = event.involved_object.name.clone()?;
                Some(NodeEvent {
                    kind: NodeEventKind::from_reason(event.reason.as_deref().unwrap_or("")),
                    node,
                    message: event.message.clone().unwrap_or_default(),
                    timestamp: event_timestamp(&event),
                })
            })
            .collect();
        // Monotonic order per node falls out of a global timestamp sort.
        records.sort_by_key(|e| e.timestamp);
        Ok(records)
    }

    async fn list_pod_events(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<PodEvent>, ClientError> {
        let client = self
            .client()
            .await
            .map_err(|_| ClientError::EventsUnavailable)?;
        let events: Api<Event> = match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };
        let params = ListParams::default().fields("involvedObject.kind=Pod");
        let list = events.list(&params).await.map_err(|e| {
            tracing::error!(
                cluster = %self.config.cluster_id,
                namespace = namespace.unwrap_or("*"),
                error = %e,
                "failed to list pod events"
            );
            ClientError::EventsUnavailable
        })?;

        let mut records: Vec<PodEvent> = list
            .items
            .into_iter()
            .filter_map(|event| {
                let pod = event.involved_object.name.clone()?;
                let namespace = event.involved_object.namespace.clone().unwrap_or_default();
                Some(PodEvent {
                    pod,
                    namespace,
                    reason: event.reason.clone().unwrap_or_default(),
                    message: event.message.clone().unwrap_or_default(),
                    timestamp: event_timestamp(&event),
                })
            })
            .collect();
        records.sort_by_key(|e| e.timestamp);
        Ok(records)
    }
}

#[async_trait]
impl PolicySource for KubeApi {
    async fn list_pdbs(&self) -> Result<Vec<PdbRecord>, ClientError> {
        let client = self
            .client()
            .await
            .map_err(|_| ClientError::PolicyUnavailable)?;
        let pdbs: Api<PodDisruptionBudget> = Api::all(client);
        let list = pdbs.list(&ListParams::default()).await.map_err(|e| {
            tracing::error!(cluster = %self.config.cluster_id, error = %e, "failed to list PDBs");
            ClientError::PolicyUnavailable
        })?;

        Ok(list.items.into_iter().map(pdb_record).collect())
    }
}

fn node_record(node: Node, now: chrono::DateTime<Utc>) -> NodeRecord {
    let name = node.metadata.name.clone().unwrap_or_default();
    let labels = node.metadata.labels.clone().unwrap_or_default();
    let pool = labels
        .get(PRIMARY_POOL_LABEL)
        .or_else(|| labels.get(FALLBACK_POOL_LABEL))
        .cloned();

    let spec = node.spec.unwrap_or_default();
    let status = node.status.unwrap_or_default();
    let allocatable = status.allocatable.unwrap_or_default();
    let ready = status
        .conditions
        .as_ref()
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);
    let version = status
        .node_info
        .map(|info| info.kubelet_version.trim_start_matches('v').to_string())
        .unwrap_or_default();
    let age_seconds = node
        .metadata
        .creation_timestamp
        .map(|t| (now - t.0).num_seconds());

    NodeRecord {
        name,
        pool,
        unschedulable: spec.unschedulable.unwrap_or(false),
        allocatable_cpu_millis: allocatable
            .get("cpu")
            .map(|q| parse_cpu_millicores(&q.0))
            .unwrap_or(0.0),
        allocatable_memory_bytes: allocatable
            .get("memory")
            .map(|q| parse_memory_bytes(&q.0))
            .unwrap_or(0.0),
        version,
        ready,
        age_seconds,
    }
}

fn pod_record(pod: Pod) -> PodRecord {
    let name = pod.metadata.name.clone().unwrap_or_default();
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let labels = pod.metadata.labels.clone().unwrap_or_default();

    let spec = pod.spec.unwrap_or_default();
    let status = pod.status.unwrap_or_default();

    // Memory limits by container name so OOMKill reports can name the limit.
    let mut requests_cpu = 0.0;
    let mut requests_memory = 0.0;
    let mut memory_limits = std::collections::BTreeMap::new();
    for container in &spec.containers {
        if let Some(resources) = &container.resources {
            if let Some(requests) = &resources.requests {
                if let Some(cpu) = requests.get("cpu") {
                    requests_cpu += parse_cpu_millicores(&cpu.0);
                }
                if let Some(memory) = requests.get("memory") {
                    requests_memory += parse_memory_bytes(&memory.0);
                }
            }
            if let Some(limits) = &resources.limits {
                if let Some(memory) = limits.get("memory") {
                    memory_limits.insert(container.name.clone(), memory.0.clone());
                }
            }
        }
    }

    let containers = status
        .container_statuses
        .unwrap_or_default()
        .into_iter()
        .map(|cs| ContainerStatus {
            memory_limit: memory_limits.get(&cs.name).cloned(),
            waiting_reason: cs
                .state
                .as_ref()
                .and_then(|s| s.waiting.as_ref())
                .and_then(|w| w.reason.clone()),
            last_terminated_reason: cs
                .last_state
                .as_ref()
                .and_then(|s| s.terminated.as_ref())
                .and_then(|t| t.reason.clone()),
            name: cs.name,
            ready: cs.ready,
            restart_count: i64::from(cs.restart_count),
        })
        .collect();

    PodRecord {
        name,
        namespace,
        phase: status.phase.unwrap_or_else(|| "Unknown".to_string()),
        reason: status.reason,
        node_name: spec.node_name,
        labels,
        containers,
        requests_cpu_millis: requests_cpu,
        requests_memory_bytes: requests_memory,
    }
}

fn pdb_record(pdb: PodDisruptionBudget) -> PdbRecord {
    let spec = pdb.spec.unwrap_or_default();
    let status = pdb.status.unwrap_or_default();
    PdbRecord {
        name: pdb.metadata.name.unwrap_or_default(),
        namespace: pdb.metadata.namespace.unwrap_or_default(),
        selector: spec
            .selector
            .and_then(|s| s.match_labels)
            .unwrap_or_default(),
        min_available: spec.min_available.as_ref().map(pdb_threshold),
        max_unavailable: spec.max_unavailable.as_ref().map(pdb_threshold),
        current_healthy: i64::from(status.current_healthy),
        desired_healthy: i64::from(status.desired_healthy),
        expected_pods: i64::from(status.expected_pods),
        disruptions_allowed: i64::from(status.disruptions_allowed),
    }
}

fn pdb_threshold(value: &IntOrString) -> PdbThreshold {
    match value {
        IntOrString::Int(n) => PdbThreshold::Count(i64::from(*n)),
        IntOrString::String(s) => {
            let trimmed = s.trim_end_matches('%');
            match (s.ends_with('%'), trimmed.parse::<i64>()) {
                (true, Ok(p)) => PdbThreshold::Percent(p),
                (false, Ok(n)) => PdbThreshold::Count(n),
                // Malformed values act as "no budget left" rather than
                // pretending there is headroom.
                _ => PdbThreshold::Count(0),
            }
        }
    }
}

/// Pick the most relevant of an event's three timestamp fields:
/// `lastTimestamp` tracks recurrence, `eventTime` serves newer event objects,
/// `firstTimestamp` is the fallback.
fn event_timestamp(event: &Event) -> Option<chrono::DateTime<Utc>> {
    event
        .last_timestamp
        .as_ref()
        .map(|t| t.0)
        .or_else(|| event.event_time.as_ref().map(|t| t.0))
        .or_else(|| event.first_timestamp.as_ref().map(|t| t.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdb_threshold_parses_int_and_percent() {
        assert_eq!(
            pdb_threshold(&IntOrString::Int(2)),
            PdbThreshold::Count(2)
        );
        assert_eq!(
            pdb_threshold(&IntOrString::String("25%".into())),
            PdbThreshold::Percent(25)
        );
        assert_eq!(
            pdb_threshold(&IntOrString::String("3".into())),
            PdbThreshold::Count(3)
        );
        assert_eq!(
            pdb_threshold(&IntOrString::String("garbage".into())),
            PdbThreshold::Count(0)
        );
    }
}
