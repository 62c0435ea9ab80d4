//! Client abstractions for the Kubernetes and managed-cloud APIs.
//!
//! Five capability traits, each parameterized by a resolved [`ClusterConfig`]
//! at construction time. Tool handlers only ever see `Arc<dyn Trait>` behind a
//! [`ClientSet`], so classifiers are testable against in-memory sources and the
//! real SDK types never leak past this module.
//!
//! ## Failure contract
//!
//! Every method either returns a fully-populated result or a [`ClientError`]
//! whose `Display` string is already safe to forward to the caller — it
//! paraphrases the condition and carries no SDK error text, hostnames, or
//! identifiers. The underlying detail is logged to stderr at the failure site.
//!
//! ## Concurrency contract
//!
//! All methods are safe to call concurrently from independent cluster tasks.
//! Expensive construction (kubeconfig load, credential acquisition) is lazy
//! and guarded by `tokio::sync::OnceCell`, so two concurrent first calls
//! cannot race into duplicate or half-initialized instances.

pub mod azure;
pub mod kube;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ClusterConfig;
use crate::model::{
    ClusterDescription, HistoricalUpgrade, NodeEvent, NodeMetrics, NodeRecord, PdbRecord,
    PodEvent, PodRecord, UpgradeProfile,
};

/// Errors surfaced by any client method. Messages are deliberately paraphrased;
/// the `source` tag feeds the envelope error taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("cluster API not reachable")]
    CoreUnavailable,
    #[error("metrics endpoint not reachable")]
    MetricsUnavailable,
    #[error("events API not reachable")]
    EventsUnavailable,
    #[error("policy API not reachable")]
    PolicyUnavailable,
    #[error("cloud management API request failed")]
    CloudUnavailable,
    #[error("cloud credential acquisition failed")]
    CredentialUnavailable,
    #[error("cloud audit log query failed")]
    AuditLogUnavailable,
}

impl ClientError {
    /// Stable `source` tag for envelope errors.
    pub fn source(&self) -> &'static str {
        match self {
            ClientError::CoreUnavailable => "core-api",
            ClientError::MetricsUnavailable => "metrics-api",
            ClientError::EventsUnavailable => "events-api",
            ClientError::PolicyUnavailable => "policy-api",
            ClientError::CloudUnavailable | ClientError::CredentialUnavailable => "cloud-api",
            ClientError::AuditLogUnavailable => "cloud-audit-log",
        }
    }
}

/// Nodes and pods from the core API.
#[async_trait]
pub trait NodePodSource: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<NodeRecord>, ClientError>;
    async fn list_pods(&self, namespace: Option<&str>) -> Result<Vec<PodRecord>, ClientError>;
}

/// Per-node CPU/memory usage from the metrics endpoint. Fails with the
/// distinguishable [`ClientError::MetricsUnavailable`] so callers can degrade.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn list_node_metrics(&self) -> Result<Vec<NodeMetrics>, ClientError>;
}

/// Node and pod lifecycle events.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn list_node_events(&self) -> Result<Vec<NodeEvent>, ClientError>;
    async fn list_pod_events(&self, namespace: Option<&str>)
        -> Result<Vec<PodEvent>, ClientError>;
}

/// PodDisruptionBudgets with enough status to compute satisfiability.
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn list_pdbs(&self) -> Result<Vec<PdbRecord>, ClientError>;
}

/// Managed-cloud control plane: cluster description, upgrade profile, and the
/// audit log of past upgrades (~90-day retention).
#[async_trait]
pub trait ControlPlaneSource: Send + Sync {
    async fn describe_cluster(&self) -> Result<ClusterDescription, ClientError>;
    async fn upgrade_profile(&self) -> Result<UpgradeProfile, ClientError>;
    async fn historical_upgrades(&self, limit: usize)
        -> Result<Vec<HistoricalUpgrade>, ClientError>;
}

/// The five sources for one cluster, ready for a tool handler.
#[derive(Clone)]
pub struct ClientSet {
    pub nodes: Arc<dyn NodePodSource>,
    pub metrics: Arc<dyn MetricsSource>,
    pub events: Arc<dyn EventSource>,
    pub policy: Arc<dyn PolicySource>,
    pub control_plane: Arc<dyn ControlPlaneSource>,
}

impl ClientSet {
    /// Build the production client set for a cluster: one Kubernetes-backed
    /// client serving the four in-cluster sources, and a cached ARM client for
    /// the control plane.
    pub fn for_cluster(config: &ClusterConfig) -> Self {
        let kube = Arc::new(kube::KubeApi::new(config.clone()));
        let arm = azure::ArmClient::new(config.clone());
        Self {
            nodes: kube.clone(),
            metrics: kube.clone(),
            events: kube.clone(),
            policy: kube,
            control_plane: Arc::new(azure::CachedControlPlane::new(arm)),
        }
    }
}

#[cfg(test)]
pub mod mock {
    //! In-memory sources for handler tests. Each field is the canned result
    //! its trait method returns.

    use std::collections::BTreeMap;

    use super::*;
    use crate::model::{ContainerStatus, NodeEventKind};
    use chrono::{DateTime, Utc};

    pub struct StaticSources {
        pub nodes: Result<Vec<NodeRecord>, ClientError>,
        pub pods: Result<Vec<PodRecord>, ClientError>,
        pub metrics: Result<Vec<NodeMetrics>, ClientError>,
        pub node_events: Result<Vec<NodeEvent>, ClientError>,
        pub pod_events: Result<Vec<PodEvent>, ClientError>,
        pub pdbs: Result<Vec<PdbRecord>, ClientError>,
        pub description: Result<ClusterDescription, ClientError>,
        pub profile: Result<UpgradeProfile, ClientError>,
        pub history: Result<Vec<HistoricalUpgrade>, ClientError>,
    }

    impl Default for StaticSources {
        fn default() -> Self {
            Self {
                nodes: Ok(vec![]),
                pods: Ok(vec![]),
                metrics: Ok(vec![]),
                node_events: Ok(vec![]),
                pod_events: Ok(vec![]),
                pdbs: Ok(vec![]),
                description: Ok(ClusterDescription::default()),
                profile: Ok(UpgradeProfile::default()),
                history: Ok(vec![]),
            }
        }
    }

    impl StaticSources {
        pub fn into_client_set(self) -> ClientSet {
            let shared = Arc::new(self);
            ClientSet {
                nodes: shared.clone(),
                metrics: shared.clone(),
                events: shared.clone(),
                policy: shared.clone(),
                control_plane: shared,
            }
        }
    }

    #[async_trait]
    impl NodePodSource for StaticSources {
        async fn list_nodes(&self) -> Result<Vec<NodeRecord>, ClientError> {
            self.nodes.clone()
        }
        async fn list_pods(
            &self,
            namespace: Option<&str>,
        ) -> Result<Vec<PodRecord>, ClientError> {
            let pods = self.pods.clone()?;
            Ok(match namespace {
                Some(ns) => pods.into_iter().filter(|p| p.namespace == ns).collect(),
                None => pods,
            })
        }
    }

    #[async_trait]
    impl MetricsSource for StaticSources {
        async fn list_node_metrics(&self) -> Result<Vec<NodeMetrics>, ClientError> {
            self.metrics.clone()
        }
    }

    #[async_trait]
    impl EventSource for StaticSources {
        async fn list_node_events(&self) -> Result<Vec<NodeEvent>, ClientError> {
            self.node_events.clone()
        }
        async fn list_pod_events(
            &self,
            namespace: Option<&str>,
        ) -> Result<Vec<PodEvent>, ClientError> {
            let events = self.pod_events.clone()?;
            Ok(match namespace {
                Some(ns) => events.into_iter().filter(|e| e.namespace == ns).collect(),
                None => events,
            })
        }
    }

    #[async_trait]
    impl PolicySource for StaticSources {
        async fn list_pdbs(&self) -> Result<Vec<PdbRecord>, ClientError> {
            self.pdbs.clone()
        }
    }

    #[async_trait]
    impl ControlPlaneSource for StaticSources {
        async fn describe_cluster(&self) -> Result<ClusterDescription, ClientError> {
            self.description.clone()
        }
        async fn upgrade_profile(&self) -> Result<UpgradeProfile, ClientError> {
            self.profile.clone()
        }
        async fn historical_upgrades(
            &self,
            limit: usize,
        ) -> Result<Vec<HistoricalUpgrade>, ClientError> {
            let mut records = self.history.clone()?;
            records.truncate(limit);
            Ok(records)
        }
    }

    // Record builders with sensible defaults so tests only spell out the
    // fields their scenario cares about.

    pub fn node(name: &str, pool: &str) -> NodeRecord {
        NodeRecord {
            name: name.to_string(),
            pool: Some(pool.to_string()),
            unschedulable: false,
            allocatable_cpu_millis: 4000.0,
            allocatable_memory_bytes: 16.0 * 1024.0 * 1024.0 * 1024.0,
            version: "1.29.8".to_string(),
            ready: true,
            age_seconds: Some(86_400),
        }
    }

    pub fn pod(name: &str, namespace: &str, phase: &str, node: Option<&str>) -> PodRecord {
        PodRecord {
            name: name.to_string(),
            namespace: namespace.to_string(),
            phase: phase.to_string(),
            reason: None,
            node_name: node.map(str::to_string),
            labels: BTreeMap::new(),
            containers: vec![],
            requests_cpu_millis: 0.0,
            requests_memory_bytes: 0.0,
        }
    }

    pub fn waiting_container(name: &str, reason: &str) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            waiting_reason: Some(reason.to_string()),
            ..Default::default()
        }
    }

    pub fn node_event(
        node: &str,
        kind: NodeEventKind,
        timestamp: DateTime<Utc>,
    ) -> NodeEvent {
        NodeEvent {
            kind,
            node: node.to_string(),
            message: String::new(),
            timestamp: Some(timestamp),
        }
    }
}
