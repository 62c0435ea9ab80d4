//! Domain records shared between the client layer and the classifiers.
//!
//! All records are plain data constructed fresh from API responses inside a
//! single tool invocation and dropped when the envelope is serialized. Nothing
//! here holds SDK types — the client layer normalizes everything at the
//! boundary so the classifiers stay pure and testable.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Pressure level for a node pool. Ordering is severity: `Ok < Warning < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Pressure {
    Ok,
    Warning,
    Critical,
}

/// State of a single node during an upgrade. Exactly one state is assigned
/// per node; the set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Upgraded,
    Upgrading,
    Cordoned,
    PdbBlocked,
    Pending,
    Stalled,
}

impl NodeState {
    /// States in which the node is actively involved in the upgrade and its
    /// pods are expected to be churning.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            NodeState::Cordoned | NodeState::Upgrading | NodeState::PdbBlocked | NodeState::Stalled
        )
    }
}

/// Failure category for an unhealthy pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureCategory {
    Scheduling,
    Runtime,
    Registry,
    Config,
    Unknown,
}

impl FailureCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureCategory::Scheduling => "scheduling",
            FailureCategory::Runtime => "runtime",
            FailureCategory::Registry => "registry",
            FailureCategory::Config => "config",
            FailureCategory::Unknown => "unknown",
        }
    }
}

/// A node as seen by the core API, with quantities pre-parsed.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub name: String,
    /// Pool label value, already resolved through the primary/fallback keys.
    /// `None` when neither label is present.
    pub pool: Option<String>,
    pub unschedulable: bool,
    pub allocatable_cpu_millis: f64,
    pub allocatable_memory_bytes: f64,
    /// Kubelet version with any leading `v` stripped.
    pub version: String,
    pub ready: bool,
    pub age_seconds: Option<i64>,
}

/// Per-container status extracted from a pod.
#[derive(Debug, Clone, Default)]
pub struct ContainerStatus {
    pub name: String,
    pub ready: bool,
    pub restart_count: i64,
    /// Current `state.waiting.reason`, e.g. `CrashLoopBackOff`.
    pub waiting_reason: Option<String>,
    /// `lastState.terminated.reason` from the previous container run.
    pub last_terminated_reason: Option<String>,
    /// Raw memory limit quantity from the pod spec, kept as a string for
    /// OOMKill reporting.
    pub memory_limit: Option<String>,
}

/// A pod as seen by the core API.
#[derive(Debug, Clone, Default)]
pub struct PodRecord {
    pub name: String,
    pub namespace: String,
    pub phase: String,
    pub reason: Option<String>,
    pub node_name: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub containers: Vec<ContainerStatus>,
    /// Sum of container CPU requests, millicores.
    pub requests_cpu_millis: f64,
    /// Sum of container memory requests, bytes.
    pub requests_memory_bytes: f64,
}

/// Kind of a node lifecycle event, derived from the event reason string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEventKind {
    Upgrade,
    Ready,
    NotReady,
    Cordon,
    Other,
}

impl NodeEventKind {
    pub fn from_reason(reason: &str) -> Self {
        match reason {
            "NodeUpgrade" => NodeEventKind::Upgrade,
            "NodeReady" => NodeEventKind::Ready,
            "NodeNotReady" => NodeEventKind::NotReady,
            "NodeNotSchedulable" => NodeEventKind::Cordon,
            _ => NodeEventKind::Other,
        }
    }
}

/// An event attached to a node.
#[derive(Debug, Clone)]
pub struct NodeEvent {
    pub kind: NodeEventKind,
    pub node: String,
    pub message: String,
    pub timestamp: Option<DateTime<Utc>>,
}

/// An event attached to a pod.
#[derive(Debug, Clone)]
pub struct PodEvent {
    pub pod: String,
    pub namespace: String,
    pub reason: String,
    pub message: String,
    pub timestamp: Option<DateTime<Utc>>,
}

/// A PodDisruptionBudget threshold: an absolute count or a percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdbThreshold {
    Count(i64),
    Percent(i64),
}

/// A PodDisruptionBudget with its live status.
#[derive(Debug, Clone, Default)]
pub struct PdbRecord {
    pub name: String,
    pub namespace: String,
    /// `spec.selector.matchLabels`. An empty selector matches every pod in the
    /// PDB's namespace, per Kubernetes semantics.
    pub selector: BTreeMap<String, String>,
    pub min_available: Option<PdbThreshold>,
    pub max_unavailable: Option<PdbThreshold>,
    pub current_healthy: i64,
    pub desired_healthy: i64,
    pub expected_pods: i64,
    pub disruptions_allowed: i64,
}

impl PdbRecord {
    /// Whether this PDB's selector matches the given pod. Namespace must match
    /// and every selector label must be present on the pod.
    pub fn matches(&self, pod: &PodRecord) -> bool {
        if pod.namespace != self.namespace {
            return false;
        }
        self.selector
            .iter()
            .all(|(k, v)| pod.labels.get(k) == Some(v))
    }

    /// Resolve `min_available` against the expected pod count, rounding
    /// percentages up the way the eviction controller does.
    pub fn resolved_min_available(&self) -> Option<i64> {
        match self.min_available? {
            PdbThreshold::Count(n) => Some(n),
            PdbThreshold::Percent(p) => {
                Some((self.expected_pods * p + 99) / 100)
            }
        }
    }
}

/// CPU/memory usage for one node from the metrics endpoint.
#[derive(Debug, Clone)]
pub struct NodeMetrics {
    pub name: String,
    pub cpu_millis: f64,
    pub memory_bytes: f64,
}

/// One agent pool as described by the managed-cloud control plane.
#[derive(Debug, Clone, Default)]
pub struct PoolDescription {
    pub name: String,
    pub count: i64,
    /// Version the pool is running right now. `None` mid-upgrade on some API
    /// versions — treated as evidence that an upgrade is in flight.
    pub current_version: Option<String>,
    /// Desired version. Differs from `current_version` during an upgrade.
    pub target_version: Option<String>,
    pub provisioning_state: Option<String>,
}

impl PoolDescription {
    /// A pool is upgrading when the control plane says so, when the current
    /// version is unreported mid-upgrade, or when current and target diverge.
    pub fn is_upgrading(&self) -> bool {
        if self.provisioning_state.as_deref() == Some("Upgrading") {
            return true;
        }
        match (&self.current_version, &self.target_version) {
            (None, _) => true,
            (Some(current), Some(target)) => current != target,
            (Some(_), None) => false,
        }
    }
}

/// Control-plane description of a cluster.
#[derive(Debug, Clone, Default)]
pub struct ClusterDescription {
    pub control_plane_version: String,
    pub provisioning_state: Option<String>,
    pub fqdn: Option<String>,
    pub pools: Vec<PoolDescription>,
}

/// Support metadata for one Kubernetes version.
#[derive(Debug, Clone)]
pub struct VersionSupport {
    pub version: String,
    pub support_status: Option<String>,
    pub end_of_support: Option<DateTime<Utc>>,
}

/// Available upgrades plus the version support table.
#[derive(Debug, Clone, Default)]
pub struct UpgradeProfile {
    pub control_plane_upgrades: Vec<String>,
    pub version_support: Vec<VersionSupport>,
}

impl UpgradeProfile {
    /// Find support info for a version, matching exactly first and then by
    /// `major.minor` prefix (the audit table is keyed per minor release).
    pub fn support_for(&self, version: &str) -> Option<&VersionSupport> {
        if let Some(exact) = self.version_support.iter().find(|v| v.version == version) {
            return Some(exact);
        }
        let minor = version.splitn(3, '.').take(2).collect::<Vec<_>>().join(".");
        self.version_support
            .iter()
            .find(|v| v.version == minor || v.version.starts_with(&format!("{minor}.")))
    }
}

/// One completed upgrade from the control-plane audit log (~90-day retention).
#[derive(Debug, Clone)]
pub struct HistoricalUpgrade {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Human description of the version move, as recorded by the audit log.
    pub version_path: String,
    pub duration_seconds: f64,
    /// Per-node detail is not present in the audit log for all record shapes.
    pub node_count: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pressure_severity_is_ordered() {
        assert!(Pressure::Ok < Pressure::Warning);
        assert!(Pressure::Warning < Pressure::Critical);
        assert_eq!(
            [Pressure::Warning, Pressure::Ok, Pressure::Critical]
                .into_iter()
                .max(),
            Some(Pressure::Critical)
        );
    }

    #[test]
    fn pool_upgrading_when_versions_diverge() {
        let pool = PoolDescription {
            current_version: Some("1.29.8".into()),
            target_version: Some("1.30.0".into()),
            ..Default::default()
        };
        assert!(pool.is_upgrading());
    }

    #[test]
    fn pool_upgrading_when_current_version_missing() {
        // Mid-upgrade the control plane can report a null current version; that
        // alone means an upgrade is in flight.
        let pool = PoolDescription {
            current_version: None,
            target_version: Some("1.30.0".into()),
            ..Default::default()
        };
        assert!(pool.is_upgrading());
    }

    #[test]
    fn pool_not_upgrading_when_converged() {
        let pool = PoolDescription {
            current_version: Some("1.30.0".into()),
            target_version: Some("1.30.0".into()),
            provisioning_state: Some("Succeeded".into()),
            ..Default::default()
        };
        assert!(!pool.is_upgrading());
    }

    #[test]
    fn pdb_selector_requires_namespace_and_labels() {
        let pdb = PdbRecord {
            namespace: "payments".into(),
            selector: BTreeMap::from([("app".to_string(), "api".to_string())]),
            ..Default::default()
        };
        let mut pod = PodRecord {
            namespace: "payments".into(),
            labels: BTreeMap::from([("app".to_string(), "api".to_string())]),
            ..Default::default()
        };
        assert!(pdb.matches(&pod));
        pod.namespace = "other".into();
        assert!(!pdb.matches(&pod));
    }

    #[test]
    fn pdb_min_available_percent_rounds_up() {
        let pdb = PdbRecord {
            min_available: Some(PdbThreshold::Percent(50)),
            expected_pods: 3,
            ..Default::default()
        };
        assert_eq!(pdb.resolved_min_available(), Some(2));
    }

    #[test]
    fn version_support_matches_minor_prefix() {
        let profile = UpgradeProfile {
            control_plane_upgrades: vec![],
            version_support: vec![VersionSupport {
                version: "1.29".into(),
                support_status: Some("KubernetesOfficial".into()),
                end_of_support: None,
            }],
        };
        assert!(profile.support_for("1.29.8").is_some());
        assert!(profile.support_for("1.31.1").is_none());
    }
}
