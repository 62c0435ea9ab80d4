//! Cluster registry and shared application context.
//!
//! [`ClusterRegistry`] maps composite cluster IDs to their configuration and
//! lazily-constructed client sets. All tool handlers resolve clusters through
//! [`ClusterRegistry::resolve`]; an unknown ID yields a structured error
//! listing the valid IDs so the calling agent can self-correct.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::clients::ClientSet;
use crate::config::{ClusterConfig, Thresholds};
use crate::envelope::HandlerError;
use crate::scrub::Scrubber;

/// One configured cluster: its identity plus its client set.
pub struct ClusterHandle {
    pub config: ClusterConfig,
    pub clients: ClientSet,
}

impl std::fmt::Debug for ClusterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterHandle")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Registry of configured clusters, keyed by composite ID. The `BTreeMap`
/// keeps iteration in stable cluster-ID order, which the fan-out engine and
/// error messages both rely on.
pub struct ClusterRegistry {
    clusters: BTreeMap<String, Arc<ClusterHandle>>,
}

impl ClusterRegistry {
    /// Build a registry with production client sets.
    pub fn new(configs: Vec<ClusterConfig>) -> Self {
        Self::from_parts(
            configs
                .into_iter()
                .map(|config| {
                    let clients = ClientSet::for_cluster(&config);
                    (config, clients)
                })
                .collect(),
        )
    }

    /// Build a registry from explicit (config, clients) pairs. Tests use this
    /// to inject in-memory sources.
    pub fn from_parts(parts: Vec<(ClusterConfig, ClientSet)>) -> Self {
        let clusters = parts
            .into_iter()
            .map(|(config, clients)| {
                let id = config.cluster_id.clone();
                (id, Arc::new(ClusterHandle { config, clients }))
            })
            .collect();
        Self { clusters }
    }

    /// Resolve a cluster ID to its handle.
    pub fn resolve(&self, cluster_id: &str) -> Result<Arc<ClusterHandle>, HandlerError> {
        self.clusters.get(cluster_id).cloned().ok_or_else(|| {
            let valid = self
                .clusters
                .keys()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ");
            HandlerError::UnknownCluster(format!(
                "Unknown cluster '{cluster_id}'. Valid clusters: {valid}"
            ))
        })
    }

    /// All configured cluster IDs, in stable order.
    pub fn cluster_ids(&self) -> Vec<String> {
        self.clusters.keys().cloned().collect()
    }

    /// All configured subscription IDs (scrubber input).
    pub fn subscription_ids(&self) -> Vec<String> {
        self.clusters
            .values()
            .map(|h| h.config.subscription_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

/// Shared, immutable state for the life of the process.
pub struct AppContext {
    pub registry: ClusterRegistry,
    pub thresholds: Thresholds,
    pub scrubber: Scrubber,
}

impl AppContext {
    pub fn new(registry: ClusterRegistry, thresholds: Thresholds) -> Self {
        let scrubber = Scrubber::new(&registry.subscription_ids());
        Self {
            registry,
            thresholds,
            scrubber,
        }
    }
}
