//! Cluster map and threshold configuration.
//!
//! The cluster map is a YAML document with one entry per composite cluster ID
//! (`<environment>-<region>`), resolved from three sources (tried in order):
//!
//! 1. `--clusters <path>` CLI flag
//! 2. `FLEET_CLUSTER_MAP` environment variable
//! 3. `clusters.yaml` in the working directory
//!
//! ```yaml
//! clusters:
//!   prod-eastus:
//!     environment: prod
//!     region: eastus
//!     subscription_id: "00000000-0000-0000-0000-000000000000"
//!     resource_group: rg-prod-eastus
//!     cluster_name: aks-prod-eastus
//!     kube_context: aks-prod-eastus
//! ```
//!
//! Thresholds are read once from environment variables at startup and are
//! immutable for the life of the process.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use uuid::Uuid;

/// Immutable configuration for a single cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Composite ID of the form `<environment>-<region>`, e.g. `prod-eastus`.
    pub cluster_id: String,
    pub environment: String,
    pub region: String,
    pub subscription_id: String,
    pub resource_group: String,
    pub cluster_name: String,
    pub kube_context: String,
}

/// Raw YAML cluster map.
#[derive(Deserialize)]
struct ClusterMapFile {
    clusters: BTreeMap<String, ClusterEntry>,
}

#[derive(Deserialize)]
struct ClusterEntry {
    environment: String,
    region: String,
    subscription_id: String,
    resource_group: String,
    cluster_name: String,
    kube_context: String,
}

/// Resolve the cluster map path from CLI flag, env var, or default location.
pub fn cluster_map_path(cli_path: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_path {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var("FLEET_CLUSTER_MAP") {
        return PathBuf::from(path);
    }
    PathBuf::from("clusters.yaml")
}

/// Load and validate the cluster map.
pub fn load_cluster_map(path: &Path) -> Result<Vec<ClusterConfig>, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read cluster map {}: {e}", path.display()))?;

    let file: ClusterMapFile = serde_yaml::from_str(&contents)
        .map_err(|e| format!("Failed to parse cluster map {}: {e}", path.display()))?;

    if file.clusters.is_empty() {
        return Err("Cluster map contains no clusters".into());
    }

    let mut configs = Vec::with_capacity(file.clusters.len());
    for (cluster_id, entry) in file.clusters {
        let config = ClusterConfig {
            cluster_id: cluster_id.clone(),
            environment: entry.environment,
            region: entry.region,
            subscription_id: entry.subscription_id,
            resource_group: entry.resource_group,
            cluster_name: entry.cluster_name,
            kube_context: entry.kube_context,
        };
        validate_cluster(&config)?;
        configs.push(config);
    }
    Ok(configs)
}

fn validate_cluster(config: &ClusterConfig) -> Result<(), String> {
    let id = &config.cluster_id;
    let expected = format!("{}-{}", config.environment, config.region);
    if *id != expected {
        return Err(format!(
            "Cluster '{id}' does not match its environment/region ('{expected}')"
        ));
    }
    if config.subscription_id.starts_with('<') && config.subscription_id.ends_with('>') {
        return Err(format!(
            "Cluster '{id}' has a placeholder subscription ID. Set a real subscription ID before serving."
        ));
    }
    if Uuid::parse_str(&config.subscription_id).is_err() {
        return Err(format!("Cluster '{id}' has a malformed subscription ID"));
    }
    for (field, value) in [
        ("resource_group", &config.resource_group),
        ("cluster_name", &config.cluster_name),
        ("kube_context", &config.kube_context),
    ] {
        if value.is_empty() {
            return Err(format!("Cluster '{id}' has an empty {field}"));
        }
    }
    Ok(())
}

/// Operational thresholds with environment variable overrides.
#[derive(Debug, Clone)]
pub struct Thresholds {
    pub cpu_warning: f64,
    pub cpu_critical: f64,
    pub memory_warning: f64,
    pub memory_critical: f64,
    pub pending_pods_warning: i64,
    pub pending_pods_critical: i64,
    pub upgrade_anomaly_minutes: i64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_warning: 75.0,
            cpu_critical: 90.0,
            memory_warning: 80.0,
            memory_critical: 95.0,
            pending_pods_warning: 1,
            pending_pods_critical: 10,
            upgrade_anomaly_minutes: 60,
        }
    }
}

impl Thresholds {
    /// Read thresholds from the environment, falling back to defaults for
    /// unset or unparseable values.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            cpu_warning: env_f64("PRESSURE_CPU_WARNING", defaults.cpu_warning),
            cpu_critical: env_f64("PRESSURE_CPU_CRITICAL", defaults.cpu_critical),
            memory_warning: env_f64("PRESSURE_MEMORY_WARNING", defaults.memory_warning),
            memory_critical: env_f64("PRESSURE_MEMORY_CRITICAL", defaults.memory_critical),
            pending_pods_warning: env_i64("PRESSURE_PENDING_PODS_WARNING", defaults.pending_pods_warning),
            pending_pods_critical: env_i64("PRESSURE_PENDING_PODS_CRITICAL", defaults.pending_pods_critical),
            upgrade_anomaly_minutes: env_i64("UPGRADE_ANOMALY_MINUTES", defaults.upgrade_anomaly_minutes),
        }
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "unparseable threshold override, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "unparseable threshold override, using default");
            default
        }),
        Err(_) => default,
    }
}
