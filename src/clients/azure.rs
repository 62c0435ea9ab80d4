//! Managed-cloud control-plane client over the ARM REST API.
//!
//! [`ArmClient`] wraps `reqwest::Client` with bearer authentication against
//! `management.azure.com`. The token comes from `AZURE_ACCESS_TOKEN` when set
//! (CI), otherwise from `az account get-access-token` (developer laptops) —
//! acquired once per process through a `OnceCell`, so concurrent first calls
//! from a fleet fan-out share a single acquisition.
//!
//! [`CachedControlPlane`] is a transparent 30-second cache over the two
//! fan-out-sensitive reads (`describe_cluster`, `upgrade_profile`); audit-log
//! queries pass through uncached.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, OnceCell};

use crate::clients::{ClientError, ControlPlaneSource};
use crate::config::ClusterConfig;
use crate::model::{
    ClusterDescription, HistoricalUpgrade, PoolDescription, UpgradeProfile, VersionSupport,
};

const ARM_BASE: &str = "https://management.azure.com";
const API_VERSION: &str = "2024-05-01";
const ACTIVITY_LOG_API_VERSION: &str = "2015-04-01";
const AUDIT_WINDOW_DAYS: i64 = 90;
const CACHE_TTL: Duration = Duration::from_secs(30);

/// The process-wide management token. One acquisition serves every cluster;
/// the ARM token is subscription-agnostic.
static ACCESS_TOKEN: OnceCell<String> = OnceCell::const_new();

async fn access_token() -> Result<String, ClientError> {
    let token = ACCESS_TOKEN
        .get_or_try_init(|| async {
            if let Ok(token) = std::env::var("AZURE_ACCESS_TOKEN") {
                if !token.is_empty() {
                    return Ok(token);
                }
            }
            let output = tokio::process::Command::new("az")
                .args([
                    "account",
                    "get-access-token",
                    "--resource",
                    ARM_BASE,
                    "--query",
                    "accessToken",
                    "--output",
                    "tsv",
                ])
                .output()
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "failed to spawn az for token acquisition");
                    ClientError::CredentialUnavailable
                })?;
            if !output.status.success() {
                tracing::error!(status = ?output.status, "az token acquisition failed");
                return Err(ClientError::CredentialUnavailable);
            }
            let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if token.is_empty() {
                return Err(ClientError::CredentialUnavailable);
            }
            Ok(token)
        })
        .await?;
    Ok(token.clone())
}

/// ARM REST client for one cluster.
pub struct ArmClient {
    http: reqwest::Client,
    config: ClusterConfig,
}

impl ArmClient {
    pub fn new(config: ClusterConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");
        Self { http, config }
    }

    fn cluster_resource_id(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.ContainerService/managedClusters/{}",
            self.config.subscription_id, self.config.resource_group, self.config.cluster_name
        )
    }

    async fn get_json(&self, url: &str, error: ClientError) -> Result<Value, ClientError> {
        let token = access_token().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(cluster = %self.config.cluster_id, error = %e, "cloud API request failed");
                error.clone()
            })?;
        if !response.status().is_success() {
            tracing::error!(
                cluster = %self.config.cluster_id,
                status = %response.status(),
                "cloud API returned non-success status"
            );
            return Err(error);
        }
        response.json().await.map_err(|e| {
            tracing::error!(cluster = %self.config.cluster_id, error = %e, "cloud API returned invalid JSON");
            error
        })
    }
}

#[async_trait]
impl ControlPlaneSource for ArmClient {
    async fn describe_cluster(&self) -> Result<ClusterDescription, ClientError> {
        let url = format!(
            "{ARM_BASE}{}?api-version={API_VERSION}",
            self.cluster_resource_id()
        );
        let body = self.get_json(&url, ClientError::CloudUnavailable).await?;
        let properties = body.get("properties").cloned().unwrap_or(Value::Null);

        let pools = properties
            .get("agentPoolProfiles")
            .and_then(Value::as_array)
            .map(|profiles| {
                profiles
                    .iter()
                    .map(|pool| PoolDescription {
                        name: str_field(pool, "name").unwrap_or_default(),
                        count: pool.get("count").and_then(Value::as_i64).unwrap_or(0),
                        current_version: str_field(pool, "currentOrchestratorVersion"),
                        target_version: str_field(pool, "orchestratorVersion"),
                        provisioning_state: str_field(pool, "provisioningState"),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(ClusterDescription {
            control_plane_version: str_field(&properties, "kubernetesVersion")
                .unwrap_or_else(|| "unknown".to_string()),
            provisioning_state: str_field(&properties, "provisioningState"),
            fqdn: str_field(&properties, "fqdn"),
            pools,
        })
    }

    async fn upgrade_profile(&self) -> Result<UpgradeProfile, ClientError> {
        let url = format!(
            "{ARM_BASE}{}/upgradeProfiles/default?api-version={API_VERSION}",
            self.cluster_resource_id()
        );
        let body = self.get_json(&url, ClientError::CloudUnavailable).await?;
        let control_plane_upgrades = body
            .pointer("/properties/controlPlaneProfile/upgrades")
            .and_then(Value::as_array)
            .map(|upgrades| {
                upgrades
                    .iter()
                    .filter_map(|u| str_field(u, "kubernetesVersion"))
                    .collect()
            })
            .unwrap_or_default();

        // Support windows come from the regional version listing; the upgrade
        // profile itself does not carry end-of-support dates.
        let versions_url = format!(
            "{ARM_BASE}/subscriptions/{}/providers/Microsoft.ContainerService/locations/{}/kubernetesVersions?api-version={API_VERSION}",
            self.config.subscription_id, self.config.region
        );
        let versions = self
            .get_json(&versions_url, ClientError::CloudUnavailable)
            .await?;
        let version_support = versions
            .get("values")
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(|entry| {
                        Some(VersionSupport {
                            version: str_field(entry, "version")?,
                            support_status: entry
                                .pointer("/capabilities/supportPlan/0")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                            end_of_support: str_field(entry, "endOfLifeDate")
                                .and_then(|raw| parse_arm_timestamp(&raw)),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(UpgradeProfile {
            control_plane_upgrades,
            version_support,
        })
    }

    async fn historical_upgrades(
        &self,
        limit: usize,
    ) -> Result<Vec<HistoricalUpgrade>, ClientError> {
        let now = Utc::now();
        let window_start = now - chrono::Duration::days(AUDIT_WINDOW_DAYS);
        let filter = format!(
            "eventTimestamp ge '{}' and eventTimestamp le '{}' and resourceUri eq '{}'",
            window_start.to_rfc3339(),
            now.to_rfc3339(),
            self.cluster_resource_id()
        );
        let url = format!(
            "{ARM_BASE}/subscriptions/{}/providers/Microsoft.Insights/eventtypes/management/values?api-version={ACTIVITY_LOG_API_VERSION}&$filter={}",
            self.config.subscription_id,
            urlencode(&filter)
        );
        let body = self
            .get_json(&url, ClientError::AuditLogUnavailable)
            .await?;

        let mut records = Vec::new();
        for entry in body.get("value").and_then(Value::as_array).into_iter().flatten() {
            if records.len() >= limit {
                break;
            }
            let operation = entry
                .pointer("/operationName/value")
                .and_then(Value::as_str)
                .unwrap_or("");
            let status = entry
                .pointer("/status/value")
                .and_then(Value::as_str)
                .unwrap_or("");
            if operation != "Microsoft.ContainerService/managedClusters/write"
                || status != "Succeeded"
            {
                continue;
            }
            let completed_at = str_field(entry, "eventTimestamp")
                .and_then(|raw| parse_arm_timestamp(&raw));
            let started_at = str_field(entry, "submissionTimestamp")
                .and_then(|raw| parse_arm_timestamp(&raw));
            let (Some(start), Some(end)) = (started_at, completed_at) else {
                continue;
            };
            let duration_seconds = (end - start).num_milliseconds() as f64 / 1000.0;
            if duration_seconds <= 0.0 {
                continue;
            }
            records.push(HistoricalUpgrade {
                started_at,
                completed_at,
                version_path: str_field(entry, "description")
                    .unwrap_or_else(|| "unknown".to_string()),
                duration_seconds,
                node_count: None,
            });
        }
        Ok(records)
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn parse_arm_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Minimal query-string escaping for the OData filter (spaces, quotes,
/// colons from the RFC 3339 timestamps).
fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            ' ' => out.push_str("%20"),
            '\'' => out.push_str("%27"),
            ':' => out.push_str("%3A"),
            '+' => out.push_str("%2B"),
            _ => out.push(c),
        }
    }
    out
}

/// 30-second time-keyed cache over the control-plane reads that fan-out
/// bursts hit hardest. Thread-safe and transparent to callers.
pub struct CachedControlPlane<S> {
    inner: Arc<S>,
    describe: Mutex<Option<(Instant, ClusterDescription)>>,
    profile: Mutex<Option<(Instant, UpgradeProfile)>>,
}

impl<S> CachedControlPlane<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner: Arc::new(inner),
            describe: Mutex::new(None),
            profile: Mutex::new(None),
        }
    }
}

#[async_trait]
impl<S: ControlPlaneSource + 'static> ControlPlaneSource for CachedControlPlane<S> {
    async fn describe_cluster(&self) -> Result<ClusterDescription, ClientError> {
        let mut slot = self.describe.lock().await;
        if let Some((fetched, cached)) = slot.as_ref() {
            if fetched.elapsed() < CACHE_TTL {
                return Ok(cached.clone());
            }
        }
        let fresh = self.inner.describe_cluster().await?;
        *slot = Some((Instant::now(), fresh.clone()));
        Ok(fresh)
    }

    async fn upgrade_profile(&self) -> Result<UpgradeProfile, ClientError> {
        let mut slot = self.profile.lock().await;
        if let Some((fetched, cached)) = slot.as_ref() {
            if fetched.elapsed() < CACHE_TTL {
                return Ok(cached.clone());
            }
        }
        let fresh = self.inner.upgrade_profile().await?;
        *slot = Some((Instant::now(), fresh.clone()));
        Ok(fresh)
    }

    async fn historical_upgrades(
        &self,
        limit: usize,
    ) -> Result<Vec<HistoricalUpgrade>, ClientError> {
        self.inner.historical_upgrades(limit).await
    }
}
