//! `get_kubernetes_upgrade_status` — control-plane and per-pool version state.
//!
//! Reads the cluster description and upgrade profile from the control plane,
//! flags pools whose version support window is closed (`deprecated`) or
//! closing within 60 days (`nearing_eos`), and detects in-flight upgrades.
//! A missing current version mid-upgrade counts as upgrading — the version
//! comparison is never attempted against a null.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

use super::{cluster_arg, respond, respond_handler_error, ToolResult};
use crate::envelope::{merge_fleet, HandlerError, ToolError};
use crate::fanout::{fan_out, ClusterTarget};
use crate::model::UpgradeProfile;
use crate::registry::AppContext;

const NEARING_EOS_DAYS: i64 = 60;

/// Version info for a single node pool.
#[derive(Debug, Serialize)]
pub struct NodePoolVersionInfo {
    pub pool_name: String,
    /// Null while the control plane withholds the current version mid-upgrade.
    pub current_version: Option<String>,
    pub target_version: Option<String>,
    pub upgrading: bool,
    pub support_status: Option<String>,
    pub days_until_eos: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct UpgradeStatusOutput {
    pub cluster: String,
    pub control_plane_version: String,
    pub node_pools: Vec<NodePoolVersionInfo>,
    pub available_upgrades: Vec<String>,
    pub upgrade_active: bool,
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
    match ClusterTarget::parse(cluster) {
        ClusterTarget::All => {
            let results = fan_out(ctx, handler).await;
            respond(ctx, &merge_fleet(results))
        }
        ClusterTarget::One(id) => match handler(ctx.clone(), id.clone()).await {
            Ok(output) => respond(ctx, &output),
            Err(err) => respond_handler_error(ctx, &id, &err),
        },
    }
}

/// Support classification for a pool version: past end-of-support is
/// `deprecated`, within 60 days is `nearing_eos`, otherwise the profile's
/// own support plan string.
fn support_fields(
    profile: &UpgradeProfile,
    version: &str,
    now: chrono::DateTime<Utc>,
) -> (Option<String>, Option<i64>) {
    let Some(support) = profile.support_for(version) else {
        return (None, None);
    };
    match support.end_of_support {
        Some(eos) => {
            let days = (eos - now).num_days();
            let status = if days < 0 {
                "deprecated".to_string()
            } else if days <= NEARING_EOS_DAYS {
                "nearing_eos".to_string()
            } else {
                support
                    .support_status
                    .clone()
                    .unwrap_or_else(|| "supported".to_string())
            };
            (Some(status), Some(days))
        }
        None => (support.support_status.clone(), None),
    }
}

async fn handler(
    ctx: Arc<AppContext>,
    cluster_id: String,
) -> Result<UpgradeStatusOutput, HandlerError> {
    let handle = ctx.registry.resolve(&cluster_id)?;
    let clients = &handle.clients;
    let now = Utc::now();
    let mut errors: Vec<ToolError> = Vec::new();

    // The description is the backbone of this answer; without it the handler
    // fails outright and fan-out reports the cluster unreachable.
    let description = clients.control_plane.describe_cluster().await?;

    // The profile only enriches with upgrade options and support windows.
    let profile = match clients.control_plane.upgrade_profile().await {
        Ok(profile) => profile,
        Err(err) => {
            errors.push(ToolError::degraded(&cluster_id, &err));
            UpgradeProfile::default()
        }
    };

    let mut node_pools = Vec::with_capacity(description.pools.len());
    let mut upgrade_active = false;
    for pool in &description.pools {
        let upgrading = pool.is_upgrading();
        if upgrading {
            upgrade_active = true;
        }
        let (support_status, days_until_eos) = pool
            .current_version
            .as_deref()
            .map(|v| support_fields(&profile, v, now))
            .unwrap_or((None, None));
        node_pools.push(NodePoolVersionInfo {
            pool_name: pool.name.clone(),
            current_version: pool.current_version.clone(),
            target_version: if upgrading {
                pool.target_version.clone()
            } else {
                None
            },
            upgrading,
            support_status,
            days_until_eos,
        });
    }

    let available_upgrades = profile.control_plane_upgrades.clone();
    let upgrade_count = available_upgrades.len();
    let mut summary = format!(
        "{cluster_id} running {}",
        description.control_plane_version
    );
    if upgrade_active {
        summary.push_str(", upgrade in progress");
    } else if upgrade_count > 0 {
        let plural = if upgrade_count == 1 { "" } else { "s" };
        summary.push_str(&format!(", {upgrade_count} upgrade{plural} available"));
    }
    if node_pools
        .iter()
        .any(|p| p.support_status.as_deref() == Some("deprecated"))
    {
        summary.push_str(", deprecated version in use");
    }

    let partial_data = !errors.is_empty();
    Ok(UpgradeStatusOutput {
        cluster: cluster_id,
        control_plane_version: description.control_plane_version,
        node_pools,
        available_upgrades,
        upgrade_active,
        summary,
        timestamp: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        errors,
        partial_data,
    })
}
