//! Input validation for tool parameters.
//!
//! Validation runs before any client is constructed or invoked; a failure is
//! reported with `source="validation"` and never reaches a cluster.

use once_cell::sync::Lazy;
use regex::Regex;

// RFC 1123 label: lowercase alphanumeric and hyphens, 1-63 chars,
// starts and ends with an alphanumeric. Kubernetes enforces this for
// namespace names.
static NAMESPACE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").expect("static regex"));

// AKS node pool names are stricter than generic RFC 1123: must start with a
// letter and are capped at 12 characters.
static NODE_POOL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9]{0,11}$").expect("static regex"));

/// Validate a Kubernetes namespace name. `None` means "all namespaces".
pub fn validate_namespace(namespace: Option<&str>) -> Result<(), String> {
    let Some(namespace) = namespace else {
        return Ok(());
    };
    if NAMESPACE_RE.is_match(namespace) {
        Ok(())
    } else {
        Err(format!(
            "Invalid namespace: '{namespace}'. Must be a valid RFC 1123 label."
        ))
    }
}

/// Validate an AKS node pool name. `None` means "all pools".
pub fn validate_node_pool(node_pool: Option<&str>) -> Result<(), String> {
    let Some(node_pool) = node_pool else {
        return Ok(());
    };
    if NODE_POOL_RE.is_match(node_pool) {
        Ok(())
    } else {
        Err(format!(
            "Invalid node pool name: '{node_pool}'. Must be 1-12 lowercase alphanumeric starting with a letter."
        ))
    }
}

/// Validate `history_count` against its documented range.
pub fn validate_history_count(count: i64) -> Result<usize, String> {
    if (1..=50).contains(&count) {
        Ok(count as usize)
    } else {
        Err(format!(
            "Invalid history_count: {count}. Must be between 1 and 50."
        ))
    }
}

/// Pod status filter for `get_pod_health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    Pending,
    Failed,
    All,
}

impl StatusFilter {
    pub fn parse(value: &str) -> Result<Self, String> {
        match value {
            "pending" => Ok(StatusFilter::Pending),
            "failed" => Ok(StatusFilter::Failed),
            "all" => Ok(StatusFilter::All),
            other => Err(format!(
                "Invalid status_filter: '{other}'. Must be one of: all, failed, pending"
            )),
        }
    }
}

/// Evaluation mode for `check_pdb_upgrade_risk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdbMode {
    Preflight,
    Live,
}

impl PdbMode {
    pub fn parse(value: &str) -> Result<Self, String> {
        match value {
            "preflight" => Ok(PdbMode::Preflight),
            "live" => Ok(PdbMode::Live),
            other => Err(format!(
                "Invalid mode: '{other}'. Must be one of: live, preflight"
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PdbMode::Preflight => "preflight",
            PdbMode::Live => "live",
        }
    }
}
