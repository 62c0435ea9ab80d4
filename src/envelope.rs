//! Result-envelope protocol: the shared error record, the single-error
//! envelope, and the fleet merge.
//!
//! Every tool output carries `errors: Vec<ToolError>` and `partial_data`.
//! `partial_data` is true exactly when at least one dependency failed but
//! usable payload remains; a cluster that cannot even be resolved yields a
//! single-error envelope with `partial_data=false`.

use serde::Serialize;

use crate::clients::ClientError;

/// Structured error attached to an envelope. The `error` string is always
/// scrub-safe: client errors paraphrase the condition and validation errors
/// only echo caller input, which is scrubbed again before serialization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolError {
    pub error: String,
    /// Failing dependency: `core-api`, `metrics-api`, `events-api`,
    /// `policy-api`, `cloud-api`, `cloud-audit-log`, `config`, `validation`,
    /// or `cancelled`.
    pub source: String,
    pub cluster: String,
    pub partial_data: bool,
}

impl ToolError {
    pub fn new(cluster: &str, source: &str, error: impl Into<String>, partial_data: bool) -> Self {
        Self {
            error: error.into(),
            source: source.to_string(),
            cluster: cluster.to_string(),
            partial_data,
        }
    }

    /// Degraded-but-continuing failure from a client call.
    pub fn degraded(cluster: &str, err: &ClientError) -> Self {
        Self::new(cluster, err.source(), err.to_string(), true)
    }

    pub fn validation(cluster: &str, message: impl Into<String>) -> Self {
        Self::new(cluster, "validation", message, false)
    }

    pub fn cancelled(cluster: &str) -> Self {
        Self::new(cluster, "cancelled", "tool call cancelled by client", false)
    }
}

/// Why a per-cluster handler failed outright (as opposed to degrading).
#[derive(Debug, Clone)]
pub enum HandlerError {
    /// The cluster ID did not resolve; the message lists valid IDs.
    UnknownCluster(String),
    /// A client the handler cannot continue without failed.
    Client(ClientError),
    /// The cluster task died before producing a result.
    Aborted,
}

impl HandlerError {
    pub fn to_tool_error(&self, cluster: &str) -> ToolError {
        match self {
            HandlerError::UnknownCluster(message) => {
                ToolError::new(cluster, "config", message.clone(), false)
            }
            HandlerError::Client(err) => ToolError::new(cluster, err.source(), err.to_string(), true),
            HandlerError::Aborted => {
                ToolError::new(cluster, "core-api", "cluster handler aborted unexpectedly", true)
            }
        }
    }
}

impl From<ClientError> for HandlerError {
    fn from(err: ClientError) -> Self {
        HandlerError::Client(err)
    }
}

/// Envelope for a request that produced no payload at all (unresolvable
/// cluster, validation failure, cancellation).
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub cluster: String,
    pub errors: Vec<ToolError>,
    pub partial_data: bool,
}

impl ErrorEnvelope {
    pub fn single(cluster: &str, error: ToolError) -> Self {
        Self {
            cluster: cluster.to_string(),
            errors: vec![error],
            partial_data: false,
        }
    }
}

/// Merged envelope for a fleet-wide (`cluster="all"`) invocation. Clusters
/// appear in stable cluster-ID order; one `ToolError` per failed cluster.
#[derive(Debug, Serialize)]
pub struct FleetEnvelope<T: Serialize> {
    pub clusters: Vec<T>,
    pub errors: Vec<ToolError>,
    pub partial_data: bool,
}

/// Merge per-cluster results into a fleet envelope. Input must already be in
/// stable cluster-ID order; the fan-out engine guarantees that.
pub fn merge_fleet<T: Serialize>(results: Vec<(String, Result<T, HandlerError>)>) -> FleetEnvelope<T> {
    let mut clusters = Vec::new();
    let mut errors = Vec::new();
    for (cluster_id, result) in results {
        match result {
            Ok(output) => clusters.push(output),
            Err(err) => errors.push(err.to_tool_error(&cluster_id)),
        }
    }
    let partial_data = !errors.is_empty() && !clusters.is_empty();
    FleetEnvelope {
        clusters,
        errors,
        partial_data,
    }
}
