//! Fleet fan-out engine.
//!
//! Dispatches a per-cluster handler against one cluster or the whole fleet.
//! Each cluster runs in its own spawned task so a failure (or panic) in one
//! cannot disturb the others; the result list is returned in stable
//! cluster-ID order. Parallelism is naturally bounded by the fleet size.
//! Retries are the client layer's concern, not this one's.

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::envelope::HandlerError;
use crate::registry::AppContext;

/// Target of a tool call: a concrete cluster or the `all` sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterTarget {
    All,
    One(String),
}

impl ClusterTarget {
    pub fn parse(cluster: &str) -> Self {
        if cluster == "all" {
            ClusterTarget::All
        } else {
            ClusterTarget::One(cluster.to_string())
        }
    }
}

/// Run `handler` once per configured cluster, concurrently and isolated.
///
/// The returned vector is sorted by cluster ID regardless of completion
/// order. A task that dies without producing a result (panic, runtime
/// shutdown) is reported as [`HandlerError::Aborted`] for its cluster.
pub async fn fan_out<T, F, Fut>(
    ctx: &Arc<AppContext>,
    handler: F,
) -> Vec<(String, Result<T, HandlerError>)>
where
    T: Send + 'static,
    F: Fn(Arc<AppContext>, String) -> Fut,
    Fut: Future<Output = Result<T, HandlerError>> + Send + 'static,
{
    let mut set = JoinSet::new();
    for cluster_id in ctx.registry.cluster_ids() {
        let fut = handler(ctx.clone(), cluster_id.clone());
        set.spawn(async move { (cluster_id, fut.await) });
    }

    let mut results = Vec::with_capacity(ctx.registry.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((cluster_id, result)) => results.push((cluster_id, result)),
            Err(join_err) => {
                // The task identity is lost on a panic; log it and account for
                // the gap below so the envelope still covers every cluster.
                tracing::error!(error = %join_err, "cluster task failed to complete");
            }
        }
    }

    // Any cluster missing from the results lost its task — report it aborted
    // rather than silently dropping it from the envelope.
    for cluster_id in ctx.registry.cluster_ids() {
        if !results.iter().any(|(id, _)| *id == cluster_id) {
            results.push((cluster_id, Err(HandlerError::Aborted)));
        }
    }

    results.sort_by(|(a, _), (b, _)| a.cmp(b));
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::mock::StaticSources;
    use crate::clients::ClientError;
    use crate::config::{ClusterConfig, Thresholds};
    use crate::registry::ClusterRegistry;

    fn context(ids: &[&str]) -> Arc<AppContext> {
        let parts = ids
            .iter()
            .map(|id| {
                let (environment, region) = id.split_once('-').unwrap();
                let config = ClusterConfig {
                    cluster_id: id.to_string(),
                    environment: environment.to_string(),
                    region: region.to_string(),
                    subscription_id: "12345678-1234-1234-1234-123456789abc".to_string(),
                    resource_group: format!("rg-{id}"),
                    cluster_name: format!("aks-{id}"),
                    kube_context: format!("aks-{id}"),
                };
                (config, StaticSources::default().into_client_set())
            })
            .collect();
        Arc::new(AppContext::new(
            ClusterRegistry::from_parts(parts),
            Thresholds::default(),
        ))
    }

    #[test]
    fn parse_all_sentinel() {
        assert_eq!(ClusterTarget::parse("all"), ClusterTarget::All);
        assert_eq!(
            ClusterTarget::parse("dev-eastus"),
            ClusterTarget::One("dev-eastus".into())
        );
    }

    #[tokio::test]
    async fn results_come_back_in_cluster_id_order() {
        let ctx = context(&["prod-westus2", "dev-eastus", "staging-eastus"]);
        let results = fan_out(&ctx, |_, id| async move { Ok::<_, HandlerError>(id.len()) }).await;
        let ids: Vec<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["dev-eastus", "prod-westus2", "staging-eastus"]);
    }

    #[tokio::test]
    async fn one_failure_does_not_disturb_others() {
        let ctx = context(&["dev-eastus", "staging-westus2"]);
        let results = fan_out(&ctx, |_, id| async move {
            if id == "staging-westus2" {
                Err(HandlerError::Client(ClientError::CoreUnavailable))
            } else {
                Ok(42)
            }
        })
        .await;
        assert!(matches!(results[0], (ref id, Ok(42)) if id == "dev-eastus"));
        assert!(matches!(
            results[1],
            (ref id, Err(HandlerError::Client(ClientError::CoreUnavailable))) if id == "staging-westus2"
        ));
    }

    #[tokio::test]
    async fn panicking_cluster_is_reported_aborted() {
        let ctx = context(&["dev-eastus", "dev-westus2"]);
        let results = fan_out(&ctx, |_, id| async move {
            if id == "dev-westus2" {
                panic!("boom");
            }
            Ok(1)
        })
        .await;
        assert!(matches!(results[0], (_, Ok(1))));
        assert!(matches!(results[1], (_, Err(HandlerError::Aborted))));
    }
}
