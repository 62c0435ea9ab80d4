//! Shared pod failure classification used by pod health and upgrade progress.
//!
//! The taxonomy groups failure reasons by the layer that produced them:
//! scheduling failures happen before any container starts, registry failures
//! mean the image never arrived, config failures mean the image ran into bad
//! configuration, and runtime failures cover everything that died after
//! starting (including OOM kills).

use crate::model::{FailureCategory, PodRecord};

const SCHEDULING_REASONS: &[&str] = &[
    "Unschedulable",
    "FailedScheduling",
    "PodFitsResources",
    "InsufficientCPU",
    "InsufficientMemory",
];
const RUNTIME_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "OOMKilled",
    "Error",
    "ContainerStatusUnknown",
];
const REGISTRY_REASONS: &[&str] = &["ImagePullBackOff", "ErrImagePull", "ErrImageNeverPull"];
const CONFIG_REASONS: &[&str] = &[
    "CreateContainerConfigError",
    "InvalidImageName",
    "RunContainerError",
];

fn match_reason(reason: &str) -> Option<FailureCategory> {
    if SCHEDULING_REASONS.contains(&reason) {
        Some(FailureCategory::Scheduling)
    } else if RUNTIME_REASONS.contains(&reason) {
        Some(FailureCategory::Runtime)
    } else if REGISTRY_REASONS.contains(&reason) {
        Some(FailureCategory::Registry)
    } else if CONFIG_REASONS.contains(&reason) {
        Some(FailureCategory::Config)
    } else {
        None
    }
}

/// Determine the failure category for a pod. The pod-level reason wins for
/// scheduling failures (no container ever started); otherwise the current
/// container waiting reason is the most actionable signal, then the previous
/// run's termination reason, then the pod-level reason as a last resort.
pub fn categorize_failure(pod: &PodRecord) -> FailureCategory {
    if let Some(reason) = pod.reason.as_deref() {
        if SCHEDULING_REASONS.contains(&reason) {
            return FailureCategory::Scheduling;
        }
    }
    // Pending pods with no node assignment failed to schedule even when the
    // API reports no explicit reason.
    if pod.phase == "Pending" && pod.node_name.is_none() && pod.reason.is_none() {
        return FailureCategory::Scheduling;
    }

    for cs in &pod.containers {
        if let Some(category) = cs.waiting_reason.as_deref().and_then(match_reason) {
            return category;
        }
        if cs.last_terminated_reason.as_deref() == Some("OOMKilled") {
            return FailureCategory::Runtime;
        }
    }

    pod.reason
        .as_deref()
        .and_then(match_reason)
        .unwrap_or(FailureCategory::Unknown)
}

/// Whether a pod is currently unhealthy: bad phase, a bad container waiting
/// state, or an OOM kill in its most recent container run.
pub fn is_unhealthy(pod: &PodRecord) -> bool {
    if matches!(pod.phase.as_str(), "Pending" | "Failed" | "Unknown") {
        return true;
    }
    pod.containers.iter().any(|cs| {
        cs.waiting_reason
            .as_deref()
            .is_some_and(|r| match_reason(r).is_some_and(|c| c != FailureCategory::Scheduling))
            || cs.last_terminated_reason.as_deref() == Some("OOMKilled")
    })
}

/// OOMKill detail: the first OOM-killed container's name, memory limit, and
/// restart count.
pub fn oomkill_info(pod: &PodRecord) -> Option<(String, Option<String>, i64)> {
    pod.containers
        .iter()
        .find(|cs| cs.last_terminated_reason.as_deref() == Some("OOMKilled"))
        .map(|cs| (cs.name.clone(), cs.memory_limit.clone(), cs.restart_count))
}

/// Sort rank for phases: Failed first, then Unknown, then Pending.
pub fn phase_rank(phase: &str) -> u8 {
    match phase {
        "Failed" => 0,
        "Unknown" => 1,
        "Pending" => 2,
        _ => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::mock::{pod, waiting_container};
    use crate::model::ContainerStatus;

    #[test]
    fn pod_level_scheduling_reason_wins() {
        let mut p = pod("web-1", "default", "Pending", None);
        p.reason = Some("Unschedulable".into());
        assert_eq!(categorize_failure(&p), FailureCategory::Scheduling);
    }

    #[test]
    fn unassigned_pending_without_reason_is_scheduling() {
        let p = pod("web-1", "default", "Pending", None);
        assert_eq!(categorize_failure(&p), FailureCategory::Scheduling);
    }

    #[test]
    fn waiting_reasons_map_to_categories() {
        for (reason, expected) in [
            ("CrashLoopBackOff", FailureCategory::Runtime),
            ("ImagePullBackOff", FailureCategory::Registry),
            ("ErrImagePull", FailureCategory::Registry),
            ("CreateContainerConfigError", FailureCategory::Config),
        ] {
            let mut p = pod("web-1", "default", "Running", Some("n1"));
            p.containers = vec![waiting_container("app", reason)];
            assert_eq!(categorize_failure(&p), expected, "reason {reason}");
        }
    }

    #[test]
    fn oomkill_in_last_run_is_runtime() {
        let mut p = pod("web-1", "default", "Running", Some("n1"));
        p.containers = vec![ContainerStatus {
            name: "app".into(),
            last_terminated_reason: Some("OOMKilled".into()),
            ..Default::default()
        }];
        assert_eq!(categorize_failure(&p), FailureCategory::Runtime);
        assert!(is_unhealthy(&p));
    }

    #[test]
    fn unmatched_reason_is_unknown() {
        let mut p = pod("web-1", "default", "Failed", Some("n1"));
        p.reason = Some("Evicted".into());
        assert_eq!(categorize_failure(&p), FailureCategory::Unknown);
    }

    #[test]
    fn running_healthy_pod_is_healthy() {
        let mut p = pod("web-1", "default", "Running", Some("n1"));
        p.containers = vec![ContainerStatus {
            name: "app".into(),
            ready: true,
            ..Default::default()
        }];
        assert!(!is_unhealthy(&p));
    }

    #[test]
    fn bad_phases_are_unhealthy() {
        for phase in ["Pending", "Failed", "Unknown"] {
            assert!(is_unhealthy(&pod("p", "default", phase, None)), "{phase}");
        }
    }

    #[test]
    fn oomkill_info_reports_container_and_limit() {
        let mut p = pod("web-1", "default", "Running", Some("n1"));
        p.containers = vec![ContainerStatus {
            name: "app".into(),
            restart_count: 7,
            last_terminated_reason: Some("OOMKilled".into()),
            memory_limit: Some("512Mi".into()),
            ..Default::default()
        }];
        let (name, limit, restarts) = oomkill_info(&p).unwrap();
        assert_eq!(name, "app");
        assert_eq!(limit.as_deref(), Some("512Mi"));
        assert_eq!(restarts, 7);
    }

    #[test]
    fn phase_ordering_puts_failed_first() {
        assert!(phase_rank("Failed") < phase_rank("Unknown"));
        assert!(phase_rank("Unknown") < phase_rank("Pending"));
        assert!(phase_rank("Pending") < phase_rank("Running"));
    }
}
