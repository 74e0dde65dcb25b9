//! Deployment readiness classification.
//!
//! Mirrors the kstatus notion of InProgress / Current / Failed for the one
//! workload kind the manager owns. The result drives the sync object's
//! Reconciling and Stalled conditions.

use k8s_openapi::api::apps::v1::Deployment;

/// Aggregate status of a worker Deployment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkloadStatus {
    /// Rollout is still making progress.
    InProgress { message: String },
    /// All replicas are updated, available, and observed.
    Current,
    /// The rollout hit a terminal condition (progress deadline exceeded or
    /// replica failure).
    Failed { message: String },
}

/// Classify a Deployment the way kstatus would.
pub fn compute(deployment: &Deployment) -> WorkloadStatus {
    let generation = deployment.metadata.generation.unwrap_or(0);
    let Some(status) = &deployment.status else {
        return WorkloadStatus::InProgress {
            message: "status not yet reported".into(),
        };
    };

    if status.observed_generation.unwrap_or(0) < generation {
        return WorkloadStatus::InProgress {
            message: format!(
                "observed generation {} behind generation {generation}",
                status.observed_generation.unwrap_or(0)
            ),
        };
    }

    // Terminal failure conditions reported by the deployment controller.
    if let Some(conditions) = &status.conditions {
        for c in conditions {
            if c.type_ == "Progressing"
                && c.status == "False"
                && c.reason.as_deref() == Some("ProgressDeadlineExceeded")
            {
                return WorkloadStatus::Failed {
                    message: c
                        .message
                        .clone()
                        .unwrap_or_else(|| "progress deadline exceeded".into()),
                };
            }
            if c.type_ == "ReplicaFailure" && c.status == "True" {
                return WorkloadStatus::Failed {
                    message: c.message.clone().unwrap_or_else(|| "replica failure".into()),
                };
            }
        }
    }

    let specified = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let updated = status.updated_replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);
    let total = status.replicas.unwrap_or(0);

    if updated < specified {
        return WorkloadStatus::InProgress {
            message: format!("updated: {updated}/{specified}"),
        };
    }
    if total > specified {
        return WorkloadStatus::InProgress {
            message: format!("pending termination: {}", total - specified),
        };
    }
    if available < specified {
        return WorkloadStatus::InProgress {
            message: format!("available: {available}/{specified}"),
        };
    }
    WorkloadStatus::Current
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentSpec, DeploymentStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn deployment(status: DeploymentStatus) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                generation: Some(2),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                ..Default::default()
            }),
            status: Some(status),
            ..Default::default()
        }
    }

    #[test]
    fn current_when_replicas_match() {
        let status = DeploymentStatus {
            observed_generation: Some(2),
            replicas: Some(1),
            updated_replicas: Some(1),
            available_replicas: Some(1),
            ..Default::default()
        };
        assert_eq!(compute(&deployment(status)), WorkloadStatus::Current);
    }

    #[test]
    fn in_progress_when_generation_behind() {
        let status = DeploymentStatus {
            observed_generation: Some(1),
            ..Default::default()
        };
        assert!(matches!(
            compute(&deployment(status)),
            WorkloadStatus::InProgress { .. }
        ));
    }

    #[test]
    fn failed_on_progress_deadline() {
        let status = DeploymentStatus {
            observed_generation: Some(2),
            conditions: Some(vec![DeploymentCondition {
                type_: "Progressing".into(),
                status: "False".into(),
                reason: Some("ProgressDeadlineExceeded".into()),
                message: Some("did not progress".into()),
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert!(matches!(
            compute(&deployment(status)),
            WorkloadStatus::Failed { .. }
        ));
    }

    #[test]
    fn in_progress_when_unavailable() {
        let status = DeploymentStatus {
            observed_generation: Some(2),
            replicas: Some(1),
            updated_replicas: Some(1),
            available_replicas: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            compute(&deployment(status)),
            WorkloadStatus::InProgress { .. }
        ));
    }
}
