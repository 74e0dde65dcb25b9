//! ServiceAccount and RBAC management for reconciler workers.
//!
//! Namespace workers get a per-namespace RoleBinding shared by all workers
//! in that namespace. Root workers accumulate as subjects on one shared
//! ClusterRoleBinding; removing the last subject deletes the binding. The
//! subject list is the only mutable state shared across syncs, so mutation
//! happens under the manager's reconcile lock with conflict retries.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding, RoleRef, Subject};
use kube::api::{DeleteParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use tracing::info;

use crate::crd::CONTROLLER_NAMESPACE;
use crate::manager::FIELD_MANAGER;
use crate::manager::error::{Error, Result};
use crate::manager::names::{
    NS_RECONCILER_ROLE_BINDING, RECONCILER_CLUSTER_ROLE, ROOT_RECONCILER_CLUSTER_ROLE_BINDING,
};

/// Annotation placed on worker service accounts using GCP service account auth.
pub const GCP_SA_ANNOTATION: &str = "iam.gke.io/gcp-service-account";

const CONFLICT_RETRIES: usize = 3;

fn role_ref() -> RoleRef {
    RoleRef {
        api_group: "rbac.authorization.k8s.io".into(),
        kind: "ClusterRole".into(),
        name: RECONCILER_CLUSTER_ROLE.into(),
    }
}

fn worker_subject(reconciler: &str) -> Subject {
    Subject {
        kind: "ServiceAccount".into(),
        name: reconciler.to_string(),
        namespace: Some(CONTROLLER_NAMESPACE.to_string()),
        ..Default::default()
    }
}

fn subject_eq(a: &Subject, b: &Subject) -> bool {
    a.kind == b.kind && a.name == b.name && a.namespace == b.namespace
}

/// Ensure the worker ServiceAccount exists, annotated for GCP SA auth when
/// requested.
pub async fn upsert_service_account(
    client: &Client,
    reconciler: &str,
    gcp_sa_email: Option<&str>,
    labels: &BTreeMap<String, String>,
) -> Result<()> {
    let mut annotations = BTreeMap::new();
    if let Some(email) = gcp_sa_email {
        annotations.insert(GCP_SA_ANNOTATION.to_string(), email.to_string());
    }
    let sa = ServiceAccount {
        metadata: ObjectMeta {
            name: Some(reconciler.to_string()),
            namespace: Some(CONTROLLER_NAMESPACE.to_string()),
            labels: Some(labels.clone()),
            annotations: if annotations.is_empty() {
                None
            } else {
                Some(annotations)
            },
            ..Default::default()
        },
        ..Default::default()
    };
    let api: Api<ServiceAccount> = Api::namespaced(client.clone(), CONTROLLER_NAMESPACE);
    api.patch(
        reconciler,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&sa),
    )
    .await?;
    Ok(())
}

/// Delete the worker ServiceAccount (teardown path).
pub async fn delete_service_account(client: &Client, reconciler: &str) -> Result<()> {
    let api: Api<ServiceAccount> = Api::namespaced(client.clone(), CONTROLLER_NAMESPACE);
    match api.delete(reconciler, &DeleteParams::default()).await {
        Ok(_) => {
            info!(service_account = %reconciler, "Deleted worker ServiceAccount");
            Ok(())
        }
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(Error::Kube(e)),
    }
}

/// Ensure the namespace's shared RoleBinding contains the worker subject.
pub async fn upsert_role_binding(
    client: &Client,
    namespace: &str,
    reconciler: &str,
) -> Result<()> {
    let api: Api<RoleBinding> = Api::namespaced(client.clone(), namespace);
    for attempt in 0..CONFLICT_RETRIES {
        let existing = match api.get(NS_RECONCILER_ROLE_BINDING).await {
            Ok(rb) => Some(rb),
            Err(kube::Error::Api(e)) if e.code == 404 => None,
            Err(e) => return Err(Error::Kube(e)),
        };

        let subject = worker_subject(reconciler);
        match existing {
            None => {
                let rb = RoleBinding {
                    metadata: ObjectMeta {
                        name: Some(NS_RECONCILER_ROLE_BINDING.to_string()),
                        namespace: Some(namespace.to_string()),
                        ..Default::default()
                    },
                    role_ref: role_ref(),
                    subjects: Some(vec![subject]),
                };
                match api.create(&PostParams::default(), &rb).await {
                    Ok(_) => {
                        info!(namespace = %namespace, "Created reconciler RoleBinding");
                        return Ok(());
                    }
                    Err(kube::Error::Api(e)) if e.code == 409 && attempt + 1 < CONFLICT_RETRIES => {
                        continue;
                    }
                    Err(e) => return Err(Error::Kube(e)),
                }
            }
            Some(mut rb) => {
                let subjects = rb.subjects.get_or_insert_with(Vec::new);
                if subjects.iter().any(|s| subject_eq(s, &subject)) {
                    return Ok(());
                }
                subjects.push(subject);
                match api
                    .replace(NS_RECONCILER_ROLE_BINDING, &PostParams::default(), &rb)
                    .await
                {
                    Ok(_) => {
                        info!(namespace = %namespace, reconciler = %reconciler, "Added RoleBinding subject");
                        return Ok(());
                    }
                    Err(kube::Error::Api(e)) if e.code == 409 && attempt + 1 < CONFLICT_RETRIES => {
                        continue;
                    }
                    Err(e) => return Err(Error::Kube(e)),
                }
            }
        }
    }
    Err(Error::Transient(format!(
        "conflict updating RoleBinding {NS_RECONCILER_ROLE_BINDING} in {namespace}"
    )))
}

/// Remove the worker subject from the namespace RoleBinding; delete the
/// binding when it was the last subject.
pub async fn remove_role_binding_subject(
    client: &Client,
    namespace: &str,
    reconciler: &str,
) -> Result<()> {
    let api: Api<RoleBinding> = Api::namespaced(client.clone(), namespace);
    for attempt in 0..CONFLICT_RETRIES {
        let mut rb = match api.get(NS_RECONCILER_ROLE_BINDING).await {
            Ok(rb) => rb,
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
            Err(e) => return Err(Error::Kube(e)),
        };
        let subject = worker_subject(reconciler);
        let subjects = rb.subjects.get_or_insert_with(Vec::new);
        let before = subjects.len();
        subjects.retain(|s| !subject_eq(s, &subject));
        if subjects.len() == before {
            return Ok(());
        }

        let result = if subjects.is_empty() {
            api.delete(NS_RECONCILER_ROLE_BINDING, &DeleteParams::default())
                .await
                .map(|_| ())
        } else {
            api.replace(NS_RECONCILER_ROLE_BINDING, &PostParams::default(), &rb)
                .await
                .map(|_| ())
        };
        match result {
            Ok(()) => {
                info!(namespace = %namespace, reconciler = %reconciler, "Removed RoleBinding subject");
                return Ok(());
            }
            Err(kube::Error::Api(e)) if e.code == 409 && attempt + 1 < CONFLICT_RETRIES => continue,
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
            Err(e) => return Err(Error::Kube(e)),
        }
    }
    Err(Error::Transient(format!(
        "conflict updating RoleBinding {NS_RECONCILER_ROLE_BINDING} in {namespace}"
    )))
}

/// Ensure the shared root ClusterRoleBinding contains the worker subject.
pub async fn upsert_cluster_role_binding_subject(
    client: &Client,
    reconciler: &str,
) -> Result<()> {
    let api: Api<ClusterRoleBinding> = Api::all(client.clone());
    for attempt in 0..CONFLICT_RETRIES {
        let existing = match api.get(ROOT_RECONCILER_CLUSTER_ROLE_BINDING).await {
            Ok(crb) => Some(crb),
            Err(kube::Error::Api(e)) if e.code == 404 => None,
            Err(e) => return Err(Error::Kube(e)),
        };

        let subject = worker_subject(reconciler);
        match existing {
            None => {
                let crb = ClusterRoleBinding {
                    metadata: ObjectMeta {
                        name: Some(ROOT_RECONCILER_CLUSTER_ROLE_BINDING.to_string()),
                        ..Default::default()
                    },
                    role_ref: role_ref(),
                    subjects: Some(vec![subject]),
                };
                match api.create(&PostParams::default(), &crb).await {
                    Ok(_) => {
                        info!("Created root reconciler ClusterRoleBinding");
                        return Ok(());
                    }
                    Err(kube::Error::Api(e)) if e.code == 409 && attempt + 1 < CONFLICT_RETRIES => {
                        continue;
                    }
                    Err(e) => return Err(Error::Kube(e)),
                }
            }
            Some(mut crb) => {
                let subjects = crb.subjects.get_or_insert_with(Vec::new);
                if subjects.iter().any(|s| subject_eq(s, &subject)) {
                    return Ok(());
                }
                subjects.push(subject);
                match api
                    .replace(
                        ROOT_RECONCILER_CLUSTER_ROLE_BINDING,
                        &PostParams::default(),
                        &crb,
                    )
                    .await
                {
                    Ok(_) => {
                        info!(reconciler = %reconciler, "Added ClusterRoleBinding subject");
                        return Ok(());
                    }
                    Err(kube::Error::Api(e)) if e.code == 409 && attempt + 1 < CONFLICT_RETRIES => {
                        continue;
                    }
                    Err(e) => return Err(Error::Kube(e)),
                }
            }
        }
    }
    Err(Error::Transient(format!(
        "conflict updating ClusterRoleBinding {ROOT_RECONCILER_CLUSTER_ROLE_BINDING}"
    )))
}

/// Remove the worker subject from the shared root ClusterRoleBinding,
/// deleting the binding when the subject list becomes empty.
pub async fn remove_cluster_role_binding_subject(
    client: &Client,
    reconciler: &str,
) -> Result<()> {
    let api: Api<ClusterRoleBinding> = Api::all(client.clone());
    for attempt in 0..CONFLICT_RETRIES {
        let mut crb = match api.get(ROOT_RECONCILER_CLUSTER_ROLE_BINDING).await {
            Ok(crb) => crb,
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
            Err(e) => return Err(Error::Kube(e)),
        };
        let subject = worker_subject(reconciler);
        let subjects = crb.subjects.get_or_insert_with(Vec::new);
        let before = subjects.len();
        subjects.retain(|s| !subject_eq(s, &subject));
        if subjects.len() == before {
            return Ok(());
        }

        let result = if subjects.is_empty() {
            api.delete(ROOT_RECONCILER_CLUSTER_ROLE_BINDING, &DeleteParams::default())
                .await
                .map(|_| ())
        } else {
            api.replace(
                ROOT_RECONCILER_CLUSTER_ROLE_BINDING,
                &PostParams::default(),
                &crb,
            )
            .await
            .map(|_| ())
        };
        match result {
            Ok(()) => {
                info!(reconciler = %reconciler, "Removed ClusterRoleBinding subject");
                return Ok(());
            }
            Err(kube::Error::Api(e)) if e.code == 409 && attempt + 1 < CONFLICT_RETRIES => continue,
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
            Err(e) => return Err(Error::Kube(e)),
        }
    }
    Err(Error::Transient(format!(
        "conflict updating ClusterRoleBinding {ROOT_RECONCILER_CLUSTER_ROLE_BINDING}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_subject_shape() {
        let s = worker_subject("root-reconciler");
        assert_eq!(s.kind, "ServiceAccount");
        assert_eq!(s.name, "root-reconciler");
        assert_eq!(s.namespace.as_deref(), Some(CONTROLLER_NAMESPACE));
    }

    #[test]
    fn subject_equality_ignores_api_group() {
        let a = worker_subject("root-reconciler");
        let mut b = worker_subject("root-reconciler");
        b.api_group = Some("".into());
        assert!(subject_eq(&a, &b));
        let c = worker_subject("root-reconciler-other");
        assert!(!subject_eq(&a, &c));
    }
}
