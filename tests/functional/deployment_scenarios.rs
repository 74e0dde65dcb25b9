//! Worker deployment shaping across auth modes and user edits.

use std::collections::BTreeSet;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Toleration;
use sync_operator::crd::{AuthType, Scope, SyncSpec};
use sync_operator::manager::deployment::{
    ASKPASS_SIDECAR, DeploymentInput, GIT_SYNC_CONTAINER, RECONCILER_CONTAINER, build_deployment,
    merge_with_existing,
};

use crate::common::fixtures::SyncBuilder;

fn input<'a>(spec: &'a SyncSpec, scope: &'a Scope, auth_secret: Option<String>) -> DeploymentInput<'a> {
    DeploymentInput {
        scope,
        sync_name: "root-sync",
        sync_kind: "RootSync",
        sync_generation: 1,
        reconciler: "root-reconciler",
        spec,
        cluster_name: "test-cluster",
        reconciler_polling_period_secs: 15,
        hydration_polling_period_secs: 5,
        autopilot: false,
        membership: None,
        auth_secret,
        ca_cert_secret: None,
        auth_secret_keys: BTreeSet::new(),
        notification_enabled: false,
        notification_config: None,
    }
}

fn container_names(d: &Deployment) -> Vec<String> {
    d.spec
        .as_ref()
        .unwrap()
        .template
        .spec
        .as_ref()
        .unwrap()
        .containers
        .iter()
        .map(|c| c.name.clone())
        .collect()
}

fn volume_names(d: &Deployment) -> Vec<String> {
    d.spec
        .as_ref()
        .unwrap()
        .template
        .spec
        .as_ref()
        .unwrap()
        .volumes
        .as_ref()
        .unwrap()
        .iter()
        .map(|v| v.name.clone())
        .collect()
}

/// Walking the auth mode ssh -> gcpserviceaccount -> none reshapes the pod:
/// the creds volume disappears, the askpass sidecar comes and goes.
#[test]
fn auth_switch_reshapes_worker_pod() {
    let scope = Scope::Root;

    // ssh: git-creds volume, no sidecar.
    let ssh = SyncBuilder::root("root-sync")
        .git("git@github.com:acme/config", "main")
        .auth(AuthType::Ssh, Some("root-ssh-key"))
        .build_root();
    let ssh_deploy = build_deployment(&input(
        &ssh.spec.sync,
        &scope,
        Some("root-ssh-key".to_string()),
    ))
    .unwrap();
    assert!(volume_names(&ssh_deploy).contains(&"git-creds".to_string()));
    assert!(!container_names(&ssh_deploy).contains(&ASKPASS_SIDECAR.to_string()));

    // gcpserviceaccount: no creds volume, askpass sidecar present.
    let mut gcpsa = SyncBuilder::root("root-sync")
        .git("git@github.com:acme/config", "main")
        .auth(AuthType::GcpServiceAccount, None)
        .build_root();
    gcpsa.spec.sync.git.as_mut().unwrap().gcp_service_account_email =
        Some("sync@proj.iam.gserviceaccount.com".into());
    let gcpsa_deploy = build_deployment(&input(&gcpsa.spec.sync, &scope, None)).unwrap();
    assert!(!volume_names(&gcpsa_deploy).contains(&"git-creds".to_string()));
    assert!(container_names(&gcpsa_deploy).contains(&ASKPASS_SIDECAR.to_string()));

    // The switch is a real spec change that must be written.
    let (_, changed) = merge_with_existing(gcpsa_deploy.clone(), Some(ssh_deploy)).unwrap();
    assert!(changed);

    // none: no creds volume, no sidecar.
    let none = SyncBuilder::root("root-sync")
        .git("git@github.com:acme/config", "main")
        .auth(AuthType::None, None)
        .build_root();
    let none_deploy = build_deployment(&input(&none.spec.sync, &scope, None)).unwrap();
    assert!(!volume_names(&none_deploy).contains(&"git-creds".to_string()));
    assert!(!container_names(&none_deploy).contains(&ASKPASS_SIDECAR.to_string()));
    let (_, changed) = merge_with_existing(none_deploy, Some(gcpsa_deploy)).unwrap();
    assert!(changed);
}

/// Owned fields are reverted within one reconcile; unowned fields survive.
#[test]
fn user_edit_revert_vs_preserve() {
    let scope = Scope::Root;
    let sync = SyncBuilder::root("root-sync")
        .git("git@github.com:acme/config", "main")
        .build_root();
    let desired = build_deployment(&input(&sync.spec.sync, &scope, None)).unwrap();

    // A user patches the live object: one owned field, two unowned fields.
    let mut live = desired.clone();
    {
        let pod = live.spec.as_mut().unwrap().template.spec.as_mut().unwrap();
        pod.containers
            .iter_mut()
            .find(|c| c.name == RECONCILER_CONTAINER)
            .unwrap()
            .image_pull_policy = Some("Always".into());
        pod.tolerations = Some(vec![Toleration {
            key: Some("dedicated".into()),
            operator: Some("Exists".into()),
            ..Default::default()
        }]);
        pod.priority_class_name = Some("system-node-critical".into());
    }

    let (merged, changed) = merge_with_existing(desired, Some(live)).unwrap();
    assert!(changed, "owned-field edit requires a corrective write");

    let pod = merged.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
    let reconciler = pod
        .containers
        .iter()
        .find(|c| c.name == RECONCILER_CONTAINER)
        .unwrap();
    assert_eq!(
        reconciler.image_pull_policy.as_deref(),
        Some("IfNotPresent"),
        "owned field reverted"
    );
    assert_eq!(
        pod.priority_class_name.as_deref(),
        Some("system-node-critical"),
        "unowned field preserved"
    );
    assert!(pod.tolerations.is_some(), "unowned field preserved");
}

/// Re-reconciling an unchanged spec writes nothing.
#[test]
fn unchanged_spec_is_a_no_op() {
    let scope = Scope::Root;
    let sync = SyncBuilder::root("root-sync")
        .git("git@github.com:acme/config", "main")
        .auth(AuthType::Ssh, Some("root-ssh-key"))
        .build_root();
    let desired = build_deployment(&input(
        &sync.spec.sync,
        &scope,
        Some("root-ssh-key".to_string()),
    ))
    .unwrap();
    let again = build_deployment(&input(
        &sync.spec.sync,
        &scope,
        Some("root-ssh-key".to_string()),
    ))
    .unwrap();
    let (_, changed) = merge_with_existing(again, Some(desired)).unwrap();
    assert!(!changed);
}

/// Generation bumps restart the worker through the env contract.
#[test]
fn generation_bump_changes_reconciler_env() {
    let scope = Scope::Root;
    let sync = SyncBuilder::root("root-sync")
        .git("git@github.com:acme/config", "main")
        .build_root();
    let mut gen1 = input(&sync.spec.sync, &scope, None);
    gen1.sync_generation = 1;
    let mut gen2 = input(&sync.spec.sync, &scope, None);
    gen2.sync_generation = 2;

    let d1 = build_deployment(&gen1).unwrap();
    let d2 = build_deployment(&gen2).unwrap();
    let (_, changed) = merge_with_existing(d2, Some(d1)).unwrap();
    assert!(changed);
}

/// The git-sync container carries the fetch contract for the fetcher.
#[test]
fn git_sync_env_contract() {
    let scope = Scope::Namespace("tenant-a".into());
    let sync = SyncBuilder::namespaced("repo-sync", "tenant-a")
        .git("https://example.com/tenant-a/config", "main")
        .dir("overlays/prod")
        .build_repo();
    let d = build_deployment(&DeploymentInput {
        scope: &scope,
        sync_name: "repo-sync",
        sync_kind: "RepoSync",
        sync_generation: 1,
        reconciler: "ns-reconciler-tenant-a",
        spec: &sync.spec.sync,
        cluster_name: "test-cluster",
        reconciler_polling_period_secs: 15,
        hydration_polling_period_secs: 5,
        autopilot: false,
        membership: None,
        auth_secret: None,
        ca_cert_secret: None,
        auth_secret_keys: BTreeSet::new(),
        notification_enabled: false,
        notification_config: None,
    })
    .unwrap();

    let pod = d.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
    assert_eq!(
        pod.service_account_name.as_deref(),
        Some("ns-reconciler-tenant-a")
    );
    let git_sync = pod
        .containers
        .iter()
        .find(|c| c.name == GIT_SYNC_CONTAINER)
        .unwrap();
    let envs = git_sync.env.as_ref().unwrap();
    let get = |name: &str| {
        envs.iter()
            .find(|e| e.name == name)
            .and_then(|e| e.value.clone())
    };
    assert_eq!(
        get("GIT_SYNC_REPO").as_deref(),
        Some("https://example.com/tenant-a/config")
    );
    assert_eq!(get("GIT_SYNC_BRANCH").as_deref(), Some("main"));
    assert_eq!(get("GIT_SYNC_PERIOD").as_deref(), Some("15s"));
}
