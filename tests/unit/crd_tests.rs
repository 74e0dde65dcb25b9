//! CRD serialization and accessor tests.

use sync_operator::crd::{
    AuthType, RootSync, SourceFormat, SourceType, SyncApi,
};

use crate::common::fixtures::SyncBuilder;

#[test]
fn root_sync_deserializes_user_yaml() {
    let yaml = r#"
apiVersion: syncoperator.smoketurner.com/v1beta1
kind: RootSync
metadata:
  name: root-sync
spec:
  sourceFormat: hierarchy
  sourceType: git
  git:
    repo: git@github.com:acme/platform-config
    branch: main
    dir: acme
    auth: ssh
    secretRef:
      name: root-ssh-key
  override:
    reconcileTimeoutSeconds: 120
    gitSyncDepth: 10
"#;
    let rs: RootSync = serde_yaml::from_str(yaml).expect("parses");
    assert_eq!(rs.spec.source_format, SourceFormat::Hierarchy);
    assert_eq!(rs.spec.source_type, SourceType::Git);

    let git = rs.spec.git.as_ref().expect("git spec");
    assert_eq!(git.repo, "git@github.com:acme/platform-config");
    assert_eq!(git.auth, AuthType::Ssh);
    assert_eq!(rs.spec.auth_secret_name(), "root-ssh-key");
    assert_eq!(rs.spec.sync_dir(), "acme");
    assert_eq!(rs.spec.source_rev(), "HEAD");

    let overrides = rs.spec.overrides();
    assert_eq!(overrides.reconcile_timeout_secs(), 120);
    assert_eq!(overrides.git_sync_depth, Some(10));
    // Unset overrides fall back to their defaults.
    assert_eq!(overrides.api_server_timeout_secs(), 15);
}

#[test]
fn spec_defaults_are_sane() {
    let yaml = r#"
apiVersion: syncoperator.smoketurner.com/v1beta1
kind: RepoSync
metadata:
  name: repo-sync
  namespace: tenant-a
spec:
  sourceType: git
  git:
    repo: https://example.com/tenant-a/config
"#;
    let rs: sync_operator::crd::RepoSync = serde_yaml::from_str(yaml).expect("parses");
    assert_eq!(rs.spec.source_format, SourceFormat::Unstructured);
    assert_eq!(rs.spec.git.as_ref().unwrap().auth, AuthType::None);
    assert_eq!(rs.spec.sync_dir(), ".");
}

#[test]
fn scope_of_follows_kind() {
    use sync_operator::crd::Scope;
    let root = SyncBuilder::root("root-sync")
        .git("git@github.com:acme/config", "main")
        .build_root();
    assert_eq!(root.scope_of(), Scope::Root);

    let repo = SyncBuilder::namespaced("repo-sync", "tenant-a")
        .git("https://example.com/config", "main")
        .build_repo();
    assert_eq!(repo.scope_of(), Scope::Namespace("tenant-a".into()));
}

#[test]
fn status_round_trips_with_camel_case() {
    let mut root = SyncBuilder::root("root-sync")
        .git("git@github.com:acme/config", "main")
        .build_root();
    let status = root.sync_status_mut();
    status.last_synced_commit = "abc123".into();
    status.observed_generation = 3;

    let json = serde_json::to_value(&root).unwrap();
    assert_eq!(json["status"]["lastSyncedCommit"], "abc123");
    assert_eq!(json["status"]["observedGeneration"], 3);

    let back: RootSync = serde_json::from_value(json).unwrap();
    assert_eq!(back.sync_status().unwrap().last_synced_commit, "abc123");
}
