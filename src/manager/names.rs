//! Deterministic worker identity derived from a sync object.
//!
//! The worker name names the reconciler Deployment, its ServiceAccount, the
//! managed secret copies, and the subject entries in the shared RBAC
//! objects, so it must be a valid DNS-1123 subdomain.

use std::sync::LazyLock;

use regex::Regex;

use crate::crd::{REPO_SYNC_NAME, ROOT_SYNC_NAME, Scope};

/// Prefix of every root-scope worker.
pub const ROOT_RECONCILER_PREFIX: &str = "root-reconciler";
/// Prefix of every namespace-scope worker.
pub const NS_RECONCILER_PREFIX: &str = "ns-reconciler";

/// Name of the ClusterRole granting reconcilers their permissions.
pub const RECONCILER_CLUSTER_ROLE: &str = "syncoperator.smoketurner.com:reconciler";
/// Name of the shared ClusterRoleBinding whose subjects are root workers.
pub const ROOT_RECONCILER_CLUSTER_ROLE_BINDING: &str =
    "syncoperator.smoketurner.com:root-reconciler";
/// Name of the per-namespace RoleBinding shared by that namespace's workers.
pub const NS_RECONCILER_ROLE_BINDING: &str = "syncoperator.smoketurner.com:ns-reconciler";

static DNS1123_SUBDOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("static pattern")
});

const DNS1123_SUBDOMAIN_MAX_LEN: usize = 253;

/// The worker name for a sync object.
///
/// The default sync names map to short, stable worker names; any other name
/// is suffixed in a way that cannot collide with another sync. Namespace
/// workers additionally encode the name length so that `ns1-a/b` and
/// `ns1/a-b` produce distinct workers.
pub fn reconciler_name(scope: &Scope, sync_name: &str) -> String {
    match scope {
        Scope::Root => {
            if sync_name == ROOT_SYNC_NAME {
                ROOT_RECONCILER_PREFIX.to_string()
            } else {
                format!("{ROOT_RECONCILER_PREFIX}-{sync_name}")
            }
        }
        Scope::Namespace(ns) => {
            if sync_name == REPO_SYNC_NAME {
                format!("{NS_RECONCILER_PREFIX}-{ns}")
            } else {
                format!("{NS_RECONCILER_PREFIX}-{ns}-{sync_name}-{}", sync_name.len())
            }
        }
    }
}

/// The controller-namespace name of a secret copied for a worker.
pub fn managed_secret_name(reconciler: &str, user_secret: &str) -> String {
    format!("{reconciler}-{user_secret}")
}

/// Whether a name in the controller namespace belongs to some worker.
pub fn is_reconciler_resource(name: &str) -> bool {
    name == ROOT_RECONCILER_PREFIX
        || name.starts_with(&format!("{ROOT_RECONCILER_PREFIX}-"))
        || name.starts_with(&format!("{NS_RECONCILER_PREFIX}-"))
}

/// Validate a derived name as a DNS-1123 subdomain.
pub fn validate_dns1123(name: &str) -> Result<(), String> {
    if name.len() > DNS1123_SUBDOMAIN_MAX_LEN {
        return Err(format!(
            "name {name:?} is {} characters long, must be at most {DNS1123_SUBDOMAIN_MAX_LEN}",
            name.len()
        ));
    }
    if !DNS1123_SUBDOMAIN.is_match(name) {
        return Err(format!(
            "name {name:?} must consist of lower case alphanumeric characters, '-' or '.', \
             and must start and end with an alphanumeric character"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sync_names_get_short_workers() {
        assert_eq!(reconciler_name(&Scope::Root, "root-sync"), "root-reconciler");
        assert_eq!(
            reconciler_name(&Scope::Namespace("tenant-a".into()), "repo-sync"),
            "ns-reconciler-tenant-a"
        );
    }

    #[test]
    fn non_default_names_are_disambiguated() {
        assert_eq!(
            reconciler_name(&Scope::Root, "platform"),
            "root-reconciler-platform"
        );
        // Length suffix keeps ns/name splits unambiguous.
        assert_ne!(
            reconciler_name(&Scope::Namespace("ns1-a".into()), "b"),
            reconciler_name(&Scope::Namespace("ns1".into()), "a-b")
        );
    }

    #[test]
    fn dns1123_rules() {
        assert!(validate_dns1123("root-reconciler").is_ok());
        assert!(validate_dns1123("Invalid_Name").is_err());
        assert!(validate_dns1123(&"a".repeat(254)).is_err());
        assert!(validate_dns1123("-leading").is_err());
    }

    #[test]
    fn reconciler_resource_detection() {
        assert!(is_reconciler_resource("root-reconciler"));
        assert!(is_reconciler_resource("root-reconciler-platform"));
        assert!(is_reconciler_resource("ns-reconciler-tenant-a"));
        assert!(!is_reconciler_resource("some-other-deployment"));
    }
}
