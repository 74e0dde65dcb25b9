//! Sync spec validation run before any worker resources are provisioned.
//!
//! Validation failures stall the sync (Stalled=True) and are not retried
//! until the spec changes, with one exception: a missing user secret is
//! retried because the user may create it at any moment.

use crate::crd::{AuthType, CONTROLLER_NAMESPACE, Scope, SourceFormat, SourceType, SyncSpec};
use crate::manager::error::Error;
use crate::manager::names;

/// RepoSync objects may not live in the controller's own namespace: their
/// reconcilers would then manage the very namespace the platform runs in.
pub fn validate_namespace(scope: &Scope) -> Result<(), Error> {
    if let Scope::Namespace(ns) = scope
        && ns == CONTROLLER_NAMESPACE
    {
        return Err(Error::Validation(format!(
            "RepoSync objects are not allowed in the {CONTROLLER_NAMESPACE} namespace"
        )));
    }
    Ok(())
}

/// Validate the derived worker name as a DNS-1123 subdomain.
pub fn validate_reconciler_name(name: &str) -> Result<(), Error> {
    names::validate_dns1123(name)
        .map_err(|e| Error::Validation(format!("Invalid reconciler name {name:?}: {e}")))
}

/// Validate that exactly one source sub-spec is set, matches the declared
/// source type, and carries a coherent auth configuration.
pub fn validate_spec(spec: &SyncSpec, scope: &Scope) -> Result<(), Error> {
    let set = [
        spec.git.is_some(),
        spec.oci.is_some(),
        spec.helm.is_some(),
    ]
    .iter()
    .filter(|b| **b)
    .count();
    if set != 1 {
        return Err(Error::Validation(format!(
            "exactly one of spec.git, spec.oci, spec.helm must be set, found {set}"
        )));
    }

    match spec.source_type {
        SourceType::Git => {
            let git = spec.git.as_ref().ok_or_else(|| {
                Error::Validation("sourceType is \"git\" but spec.git is not set".into())
            })?;
            if git.repo.is_empty() {
                return Err(Error::Validation("spec.git.repo must be set".into()));
            }
            validate_auth(git.auth, git.secret_ref.as_ref().map_or("", |s| s.name()))?;
            validate_gcp_sa(git.auth, git.gcp_service_account_email.as_deref())?;
        }
        SourceType::Oci => {
            let oci = spec.oci.as_ref().ok_or_else(|| {
                Error::Validation("sourceType is \"oci\" but spec.oci is not set".into())
            })?;
            if oci.image.is_empty() {
                return Err(Error::Validation("spec.oci.image must be set".into()));
            }
            if oci.auth.requires_secret() {
                return Err(Error::Validation(format!(
                    "spec.oci.auth {:?} is not supported for OCI sources",
                    oci.auth.to_string()
                )));
            }
            validate_gcp_sa(oci.auth, oci.gcp_service_account_email.as_deref())?;
        }
        SourceType::Helm => {
            let helm = spec.helm.as_ref().ok_or_else(|| {
                Error::Validation("sourceType is \"helm\" but spec.helm is not set".into())
            })?;
            if helm.repo.is_empty() || helm.chart.is_empty() {
                return Err(Error::Validation(
                    "spec.helm.repo and spec.helm.chart must be set".into(),
                ));
            }
            validate_auth(helm.auth, helm.secret_ref.as_ref().map_or("", |s| s.name()))?;
            validate_gcp_sa(helm.auth, helm.gcp_service_account_email.as_deref())?;
        }
    }

    // Hierarchy mode only makes sense for cluster-wide sources.
    if spec.source_format == SourceFormat::Hierarchy && !matches!(scope, Scope::Root) {
        return Err(Error::Validation(
            "sourceFormat \"hierarchy\" is only supported on RootSync".into(),
        ));
    }

    Ok(())
}

fn validate_auth(auth: AuthType, secret_name: &str) -> Result<(), Error> {
    if auth.requires_secret() && secret_name.is_empty() {
        return Err(Error::Validation(format!(
            "auth type {auth:?} requires a secretRef",
            auth = auth.to_string()
        )));
    }
    if !auth.requires_secret() && !secret_name.is_empty() {
        return Err(Error::Validation(format!(
            "auth type {auth:?} must not specify a secretRef",
            auth = auth.to_string()
        )));
    }
    Ok(())
}

fn validate_gcp_sa(auth: AuthType, email: Option<&str>) -> Result<(), Error> {
    match (auth, email) {
        (AuthType::GcpServiceAccount, None | Some("")) => Err(Error::Validation(
            "auth type \"gcpserviceaccount\" requires gcpServiceAccountEmail".into(),
        )),
        (AuthType::GcpServiceAccount, Some(email)) if !email.contains('@') => Err(
            Error::Validation(format!("invalid gcpServiceAccountEmail {email:?}")),
        ),
        _ => Ok(()),
    }
}

/// Validate the managed secret name derived for the worker copy.
pub fn validate_managed_secret_name(reconciler: &str, user_secret: &str) -> Result<(), Error> {
    let name = names::managed_secret_name(reconciler, user_secret);
    names::validate_dns1123(&name).map_err(|e| {
        Error::Validation(format!(
            "The managed secret name {name:?} is invalid: {e}. To fix it, update the secretRef name"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{GitSpec, OciSpec, SecretRef};

    fn git_spec(auth: AuthType, secret: Option<&str>) -> SyncSpec {
        SyncSpec {
            source_type: SourceType::Git,
            git: Some(GitSpec {
                repo: "git@github.com:acme/config".into(),
                auth,
                secret_ref: secret.map(|name| SecretRef {
                    name: Some(name.into()),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn repo_sync_rejected_in_controller_namespace() {
        let scope = Scope::Namespace(CONTROLLER_NAMESPACE.into());
        assert!(validate_namespace(&scope).is_err());
        assert!(validate_namespace(&Scope::Namespace("tenant-a".into())).is_ok());
        assert!(validate_namespace(&Scope::Root).is_ok());
    }

    #[test]
    fn exactly_one_source_required() {
        let mut spec = git_spec(AuthType::None, None);
        spec.oci = Some(OciSpec {
            image: "example.com/repo/image:v1".into(),
            ..Default::default()
        });
        assert!(validate_spec(&spec, &Scope::Root).is_err());
    }

    #[test]
    fn auth_secret_combinations() {
        assert!(validate_spec(&git_spec(AuthType::Ssh, Some("ssh-key")), &Scope::Root).is_ok());
        assert!(validate_spec(&git_spec(AuthType::Ssh, None), &Scope::Root).is_err());
        assert!(validate_spec(&git_spec(AuthType::None, Some("stray")), &Scope::Root).is_err());
        assert!(validate_spec(&git_spec(AuthType::None, None), &Scope::Root).is_ok());
    }

    #[test]
    fn gcpserviceaccount_requires_email() {
        let mut spec = git_spec(AuthType::GcpServiceAccount, None);
        assert!(validate_spec(&spec, &Scope::Root).is_err());
        spec.git.as_mut().unwrap().gcp_service_account_email =
            Some("sync@proj.iam.gserviceaccount.com".into());
        assert!(validate_spec(&spec, &Scope::Root).is_ok());
    }

    #[test]
    fn hierarchy_is_root_only() {
        let mut spec = git_spec(AuthType::None, None);
        spec.source_format = SourceFormat::Hierarchy;
        assert!(validate_spec(&spec, &Scope::Root).is_ok());
        assert!(validate_spec(&spec, &Scope::Namespace("tenant-a".into())).is_err());
    }
}
