//! Auth secret management for reconciler workers.
//!
//! A RepoSync references secrets in its own namespace, but its worker runs
//! in the controller namespace, so the manager maintains a copy named
//! `<worker>-<origSecret>` there. RootSync secrets already live in the
//! controller namespace and are mounted in place. Secret content is
//! validated for the key the declared auth type requires.

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{DeleteParams, ListParams, ObjectMeta, Patch, PatchParams};
use kube::{Api, Client};
use tracing::info;

use crate::crd::{AuthType, CONTROLLER_NAMESPACE, Scope};
use crate::manager::FIELD_MANAGER;
use crate::manager::error::{Error, Result};
use crate::manager::names;

/// Key expected in a CA certificate secret.
pub const CA_CERT_KEY: &str = "cert";
/// Additional key expected alongside `token`.
pub const TOKEN_USERNAME_KEY: &str = "username";

/// Validate that a user secret carries the keys its auth type requires.
pub fn validate_secret_data(auth: AuthType, secret: &Secret) -> Result<()> {
    let name = secret.metadata.name.as_deref().unwrap_or("");
    let has_key = |key: &str| {
        secret
            .data
            .as_ref()
            .is_some_and(|d| d.contains_key(key))
            || secret
                .string_data
                .as_ref()
                .is_some_and(|d| d.contains_key(key))
    };

    if let Some(key) = auth.required_secret_key()
        && !has_key(key)
    {
        return Err(Error::Secret(format!(
            "secret {name} is missing the {key:?} key required by auth type {auth}"
        )));
    }
    if auth == AuthType::Token && !has_key(TOKEN_USERNAME_KEY) {
        return Err(Error::Secret(format!(
            "secret {name} is missing the \"username\" key required by auth type token"
        )));
    }
    Ok(())
}

/// Validate that a CA certificate secret carries the `cert` key.
pub fn validate_ca_cert_secret(secret: &Secret) -> Result<()> {
    let name = secret.metadata.name.as_deref().unwrap_or("");
    let has_key = secret
        .data
        .as_ref()
        .is_some_and(|d| d.contains_key(CA_CERT_KEY))
        || secret
            .string_data
            .as_ref()
            .is_some_and(|d| d.contains_key(CA_CERT_KEY));
    if !has_key {
        return Err(Error::Secret(format!(
            "secret {name} is missing the {CA_CERT_KEY:?} key required for CA certificates"
        )));
    }
    Ok(())
}

fn managed_labels(reconciler: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(
        crate::metadata::RECONCILER_LABEL.to_string(),
        reconciler.to_string(),
    )])
}

async fn get_user_secret(client: &Client, namespace: &str, name: &str) -> Result<Secret> {
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    match api.get(name).await {
        Ok(secret) => Ok(secret),
        Err(kube::Error::Api(e)) if e.code == 404 => Err(Error::Secret(format!(
            "Secret {name} not found in namespace {namespace}: create one to allow client authentication"
        ))),
        Err(e) => Err(Error::Kube(e)),
    }
}

async fn upsert_copy(
    client: &Client,
    reconciler: &str,
    source: &Secret,
    copy_name: &str,
) -> Result<()> {
    let copy = Secret {
        metadata: ObjectMeta {
            name: Some(copy_name.to_string()),
            namespace: Some(CONTROLLER_NAMESPACE.to_string()),
            labels: Some(managed_labels(reconciler)),
            ..Default::default()
        },
        data: source.data.clone(),
        string_data: source.string_data.clone(),
        type_: source.type_.clone(),
        ..Default::default()
    };
    let api: Api<Secret> = Api::namespaced(client.clone(), CONTROLLER_NAMESPACE);
    api.patch(
        copy_name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&copy),
    )
    .await?;
    Ok(())
}

/// Ensure the auth secret the worker mounts exists and is valid.
///
/// Returns the name of the secret the Deployment should reference, or None
/// when the auth type needs no secret.
pub async fn upsert_auth_secret(
    client: &Client,
    scope: &Scope,
    auth: AuthType,
    user_secret_name: &str,
    reconciler: &str,
) -> Result<Option<String>> {
    if !auth.requires_secret() {
        return Ok(None);
    }

    match scope {
        Scope::Root => {
            // Root secrets already live in the controller namespace.
            let secret = get_user_secret(client, CONTROLLER_NAMESPACE, user_secret_name).await?;
            validate_secret_data(auth, &secret)?;
            Ok(Some(user_secret_name.to_string()))
        }
        Scope::Namespace(ns) => {
            let secret = get_user_secret(client, ns, user_secret_name).await?;
            validate_secret_data(auth, &secret)?;
            let copy_name = names::managed_secret_name(reconciler, user_secret_name);
            upsert_copy(client, reconciler, &secret, &copy_name).await?;
            info!(secret = %copy_name, reconciler = %reconciler, "Upserted auth secret copy");
            Ok(Some(copy_name))
        }
    }
}

/// Ensure the CA certificate secret the worker mounts exists and is valid.
pub async fn upsert_ca_cert_secret(
    client: &Client,
    scope: &Scope,
    ca_cert_secret_name: &str,
    reconciler: &str,
) -> Result<Option<String>> {
    if ca_cert_secret_name.is_empty() {
        return Ok(None);
    }

    match scope {
        Scope::Root => {
            let secret =
                get_user_secret(client, CONTROLLER_NAMESPACE, ca_cert_secret_name).await?;
            validate_ca_cert_secret(&secret)?;
            Ok(Some(ca_cert_secret_name.to_string()))
        }
        Scope::Namespace(ns) => {
            let secret = get_user_secret(client, ns, ca_cert_secret_name).await?;
            validate_ca_cert_secret(&secret)?;
            let copy_name = names::managed_secret_name(reconciler, ca_cert_secret_name);
            upsert_copy(client, reconciler, &secret, &copy_name).await?;
            info!(secret = %copy_name, reconciler = %reconciler, "Upserted CA cert secret copy");
            Ok(Some(copy_name))
        }
    }
}

/// Delete every secret copy owned by a worker (teardown path).
pub async fn delete_managed_secrets(client: &Client, reconciler: &str) -> Result<()> {
    let api: Api<Secret> = Api::namespaced(client.clone(), CONTROLLER_NAMESPACE);
    let selector = format!("{}={}", crate::metadata::RECONCILER_LABEL, reconciler);
    let list = api
        .list(&ListParams::default().labels(&selector))
        .await?;
    for secret in list.items {
        if let Some(name) = secret.metadata.name.as_deref() {
            match api.delete(name, &DeleteParams::default()).await {
                Ok(_) => info!(secret = %name, "Deleted managed secret"),
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => return Err(Error::Kube(e)),
            }
        }
    }
    Ok(())
}

/// Read a named key out of a secret as UTF-8 (used for proxy wiring).
pub fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    if let Some(data) = &secret.data
        && let Some(ByteString(bytes)) = data.get(key)
    {
        return String::from_utf8(bytes.clone()).ok();
    }
    secret
        .string_data
        .as_ref()
        .and_then(|d| d.get(key))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret_with_keys(keys: &[&str]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("creds".into()),
                ..Default::default()
            },
            data: Some(
                keys.iter()
                    .map(|k| (k.to_string(), ByteString(b"value".to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn ssh_requires_ssh_key() {
        assert!(validate_secret_data(AuthType::Ssh, &secret_with_keys(&["ssh"])).is_ok());
        assert!(validate_secret_data(AuthType::Ssh, &secret_with_keys(&["id_rsa"])).is_err());
    }

    #[test]
    fn token_requires_token_and_username() {
        assert!(
            validate_secret_data(AuthType::Token, &secret_with_keys(&["token", "username"]))
                .is_ok()
        );
        assert!(validate_secret_data(AuthType::Token, &secret_with_keys(&["token"])).is_err());
        assert!(validate_secret_data(AuthType::Token, &secret_with_keys(&["username"])).is_err());
    }

    #[test]
    fn ca_cert_requires_cert_key() {
        assert!(validate_ca_cert_secret(&secret_with_keys(&["cert"])).is_ok());
        assert!(validate_ca_cert_secret(&secret_with_keys(&["ca.crt"])).is_err());
    }

    #[test]
    fn secret_value_reads_binary_data() {
        let secret = secret_with_keys(&["https_proxy"]);
        assert_eq!(secret_value(&secret, "https_proxy").as_deref(), Some("value"));
        assert_eq!(secret_value(&secret, "missing"), None);
    }
}
