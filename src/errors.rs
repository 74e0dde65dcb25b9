//! Pipeline error model.
//!
//! Every error surfaced on a sync object's status carries a stable code so
//! that users and the notification engine can key off it. Codes group by
//! family: KNV1xxx are user-correctable, KNV2xxx are environmental, and
//! KNV9998 is an internal bug path.

use thiserror::Error;

use crate::crd::ConfigSyncError;

/// Stable error codes surfaced in sync status.
pub mod codes {
    /// Required hierarchy marker `system/repo.yaml` is missing.
    pub const MISSING_REPO: &str = "KNV1017";
    /// Two declared objects share the same group/kind/namespace/name.
    pub const DUPLICATE_OBJECT: &str = "KNV1021";
    /// Object scope violates the sync's scope (e.g. cluster object in a RepoSync).
    pub const SCOPE_VIOLATION: &str = "KNV1032";
    /// A declared dependency cycle or unknown depends-on reference.
    pub const DEPENDENCY_ERROR: &str = "KNV1035";
    /// A forbidden GVK was declared in the source.
    pub const FORBIDDEN_KIND: &str = "KNV1045";
    /// A sync declares itself in its own source.
    pub const SELF_MANAGEMENT: &str = "KNV1057";
    /// Two managers claim the same object.
    pub const MANAGEMENT_CONFLICT: &str = "KNV1060";
    /// Pruning was refused because it would empty the inventory.
    pub const PRUNE_SAFETY: &str = "KNV1064";
    /// User-correctable rendering failure.
    pub const ACTIONABLE_RENDERING: &str = "KNV1068";
    /// Malformed YAML/JSON in the source.
    pub const PARSE_ERROR: &str = "KNV1027";
    /// API server request failed.
    pub const API_SERVER: &str = "KNV2002";
    /// The fetcher reported a source error sentinel.
    pub const SOURCE: &str = "KNV2004";
    /// Transient infrastructure failure; retried with backoff.
    pub const TRANSIENT: &str = "KNV2016";
    /// Rendering failed inside the renderer toolchain.
    pub const INTERNAL_RENDERING: &str = "KNV2015";
    /// Bug path.
    pub const INTERNAL: &str = "KNV9998";
}

/// Classification the hydrator stamps into its error sentinel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum RenderingErrorClass {
    /// User can fix the source (e.g. misplaced kustomization.yaml).
    Actionable,
    /// Environment hiccup; the rehydrate timer retries.
    Transient,
    /// Renderer toolchain bug or unexpected filesystem state.
    Internal,
}

impl RenderingErrorClass {
    pub fn code(self) -> &'static str {
        match self {
            RenderingErrorClass::Actionable => codes::ACTIONABLE_RENDERING,
            RenderingErrorClass::Transient => codes::TRANSIENT,
            RenderingErrorClass::Internal => codes::INTERNAL_RENDERING,
        }
    }
}

/// An error produced by a pipeline stage, surfaced in sync status.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum StatusError {
    /// Retried locally with backoff; never stalls the sync.
    #[error("transient error: {message}")]
    Transient { message: String },

    /// The fetcher wrote an error sentinel for the active source.
    #[error("source error: {message}")]
    Source { message: String },

    /// The hydrator failed; class decides retry behavior.
    #[error("rendering error: {message}")]
    Rendering {
        class: RenderingErrorClass,
        message: String,
    },

    /// Blocking validation failure; the pipeline halts before apply.
    #[error("validation error: {message}")]
    Validation { code: &'static str, message: String },

    /// API error during apply.
    #[error("apply error: {message}")]
    Apply { message: String },

    /// A foreign manager claims a declared object.
    #[error("management conflict: {message}")]
    ManagementConflict { message: String },

    /// API server read/write failure outside apply.
    #[error("API server error: {message}")]
    ApiServer { message: String },

    /// Bug path; full detail goes to logs, short message to status.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl StatusError {
    pub fn transient(message: impl Into<String>) -> Self {
        StatusError::Transient {
            message: message.into(),
        }
    }

    pub fn source(message: impl Into<String>) -> Self {
        StatusError::Source {
            message: message.into(),
        }
    }

    pub fn rendering(class: RenderingErrorClass, message: impl Into<String>) -> Self {
        StatusError::Rendering {
            class,
            message: message.into(),
        }
    }

    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        StatusError::Validation {
            code,
            message: message.into(),
        }
    }

    pub fn apply(message: impl Into<String>) -> Self {
        StatusError::Apply {
            message: message.into(),
        }
    }

    pub fn management_conflict(
        object: &str,
        current_manager: &str,
        new_manager: &str,
    ) -> Self {
        StatusError::ManagementConflict {
            message: format!(
                "The object {object} is managed by {current_manager} but is also declared by {new_manager}. \
                 Remove the declaration from one of the two sources to resolve the conflict"
            ),
        }
    }

    pub fn api_server(message: impl Into<String>) -> Self {
        StatusError::ApiServer {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        StatusError::Internal {
            message: message.into(),
        }
    }

    /// The stable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            StatusError::Transient { .. } => codes::TRANSIENT,
            StatusError::Source { .. } => codes::SOURCE,
            StatusError::Rendering { class, .. } => class.code(),
            StatusError::Validation { code, .. } => code,
            StatusError::Apply { .. } => codes::API_SERVER,
            StatusError::ManagementConflict { .. } => codes::MANAGEMENT_CONFLICT,
            StatusError::ApiServer { .. } => codes::API_SERVER,
            StatusError::Internal { .. } => codes::INTERNAL,
        }
    }

    /// Whether the orchestrator should retry locally without a spec change.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StatusError::Transient { .. }
                | StatusError::ApiServer { .. }
                | StatusError::Apply { .. }
                | StatusError::Rendering {
                    class: RenderingErrorClass::Transient,
                    ..
                }
        )
    }

    /// Whether this error halts the pipeline before apply.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            StatusError::Validation { .. } | StatusError::Source { .. }
        )
    }

    /// Convert to the status wire form.
    pub fn to_cse(&self) -> ConfigSyncError {
        ConfigSyncError::new(self.code(), self.to_string())
    }
}

/// Convert a batch of pipeline errors to their wire form.
pub fn to_cse_list(errs: &[StatusError]) -> Vec<ConfigSyncError> {
    errs.iter().map(StatusError::to_cse).collect()
}

/// Whether any error in the batch blocks the pipeline.
pub fn has_blocking_errors(errs: &[StatusError]) -> bool {
    errs.iter().any(StatusError::is_blocking)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_by_kind() {
        assert_eq!(StatusError::transient("x").code(), codes::TRANSIENT);
        assert_eq!(StatusError::source("x").code(), codes::SOURCE);
        assert_eq!(
            StatusError::rendering(RenderingErrorClass::Actionable, "x").code(),
            codes::ACTIONABLE_RENDERING
        );
        assert_eq!(
            StatusError::validation(codes::MISSING_REPO, "x").code(),
            codes::MISSING_REPO
        );
        assert_eq!(
            StatusError::management_conflict("deployment.apps/a", "m1", "m2").code(),
            codes::MANAGEMENT_CONFLICT
        );
    }

    #[test]
    fn transient_rendering_is_retryable_but_actionable_is_not() {
        assert!(StatusError::rendering(RenderingErrorClass::Transient, "x").is_transient());
        assert!(!StatusError::rendering(RenderingErrorClass::Actionable, "x").is_transient());
    }

    #[test]
    fn blocking_split() {
        assert!(StatusError::validation(codes::DUPLICATE_OBJECT, "x").is_blocking());
        assert!(StatusError::source("x").is_blocking());
        assert!(!StatusError::apply("x").is_blocking());
        assert!(!StatusError::management_conflict("o", "a", "b").is_blocking());
    }

    #[test]
    fn conflict_message_names_both_managers() {
        let err = StatusError::management_conflict("namespace/ns-a", ":root:root-sync", "tenant:repo-sync");
        let msg = err.to_string();
        assert!(msg.contains(":root:root-sync"));
        assert!(msg.contains("tenant:repo-sync"));
    }
}
