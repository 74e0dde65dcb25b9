//! The reconciler-manager: watches RootSync and RepoSync objects and owns
//! the lifecycle of their worker workloads (Deployment, ServiceAccount,
//! secret copies, RBAC), including finalizer-driven teardown.

pub mod context;
pub mod deployment;
pub mod error;
pub mod kstatus;
pub mod names;
pub mod rbac;
pub mod reconcile;
pub mod repo_controller;
pub mod root_controller;
pub mod secrets;
pub mod status;
pub mod validation;

/// Field manager identity used for every manager-side server-side apply.
pub const FIELD_MANAGER: &str = "reconciler-manager";
