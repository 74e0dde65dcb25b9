//! Applier: converges cluster state to the declared object set.
//!
//! Each pass applies the declared objects in dependency order (CRDs and
//! Namespaces first, then explicit `depends-on` edges), prunes inventory
//! entries no longer declared in reverse order, and rewrites the inventory
//! with per-object actuation results. Field-manager conflicts are surfaced
//! as management conflicts and left to the remediator's watch rather than
//! retried here.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use kube::api::{DeleteParams, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject};
use kube::{Api, Client};
use tracing::{debug, info, warn};

use crate::crd::{Scope, StatusMode};
use crate::errors::{StatusError, codes};
use crate::metadata::{self, DEPENDS_ON_ANNOTATION, ObjectId};
use crate::reconciler::inventory::{Actuation, Inventory, InventoryClient, InventoryEntry};


/// Annotation marking the explicit prune-safety object.
pub const SAFETY_MARKER_ANNOTATION: &str = "syncoperator.smoketurner.com/safety-marker";

/// Outcome of one apply pass.
#[derive(Debug, Default)]
pub struct ApplyResult {
    /// Actuation per declared object, in apply order.
    pub applied: Vec<(ObjectId, Actuation)>,
    /// Identities pruned (or skipped) this pass.
    pub pruned: Vec<(ObjectId, Actuation)>,
    /// Apply/prune errors, including management conflicts.
    pub errors: Vec<StatusError>,
}

impl ApplyResult {
    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Guess the plural for a kind the way the API server's defaulting does.
pub fn pluralize(kind: &str) -> String {
    let lower = kind.to_lowercase();
    // Kinds whose names are already plural.
    if lower == "endpoints" {
        return lower;
    }
    if let Some(stem) = lower.strip_suffix('y') {
        let penultimate = stem.chars().last().unwrap_or('a');
        if !"aeiou".contains(penultimate) {
            return format!("{stem}ies");
        }
    }
    if lower.ends_with('s')
        || lower.ends_with('x')
        || lower.ends_with('z')
        || lower.ends_with("ch")
        || lower.ends_with("sh")
    {
        return format!("{lower}es");
    }
    format!("{lower}s")
}

/// Build an ApiResource for an object's declared type.
pub fn api_resource_of(obj: &DynamicObject) -> Result<ApiResource, StatusError> {
    let types = obj.types.as_ref().ok_or_else(|| {
        StatusError::internal("object reached the applier without type information")
    })?;
    let (group, version) = match types.api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), types.api_version.clone()),
    };
    Ok(ApiResource {
        group,
        version,
        api_version: types.api_version.clone(),
        kind: types.kind.clone(),
        plural: pluralize(&types.kind),
    })
}

/// Parse a `depends-on` annotation value into object identities.
///
/// Format (comma separated):
/// `<group>/namespaces/<ns>/<kind>/<name>` or `<group>/<kind>/<name>`.
pub fn parse_depends_on(value: &str) -> Result<Vec<ObjectId>, StatusError> {
    let mut ids = Vec::new();
    for entry in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let parts: Vec<&str> = entry.split('/').collect();
        let id = match parts.as_slice() {
            [group, "namespaces", ns, kind, name] => ObjectId::new(group, kind, ns, name),
            [group, kind, name] => ObjectId::new(group, kind, "", name),
            _ => {
                return Err(StatusError::validation(
                    codes::DEPENDENCY_ERROR,
                    format!("malformed depends-on entry {entry:?}"),
                ));
            }
        };
        ids.push(id);
    }
    Ok(ids)
}

fn dependency_class(obj: &DynamicObject) -> u8 {
    match obj.types.as_ref().map(|t| t.kind.as_str()) {
        Some("CustomResourceDefinition") => 0,
        Some("Namespace") => 1,
        _ => 2,
    }
}

/// Order declared objects: CRDs, then Namespaces, then everything else,
/// honoring explicit depends-on edges within and across classes. A cycle is
/// a fatal validation error reported before any apply.
pub fn sort_for_apply(objects: &[DynamicObject]) -> Result<Vec<usize>, StatusError> {
    let ids: Vec<Option<ObjectId>> = objects.iter().map(ObjectId::of).collect();
    let index_of: BTreeMap<&ObjectId, usize> = ids
        .iter()
        .enumerate()
        .filter_map(|(i, id)| id.as_ref().map(|id| (id, i)))
        .collect();

    // Edges: dependency -> dependent.
    let mut edges: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); objects.len()];
    let mut indegree = vec![0usize; objects.len()];
    let add_edge = |edges: &mut Vec<BTreeSet<usize>>, indegree: &mut Vec<usize>, from: usize, to: usize| {
        if from != to && edges[from].insert(to) {
            indegree[to] += 1;
        }
    };

    for (i, obj) in objects.iter().enumerate() {
        if let Some(value) = metadata::get_annotation(obj, DEPENDS_ON_ANNOTATION) {
            for dep in parse_depends_on(value)? {
                match index_of.get(&dep) {
                    Some(&j) => add_edge(&mut edges, &mut indegree, j, i),
                    None => {
                        return Err(StatusError::validation(
                            codes::DEPENDENCY_ERROR,
                            format!(
                                "object {} depends on {dep} which is not declared",
                                ids[i].as_ref().map(ToString::to_string).unwrap_or_default()
                            ),
                        ));
                    }
                }
            }
        }
        // Implicit class edges: everything depends on CRDs; namespaced
        // objects depend on their declared Namespace.
        if let Some(ns) = obj.metadata.namespace.as_deref() {
            let ns_id = ObjectId::new("", "Namespace", "", ns);
            if let Some(&j) = index_of.get(&ns_id) {
                add_edge(&mut edges, &mut indegree, j, i);
            }
        }
    }

    // Kahn's algorithm with (class, declaration order) tie-breaking.
    let mut ready: Vec<usize> = indegree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| i)
        .collect();
    ready.sort_by_key(|&i| (dependency_class(&objects[i]), i));

    let mut order = Vec::with_capacity(objects.len());
    while let Some(i) = ready.first().copied() {
        ready.remove(0);
        order.push(i);
        for &next in &edges[i] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push(next);
            }
        }
        ready.sort_by_key(|&i| (dependency_class(&objects[i]), i));
    }

    if order.len() != objects.len() {
        let stuck: Vec<String> = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d > 0)
            .filter_map(|(i, _)| ids[i].as_ref().map(ToString::to_string))
            .collect();
        return Err(StatusError::validation(
            codes::DEPENDENCY_ERROR,
            format!("dependency cycle among declared objects: {}", stuck.join(", ")),
        ));
    }
    Ok(order)
}

/// Whether an object is the explicit prune-safety marker.
pub fn is_safety_marker(obj: &DynamicObject) -> bool {
    metadata::get_annotation(obj, SAFETY_MARKER_ANNOTATION) == Some("true")
}

/// The safety check: refuse a pass whose declared set is empty (markers
/// aside) while the inventory still holds objects. An empty source is far
/// more often a bad commit than an intentional wipe; declaring the safety
/// marker states the intent explicitly.
pub fn check_prune_safety(
    declared: &[DynamicObject],
    prune: &[ObjectId],
) -> Result<(), StatusError> {
    if prune.is_empty() {
        return Ok(());
    }
    let marker_declared = declared.iter().any(is_safety_marker);
    let real_declared = declared.iter().filter(|o| !is_safety_marker(o)).count();
    if real_declared == 0 && !marker_declared {
        return Err(StatusError::validation(
            codes::PRUNE_SAFETY,
            format!(
                "the source declares no objects but {} objects remain in the inventory; \
                 refusing to prune the whole inventory. Declare a safety marker object \
                 (annotation {SAFETY_MARKER_ANNOTATION}=true) to confirm the removal",
                prune.len()
            ),
        ));
    }
    Ok(())
}

/// The applier for one sync.
pub struct Applier {
    client: Client,
    scope: Scope,
    sync_name: String,
    /// Field manager identity: the reconciler name.
    field_manager: String,
    api_server_timeout: Duration,
    reconcile_timeout: Duration,
    /// Whether per-object actuation results are recorded in the inventory.
    status_mode: StatusMode,
    inventory: InventoryClient,
}

impl Applier {
    pub fn new(
        client: Client,
        scope: Scope,
        sync_name: String,
        reconciler: String,
        api_server_timeout: Duration,
        reconcile_timeout: Duration,
        status_mode: StatusMode,
    ) -> Self {
        let inventory = InventoryClient::new(client.clone(), &scope, &reconciler);
        Applier {
            client,
            scope,
            sync_name,
            field_manager: reconciler,
            api_server_timeout,
            reconcile_timeout,
            status_mode,
            inventory,
        }
    }

    fn api_for(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }

    /// One apply pass: diff, order, apply, prune, persist inventory.
    pub async fn apply(&self, commit: &str, declared: Vec<DynamicObject>) -> ApplyResult {
        let mut result = ApplyResult::default();

        let inventory = match self.inventory.load().await {
            Ok(inv) => inv,
            Err(e) => {
                result.errors.push(e);
                return result;
            }
        };

        let declared_ids: Vec<ObjectId> = declared.iter().filter_map(ObjectId::of).collect();
        let prune_candidates = inventory.prune_candidates(&declared_ids);
        let prune_ids: Vec<ObjectId> = prune_candidates.iter().map(|e| e.id.clone()).collect();

        if let Err(e) = check_prune_safety(&declared, &prune_ids) {
            result.errors.push(e);
            return result;
        }

        let order = match sort_for_apply(&declared) {
            Ok(order) => order,
            Err(e) => {
                // Cycles are fatal before any apply.
                result.errors.push(e);
                return result;
            }
        };

        for &i in &order {
            let obj = &declared[i];
            let Some(id) = ObjectId::of(obj) else { continue };
            match self.apply_object(obj, &id).await {
                Ok(()) => {
                    result.applied.push((id, Actuation::Succeeded));
                }
                Err(e) => {
                    warn!(object = %id, error = %e, "Apply failed");
                    result.applied.push((id, Actuation::Failed));
                    result.errors.push(e);
                }
            }
        }

        // Prune in reverse dependency order: dependents before their
        // dependencies, the inverse of apply.
        for entry in prune_candidates.iter().rev() {
            let id = &entry.id;
            match self.prune_object(entry).await {
                Ok(actuation) => result.pruned.push((id.clone(), actuation)),
                Err(e) => {
                    warn!(object = %id, error = %e, "Prune failed");
                    result.pruned.push((id.clone(), Actuation::Failed));
                    result.errors.push(e);
                }
            }
        }

        // Rewrite the inventory: declared objects with their actuation, plus
        // prune survivors (skips and failures).
        let version_of: BTreeMap<ObjectId, String> = declared
            .iter()
            .filter_map(|o| {
                let id = ObjectId::of(o)?;
                let version = o.types.as_ref()?.api_version.clone();
                Some((id, version))
            })
            .collect();
        let record_status = |status: Actuation| match self.status_mode {
            StatusMode::Enabled => status,
            StatusMode::Disabled => Actuation::Pending,
        };
        let mut entries: Vec<InventoryEntry> = result
            .applied
            .iter()
            .map(|(id, status)| InventoryEntry {
                id: id.clone(),
                api_version: version_of.get(id).cloned().unwrap_or_default(),
                status: record_status(*status),
            })
            .collect();
        for (id, actuation) in &result.pruned {
            if *actuation != Actuation::Succeeded {
                let api_version = prune_candidates
                    .iter()
                    .find(|e| &e.id == id)
                    .map(|e| e.api_version.clone())
                    .unwrap_or_default();
                entries.push(InventoryEntry {
                    id: id.clone(),
                    api_version,
                    status: record_status(*actuation),
                });
            }
        }
        let new_inventory = Inventory {
            commit: commit.to_string(),
            entries,
        };
        if let Err(e) = self.inventory.save(&new_inventory).await {
            result.errors.push(e);
        }

        info!(
            commit = %commit,
            applied = result.applied.len(),
            pruned = result.pruned.len(),
            errors = result.errors.len(),
            "Apply pass finished"
        );
        result
    }

    /// Server-side apply of one declared object.
    async fn apply_object(&self, obj: &DynamicObject, id: &ObjectId) -> Result<(), StatusError> {
        let resource = api_resource_of(obj)?;
        let api = self.api_for(&resource, obj.metadata.namespace.as_deref());
        let name = obj.metadata.name.as_deref().ok_or_else(|| {
            StatusError::internal(format!("declared object {id} has no name"))
        })?;

        let params = PatchParams::apply(&self.field_manager);
        let patch = Patch::Apply(obj);
        let fut = api.patch(name, &params, &patch);
        let response = tokio::time::timeout(self.api_server_timeout, fut)
            .await
            .map_err(|_| {
                StatusError::apply(format!(
                    "apply of {id} timed out after {:?}",
                    self.api_server_timeout
                ))
            })?;

        match response {
            Ok(_) => {
                debug!(object = %id, "Applied");
                if matches!(
                    resource.kind.as_str(),
                    "CustomResourceDefinition" | "Namespace"
                ) {
                    self.wait_for_current(&api, name, id).await?;
                }
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                // A field-manager conflict: another manager owns fields we
                // declared. Not retried locally; the remediator keeps watch.
                let current = self.live_manager(&api, name).await;
                Err(StatusError::management_conflict(
                    &id.to_string(),
                    &current,
                    &self.scope.manager(&self.sync_name),
                ))
            }
            Err(e) => Err(StatusError::apply(format!("failed to apply {id}: {e}"))),
        }
    }

    async fn live_manager(&self, api: &Api<DynamicObject>, name: &str) -> String {
        match api.get(name).await {
            Ok(live) => {
                let manager = metadata::manager_of(&live);
                if manager.is_empty() {
                    "an unmanaged field owner".to_string()
                } else {
                    manager.to_string()
                }
            }
            Err(_) => "an unknown manager".to_string(),
        }
    }

    /// Wait for ordering-critical kinds to become usable before their
    /// dependents apply, bounded by the reconcile timeout.
    async fn wait_for_current(
        &self,
        api: &Api<DynamicObject>,
        name: &str,
        id: &ObjectId,
    ) -> Result<(), StatusError> {
        let deadline = tokio::time::Instant::now() + self.reconcile_timeout;
        loop {
            match api.get(name).await {
                Ok(live) => {
                    if is_established(&live) {
                        return Ok(());
                    }
                }
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => {
                    return Err(StatusError::apply(format!(
                        "failed waiting for {id} to become current: {e}"
                    )));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(StatusError::apply(format!(
                    "{id} did not become current within {:?}",
                    self.reconcile_timeout
                )));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Delete one prune candidate, honoring the prevent-deletion marker.
    async fn prune_object(&self, entry: &InventoryEntry) -> Result<Actuation, StatusError> {
        let id = &entry.id;
        // Use the apiVersion recorded at declaration time; fall back to the
        // group's v1 for inventories written before it was recorded.
        let api_version = if !entry.api_version.is_empty() {
            entry.api_version.clone()
        } else if id.group.is_empty() {
            "v1".to_string()
        } else {
            format!("{}/v1", id.group)
        };
        let version = api_version
            .split_once('/')
            .map(|(_, v)| v.to_string())
            .unwrap_or_else(|| api_version.clone());
        let resource = ApiResource {
            group: id.group.clone(),
            version,
            api_version,
            kind: id.kind.clone(),
            plural: pluralize(&id.kind),
        };
        let namespace = (!id.namespace.is_empty()).then_some(id.namespace.as_str());
        let api = self.api_for(&resource, namespace);

        let live = match api.get(&id.name).await {
            Ok(live) => live,
            Err(kube::Error::Api(e)) if e.code == 404 => {
                // Already gone; pruning is complete.
                return Ok(Actuation::Succeeded);
            }
            Err(e) => {
                return Err(StatusError::apply(format!("failed to read {id}: {e}")));
            }
        };

        if metadata::prevents_deletion(&live) {
            debug!(object = %id, "Prune skipped (prevent-deletion)");
            return Ok(Actuation::SkippedPrune);
        }
        // Never prune an object another manager has since adopted.
        let manager = metadata::manager_of(&live);
        let ours = self.scope.manager(&self.sync_name);
        if !manager.is_empty() && manager != ours {
            debug!(object = %id, manager = %manager, "Prune skipped (foreign manager)");
            return Ok(Actuation::SkippedPrune);
        }

        let delete_params = DeleteParams::default();
        let fut = api.delete(&id.name, &delete_params);
        match tokio::time::timeout(self.api_server_timeout, fut).await {
            Ok(Ok(_)) => {
                info!(object = %id, "Pruned");
                Ok(Actuation::Succeeded)
            }
            Ok(Err(kube::Error::Api(e))) if e.code == 404 => Ok(Actuation::Succeeded),
            Ok(Err(e)) => Err(StatusError::apply(format!("failed to prune {id}: {e}"))),
            Err(_) => Err(StatusError::apply(format!(
                "prune of {id} timed out after {:?}",
                self.api_server_timeout
            ))),
        }
    }
}

/// Whether an applied ordering-critical object is usable by dependents.
fn is_established(obj: &DynamicObject) -> bool {
    match obj.types.as_ref().map(|t| t.kind.as_str()) {
        Some("CustomResourceDefinition") => obj.data["status"]["conditions"]
            .as_array()
            .is_some_and(|conds| {
                conds.iter().any(|c| {
                    c["type"].as_str() == Some("Established")
                        && c["status"].as_str() == Some("True")
                })
            }),
        Some("Namespace") => obj.data["status"]["phase"]
            .as_str()
            .map(|p| p == "Active")
            // A namespace with no phase yet is treated as active; the API
            // server admits objects into it as soon as it exists.
            .unwrap_or(true),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::TypeMeta;

    fn object(api_version: &str, kind: &str, ns: Option<&str>, name: &str) -> DynamicObject {
        let mut obj = DynamicObject {
            types: Some(TypeMeta {
                api_version: api_version.into(),
                kind: kind.into(),
            }),
            metadata: Default::default(),
            data: serde_json::json!({}),
        };
        obj.metadata.name = Some(name.into());
        obj.metadata.namespace = ns.map(String::from);
        obj
    }

    #[test]
    fn pluralize_handles_common_shapes() {
        assert_eq!(pluralize("Deployment"), "deployments");
        assert_eq!(pluralize("NetworkPolicy"), "networkpolicies");
        assert_eq!(pluralize("Ingress"), "ingresses");
        assert_eq!(pluralize("Endpoints"), "endpoints");
        assert_eq!(pluralize("Gateway"), "gateways");
    }

    #[test]
    fn parse_depends_on_both_forms() {
        let ids = parse_depends_on(
            "apps/namespaces/shop/Deployment/web, rbac.authorization.k8s.io/ClusterRole/admin",
        )
        .unwrap();
        assert_eq!(ids[0], ObjectId::new("apps", "Deployment", "shop", "web"));
        assert_eq!(
            ids[1],
            ObjectId::new("rbac.authorization.k8s.io", "ClusterRole", "", "admin")
        );
        assert!(parse_depends_on("not-enough-parts").is_err());
    }

    #[test]
    fn sort_puts_crds_and_namespaces_first() {
        let objs = vec![
            object("apps/v1", "Deployment", Some("shop"), "web"),
            object("v1", "Namespace", None, "shop"),
            object("apiextensions.k8s.io/v1", "CustomResourceDefinition", None, "widgets.example.com"),
        ];
        let order = sort_for_apply(&objs).unwrap();
        assert_eq!(order, vec![2, 1, 0]);
    }

    #[test]
    fn sort_honors_depends_on_edges() {
        let first = object("v1", "ConfigMap", Some("app"), "first");
        let mut second = object("v1", "ConfigMap", Some("app"), "second");
        metadata::set_annotation(
            &mut second,
            DEPENDS_ON_ANNOTATION,
            "/namespaces/app/ConfigMap/first",
        );
        // Declare them in the wrong order on purpose.
        let objs = vec![second, first];
        let order = sort_for_apply(&objs).unwrap();
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn sort_detects_cycles() {
        let mut a = object("v1", "ConfigMap", Some("app"), "a");
        let mut b = object("v1", "ConfigMap", Some("app"), "b");
        metadata::set_annotation(&mut a, DEPENDS_ON_ANNOTATION, "/namespaces/app/ConfigMap/b");
        metadata::set_annotation(&mut b, DEPENDS_ON_ANNOTATION, "/namespaces/app/ConfigMap/a");
        let err = sort_for_apply(&[a, b]).unwrap_err();
        assert_eq!(err.code(), codes::DEPENDENCY_ERROR);
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn sort_rejects_undeclared_dependency() {
        let mut a = object("v1", "ConfigMap", Some("app"), "a");
        metadata::set_annotation(
            &mut a,
            DEPENDS_ON_ANNOTATION,
            "/namespaces/app/ConfigMap/ghost",
        );
        let err = sort_for_apply(&[a]).unwrap_err();
        assert_eq!(err.code(), codes::DEPENDENCY_ERROR);
    }

    #[test]
    fn empty_source_with_inventory_fails_safety_check() {
        let prune = vec![ObjectId::new("", "ConfigMap", "app", "a")];
        let err = check_prune_safety(&[], &prune).unwrap_err();
        assert_eq!(err.code(), codes::PRUNE_SAFETY);
    }

    #[test]
    fn safety_marker_permits_full_prune() {
        let mut marker = object("v1", "ConfigMap", Some("app"), "safety");
        metadata::set_annotation(&mut marker, SAFETY_MARKER_ANNOTATION, "true");
        let prune = vec![ObjectId::new("", "ConfigMap", "app", "a")];
        assert!(check_prune_safety(&[marker], &prune).is_ok());
    }

    #[test]
    fn partial_prune_passes_safety_check() {
        let declared = vec![object("v1", "ConfigMap", Some("app"), "keep")];
        let prune = vec![ObjectId::new("", "ConfigMap", "app", "drop")];
        assert!(check_prune_safety(&declared, &prune).is_ok());
    }

    #[test]
    fn established_checks() {
        let mut crd = object("apiextensions.k8s.io/v1", "CustomResourceDefinition", None, "x");
        assert!(!is_established(&crd));
        crd.data = serde_json::json!({
            "status": {"conditions": [{"type": "Established", "status": "True"}]}
        });
        assert!(is_established(&crd));
        let plain = object("v1", "ConfigMap", Some("app"), "cm");
        assert!(is_established(&plain));
    }
}
