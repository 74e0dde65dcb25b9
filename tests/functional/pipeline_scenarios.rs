//! Parse/validate/diff behavior over real directory trees.

use std::path::Path;

use sync_operator::crd::Scope;
use sync_operator::errors::{codes, has_blocking_errors};
use sync_operator::metadata::ObjectId;
use sync_operator::reconciler::applier::sort_for_apply;
use sync_operator::reconciler::inventory::{Actuation, Inventory, InventoryEntry};
use sync_operator::reconciler::parse::reader::read_tree;
use sync_operator::reconciler::parse::validate::{
    ValidateOptions, validate_hierarchy, validate_objects,
};
use tempfile::TempDir;

fn write(dir: &Path, rel: &str, content: &str) {
    let path = dir.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn root_opts() -> ValidateOptions {
    ValidateOptions {
        scope: Scope::Root,
        sync_name: "root-sync".into(),
    }
}

/// A hierarchy tree missing system/repo.yaml is a blocking source error;
/// restoring the marker clears it (the static half of a force-revert).
#[test]
fn missing_repo_marker_blocks_then_recovers() {
    let tree = TempDir::new().unwrap();
    write(
        tree.path(),
        "namespaces/ns-a/cm.yaml",
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: settings\n",
    );

    let (objects, read_errs) = read_tree(tree.path());
    assert!(read_errs.is_empty());
    let (_, errs) = validate_hierarchy(objects, &root_opts());
    assert!(errs.iter().any(|e| e.code() == codes::MISSING_REPO));
    assert!(has_blocking_errors(&errs));

    // The next commit restores the marker.
    write(
        tree.path(),
        "system/repo.yaml",
        "apiVersion: syncoperator.smoketurner.com/v1\nkind: Repo\nmetadata:\n  name: repo\n",
    );
    let (objects, _) = read_tree(tree.path());
    let (kept, errs) = validate_hierarchy(objects, &root_opts());
    assert!(errs.is_empty(), "{errs:?}");
    assert_eq!(kept.len(), 1);
    assert_eq!(
        kept[0].object.metadata.namespace.as_deref(),
        Some("ns-a"),
        "namespace derived from directory"
    );
}

/// Branch switch: the declared set from the new branch marks the old
/// branch's namespace for pruning and the new one for apply.
#[test]
fn branch_switch_diffs_against_inventory() {
    // Inventory from branch "main": ns-a plus its contents.
    let inventory = Inventory {
        commit: "old-head".into(),
        entries: vec![
            InventoryEntry {
                id: ObjectId::new("", "Namespace", "", "ns-a"),
                api_version: "v1".into(),
                status: Actuation::Succeeded,
            },
            InventoryEntry {
                id: ObjectId::new("", "ConfigMap", "ns-a", "settings"),
                api_version: "v1".into(),
                status: Actuation::Succeeded,
            },
        ],
    };

    // Declared set from branch "test-branch": ns-b.
    let tree = TempDir::new().unwrap();
    write(
        tree.path(),
        "ns-b.yaml",
        "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: ns-b\n",
    );
    write(
        tree.path(),
        "cm.yaml",
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: settings\n  namespace: ns-b\n",
    );
    let (mut objects, _) = read_tree(tree.path());
    let errs = validate_objects(&mut objects, &root_opts());
    assert!(errs.is_empty(), "{errs:?}");

    let declared_ids: Vec<ObjectId> = objects
        .iter()
        .filter_map(|fo| ObjectId::of(&fo.object))
        .collect();
    let prune = inventory.prune_candidates(&declared_ids);
    let prune_ids: Vec<&ObjectId> = prune.iter().map(|e| &e.id).collect();
    assert!(prune_ids.contains(&&ObjectId::new("", "Namespace", "", "ns-a")));
    assert!(prune_ids.contains(&&ObjectId::new("", "ConfigMap", "ns-a", "settings")));
    assert!(!prune_ids.contains(&&ObjectId::new("", "Namespace", "", "ns-b")));

    // And the namespace applies before the objects inside it.
    let declared: Vec<_> = objects.into_iter().map(|fo| fo.object).collect();
    let order = sort_for_apply(&declared).unwrap();
    let kinds: Vec<_> = order
        .iter()
        .map(|&i| declared[i].types.as_ref().unwrap().kind.clone())
        .collect();
    assert_eq!(kinds, vec!["Namespace", "ConfigMap"]);
}

/// A multi-document tree with a duplicate identity fails validation before
/// any apply could happen.
#[test]
fn duplicate_across_files_is_blocking() {
    let tree = TempDir::new().unwrap();
    write(
        tree.path(),
        "a.yaml",
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: dup\n  namespace: app\n",
    );
    write(
        tree.path(),
        "b.yaml",
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: dup\n  namespace: app\n",
    );
    let (mut objects, _) = read_tree(tree.path());
    let errs = validate_objects(&mut objects, &root_opts());
    assert_eq!(errs.len(), 1);
    assert_eq!(errs[0].code(), codes::DUPLICATE_OBJECT);
    assert!(has_blocking_errors(&errs));
}
