//! Parse pipeline: turn the active rendered tree into a validated,
//! stamped object stream ready for the applier.

pub mod reader;
pub mod validate;

use std::path::Path;

use kube::Client;
use kube::core::{ApiResource, DynamicObject, TypeMeta};

use crate::crd::{NamespaceStrategy, Scope, SourceFormat};
use crate::errors::{StatusError, has_blocking_errors};
use crate::metadata::{self, StampContext};
use crate::reconciler::parse::reader::FileObject;
use crate::reconciler::parse::validate::ValidateOptions;

/// Everything the parse pipeline needs to know about its sync.
pub struct ParseOptions {
    pub scope: Scope,
    pub sync_name: String,
    pub sync_kind: &'static str,
    pub source_format: SourceFormat,
    pub namespace_strategy: NamespaceStrategy,
    pub source_url: String,
}

impl ParseOptions {
    fn stamp_context(&self) -> StampContext {
        StampContext {
            scope: self.scope.clone(),
            sync_name: self.sync_name.clone(),
            sync_kind: self.sync_kind,
            source_url: self.source_url.clone(),
        }
    }
}

/// Parse and validate the tree at `sync_dir` for `commit`.
///
/// On blocking errors the object list is empty and the pipeline must not
/// apply; non-blocking errors ride along with the validated objects.
pub async fn parse_source(
    client: &Client,
    opts: &ParseOptions,
    sync_dir: &Path,
    commit: &str,
) -> (Vec<DynamicObject>, Vec<StatusError>) {
    let (objects, mut errs) = reader::read_tree(sync_dir);
    if has_blocking_errors(&errs) {
        return (Vec::new(), errs);
    }

    let validate_opts = ValidateOptions {
        scope: opts.scope.clone(),
        sync_name: opts.sync_name.clone(),
    };
    let mut objects = match opts.source_format {
        SourceFormat::Hierarchy => {
            let (kept, mut hierarchy_errs) = validate::validate_hierarchy(objects, &validate_opts);
            errs.append(&mut hierarchy_errs);
            kept
        }
        SourceFormat::Unstructured => {
            let mut objects = objects;
            let mut flat_errs = validate::validate_objects(&mut objects, &validate_opts);
            errs.append(&mut flat_errs);
            objects
        }
    };
    if has_blocking_errors(&errs) {
        return (Vec::new(), errs);
    }

    // Implicit namespaces are only synthesized for root syncs using the
    // implicit strategy; namespace syncs cannot create namespaces at all.
    if matches!(opts.scope, Scope::Root)
        && opts.namespace_strategy == NamespaceStrategy::Implicit
    {
        match add_implicit_namespaces(client, opts, &mut objects).await {
            Ok(()) => {}
            Err(e) => errs.push(e),
        }
    }

    // Stamp last: the declared-fields snapshot must cover the final form.
    let ctx = opts.stamp_context();
    for fo in &mut objects {
        metadata::stamp(&mut fo.object, &ctx, &fo.path, commit);
    }

    (objects.into_iter().map(|fo| fo.object).collect(), errs)
}

/// Synthesize Namespace objects for namespaces referenced but not declared.
///
/// A namespace that already exists in the cluster under a different manager
/// is left alone; synthesizing it would make two reconcilers fight over it.
/// Synthesized namespaces carry the prevent-deletion marker: removing the
/// last object in a namespace from the source must not prune a namespace
/// that may hold unmanaged resources.
async fn add_implicit_namespaces(
    client: &Client,
    opts: &ParseOptions,
    objects: &mut Vec<FileObject>,
) -> Result<(), StatusError> {
    let undeclared = validate::undeclared_namespaces(objects);
    if undeclared.is_empty() {
        return Ok(());
    }

    let ns_resource = ApiResource {
        group: String::new(),
        version: "v1".into(),
        api_version: "v1".into(),
        kind: "Namespace".into(),
        plural: "namespaces".into(),
    };
    let api: kube::Api<DynamicObject> = kube::Api::all_with(client.clone(), &ns_resource);
    let manager = opts.scope.manager(&opts.sync_name);

    for ns in undeclared {
        match api.get(&ns).await {
            Ok(existing) => {
                // Exists: only adopt it when we already manage it (it was
                // implicit in a previous commit and must stay in the
                // declared set or it would be pruned).
                if metadata::manager_of(&existing) != manager {
                    continue;
                }
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => {
                return Err(StatusError::api_server(format!(
                    "unable to check the existence of the implicit namespace {ns:?}: {e}"
                )));
            }
        }

        let mut object = DynamicObject::new(&ns, &ns_resource);
        object.types = Some(TypeMeta {
            api_version: "v1".into(),
            kind: "Namespace".into(),
        });
        metadata::set_annotation(
            &mut object,
            metadata::LIFECYCLE_DELETION_ANNOTATION,
            metadata::PREVENT_DELETION,
        );
        objects.push(FileObject {
            object,
            path: String::new(),
        });
    }
    Ok(())
}
