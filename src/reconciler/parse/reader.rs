//! Reads the rendered tree into untyped objects.
//!
//! Every `.yaml`, `.yml`, and `.json` file under the sync directory is
//! parsed; multi-document YAML is split; documents without an apiVersion
//! and kind are discarded (values files, fragments). Malformed documents
//! are blocking parse errors.

use std::path::Path;

use kube::core::DynamicObject;
use serde::Deserialize;
use walkdir::WalkDir;

use crate::errors::{StatusError, codes};

/// A parsed object together with the declaring file (relative to the sync
/// directory), which ends up in the source-path annotation.
#[derive(Clone, Debug)]
pub struct FileObject {
    pub object: DynamicObject,
    pub path: String,
}

fn has_config_extension(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml" | "json")
    )
}

fn parse_document(
    value: serde_json::Value,
    rel_path: &str,
    out: &mut Vec<FileObject>,
    errs: &mut Vec<StatusError>,
) {
    if value.is_null() {
        return;
    }
    let has_gvk = value.get("apiVersion").and_then(|v| v.as_str()).is_some()
        && value.get("kind").and_then(|v| v.as_str()).is_some();
    if !has_gvk {
        // Not a Kubernetes object (a values file, a fragment); skip.
        return;
    }
    match serde_json::from_value::<DynamicObject>(value) {
        Ok(object) => out.push(FileObject {
            object,
            path: rel_path.to_string(),
        }),
        Err(e) => errs.push(StatusError::validation(
            codes::PARSE_ERROR,
            format!("unable to parse object in {rel_path}: {e}"),
        )),
    }
}

/// Read every config file under `sync_dir`.
pub fn read_tree(sync_dir: &Path) -> (Vec<FileObject>, Vec<StatusError>) {
    let mut objects = Vec::new();
    let mut errs = Vec::new();

    for entry in WalkDir::new(sync_dir)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_file() || !has_config_extension(entry.path()) {
            continue;
        }
        // Hidden files and directories (.git in particular) are not config.
        let rel_path = entry
            .path()
            .strip_prefix(sync_dir)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();
        if rel_path.split('/').any(|seg| seg.starts_with('.')) {
            continue;
        }

        let content = match std::fs::read_to_string(entry.path()) {
            Ok(content) => content,
            Err(e) => {
                errs.push(StatusError::transient(format!(
                    "unable to read {rel_path}: {e}"
                )));
                continue;
            }
        };

        if entry.path().extension().and_then(|e| e.to_str()) == Some("json") {
            match serde_json::from_str::<serde_json::Value>(&content) {
                Ok(value) => parse_document(value, &rel_path, &mut objects, &mut errs),
                Err(e) => errs.push(StatusError::validation(
                    codes::PARSE_ERROR,
                    format!("malformed JSON in {rel_path}: {e}"),
                )),
            }
            continue;
        }

        for document in serde_yaml::Deserializer::from_str(&content) {
            match serde_json::Value::deserialize(document) {
                Ok(value) => parse_document(value, &rel_path, &mut objects, &mut errs),
                Err(e) => {
                    errs.push(StatusError::validation(
                        codes::PARSE_ERROR,
                        format!("malformed YAML in {rel_path}: {e}"),
                    ));
                    break;
                }
            }
        }
    }

    (objects, errs)
}
