use crate::{
    api::AppState,
    error::PluginError,
    model::{NewProcess, Process},
    sign_api::{ApiClientMetaData, ApplicationMetaData, Draft, FileMeta, StartWizard},
    storage::{Node, StorageError},
};
use axum::http::StatusCode;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, warn};

pub const APPLICATION_NAME: &str = "homecore-signd";

/// A mapping row as shown in the file sidebar, optionally enriched with
/// what signd reports about it.
#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessView {
    #[serde(flatten)]
    pub process: Process,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_draft: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl ProcessView {
    fn bare(process: Process) -> Self {
        Self {
            process,
            is_draft: None,
            meta: None,
        }
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WizardStarted {
    pub wizard_url: String,
    pub process_id: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Downloaded {
    Already {
        path: String,
        message: &'static str,
    },
    Saved {
        path: String,
        name: String,
        #[serde(rename = "targetDirMissing", skip_serializing_if = "is_false")]
        target_dir_missing: bool,
    },
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Expand one row into sidebar entries according to its remote state.
pub fn expand(process: Process, meta: FileMeta) -> Vec<ProcessView> {
    let draft_view = |process: &Process, draft: Draft| ProcessView {
        process: process.clone(),
        is_draft: Some(true),
        meta: serde_json::to_value(draft).ok(),
    };
    let process_views = |process: &Process, list: Vec<Value>| {
        list.into_iter()
            .map(|m| ProcessView {
                process: process.clone(),
                is_draft: None,
                meta: Some(m),
            })
            .collect::<Vec<_>>()
    };
    match meta {
        FileMeta::Neither => vec![ProcessView::bare(process)],
        FileMeta::Draft(draft) => vec![draft_view(&process, draft)],
        FileMeta::Processes(list) => process_views(&process, list),
        FileMeta::DraftAndProcesses(draft, list) => {
            let mut out = vec![draft_view(&process, draft)];
            out.extend(process_views(&process, list));
            out
        }
    }
}

/// All sidebar entries for a file.
pub async fn list_for_file(state: &AppState, file_id: i64) -> Result<Vec<ProcessView>, PluginError> {
    let rows = state.processes.find_by_file_id(file_id).map_err(|e| {
        error!(file_id, error = %e, "failed to get processes for file");
        PluginError::internal(e, "Failed to load processes")
    })?;
    let mut out = Vec::new();
    for process in rows {
        match state.signd.get_meta(&process.process_id).await {
            Ok(meta) => out.extend(expand(process, meta)),
            Err(e) => {
                debug!(process_id = %process.process_id, error = %e, "failed to fetch meta for process");
                out.push(ProcessView::bare(process));
            }
        }
    }
    Ok(out)
}

/// Upload a file to signd and remember the started process.
pub async fn start_wizard(
    state: &AppState,
    user: Option<&str>,
    file_id: i64,
) -> Result<WizardStarted, PluginError> {
    let user = user.ok_or_else(PluginError::unauthenticated)?;
    const FALLBACK: &str = "Failed to start signing process";
    let log = |e: &dyn std::fmt::Display| error!(file_id, error = %e, "failed to start wizard");

    let file = state
        .storage
        .get_by_id_for_user(user, file_id)
        .map_err(|e| {
            log(&e);
            PluginError::internal(e, FALLBACK)
        })?
        .into_iter()
        .next()
        .ok_or_else(|| PluginError::not_found("File not found"))?;
    if !file.is_file() {
        return Err(PluginError::bad_request("Not a file"));
    }
    let content = state.storage.read(&file).map_err(|e| {
        log(&e);
        PluginError::internal(e, FALLBACK)
    })?;

    let request = StartWizard {
        pdf_filename: file.name.clone(),
        pdf_data: STANDARD.encode(content),
        name: file.name.clone(),
        api_client_meta_data: ApiClientMetaData {
            application_name: APPLICATION_NAME.into(),
            application_meta_data: ApplicationMetaData {
                host_file_id: file_id.to_string(),
                host_file_path: file.path.clone(),
                host_file_name: file.name.clone(),
                host_user_id: user.to_string(),
                host_instance_id: state.config.instance_id.clone(),
            },
        },
    };
    let result = state.signd.start_wizard(&request).await.map_err(|e| {
        log(&e);
        PluginError::api(e, FALLBACK)
    })?;
    let (Some(process_id), Some(wizard_url)) = (result.process_id, result.wizard_url) else {
        return Err(PluginError::rejected(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Invalid response from sign API",
        ));
    };

    state
        .processes
        .insert(&NewProcess {
            file_id,
            process_id: process_id.clone(),
            user_id: user.to_string(),
            target_dir: Some(file.parent_path()),
        })
        .map_err(|e| {
            log(&e);
            PluginError::internal(e, FALLBACK)
        })?;

    Ok(WizardStarted {
        wizard_url,
        process_id,
    })
}

fn find_process(state: &AppState, process_id: &str) -> Result<Process, PluginError> {
    state
        .processes
        .find_by_process_id(process_id)
        .map_err(|e| PluginError::internal(e, "Failed to load process"))?
        .ok_or_else(|| PluginError::not_found("Process not found"))
}

/// The row together with the first process signd reports for it.
pub async fn refresh(state: &AppState, process_id: &str) -> Result<ProcessView, PluginError> {
    let process = find_process(state, process_id)?;
    let meta = state.signd.get_meta(process_id).await.map_err(|e| {
        error!(process_id, error = %e, "failed to refresh process");
        PluginError::api(e, "Failed to refresh process status")
    })?;
    let first = meta.first_process().cloned();
    Ok(ProcessView {
        meta: first,
        ..ProcessView::bare(process)
    })
}

/// `(base, extension)` of the signed copy's name.
pub fn signed_name_parts(requested: &str, process_id: &str) -> (String, String) {
    if requested.is_empty() {
        let short: String = process_id.chars().take(8).collect();
        return (format!("signed_{short}"), "pdf".into());
    }
    // the part before the last dot is the base, even when that is empty
    let name = requested.rsplit('/').next().unwrap_or(requested);
    let (base, ext) = name.rsplit_once('.').unwrap_or((name, ""));
    let ext = if ext.is_empty() { "pdf" } else { ext };
    (base.into(), ext.into())
}

/// First `<base>_signed[_n].<ext>` for which `taken` is false.
pub fn unique_signed_name<F>(base: &str, ext: &str, mut taken: F) -> anyhow::Result<String>
where
    F: FnMut(&str) -> anyhow::Result<bool>,
{
    let mut name = format!("{base}_signed.{ext}");
    let mut counter = 1;
    while taken(&name)? {
        name = format!("{base}_signed_{counter}.{ext}");
        counter += 1;
    }
    Ok(name)
}

/// Fetch the signed PDF and store it next to the original.
pub async fn download(
    state: &AppState,
    user: Option<&str>,
    process_id: &str,
    filename: &str,
) -> Result<Downloaded, PluginError> {
    let user = user.ok_or_else(PluginError::unauthenticated)?;
    let process = find_process(state, process_id)?;
    if let Some(path) = process.finished_pdf_path.clone().filter(|_| process.is_finished()) {
        return Ok(Downloaded::Already {
            path,
            message: "Already downloaded",
        });
    }

    const FALLBACK: &str = "Failed to download signed PDF";
    let internal = |e: anyhow::Error| {
        error!(process_id, error = %e, "failed to download signed PDF");
        PluginError::internal(e, FALLBACK)
    };

    let pdf = state.signd.finished_pdf(process_id).await.map_err(|e| {
        error!(process_id, error = %e, "failed to download signed PDF");
        PluginError::api(e, FALLBACK)
    })?;

    let (parent, target_dir_missing) = match resolve_target(state, &process)? {
        Some(dir) => (dir, false),
        None => (state.storage.user_folder(user).map_err(internal)?, true),
    };

    let (base, ext) = signed_name_parts(filename, process_id);
    let name = unique_signed_name(&base, &ext, |candidate| {
        state.storage.node_exists(&parent, candidate)
    })
    .map_err(internal)?;

    let saved = match state.storage.new_file(&parent, &name, &pdf) {
        Ok(node) => node,
        Err(StorageError::NotPermitted(reason)) => {
            warn!(process_id, reason = %reason, "cannot store signed PDF");
            return Err(PluginError::Rejected {
                status: StatusCode::INSUFFICIENT_STORAGE,
                message: "Insufficient permissions or storage full".into(),
                code: Some("STORAGE_ERROR"),
            });
        }
        Err(StorageError::Other(e)) => return Err(internal(e)),
    };

    state
        .processes
        .set_finished_pdf_path(process.id, &saved.path)
        .map_err(internal)?;

    Ok(Downloaded::Saved {
        path: saved.path,
        name,
        target_dir_missing,
    })
}

/// The stored target directory, `None` when unset or gone.
fn resolve_target(state: &AppState, process: &Process) -> Result<Option<Node>, PluginError> {
    let Some(dir) = process.target_dir.as_deref().filter(|d| !d.is_empty()) else {
        return Ok(None);
    };
    match state.storage.get(dir) {
        Ok(Some(node)) if !node.is_file() => Ok(Some(node)),
        Ok(_) => {
            warn!(
                process_id = %process.process_id,
                target_dir = dir,
                "target directory no longer exists, falling back to user root"
            );
            Ok(None)
        }
        Err(e) => Err(PluginError::internal(e, "Failed to download signed PDF")),
    }
}

/// Ask signd for a fresh wizard URL for a draft.
pub async fn resume_wizard(state: &AppState, process_id: &str) -> Result<String, PluginError> {
    find_process(state, process_id)?;
    let resp = state.signd.resume_wizard(process_id).await.map_err(|e| {
        error!(process_id, error = %e, "failed to resume wizard");
        PluginError::api(e, "Failed to resume wizard")
    })?;
    Ok(resp.wizard_url.unwrap_or_default())
}

/// Cancel a draft remotely and forget it locally.
pub async fn cancel_wizard(state: &AppState, process_id: &str) -> Result<(), PluginError> {
    let process = find_process(state, process_id)?;
    state.signd.cancel_wizard(process_id).await.map_err(|e| {
        error!(process_id, error = %e, "failed to cancel wizard");
        PluginError::api(e, "Failed to cancel wizard")
    })?;
    state
        .processes
        .delete(process.id)
        .map_err(|e| PluginError::internal(e, "Failed to cancel wizard"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row() -> Process {
        Process {
            id: 3,
            file_id: 42,
            process_id: "abcdef123456".into(),
            user_id: "alice".into(),
            target_dir: Some("/alice/files".into()),
            finished_pdf_path: None,
        }
    }

    #[test]
    fn names_from_requested_filename() {
        assert_eq!(
            signed_name_parts("contract.pdf", "x"),
            ("contract".into(), "pdf".into())
        );
        assert_eq!(
            signed_name_parts("archive.tar.gz", "x"),
            ("archive.tar".into(), "gz".into())
        );
        assert_eq!(signed_name_parts("README", "x"), ("README".into(), "pdf".into()));
        assert_eq!(signed_name_parts(".pdf", "x"), ("".into(), "pdf".into()));
        assert_eq!(signed_name_parts("draft.", "x"), ("draft".into(), "pdf".into()));
        assert_eq!(
            signed_name_parts("/alice/files/contract.pdf", "x"),
            ("contract".into(), "pdf".into())
        );
        assert_eq!(
            signed_name_parts("", "abcdef123456"),
            ("signed_abcdef12".into(), "pdf".into())
        );
        assert_eq!(signed_name_parts("", "ab"), ("signed_ab".into(), "pdf".into()));
    }

    #[test]
    fn name_collisions_count_up() {
        let existing = ["c_signed.pdf", "c_signed_1.pdf"];
        let name = unique_signed_name("c", "pdf", |n| Ok(existing.contains(&n))).unwrap();
        assert_eq!(name, "c_signed_2.pdf");
        let name = unique_signed_name("d", "pdf", |_| Ok(false)).unwrap();
        assert_eq!(name, "d_signed.pdf");
    }

    #[test]
    fn expands_meta_shapes() {
        assert_eq!(expand(row(), FileMeta::Neither), vec![ProcessView::bare(row())]);

        let draft = Draft {
            draft_id: Some(json!("d-1")),
            ..Default::default()
        };
        let views = expand(
            row(),
            FileMeta::DraftAndProcesses(draft, vec![json!({"a":1}), json!({"b":2})]),
        );
        assert_eq!(views.len(), 3);
        assert_eq!(views[0].is_draft, Some(true));
        assert_eq!(views[0].meta.as_ref().unwrap()["draftId"], "d-1");
        assert_eq!(views[0].meta.as_ref().unwrap()["filename"], Value::Null);
        assert_eq!(views[2].meta, Some(json!({"b":2})));
        assert_eq!(views[2].is_draft, None);
    }

    #[test]
    fn view_serializes_flat() {
        let view = ProcessView {
            is_draft: Some(true),
            ..ProcessView::bare(row())
        };
        let v = serde_json::to_value(&view).unwrap();
        assert_eq!(v["processId"], "abcdef123456");
        assert_eq!(v["fileId"], 42);
        assert_eq!(v["isDraft"], true);
        assert!(v.get("meta").is_none());
    }

    #[test]
    fn download_results_serialize() {
        let saved = Downloaded::Saved {
            path: "/alice/files/c_signed.pdf".into(),
            name: "c_signed.pdf".into(),
            target_dir_missing: false,
        };
        let v = serde_json::to_value(&saved).unwrap();
        assert!(v.get("targetDirMissing").is_none());
        let already = Downloaded::Already {
            path: "/p".into(),
            message: "Already downloaded",
        };
        assert_eq!(
            serde_json::to_value(&already).unwrap(),
            json!({"path":"/p","message":"Already downloaded"})
        );
    }
}
