use crate::{api::AppState, error::PluginError, storage::FileStorage};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tracing::error;

fn default_status() -> String {
    "ALL".into()
}

fn default_limit() -> u32 {
    25
}

/// Filters for the process overview.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverviewQuery {
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
    #[serde(default)]
    pub search_query: String,
    #[serde(default)]
    pub date_from: String,
    #[serde(default)]
    pub date_to: String,
    #[serde(default)]
    pub sort_criteria: String,
    #[serde(default)]
    pub sort_order: String,
    #[serde(default)]
    pub only_mine: bool,
}

impl Default for OverviewQuery {
    fn default() -> Self {
        Self {
            status: default_status(),
            limit: default_limit(),
            offset: 0,
            search_query: String::new(),
            date_from: String::new(),
            date_to: String::new(),
            sort_criteria: String::new(),
            sort_order: String::new(),
            only_mine: false,
        }
    }
}

/// Query parameters for signd's `list` endpoint, always scoped to this instance.
pub fn list_params(
    query: &OverviewQuery,
    instance_id: &str,
    user: Option<&str>,
) -> Vec<(&'static str, String)> {
    let mut search = Map::new();
    search.insert(
        "applicationMetaData.hostInstanceId".into(),
        Value::String(instance_id.into()),
    );
    if query.only_mine {
        if let Some(user) = user {
            search.insert(
                "applicationMetaData.hostUserId".into(),
                Value::String(user.into()),
            );
        }
    }

    let mut params = vec![
        ("status", query.status.clone()),
        ("limit", query.limit.to_string()),
        ("offset", query.offset.to_string()),
        ("metadataSearch", Value::Object(search).to_string()),
    ];
    if !query.search_query.is_empty() {
        params.push(("searchQuery", query.search_query.clone()));
        params.push(("searchMatchType", "LIKE".into()));
    }
    for (key, value) in [
        ("dateFrom", &query.date_from),
        ("dateTo", &query.date_to),
        ("sortCriteria", &query.sort_criteria),
        ("sortOrder", &query.sort_order),
    ] {
        if !value.is_empty() {
            params.push((key, value.clone()));
        }
    }
    params
}

fn host_file_id(process: &Value) -> Option<&Value> {
    process
        .pointer("/apiClientMetaData/applicationMetaData/hostFileId")
        .filter(|v| !v.is_null())
}

fn parse_file_id(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Flag each listed process with whether its source file is still present
/// in the user's folder. One lookup per distinct file id.
pub fn mark_file_existence<S: FileStorage + ?Sized>(
    result: &mut Value,
    storage: &S,
    user: &str,
) -> anyhow::Result<()> {
    let Some(processes) = result.get_mut("processes").and_then(Value::as_array_mut) else {
        return Ok(());
    };
    let mut exists: HashMap<String, bool> = HashMap::new();
    for process in processes.iter() {
        let Some(id) = host_file_id(process) else { continue };
        let key = id.to_string();
        if exists.contains_key(&key) {
            continue;
        }
        let found = match parse_file_id(id) {
            Some(file_id) => !storage.get_by_id_for_user(user, file_id)?.is_empty(),
            None => false,
        };
        exists.insert(key, found);
    }
    for process in processes.iter_mut() {
        let Some(key) = host_file_id(process).map(Value::to_string) else {
            continue;
        };
        let found = exists.get(&key).copied().unwrap_or(false);
        if let Some(meta) = process
            .pointer_mut("/apiClientMetaData/applicationMetaData")
            .and_then(Value::as_object_mut)
        {
            meta.insert("_hostFileExists".into(), json!(found));
        }
    }
    Ok(())
}

/// Processes signd knows for this instance.
pub async fn list(
    state: &AppState,
    user: Option<&str>,
    query: &OverviewQuery,
) -> Result<Value, PluginError> {
    const FALLBACK: &str = "Failed to list processes";
    let params = list_params(query, &state.config.instance_id, user);
    let mut result = state.signd.list_processes(&params).await.map_err(|e| {
        error!(error = %e, "failed to list processes");
        PluginError::api(e, FALLBACK)
    })?;
    if let Some(user) = user {
        mark_file_existence(&mut result, state.storage.as_ref(), user).map_err(|e| {
            error!(error = %e, "failed to list processes");
            PluginError::internal(e, FALLBACK)
        })?;
    }
    Ok(result)
}

/// Cancel a running signing process.
pub async fn cancel(state: &AppState, process_id: &str, reason: &str) -> Result<(), PluginError> {
    state
        .signd
        .cancel_process(process_id, reason)
        .await
        .map_err(|e| {
            error!(process_id, error = %e, "failed to cancel process");
            PluginError::api(e, "Failed to cancel process")
        })
}
