use serde::{Deserialize, Serialize};

/// One signing process started from one host file.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    pub id: i64,
    pub file_id: i64,
    pub process_id: String,
    pub user_id: String,
    pub target_dir: Option<String>,
    pub finished_pdf_path: Option<String>,
}

impl Process {
    /// A downloaded process is never downloaded again.
    pub fn is_finished(&self) -> bool {
        self.finished_pdf_path
            .as_deref()
            .is_some_and(|p| !p.is_empty())
    }
}

/// Fields needed to record a freshly started process.
#[derive(Debug, Clone)]
pub struct NewProcess {
    pub file_id: i64,
    pub process_id: String,
    pub user_id: String,
    pub target_dir: Option<String>,
}
