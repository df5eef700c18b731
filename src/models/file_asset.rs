use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAsset {
    pub id: Uuid,
    pub task_id: Option<String>,
    pub backtest_id: Option<Uuid>,
    pub file_name: String,
    pub local_path: Option<String>,
    pub storage_key: String,
    pub storage_url: String,
    pub size: i64,
    pub checksum: Option<String>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// Location of an object after a successful upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub storage_key: String,
    pub url: String,
}

/// One line of a job's `uploads` result list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadEntry {
    pub file_name: String,
    pub local_path: String,
    pub storage_key: Option<String>,
    pub storage_url: String,
    pub remote: bool,
    pub error: Option<String>,
}

impl UploadEntry {
    pub fn remote(file_name: &str, local_path: &str, uploaded: &UploadedFile) -> Self {
        Self {
            file_name: file_name.to_string(),
            local_path: local_path.to_string(),
            storage_key: Some(uploaded.storage_key.clone()),
            storage_url: uploaded.url.clone(),
            remote: true,
            error: None,
        }
    }

    pub fn local_fallback(file_name: &str, local_path: &str, local_url: String, error: String) -> Self {
        Self {
            file_name: file_name.to_string(),
            local_path: local_path.to_string(),
            storage_key: None,
            storage_url: local_url,
            remote: false,
            error: Some(error),
        }
    }
}
