use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::TaskRepository;
use crate::errors::StorageError;
use crate::external::storage::{local_file_url, StorageBackend};
use crate::models::{FileAsset, UploadEntry, UploadedFile};

/// Trading window a batch of produced files covers.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PeriodWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// Uniform upload/delete over the configured backend, plus FileAsset bookkeeping.
#[derive(Clone)]
pub struct ArtifactStorageGateway {
    backend: Arc<dyn StorageBackend>,
    repository: Arc<dyn TaskRepository>,
}

impl ArtifactStorageGateway {
    pub fn new(backend: Arc<dyn StorageBackend>, repository: Arc<dyn TaskRepository>) -> Self {
        Self { backend, repository }
    }

    pub async fn upload(&self, path: &Path, prefix: Option<&str>) -> Result<UploadedFile, StorageError> {
        self.backend.upload(path, prefix).await
    }

    pub async fn delete(&self, storage_key: &str) -> Result<(), StorageError> {
        self.backend.delete(storage_key).await
    }

    /// Uploads each file and registers a FileAsset for it. A failed upload
    /// falls back to a `file://` reference for that file only.
    pub async fn publish_outputs(
        &self,
        task_id: &str,
        files: &[PathBuf],
        prefix: &str,
        window: PeriodWindow,
    ) -> Vec<UploadEntry> {
        let mut entries = Vec::with_capacity(files.len());

        for path in files {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string());
            let local_path = path.display().to_string();

            match self.backend.upload(path, Some(prefix)).await {
                Ok(uploaded) => {
                    self.register(task_id, path, &file_name, &uploaded, window).await;
                    entries.push(UploadEntry::remote(&file_name, &local_path, &uploaded));
                }
                Err(e) => {
                    warn!(task_id = %task_id, file = %file_name, "⚠️  Upload failed, keeping local reference: {}", e);
                    let local_url = local_file_url(path).unwrap_or_else(|_| format!("file://{}", local_path));
                    entries.push(UploadEntry::local_fallback(&file_name, &local_path, local_url, e.to_string()));
                }
            }
        }

        let remote = entries.iter().filter(|e| e.remote).count();
        info!(task_id = %task_id, remote, local = entries.len() - remote, "📦 Published task outputs");
        entries
    }

    async fn register(
        &self,
        task_id: &str,
        path: &Path,
        file_name: &str,
        uploaded: &UploadedFile,
        window: PeriodWindow,
    ) {
        let (size, checksum) = match file_digest(path).await {
            Ok((size, checksum)) => (size, Some(checksum)),
            Err(e) => {
                warn!(file = %file_name, "⚠️  Could not checksum uploaded file: {}", e);
                (0, None)
            }
        };

        let asset = FileAsset {
            id: Uuid::new_v4(),
            task_id: Some(task_id.to_string()),
            backtest_id: None,
            file_name: file_name.to_string(),
            local_path: Some(path.display().to_string()),
            storage_key: uploaded.storage_key.clone(),
            storage_url: uploaded.url.clone(),
            size,
            checksum,
            period_start: window.start,
            period_end: window.end,
            metadata: json!({ "source": "task_output" }),
            created_at: Utc::now(),
        };

        if let Err(e) = self.repository.create_file_asset(&asset).await {
            warn!(task_id = %task_id, file = %file_name, "⚠️  Failed to register file asset: {}", e);
        }
    }
}

/// Size in bytes and hex SHA-256 of a file.
pub async fn file_digest(path: &Path) -> Result<(i64, String), std::io::Error> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    let mut size: i64 = 0;
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        size += read as i64;
    }
    let checksum = hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>();
    Ok((size, checksum))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_digest_of_known_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.txt");
        tokio::fs::write(&path, "abc").await.unwrap();

        let (size, checksum) = file_digest(&path).await.unwrap();
        assert_eq!(size, 3);
        assert_eq!(
            checksum,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
