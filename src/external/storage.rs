use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::config::{StorageConfig, StorageProvider};
use crate::errors::StorageError;
use crate::models::UploadedFile;

#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn upload(&self, path: &Path, prefix: Option<&str>) -> Result<UploadedFile, StorageError>;
    /// Removing a key that does not exist succeeds.
    async fn delete(&self, storage_key: &str) -> Result<(), StorageError>;
}

/// `<prefix>/<uuid>_<file name>`, where the prefix defaults to today's `YYYY/MM/DD`.
pub fn build_object_key(file_name: &str, prefix: Option<&str>) -> String {
    let prefix = match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(p) => p.to_string(),
        None => Utc::now().format("%Y/%m/%d").to_string(),
    };
    format!("{}/{}_{}", prefix, Uuid::new_v4().simple(), file_name)
}

/// `file://` URL of a local path, canonicalized when the file exists.
pub fn local_file_url(path: &Path) -> Result<String, StorageError> {
    let absolute = std::fs::canonicalize(path).or_else(|_| std::path::absolute(path))?;
    url::Url::from_file_path(&absolute)
        .map(|u| u.to_string())
        .map_err(|_| StorageError::Config(format!("cannot build file url for {}", absolute.display())))
}

fn file_name_of(path: &Path) -> Result<String, StorageError> {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| StorageError::Config(format!("{} has no file name", path.display())))
}

pub fn build_backend(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>, StorageError> {
    match config.provider {
        StorageProvider::Local => Ok(Arc::new(LocalStorage::new(config.local_root.clone()))),
        StorageProvider::Http => {
            let endpoint = config
                .endpoint
                .clone()
                .ok_or_else(|| StorageError::Config("STORAGE_ENDPOINT is not set".to_string()))?;
            Ok(Arc::new(HttpObjectStorage::new(endpoint, config.bucket.clone(), config.token.clone())))
        }
    }
}

// ==============================================================================
// Local Filesystem
// ==============================================================================

pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn upload(&self, path: &Path, prefix: Option<&str>) -> Result<UploadedFile, StorageError> {
        let storage_key = build_object_key(&file_name_of(path)?, prefix);
        let target = self.root.join(&storage_key);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(path, &target).await?;
        let url = local_file_url(&target)?;
        Ok(UploadedFile { storage_key, url })
    }

    async fn delete(&self, storage_key: &str) -> Result<(), StorageError> {
        if storage_key.is_empty() {
            return Ok(());
        }
        match tokio::fs::remove_file(self.root.join(storage_key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ==============================================================================
// HTTP Object Endpoint
// ==============================================================================

/// Plain PUT/DELETE object endpoint: `{endpoint}/{bucket}/{key}`.
pub struct HttpObjectStorage {
    client: reqwest::Client,
    endpoint: String,
    bucket: Option<String>,
    token: Option<String>,
}

impl HttpObjectStorage {
    pub fn new(endpoint: String, bucket: Option<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bucket,
            token,
        }
    }

    fn object_url(&self, storage_key: &str) -> String {
        match &self.bucket {
            Some(bucket) => format!("{}/{}/{}", self.endpoint, bucket, storage_key),
            None => format!("{}/{}", self.endpoint, storage_key),
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl StorageBackend for HttpObjectStorage {
    async fn upload(&self, path: &Path, prefix: Option<&str>) -> Result<UploadedFile, StorageError> {
        let storage_key = build_object_key(&file_name_of(path)?, prefix);
        let body = tokio::fs::read(path).await?;
        let url = self.object_url(&storage_key);

        self.authorize(self.client.put(&url))
            .body(body)
            .send()
            .await?
            .error_for_status()?;

        Ok(UploadedFile { storage_key, url })
    }

    async fn delete(&self, storage_key: &str) -> Result<(), StorageError> {
        if storage_key.is_empty() {
            return Ok(());
        }
        let response = self
            .authorize(self.client.delete(self.object_url(storage_key)))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        response.error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_layout() {
        let key = build_object_key("600000.SH_1d.csv", Some("/downloads/task-1/"));
        assert!(key.starts_with("downloads/task-1/"));
        assert!(key.ends_with("_600000.SH_1d.csv"));

        let dated = build_object_key("a.csv", None);
        assert_eq!(dated.split('/').count(), 4);
    }

    #[tokio::test]
    async fn test_local_upload_and_delete() {
        let root = tempfile::tempdir().unwrap();
        let source_dir = tempfile::tempdir().unwrap();
        let source = source_dir.path().join("prices_1d.csv");
        tokio::fs::write(&source, "date,close\n20240102,10.5\n").await.unwrap();

        let storage = LocalStorage::new(root.path().to_path_buf());
        let uploaded = storage.upload(&source, Some("downloads")).await.unwrap();
        assert!(uploaded.url.starts_with("file://"));
        assert!(root.path().join(&uploaded.storage_key).exists());

        storage.delete(&uploaded.storage_key).await.unwrap();
        assert!(!root.path().join(&uploaded.storage_key).exists());
        // second delete is a no-op
        storage.delete(&uploaded.storage_key).await.unwrap();
    }

    #[test]
    fn test_http_object_url() {
        let storage = HttpObjectStorage::new("https://objects.local/".into(), Some("data".into()), None);
        assert_eq!(storage.object_url("a/b.csv"), "https://objects.local/data/a/b.csv");
    }
}
