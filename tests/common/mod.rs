// ---------------------------------------------------------------------------
// Shared fakes for the integration tests
// ---------------------------------------------------------------------------

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use backtest_orchestrator::errors::{NotificationError, StorageError};
use backtest_orchestrator::external::storage::StorageBackend;
use backtest_orchestrator::models::{TaskEvent, UploadedFile};
use backtest_orchestrator::services::notification_service::{
    NotificationDispatcher, NotificationKind, NotificationSink,
};

/// Sink that remembers every delivery.
#[derive(Default)]
pub struct RecordingSink {
    pub delivered: Mutex<Vec<(NotificationKind, TaskEvent)>>,
}

impl RecordingSink {
    pub fn count(&self, kind: NotificationKind) -> usize {
        self.delivered.lock().iter().filter(|(k, _)| *k == kind).count()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn accepts(&self, _kind: NotificationKind) -> bool {
        true
    }

    async fn deliver(&self, kind: NotificationKind, event: &TaskEvent) -> Result<(), NotificationError> {
        self.delivered.lock().push((kind, event.clone()));
        Ok(())
    }
}

pub fn recording_dispatcher() -> (NotificationDispatcher, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    (NotificationDispatcher::new(vec![sink.clone()]), sink)
}

/// Object store that rejects uploads whose file name contains `fail_marker`.
pub struct FlakyStorage {
    pub fail_marker: String,
    pub deleted: Mutex<Vec<String>>,
}

impl FlakyStorage {
    pub fn new(fail_marker: &str) -> Self {
        Self { fail_marker: fail_marker.to_string(), deleted: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl StorageBackend for FlakyStorage {
    async fn upload(&self, path: &Path, prefix: Option<&str>) -> Result<UploadedFile, StorageError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if name.contains(&self.fail_marker) {
            return Err(StorageError::Config(format!("bucket rejected {}", name)));
        }
        let key = format!("{}/{}", prefix.unwrap_or("misc"), name);
        Ok(UploadedFile { url: format!("https://objects.test/{}", key), storage_key: key })
    }

    async fn delete(&self, storage_key: &str) -> Result<(), StorageError> {
        self.deleted.lock().push(storage_key.to_string());
        Ok(())
    }
}
