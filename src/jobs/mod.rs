//! Job bodies executed by the worker runtime.
//!
//! # Available Jobs
//!
//! - `download_job` - market-data download with artifact upload, and history supplement
//! - `backtest_job` - strategy backtest driven through the engine collaborator
//! - `pipeline_job` - step-by-step trading framework run
//! - `cleanup_job` - retention reaper for file assets and finished task records
//!
//! Every job reports through its `JobContext` and returns a typed `JobError`;
//! terminal state and notifications are handled by the runtime's tracker.

pub mod backtest_job;
pub mod cleanup_job;
pub mod download_job;
pub mod pipeline_job;

use std::sync::Arc;

use crate::config::RetentionConfig;
use crate::db::TaskRepository;
use crate::external::collaborators::{BacktestEngine, MarketDataClient, TradingFramework};
use crate::external::metrics_sink::MetricsSink;
use crate::services::storage_service::ArtifactStorageGateway;
use crate::services::worker_runtime::JobRegistry;

/// Everything the job bodies need from the outside world.
#[derive(Clone)]
pub struct JobDependencies {
    pub repository: Arc<dyn TaskRepository>,
    pub storage: ArtifactStorageGateway,
    pub market_data: Arc<dyn MarketDataClient>,
    pub engine: Arc<dyn BacktestEngine>,
    pub framework: Arc<dyn TradingFramework>,
    pub metrics: Option<Arc<dyn MetricsSink>>,
    pub retention: RetentionConfig,
}

/// Registers all five task types.
pub fn build_registry(deps: JobDependencies) -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry.register(Arc::new(download_job::DownloadDataJob::new(
        deps.market_data.clone(),
        deps.storage.clone(),
    )));
    registry.register(Arc::new(download_job::SupplementHistoryJob::new(deps.market_data)));
    registry.register(Arc::new(backtest_job::BacktestJob::new(
        deps.engine,
        deps.repository.clone(),
        deps.metrics,
    )));
    registry.register(Arc::new(pipeline_job::PipelineJob::new(deps.framework)));
    registry.register(Arc::new(cleanup_job::CleanupJob::new(
        deps.repository,
        deps.storage,
        deps.retention,
    )));
    registry
}
