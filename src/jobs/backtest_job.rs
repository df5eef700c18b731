//! Strategy backtest job.
//!
//! A BacktestRecord is created and linked to the task before the engine runs,
//! so a crash mid-run still leaves a traceable row. Engine logs are forwarded
//! line by line. On success the cost and performance summaries are written
//! back and a denormalized metrics event goes to the optional real-time sink;
//! on failure the record is marked failed with the same reason the task gets.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::db::TaskRepository;
use crate::errors::JobError;
use crate::external::collaborators::BacktestEngine;
use crate::external::metrics_sink::{MetricsEvent, MetricsSink};
use crate::models::{
    BacktestCompletion, BacktestConfig, BacktestRecord, BacktestRunRequest, EngineOutcome, TaskType,
};
use crate::services::worker_runtime::{JobContext, JobRunner};

pub struct BacktestJob {
    engine: Arc<dyn BacktestEngine>,
    repository: Arc<dyn TaskRepository>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl BacktestJob {
    pub fn new(
        engine: Arc<dyn BacktestEngine>,
        repository: Arc<dyn TaskRepository>,
        metrics: Option<Arc<dyn MetricsSink>>,
    ) -> Self {
        Self { engine, repository, metrics }
    }

    async fn execute(&self, ctx: &JobContext, request: &BacktestRunRequest) -> Result<EngineOutcome, JobError> {
        ctx.progress("loading backtest configuration", 0.05);
        let config = BacktestConfig::load(Path::new(&request.config_path), request.overrides.as_ref()).await?;
        if config.stock_list.is_empty() {
            return Err(JobError::Business("empty stock pool".to_string()));
        }

        ctx.progress(format!("running backtest over {} symbol(s)", config.stock_list.len()), 0.1);
        let outcome = self.engine.run(&config, request, ctx.forward("backtest")).await?;
        Ok(outcome)
    }

    async fn publish_metrics(&self, record: &BacktestRecord, completion: &BacktestCompletion) {
        let Some(sink) = &self.metrics else {
            return;
        };
        let event = MetricsEvent {
            backtest_id: record.id,
            task_id: record.task_id.clone(),
            timestamp: Utc::now(),
            status: completion.status.clone(),
            performance_summary: completion.performance_summary.clone(),
            cost_summary: completion.cost_summary.clone(),
        };
        if let Err(e) = sink.publish(&event).await {
            warn!(backtest_id = %record.id, "⚠️  Failed to publish metrics event: {}", e);
        }
    }
}

#[async_trait]
impl JobRunner for BacktestJob {
    fn task_name(&self) -> &'static str {
        TaskType::Backtest.task_name()
    }

    fn started_detail(&self) -> &'static str {
        "backtest started"
    }

    fn completed_detail(&self) -> &'static str {
        "backtest finished"
    }

    async fn run(&self, ctx: JobContext) -> Result<Value, JobError> {
        let request: BacktestRunRequest = ctx.parse_payload()?;
        request.validate().map_err(JobError::Validation)?;

        let record = BacktestRecord::new(&ctx.task_id, &request);
        self.repository.create_backtest(&record).await?;
        if let Err(e) = self.repository.link_backtest(&ctx.task_id, record.id).await {
            warn!(task_id = %ctx.task_id, "⚠️  Failed to link backtest record: {}", e);
        }

        let outcome = match self.execute(&ctx, &request).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let completion = BacktestCompletion::failed(&err.to_string());
                if let Err(e) = self.repository.complete_backtest(record.id, &completion).await {
                    warn!(backtest_id = %record.id, "⚠️  Failed to mark backtest failed: {}", e);
                }
                return Err(err);
            }
        };

        let completion = BacktestCompletion {
            status: "completed".to_string(),
            detail: Some("backtest finished".to_string()),
            result_path: outcome.result_path.clone(),
            cost_summary: outcome.summary("cost_summary"),
            performance_summary: outcome.summary("performance_summary"),
            report_payload: outcome.report.clone(),
        };
        if let Err(e) = self.repository.complete_backtest(record.id, &completion).await {
            warn!(backtest_id = %record.id, "⚠️  Failed to store backtest summaries: {}", e);
        }
        self.publish_metrics(&record, &completion).await;

        info!(task_id = %ctx.task_id, backtest_id = %record.id, "📈 Backtest completed");
        Ok(json!({
            "backtest_id": record.id,
            "result_path": completion.result_path,
            "performance_summary": completion.performance_summary,
            "cost_summary": completion.cost_summary,
        }))
    }
}
