//! Trading-framework pipeline: load config, init trader and account,
//! optionally fetch initial data, optionally run the strategy once.
//! Any failing step fails the whole task.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::errors::JobError;
use crate::external::collaborators::TradingFramework;
use crate::models::{PipelineRequest, TaskType};
use crate::services::worker_runtime::{JobContext, JobRunner};

pub struct PipelineJob {
    framework: Arc<dyn TradingFramework>,
}

impl PipelineJob {
    pub fn new(framework: Arc<dyn TradingFramework>) -> Self {
        Self { framework }
    }
}

#[async_trait]
impl JobRunner for PipelineJob {
    fn task_name(&self) -> &'static str {
        TaskType::Pipeline.task_name()
    }

    fn started_detail(&self) -> &'static str {
        "pipeline started"
    }

    fn completed_detail(&self) -> &'static str {
        "pipeline finished"
    }

    async fn run(&self, ctx: JobContext) -> Result<Value, JobError> {
        let request: PipelineRequest = ctx.parse_payload()?;
        request.validate().map_err(JobError::Validation)?;

        ctx.progress("loading framework configuration", 0.1);
        let mut session = self
            .framework
            .open(Path::new(&request.config_path), Path::new(&request.strategy_path))
            .await?;

        ctx.progress("initializing trader and account", 0.3);
        session.init_trader_and_account().await?;

        if request.initialize_data {
            ctx.progress("fetching initial market data", 0.5);
            session.init_data().await?;
        }

        if request.run_once {
            ctx.progress("running strategy", 0.7);
            let outcome = session.run(ctx.forward("strategy")).await;
            // stop even when the run failed; the run error wins
            let stopped = session.stop().await;
            outcome?;
            stopped?;
        }

        Ok(json!({
            "config_path": request.config_path,
            "strategy_path": request.strategy_path,
            "run_once": request.run_once,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CollaboratorError;
    use crate::external::collaborators::{CollaboratorEvents, FrameworkSession};
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct StepLog(Arc<Mutex<Vec<&'static str>>>);

    struct FakeSession {
        steps: Arc<Mutex<Vec<&'static str>>>,
        fail_run: bool,
    }

    #[async_trait]
    impl FrameworkSession for FakeSession {
        async fn init_trader_and_account(&mut self) -> Result<(), CollaboratorError> {
            self.steps.lock().push("account");
            Ok(())
        }
        async fn init_data(&mut self) -> Result<(), CollaboratorError> {
            self.steps.lock().push("data");
            Ok(())
        }
        async fn run(&mut self, _events: CollaboratorEvents) -> Result<(), CollaboratorError> {
            self.steps.lock().push("run");
            if self.fail_run {
                return Err(CollaboratorError::Failed("strategy raised".into()));
            }
            Ok(())
        }
        async fn stop(&mut self) -> Result<(), CollaboratorError> {
            self.steps.lock().push("stop");
            Ok(())
        }
    }

    struct FakeFramework {
        steps: StepLog,
        fail_run: bool,
    }

    #[async_trait]
    impl TradingFramework for FakeFramework {
        async fn open(&self, _: &Path, _: &Path) -> Result<Box<dyn FrameworkSession>, CollaboratorError> {
            self.steps.0.lock().push("open");
            Ok(Box::new(FakeSession { steps: self.steps.0.clone(), fail_run: self.fail_run }))
        }
    }

    fn ctx(payload: Value) -> JobContext {
        let (tx, _rx) = mpsc::unbounded_channel();
        JobContext::new("p-1", payload, tx)
    }

    #[tokio::test]
    async fn test_steps_run_in_order() {
        let framework = Arc::new(FakeFramework { steps: StepLog::default(), fail_run: false });
        let job = PipelineJob::new(framework.clone());
        let payload = json!({"config_path": "c.json", "strategy_path": "s.py", "run_once": true});

        let result = job.run(ctx(payload)).await.unwrap();
        assert_eq!(result["run_once"], true);
        assert_eq!(*framework.steps.0.lock(), vec!["open", "account", "data", "run", "stop"]);
    }

    #[tokio::test]
    async fn test_run_failure_still_stops_and_fails_task() {
        let framework = Arc::new(FakeFramework { steps: StepLog::default(), fail_run: true });
        let job = PipelineJob::new(framework.clone());
        let payload = json!({
            "config_path": "c.json",
            "strategy_path": "s.py",
            "initialize_data": false,
            "run_once": true,
        });

        let err = job.run(ctx(payload)).await.unwrap_err();
        assert_eq!(err, JobError::Business("strategy raised".into()));
        assert_eq!(*framework.steps.0.lock(), vec!["open", "account", "run", "stop"]);
    }
}
