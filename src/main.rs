use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use backtest_orchestrator::app;
use backtest_orchestrator::config::AppConfig;
use backtest_orchestrator::db::{InMemoryTaskRepository, PgTaskRepository, TaskRepository};
use backtest_orchestrator::external::broker::{Broker, InMemoryBroker};
use backtest_orchestrator::external::collaborators::{
    BacktestEngine, CommandCollaborator, MarketDataClient, TradingFramework, Unconfigured,
};
use backtest_orchestrator::external::metrics_sink::{MetricsSink, SqlMetricsSink};
use backtest_orchestrator::external::redis_broker::RedisBroker;
use backtest_orchestrator::external::storage::build_backend;
use backtest_orchestrator::jobs::{build_registry, JobDependencies};
use backtest_orchestrator::logging::{init_logging, LoggingConfig};
use backtest_orchestrator::services::notification_service::NotificationDispatcher;
use backtest_orchestrator::services::schedule_manager::ScheduleManager;
use backtest_orchestrator::services::status_gateway::RealtimeStatusGateway;
use backtest_orchestrator::services::storage_service::ArtifactStorageGateway;
use backtest_orchestrator::services::task_submission::TaskSubmissionService;
use backtest_orchestrator::services::worker_runtime::WorkerRuntime;
use backtest_orchestrator::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging FIRST
    init_logging(LoggingConfig::from_env())
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    let config = AppConfig::from_env().context("Invalid configuration")?;
    info!("🚀 Starting backtest orchestrator ({} mode)", config.mode.as_str());

    let repository = build_repository(&config).await?;
    let broker = build_broker(&config).await?;
    let notifier = NotificationDispatcher::from_config(
        repository.clone(),
        &config.smtp,
        config.webhook_url.as_deref(),
    );
    info!("📣 Notification sinks: {:?}", notifier.sink_names());

    let (shutdown_tx, _) = broadcast::channel::<()>(4);

    let worker = if config.mode.runs_worker() {
        let deps = build_job_dependencies(&config, repository.clone()).await?;
        let runtime = Arc::new(WorkerRuntime::new(
            broker.clone(),
            repository.clone(),
            notifier.clone(),
            build_registry(deps),
            config.worker_concurrency,
        ));
        Some(tokio::spawn(runtime.run(shutdown_tx.subscribe())))
    } else {
        None
    };

    if config.mode.runs_api() {
        let schedules = Arc::new(
            ScheduleManager::new(
                broker.clone(),
                config.schedule_config_path.clone(),
                config.scheduler_timezone,
                config.misfire_grace,
            )
            .await?,
        );
        schedules.start().await?;

        let state = AppState {
            mode: config.mode,
            repository: repository.clone(),
            submission: TaskSubmissionService::new(broker.clone(), repository.clone()),
            gateway: RealtimeStatusGateway::new(broker.clone(), repository.clone(), config.stream_interval),
            schedules: schedules.clone(),
        };

        let listener = TcpListener::bind(config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
        info!("🚀 Backtest orchestrator API running at http://{}/", config.bind_addr);

        axum::serve(listener, app::create_app(state))
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        if let Err(e) = schedules.stop().await {
            warn!("⚠️  Scheduler did not stop cleanly: {}", e);
        }
    } else {
        shutdown_signal().await;
    }

    // receivers may already be gone if the worker exited on its own
    let _ = shutdown_tx.send(());
    if let Some(handle) = worker {
        if let Err(e) = handle.await {
            error!("❌ Worker task ended abnormally: {}", e);
        }
    }

    info!("👋 Shutdown complete");
    Ok(())
}

async fn build_repository(config: &AppConfig) -> anyhow::Result<Arc<dyn TaskRepository>> {
    match &config.database_url {
        Some(url) => {
            let repository = PgTaskRepository::connect(url)
                .await
                .context("Failed to connect to the task database")?;
            info!("✅ Connected to PostgreSQL task store");
            Ok(Arc::new(repository))
        }
        None => {
            warn!("⚠️  DATABASE_URL not set, task records are kept in memory only");
            Ok(Arc::new(InMemoryTaskRepository::new()))
        }
    }
}

async fn build_broker(config: &AppConfig) -> anyhow::Result<Arc<dyn Broker>> {
    if config.uses_redis_broker() {
        let broker = RedisBroker::connect(
            &config.broker_url,
            &config.broker_queue,
            &config.worker_id,
            config.result_expires,
        )
            .await
            .context("Failed to connect to the Redis broker")?;
        return Ok(Arc::new(broker));
    }
    if !config.mode.runs_api() || !config.mode.runs_worker() {
        warn!("⚠️  In-memory broker in {} mode: no other process can reach this queue", config.mode.as_str());
    }
    Ok(Arc::new(InMemoryBroker::new(config.result_expires)))
}

async fn build_job_dependencies(
    config: &AppConfig,
    repository: Arc<dyn TaskRepository>,
) -> anyhow::Result<JobDependencies> {
    let backend = build_backend(&config.storage).context("Invalid storage configuration")?;
    let storage = ArtifactStorageGateway::new(backend, repository.clone());

    let market_data: Arc<dyn MarketDataClient> = match &config.commands.market_data {
        Some(program) => Arc::new(CommandCollaborator::new(program)),
        None => Arc::new(Unconfigured("market data client")),
    };
    let engine: Arc<dyn BacktestEngine> = match &config.commands.engine {
        Some(program) => Arc::new(CommandCollaborator::new(program)),
        None => Arc::new(Unconfigured("backtest engine")),
    };
    let framework: Arc<dyn TradingFramework> = match &config.commands.framework {
        Some(program) => Arc::new(CommandCollaborator::new(program)),
        None => Arc::new(Unconfigured("trading framework")),
    };

    let metrics: Option<Arc<dyn MetricsSink>> = match &config.metrics_url {
        Some(url) => match SqlMetricsSink::connect(url, &config.metrics_table).await {
            Ok(sink) => Some(Arc::new(sink)),
            Err(e) => {
                warn!("⚠️  Real-time metrics disabled: {}", e);
                None
            }
        },
        None => None,
    };

    Ok(JobDependencies {
        repository,
        storage,
        market_data,
        engine,
        framework,
        metrics,
        retention: config.retention.clone(),
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("❌ Failed to listen for shutdown signal: {}", e);
    }
    info!("🛑 Shutdown signal received");
}
