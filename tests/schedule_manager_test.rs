//! Schedule CRUD against a real scheduler and a temporary schedule file.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map};

use backtest_orchestrator::external::broker::{Broker, InMemoryBroker};
use backtest_orchestrator::models::ScheduleJobRequest;
use backtest_orchestrator::services::schedule_manager::{load_schedule_file, ScheduleManager};

fn nightly(cron: &str) -> ScheduleJobRequest {
    ScheduleJobRequest {
        job_id: "nightly".into(),
        cron: cron.into(),
        task_name: "orchestrator.cleanup".into(),
        args: vec![],
        kwargs: Map::new(),
        timezone: Some("Asia/Taipei".into()),
    }
}

async fn manager(path: &std::path::Path) -> ScheduleManager {
    ScheduleManager::new(
        Arc::new(InMemoryBroker::default()),
        path,
        chrono_tz::Asia::Taipei,
        Duration::from_secs(60),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_nightly_schedule_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("schedules.json");
    let schedules = manager(&path).await;

    let descriptor = schedules.add_or_update(nightly("0 2 * * *")).await.unwrap();
    assert_eq!(descriptor.job_id, "nightly");

    let listed = schedules.list().await;
    assert_eq!(listed.len(), 1);
    assert!(listed[0].next_run_time.is_some());

    schedules.remove("nightly").await.unwrap();
    assert!(schedules.list().await.is_empty());
    let persisted = load_schedule_file(&path).await.unwrap().unwrap();
    assert!(persisted.jobs.is_empty());

    // removing again is a no-op
    schedules.remove("nightly").await.unwrap();
}

#[tokio::test]
async fn test_upsert_twice_keeps_one_entry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("schedules.json");
    let schedules = manager(&path).await;

    schedules.add_or_update(nightly("0 2 * * *")).await.unwrap();
    schedules.add_or_update(nightly("30 3 * * *")).await.unwrap();

    let listed = schedules.list().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].cron, "30 3 * * *");

    let persisted = load_schedule_file(&path).await.unwrap().unwrap();
    assert_eq!(persisted.jobs.len(), 1);
    assert_eq!(persisted.jobs[0].cron, "30 3 * * *");
}

#[tokio::test]
async fn test_short_cron_is_rejected_without_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("schedules.json");
    let schedules = manager(&path).await;

    schedules.add_or_update(nightly("0 2 * * *")).await.unwrap();
    let before = tokio::fs::read(&path).await.unwrap();

    assert!(schedules.add_or_update(nightly("0 2 *")).await.is_err());
    let mut other = nightly("* * * *");
    other.job_id = "hourly".into();
    assert!(schedules.add_or_update(other).await.is_err());

    assert_eq!(schedules.list().await.len(), 1);
    assert_eq!(schedules.get("nightly").await.unwrap().cron, "0 2 * * *");
    assert_eq!(tokio::fs::read(&path).await.unwrap(), before);
}

#[tokio::test]
async fn test_replay_restores_and_skips_bad_entries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("schedules.json");
    let file = json!({
        "jobs": [
            {"job_id": "nightly", "cron": "0 2 * * *", "task_name": "orchestrator.cleanup",
             "args": [], "kwargs": {"retention_days": 7}, "timezone": "Asia/Taipei"},
            {"job_id": "broken", "cron": "every day", "task_name": "orchestrator.cleanup",
             "args": [], "kwargs": {}, "timezone": "Asia/Taipei"},
            {"job_id": "weekday-open", "cron": "0 30 9 * * 2-6", "task_name": "orchestrator.download_data",
             "args": [], "kwargs": {}, "timezone": "UTC"}
        ]
    });
    tokio::fs::write(&path, file.to_string()).await.unwrap();

    let schedules = manager(&path).await;
    assert_eq!(schedules.replay().await, 2);

    let ids: Vec<String> = schedules.list().await.into_iter().map(|d| d.job_id).collect();
    assert_eq!(ids, vec!["nightly".to_string(), "weekday-open".to_string()]);

    // replay leaves the file as it was
    let persisted = load_schedule_file(&path).await.unwrap().unwrap();
    assert_eq!(persisted.jobs.len(), 3);
}

#[tokio::test]
async fn test_invalid_timezone_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let schedules = manager(&dir.path().join("schedules.json")).await;
    let mut request = nightly("0 2 * * *");
    request.timezone = Some("Mars/Olympus".into());
    assert!(schedules.add_or_update(request).await.is_err());
    assert!(schedules.list().await.is_empty());
    assert!(!dir.path().join("schedules.json").exists());
}

#[tokio::test]
async fn test_started_manager_dispatches_to_broker() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(InMemoryBroker::default());
    let schedules = ScheduleManager::new(
        broker.clone(),
        dir.path().join("schedules.json"),
        chrono_tz::UTC,
        Duration::from_secs(60),
    )
    .await
    .unwrap();
    schedules.start().await.unwrap();

    let mut every_second = nightly("* * * * * *");
    every_second.kwargs = Map::from_iter([("retention_days".to_string(), json!(7))]);
    schedules.add_or_update(every_second).await.unwrap();

    let message = broker.receive(Duration::from_secs(4)).await.unwrap().unwrap();
    assert_eq!(message.task_name, "orchestrator.cleanup");
    assert_eq!(message.payload(), json!({"retention_days": 7}));

    schedules.stop().await.unwrap();
}

#[tokio::test]
async fn test_failed_write_leaves_schedules_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    tokio::fs::write(&blocker, "not a directory").await.unwrap();
    let schedules = manager(&blocker.join("schedules.json")).await;

    assert!(schedules.add_or_update(nightly("0 2 * * *")).await.is_err());
    assert!(schedules.list().await.is_empty());
}

#[tokio::test]
async fn test_failed_write_keeps_previous_trigger() {
    let dir = tempfile::tempdir().unwrap();
    let config_dir = dir.path().join("config");
    let schedules = manager(&config_dir.join("schedules.json")).await;
    schedules.add_or_update(nightly("0 2 * * *")).await.unwrap();

    // the config directory turns into a plain file, so every write fails
    tokio::fs::remove_dir_all(&config_dir).await.unwrap();
    tokio::fs::write(&config_dir, "not a directory").await.unwrap();

    assert!(schedules.add_or_update(nightly("30 3 * * *")).await.is_err());
    assert_eq!(schedules.get("nightly").await.unwrap().cron, "0 2 * * *");

    assert!(schedules.remove("nightly").await.is_err());
    assert_eq!(schedules.list().await.len(), 1);
}
