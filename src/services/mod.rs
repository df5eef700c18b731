pub mod notification_service;
pub mod schedule_manager;
pub mod status_gateway;
pub mod storage_service;
pub mod task_submission;
pub mod task_tracker;
pub mod worker_runtime;
